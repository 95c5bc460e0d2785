//! One host wrapper per native handle.
//!
//! The registry maps each [`NativeHandle`] to a weak reference to the wrapper
//! currently representing it. Weak entries never keep a wrapper alive: when
//! the last host reference goes away the wrapper's `Drop` evicts its own
//! entry, and a periodic sweep clears anything that slipped through. A lookup
//! that finds a dead or finalized wrapper treats the handle as unwrapped and
//! builds a fresh one in its place.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use busbridge_transport::NativeHandle;

use crate::BindError;

/// The four kinds of host-visible wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrapperKind {
    Connection,
    Bus,
    Server,
    Message,
}

impl WrapperKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Bus => "bus",
            Self::Server => "server",
            Self::Message => "message",
        }
    }
}

impl fmt::Display for WrapperKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by the shared state behind every wrapper type.
pub trait Registered: Any {
    /// True once the wrapper has been finalized. Such a wrapper no longer
    /// represents its handle even while host references to it remain.
    fn is_released(&self) -> bool;

    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;
}

/// Whether [`IdentityRegistry::resolve_or_create`] found a wrapper or built one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Existing,
    Created,
}

struct Entry {
    kind: WrapperKind,
    /// Allocation address of the wrapper, so a dropped wrapper only ever
    /// evicts its own entry and never a successor's.
    addr: usize,
    wrapper: Weak<dyn Registered>,
}

impl Entry {
    fn live(&self) -> Option<Rc<dyn Registered>> {
        self.wrapper.upgrade().filter(|wrapper| !wrapper.is_released())
    }
}

pub struct IdentityRegistry {
    entries: HashMap<NativeHandle, Entry>,
    sweep_interval: usize,
    inserts_since_sweep: usize,
}

impl IdentityRegistry {
    /// `sweep_interval` is the number of inserts between sweeps; `0` turns
    /// sweeping off and relies on eviction from `Drop` alone.
    pub fn new(sweep_interval: usize) -> Self {
        Self { entries: HashMap::new(), sweep_interval, inserts_since_sweep: 0 }
    }

    /// Returns the live wrapper for `handle`, or registers the one built by
    /// `factory`.
    ///
    /// A live wrapper of a different kind is a consistency failure: the same
    /// native object cannot be both a server and a message.
    pub fn resolve_or_create<T, F>(
        &mut self,
        handle: NativeHandle,
        kind: WrapperKind,
        factory: F,
    ) -> Result<(Rc<T>, Origin), BindError>
    where
        T: Registered,
        F: FnOnce() -> Rc<T>,
    {
        if let Some(entry) = self.entries.get(&handle) {
            if let Some(wrapper) = entry.live() {
                if entry.kind != kind {
                    return Err(BindError::internal(format!(
                        "{handle} is wrapped as a {}, not a {kind}",
                        entry.kind
                    )));
                }
                return downcast(wrapper, handle, kind).map(|wrapper| (wrapper, Origin::Existing));
            }
        }

        let wrapper = factory();
        let weak: Weak<T> = Rc::downgrade(&wrapper);
        let weak: Weak<dyn Registered> = weak;
        self.entries.insert(
            handle,
            Entry { kind, addr: Rc::as_ptr(&wrapper) as usize, wrapper: weak },
        );
        log::trace!("registry: new {kind} wrapper for {handle}");

        self.inserts_since_sweep += 1;
        if self.sweep_interval > 0 && self.inserts_since_sweep >= self.sweep_interval {
            self.sweep();
        }
        Ok((wrapper, Origin::Created))
    }

    /// Returns the live wrapper for `handle`. Used from native callbacks,
    /// where the wrapper must already exist.
    pub fn lookup_existing<T: Registered>(
        &self,
        handle: NativeHandle,
        kind: WrapperKind,
    ) -> Result<Rc<T>, BindError> {
        let wrapper = self
            .entries
            .get(&handle)
            .filter(|entry| entry.kind == kind)
            .and_then(Entry::live)
            .ok_or_else(|| BindError::internal(format!("no live {kind} wrapper for {handle}")))?;
        downcast(wrapper, handle, kind)
    }

    /// Removes the entry for `handle` if it still belongs to the wrapper at `addr`.
    pub fn evict(&mut self, handle: NativeHandle, addr: usize) -> bool {
        if self.entries.get(&handle).is_some_and(|entry| entry.addr == addr) {
            self.entries.remove(&handle);
            return true;
        }
        false
    }

    /// Drops entries whose wrapper no longer exists. Returns how many went.
    pub fn sweep(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.wrapper.strong_count() > 0);
        self.inserts_since_sweep = 0;
        let removed = before - self.entries.len();
        log::trace!("registry: sweep removed {removed} of {before} entries");
        removed
    }

    /// Number of tracked handles, dead entries included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of handles whose wrapper is alive and not finalized.
    pub fn live_count(&self) -> usize {
        self.entries.values().filter(|entry| entry.live().is_some()).count()
    }
}

fn downcast<T: Registered>(
    wrapper: Rc<dyn Registered>,
    handle: NativeHandle,
    kind: WrapperKind,
) -> Result<Rc<T>, BindError> {
    wrapper
        .into_any()
        .downcast::<T>()
        .map_err(|_| BindError::internal(format!("{kind} wrapper for {handle} has the wrong type")))
}

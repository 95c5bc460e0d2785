use std::cell::Cell;
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use busbridge_protocol::{DispatchStatus, HandlerResult, MatchRule};
use busbridge_transport::{NativeHandle, Transport, TransportError};
use serde_json::Value;

use crate::filter::{dispatch_chain, Filter, FilterList};
use crate::record::match_rule_from_value;
use crate::registry::{Origin, Registered, WrapperKind};
use crate::runtime::{begin_finalize, first_failure, Acquire, CloseOnFinalize, Context, Wrapped};
use crate::{BindError, Message};

pub(crate) struct ConnectionInner {
    ctx: Rc<Context>,
    handle: NativeHandle,
    kind: WrapperKind,
    close_on_finalize: Cell<bool>,
    filters: FilterList,
    hook_installed: Cell<bool>,
    dispatching: Cell<bool>,
    released: Cell<bool>,
}

impl ConnectionInner {
    fn live(&self) -> Result<NativeHandle, BindError> {
        if self.released.get() {
            return Err(BindError::invalid_argument(format!(
                "{} {} has been finalized",
                self.kind, self.handle
            )));
        }
        Ok(self.handle)
    }

    fn finalize(&self) -> Result<(), BindError> {
        begin_finalize(&self.released, self.kind, self.handle)?;
        // Filters may own wrappers whose drop touches this connection.
        drop(self.filters.take());

        let transport = &self.ctx.transport;
        let unhook = if self.hook_installed.replace(false) {
            transport.set_filter_hook(self.handle, None)
        } else {
            Ok(())
        };
        let close = if self.close_on_finalize.get() {
            transport.connection_close(self.handle)
        } else {
            Ok(())
        };
        let release = transport.release(self.handle);
        log::debug!("bridge: finalized {} {}", self.kind, self.handle);
        first_failure([unhook, close, release])
    }
}

impl Registered for ConnectionInner {
    fn is_released(&self) -> bool {
        self.released.get()
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn std::any::Any> {
        self
    }
}

impl Wrapped for ConnectionInner {
    fn mark_released(&self) {
        self.released.set(true);
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if !self.released.get() {
            if let Err(err) = self.finalize() {
                log::warn!("bridge: implicit finalize of {} {}: {err}", self.kind, self.handle);
            }
        }
        self.ctx.evict(self.handle, self as *const Self as usize);
    }
}

/// Host wrapper around a native connection.
///
/// Clones are further references to the same wrapper. The wrapper is
/// finalized when the last clone is dropped, or earlier by an explicit
/// [`finalize`](Connection::finalize).
#[derive(Clone)]
pub struct Connection {
    inner: Rc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn wrap(
        ctx: &Rc<Context>,
        handle: NativeHandle,
        kind: WrapperKind,
        acquire: Acquire,
        close: CloseOnFinalize,
    ) -> Result<Self, BindError> {
        let close = if kind == WrapperKind::Bus { CloseOnFinalize::DontClose } else { close };
        let (inner, origin) = ctx.wrap(handle, kind, acquire, || {
            Rc::new(ConnectionInner {
                ctx: Rc::clone(ctx),
                handle,
                kind,
                close_on_finalize: Cell::new(close == CloseOnFinalize::Close),
                filters: FilterList::default(),
                hook_installed: Cell::new(false),
                dispatching: Cell::new(false),
                released: Cell::new(false),
            })
        })?;
        if origin == Origin::Existing {
            match close {
                CloseOnFinalize::Close => inner.close_on_finalize.set(true),
                CloseOnFinalize::DontClose => inner.close_on_finalize.set(false),
                CloseOnFinalize::Unset => {}
            }
        }
        Ok(Self { inner })
    }

    fn transport(&self) -> &dyn Transport {
        self.inner.ctx.transport.as_ref()
    }

    pub fn handle(&self) -> NativeHandle {
        self.inner.handle
    }

    pub fn kind(&self) -> WrapperKind {
        self.inner.kind
    }

    /// True when both values are references to the same wrapper.
    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn close_on_finalize(&self) -> bool {
        self.inner.close_on_finalize.get()
    }

    pub fn filter_count(&self) -> usize {
        self.inner.filters.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.released.get()
    }

    // ── Filters ───────────────────────────────────────────────────────────

    /// Appends `filter` to this connection's chain. The first filter added
    /// installs the native hook that drives the chain.
    pub fn add_filter(&self, filter: Filter) -> Result<(), BindError> {
        let handle = self.inner.live()?;
        if !self.inner.hook_installed.get() {
            let hook = self.inner.ctx.filter_hook(self.inner.kind);
            self.transport().set_filter_hook(handle, Some(hook))?;
            self.inner.hook_installed.set(true);
            log::debug!("bridge: installed filter hook on {} {handle}", self.inner.kind);
        }
        self.inner.filters.push(filter);
        Ok(())
    }

    /// Removes the most recently added registration of `filter`.
    pub fn remove_filter(&self, filter: &Filter) -> Result<(), BindError> {
        self.inner.live()?;
        let removed = self.inner.filters.remove_last(filter).ok_or(BindError::NotRegistered)?;
        drop(removed);
        Ok(())
    }

    // ── Dispatch and I/O ──────────────────────────────────────────────────

    /// Runs a transport call that may invoke filters, then reports the first
    /// filter failure of the cycle, if any.
    fn run_dispatch<R>(
        &self,
        op: impl FnOnce(&dyn Transport, NativeHandle) -> Result<R, TransportError>,
    ) -> Result<R, BindError> {
        let handle = self.inner.live()?;
        if self.inner.dispatching.replace(true) {
            return Err(BindError::internal(format!(
                "re-entrant dispatch on {} {handle}",
                self.inner.kind
            )));
        }
        let outcome = op(self.transport(), handle);
        self.inner.dispatching.set(false);

        // A filter failure is the cause of whatever the transport did next.
        match (outcome, self.inner.ctx.take_pending()) {
            (Ok(value), None) => Ok(value),
            (Err(err), None) => Err(err.into()),
            (Ok(_), Some(pending)) => Err(pending),
            (Err(err), Some(pending)) => {
                log::warn!("bridge: {} {handle} failed after a filter error: {err}", self.inner.kind);
                Err(pending)
            }
        }
    }

    pub fn dispatch(&self) -> Result<DispatchStatus, BindError> {
        self.run_dispatch(|transport, handle| transport.dispatch(handle))
    }

    pub fn flush(&self) -> Result<(), BindError> {
        let handle = self.inner.live()?;
        Ok(self.transport().flush(handle)?)
    }

    pub fn get_dispatch_status(&self) -> Result<DispatchStatus, BindError> {
        let handle = self.inner.live()?;
        Ok(self.transport().dispatch_status(handle)?)
    }

    /// Performs pending I/O, waiting at most `timeout_ms` (`-1` waits
    /// indefinitely). Returns whether the connection is still connected.
    pub fn read_write(&self, timeout_ms: i32) -> Result<bool, BindError> {
        check_timeout(timeout_ms)?;
        self.run_dispatch(|transport, handle| transport.read_write(handle, timeout_ms))
    }

    /// [`read_write`](Self::read_write) with the runtime's configured timeout.
    pub fn read_write_default(&self) -> Result<bool, BindError> {
        self.read_write(self.inner.ctx.config.read_write_timeout_ms)
    }

    pub fn read_write_dispatch(&self, timeout_ms: i32) -> Result<bool, BindError> {
        check_timeout(timeout_ms)?;
        self.run_dispatch(|transport, handle| transport.read_write_dispatch(handle, timeout_ms))
    }

    /// Queues `message` for sending. A refusal from the transport is
    /// reported as `false`, not as an error.
    pub fn send(&self, message: &Message) -> Result<bool, BindError> {
        let handle = self.inner.live()?;
        let msg = message.live()?;
        match self.transport().send(handle, msg) {
            Ok(serial) => {
                log::trace!("bridge: sent {msg} on {handle} as serial {serial}");
                Ok(true)
            }
            Err(err) => {
                log::warn!("bridge: send of {msg} on {handle} failed: {err}");
                Ok(false)
            }
        }
    }

    // ── State ─────────────────────────────────────────────────────────────

    pub fn get_is_connected(&self) -> Result<bool, BindError> {
        Ok(self.transport().is_connected(self.inner.live()?))
    }

    pub fn get_is_authenticated(&self) -> Result<bool, BindError> {
        Ok(self.transport().is_authenticated(self.inner.live()?))
    }

    pub fn get_is_anonymous(&self) -> Result<bool, BindError> {
        Ok(self.transport().is_anonymous(self.inner.live()?))
    }

    pub fn get_server_id(&self) -> Result<Option<String>, BindError> {
        Ok(self.transport().server_id(self.inner.live()?))
    }

    // ── Incoming queue ────────────────────────────────────────────────────

    pub fn pop_message(&self) -> Result<Option<Message>, BindError> {
        let handle = self.inner.live()?;
        match self.transport().pop_message(handle)? {
            Some(msg) => Message::wrap(&self.inner.ctx, msg, Acquire::Adopt).map(Some),
            None => Ok(None),
        }
    }

    pub fn borrow_message(&self) -> Result<Option<Message>, BindError> {
        let handle = self.inner.live()?;
        match self.transport().borrow_message(handle)? {
            Some(msg) => Message::wrap(&self.inner.ctx, msg, Acquire::Retain).map(Some),
            None => Ok(None),
        }
    }

    pub fn return_message(&self, message: &Message) -> Result<(), BindError> {
        let handle = self.inner.live()?;
        Ok(self.transport().return_message(handle, message.live()?)?)
    }

    /// Takes a borrowed message off the queue for good.
    pub fn steal_borrowed_message(&self, message: &Message) -> Result<(), BindError> {
        let handle = self.inner.live()?;
        let msg = message.live()?;
        self.transport().steal_borrowed_message(handle, msg)?;
        // The wrapper already holds its own reference; the queue's is surplus.
        Ok(self.transport().release(msg)?)
    }

    /// Releases the wrapper's native resources now instead of on drop.
    pub fn finalize(&self) -> Result<(), BindError> {
        self.inner.finalize()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.inner.kind)
            .field("handle", &self.inner.handle)
            .field("filters", &self.inner.filters.len())
            .field("finalized", &self.inner.released.get())
            .finish()
    }
}

fn check_timeout(timeout_ms: i32) -> Result<(), BindError> {
    if timeout_ms < -1 {
        return Err(BindError::invalid_argument(format!(
            "timeout must be -1 or a non-negative number of milliseconds (got {timeout_ms})"
        )));
    }
    Ok(())
}

/// Runs the filter chain of the connection wrapper for `conn` on `msg`.
/// Called from the native hook.
pub(crate) fn run_filter_chain(
    ctx: &Rc<Context>,
    kind: WrapperKind,
    conn: NativeHandle,
    msg: NativeHandle,
) -> Result<HandlerResult, BindError> {
    let inner = ctx.registry.borrow().lookup_existing::<ConnectionInner>(conn, kind)?;
    let connection = Connection { inner };
    let message = Message::wrap(ctx, msg, Acquire::Retain)?;
    let filters = connection.inner.filters.snapshot();
    Ok(dispatch_chain(&filters, &connection, &message)?)
}

/// A connection to a message bus daemon.
///
/// Buses are shared connections: finalizing a `Bus` never closes it.
/// Every [`Connection`] method is available through `Deref`.
#[derive(Clone, Debug)]
pub struct Bus {
    conn: Connection,
}

impl Deref for Bus {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Bus {
    pub(crate) fn wrap(ctx: &Rc<Context>, handle: NativeHandle) -> Result<Self, BindError> {
        let conn = Connection::wrap(
            ctx,
            handle,
            WrapperKind::Bus,
            Acquire::Adopt,
            CloseOnFinalize::DontClose,
        )?;
        Ok(Self { conn })
    }

    pub fn as_connection(&self) -> &Connection {
        &self.conn
    }

    /// Unique name the daemon assigned to this connection.
    pub fn unique_name(&self) -> Result<Option<String>, BindError> {
        Ok(self.transport().unique_name(self.inner.live()?))
    }

    pub fn add_match(&self, rule: &MatchRule) -> Result<(), BindError> {
        let handle = self.inner.live()?;
        let text = rule.build()?;
        self.transport().add_match(handle, &text)?;
        log::debug!("bridge: added match rule {text} on {handle}");
        Ok(())
    }

    pub fn remove_match(&self, rule: &MatchRule) -> Result<(), BindError> {
        let handle = self.inner.live()?;
        let text = rule.build()?;
        self.transport().remove_match(handle, &text)?;
        log::debug!("bridge: removed match rule {text} on {handle}");
        Ok(())
    }

    pub fn add_match_record(&self, record: &Value) -> Result<(), BindError> {
        self.add_match(&match_rule_from_value(record)?)
    }

    pub fn remove_match_record(&self, record: &Value) -> Result<(), BindError> {
        self.remove_match(&match_rule_from_value(record)?)
    }
}

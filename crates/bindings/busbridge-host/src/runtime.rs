use std::cell::{Cell, RefCell};
use std::rc::Rc;

use busbridge_protocol::{validate, BusType, HandlerResult, MessageType, NameKind};
use busbridge_transport::{FilterHook, NativeHandle, Transport, TransportError};
use serde_json::Value;

use crate::connection::run_filter_chain;
use crate::record::{MethodCallRecord, SignalRecord};
use crate::registry::{IdentityRegistry, Origin, Registered, WrapperKind};
use crate::{BindError, BridgeConfig, Bus, Connection, Message, Server};

/// Whether the caller of a wrap already owns a native reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The handle came from a constructor, `pop_message`, or `server_accept`:
    /// the wrapper takes over the caller's reference.
    Adopt,
    /// The handle is borrowed: the wrapper takes a reference of its own.
    Retain,
}

/// Whether finalizing a connection wrapper closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOnFinalize {
    Close,
    DontClose,
    /// Keep whatever an existing wrapper has; a new wrapper does not close.
    Unset,
}

/// State shared by a runtime and every wrapper it created.
pub(crate) struct Context {
    pub(crate) transport: Rc<dyn Transport>,
    pub(crate) registry: RefCell<IdentityRegistry>,
    pub(crate) config: BridgeConfig,
    /// First error raised inside a filter cycle, held until the dispatching
    /// call returns to the host.
    pub(crate) pending: RefCell<Option<BindError>>,
}

/// Wrapper state the lifecycle code needs beyond [`Registered`].
pub(crate) trait Wrapped: Registered {
    fn mark_released(&self);
}

impl Context {
    /// Resolves `handle` to its wrapper and settles native references so the
    /// wrapper ends up holding exactly one.
    pub(crate) fn wrap<T, F>(
        &self,
        handle: NativeHandle,
        kind: WrapperKind,
        acquire: Acquire,
        factory: F,
    ) -> Result<(Rc<T>, Origin), BindError>
    where
        T: Wrapped,
        F: FnOnce() -> Rc<T>,
    {
        let resolved = self.registry.borrow_mut().resolve_or_create(handle, kind, factory);
        let (wrapper, origin) = match resolved {
            Ok(found) => found,
            Err(err) => {
                if acquire == Acquire::Adopt {
                    self.release_quietly(handle);
                }
                return Err(err);
            }
        };

        match (origin, acquire) {
            (Origin::Created, Acquire::Retain) => {
                if let Err(err) = self.transport.retain(handle) {
                    // Never held a reference, so there is nothing to give back.
                    wrapper.mark_released();
                    return Err(err.into());
                }
            }
            (Origin::Existing, Acquire::Adopt) => self.transport.release(handle)?,
            _ => {}
        }
        if origin == Origin::Created {
            log::debug!("bridge: wrapped {kind} {handle} ({acquire:?})");
        }
        Ok((wrapper, origin))
    }

    pub(crate) fn release_quietly(&self, handle: NativeHandle) {
        if let Err(err) = self.transport.release(handle) {
            log::warn!("bridge: releasing {handle}: {err}");
        }
    }

    /// Removes the registry entry owned by the wrapper at `addr`. Skipped
    /// when the registry is busy; the next sweep picks the entry up.
    pub(crate) fn evict(&self, handle: NativeHandle, addr: usize) {
        if let Ok(mut registry) = self.registry.try_borrow_mut() {
            registry.evict(handle, addr);
        }
    }

    /// The native hook installed on a connection once it has filters.
    pub(crate) fn filter_hook(self: &Rc<Self>, kind: WrapperKind) -> FilterHook {
        let ctx = Rc::downgrade(self);
        Rc::new(move |conn: NativeHandle, msg: NativeHandle| match ctx.upgrade() {
            Some(ctx) => ctx.run_filters(kind, conn, msg),
            None => HandlerResult::NotYetHandled,
        })
    }

    fn run_filters(self: &Rc<Self>, kind: WrapperKind, conn: NativeHandle, msg: NativeHandle) -> HandlerResult {
        match run_filter_chain(self, kind, conn, msg) {
            Ok(verdict) => verdict,
            Err(err) => {
                log::error!("bridge: filter dispatch on {kind} {conn} failed: {err}");
                let mut pending = self.pending.borrow_mut();
                if pending.is_none() {
                    *pending = Some(err);
                }
                HandlerResult::Handled
            }
        }
    }

    pub(crate) fn take_pending(&self) -> Option<BindError> {
        self.pending.borrow_mut().take()
    }
}

/// Marks `released` and fails if it already was.
pub(crate) fn begin_finalize(
    released: &Cell<bool>,
    kind: WrapperKind,
    handle: NativeHandle,
) -> Result<(), BindError> {
    if released.replace(true) {
        return Err(BindError::internal(format!("double finalize of {kind} {handle}")));
    }
    Ok(())
}

/// Every finalize step runs; the first failure is reported.
pub(crate) fn first_failure<const N: usize>(
    steps: [Result<(), TransportError>; N],
) -> Result<(), BindError> {
    for step in steps {
        step?;
    }
    Ok(())
}

/// Host-facing entry point: the module table of the binding.
///
/// A runtime owns the identity registry for one host embedding. Wrappers
/// keep the shared state alive, so they stay usable after the runtime
/// itself is dropped.
pub struct Runtime {
    ctx: Rc<Context>,
}

impl Runtime {
    pub fn new(transport: Rc<dyn Transport>) -> Self {
        Self::with_config(transport, BridgeConfig::default())
    }

    pub fn with_config(transport: Rc<dyn Transport>, config: BridgeConfig) -> Self {
        let registry = IdentityRegistry::new(config.registry_sweep_interval);
        Self {
            ctx: Rc::new(Context {
                transport,
                registry: RefCell::new(registry),
                config,
                pending: RefCell::new(None),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.ctx.config
    }

    pub fn transport(&self) -> &Rc<dyn Transport> {
        &self.ctx.transport
    }

    /// Handles with a registry entry, including entries awaiting a sweep.
    pub fn tracked_handles(&self) -> usize {
        self.ctx.registry.borrow().len()
    }

    pub fn live_wrappers(&self) -> usize {
        self.ctx.registry.borrow().live_count()
    }

    pub fn sweep(&self) -> usize {
        self.ctx.registry.borrow_mut().sweep()
    }

    // ── Connections ───────────────────────────────────────────────────────

    pub fn bus_get(&self, bus: BusType) -> Result<Bus, BindError> {
        let handle = self.ctx.transport.bus_get(bus)?;
        Bus::wrap(&self.ctx, handle)
    }

    pub fn default_bus(&self) -> Result<Bus, BindError> {
        self.bus_get(self.ctx.config.default_bus)
    }

    /// Opens a private connection. Finalizing its wrapper closes it.
    pub fn connection_open(&self, address: &str) -> Result<Connection, BindError> {
        let handle = self.ctx.transport.connection_open(address)?;
        Connection::wrap(
            &self.ctx,
            handle,
            WrapperKind::Connection,
            Acquire::Adopt,
            CloseOnFinalize::Close,
        )
    }

    /// Wraps a connection handle whose reference the caller hands over.
    pub fn adopt_connection(
        &self,
        handle: NativeHandle,
        close: CloseOnFinalize,
    ) -> Result<Connection, BindError> {
        Connection::wrap(&self.ctx, handle, WrapperKind::Connection, Acquire::Adopt, close)
    }

    // ── Messages ──────────────────────────────────────────────────────────

    pub fn message_new(&self, msg_type: MessageType) -> Result<Message, BindError> {
        if msg_type == MessageType::Invalid {
            return Err(BindError::invalid_argument(format!(
                "{msg_type} is not a valid type for a new message"
            )));
        }
        let handle = self.ctx.transport.message_new(msg_type)?;
        Message::wrap(&self.ctx, handle, Acquire::Adopt)
    }

    pub fn message_new_method_call(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        method: &str,
    ) -> Result<Message, BindError> {
        if let Some(destination) = destination {
            validate(destination, NameKind::BusOrUniqueConnection)?;
        }
        validate(path, NameKind::ObjectPath)?;
        if let Some(interface) = interface {
            validate(interface, NameKind::Interface)?;
        }
        validate(method, NameKind::Member)?;

        let handle =
            self.ctx.transport.message_new_method_call(destination, path, interface, method)?;
        Message::wrap(&self.ctx, handle, Acquire::Adopt)
    }

    /// Same as [`message_new_method_call`](Self::message_new_method_call),
    /// reading `destination`, `path`, `interface`, and `method` from a record.
    pub fn message_new_method_call_from_record(&self, record: &Value) -> Result<Message, BindError> {
        let record = MethodCallRecord::from_value(record)?;
        self.message_new_method_call(
            record.destination.as_deref(),
            &record.path,
            record.interface.as_deref(),
            &record.method,
        )
    }

    pub fn message_new_method_return(&self, call: &Message) -> Result<Message, BindError> {
        let call = call.live()?;
        let handle = self.ctx.transport.message_new_method_return(call)?;
        Message::wrap(&self.ctx, handle, Acquire::Adopt)
    }

    pub fn message_new_signal(
        &self,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<Message, BindError> {
        validate(path, NameKind::ObjectPath)?;
        validate(interface, NameKind::Interface)?;
        validate(name, NameKind::Member)?;

        let handle = self.ctx.transport.message_new_signal(path, interface, name)?;
        Message::wrap(&self.ctx, handle, Acquire::Adopt)
    }

    /// Reads `path`, `interface`, and `name` from a record.
    pub fn message_new_signal_from_record(&self, record: &Value) -> Result<Message, BindError> {
        let record = SignalRecord::from_value(record)?;
        self.message_new_signal(&record.path, &record.interface, &record.name)
    }

    /// Builds an error reply to `reply_to`. Error names follow the
    /// interface name grammar.
    pub fn message_new_error(
        &self,
        reply_to: &Message,
        error_name: &str,
        error_message: Option<&str>,
    ) -> Result<Message, BindError> {
        let reply_to = reply_to.live()?;
        validate(error_name, NameKind::Interface)?;
        let handle = self.ctx.transport.message_new_error(reply_to, error_name, error_message)?;
        Message::wrap(&self.ctx, handle, Acquire::Adopt)
    }

    // ── Servers ───────────────────────────────────────────────────────────

    /// Starts listening on `address`. A refusal carries the transport's
    /// error name and message in [`BindError::Transport`].
    pub fn server_listen(&self, address: &str) -> Result<Server, BindError> {
        let handle = self.ctx.transport.server_listen(address)?;
        Server::wrap(&self.ctx, handle)
    }
}

use std::rc::Rc;

use busbridge_protocol::{BusType, DispatchStatus, HandlerResult, MessageHeader, MessageType};

use crate::{NativeHandle, TransportError};

/// Callback the transport invokes for each message it dispatches on a
/// connection: `(connection, message) -> verdict`.
///
/// The message handle is only borrowed for the duration of the call. A hook
/// that keeps it must take its own reference with [`Transport::retain`].
pub type FilterHook = Rc<dyn Fn(NativeHandle, NativeHandle) -> HandlerResult>;

/// Reference-counted bus primitives, as exposed by the native library.
///
/// Every constructor hands out one owned reference that the caller must
/// eventually [`release`](Transport::release). Boolean getters report `false`
/// for handles the transport does not know.
///
/// Implementations may invoke a [`FilterHook`] from `dispatch`,
/// `read_write_dispatch`, and `read_write`. They must not hold internal
/// borrows across that call, since the hook re-enters the transport.
pub trait Transport {
    // ── Constructors ──────────────────────────────────────────────────────

    fn bus_get(&self, bus: BusType) -> Result<NativeHandle, TransportError>;

    fn connection_open(&self, address: &str) -> Result<NativeHandle, TransportError>;

    fn server_listen(&self, address: &str) -> Result<NativeHandle, TransportError>;

    fn message_new(&self, msg_type: MessageType) -> Result<NativeHandle, TransportError>;

    fn message_new_method_call(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        method: &str,
    ) -> Result<NativeHandle, TransportError>;

    fn message_new_method_return(&self, call: NativeHandle)
        -> Result<NativeHandle, TransportError>;

    fn message_new_signal(
        &self,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<NativeHandle, TransportError>;

    fn message_new_error(
        &self,
        reply_to: NativeHandle,
        error_name: &str,
        error_message: Option<&str>,
    ) -> Result<NativeHandle, TransportError>;

    // ── Reference counts ──────────────────────────────────────────────────

    fn retain(&self, handle: NativeHandle) -> Result<(), TransportError>;

    fn release(&self, handle: NativeHandle) -> Result<(), TransportError>;

    // ── Connections ───────────────────────────────────────────────────────

    fn connection_close(&self, conn: NativeHandle) -> Result<(), TransportError>;

    fn is_connected(&self, conn: NativeHandle) -> bool;

    fn is_authenticated(&self, conn: NativeHandle) -> bool;

    fn is_anonymous(&self, conn: NativeHandle) -> bool;

    fn server_id(&self, conn: NativeHandle) -> Option<String>;

    /// The name the bus daemon assigned; `None` for peer-to-peer connections.
    fn unique_name(&self, conn: NativeHandle) -> Option<String>;

    fn flush(&self, conn: NativeHandle) -> Result<(), TransportError>;

    fn dispatch_status(&self, conn: NativeHandle) -> Result<DispatchStatus, TransportError>;

    fn dispatch(&self, conn: NativeHandle) -> Result<DispatchStatus, TransportError>;

    /// Removes the head of the incoming queue; the caller owns the returned reference.
    fn pop_message(&self, conn: NativeHandle) -> Result<Option<NativeHandle>, TransportError>;

    /// Peeks at the head of the incoming queue. The queue keeps its reference
    /// until the message is returned or stolen.
    fn borrow_message(&self, conn: NativeHandle) -> Result<Option<NativeHandle>, TransportError>;

    fn return_message(&self, conn: NativeHandle, msg: NativeHandle) -> Result<(), TransportError>;

    /// Removes a borrowed message from the queue, transferring the queue's
    /// reference to the caller.
    fn steal_borrowed_message(
        &self,
        conn: NativeHandle,
        msg: NativeHandle,
    ) -> Result<(), TransportError>;

    /// Queues `msg` for sending and returns the serial it was stamped with.
    fn send(&self, conn: NativeHandle, msg: NativeHandle) -> Result<u32, TransportError>;

    /// Performs pending I/O. Returns whether the connection is still connected.
    fn read_write(&self, conn: NativeHandle, timeout_ms: i32) -> Result<bool, TransportError>;

    /// Like [`read_write`](Transport::read_write), then dispatches one message
    /// if any is queued.
    fn read_write_dispatch(&self, conn: NativeHandle, timeout_ms: i32)
        -> Result<bool, TransportError>;

    /// Installs (or with `None`, removes) the connection's filter hook.
    fn set_filter_hook(
        &self,
        conn: NativeHandle,
        hook: Option<FilterHook>,
    ) -> Result<(), TransportError>;

    fn add_match(&self, conn: NativeHandle, rule: &str) -> Result<(), TransportError>;

    fn remove_match(&self, conn: NativeHandle, rule: &str) -> Result<(), TransportError>;

    // ── Servers ───────────────────────────────────────────────────────────

    fn server_disconnect(&self, server: NativeHandle) -> Result<(), TransportError>;

    fn server_is_connected(&self, server: NativeHandle) -> bool;

    fn server_address(&self, server: NativeHandle) -> Option<String>;

    /// Next incoming connection, if one is waiting; the caller owns it.
    fn server_accept(&self, server: NativeHandle) -> Result<Option<NativeHandle>, TransportError>;

    // ── Messages ──────────────────────────────────────────────────────────

    fn message_header(&self, msg: NativeHandle) -> Result<MessageHeader, TransportError>;
}

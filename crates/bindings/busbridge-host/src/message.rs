use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use busbridge_protocol::MessageHeader;
use busbridge_transport::NativeHandle;

use crate::registry::{Registered, WrapperKind};
use crate::runtime::{begin_finalize, first_failure, Acquire, Context, Wrapped};
use crate::BindError;

pub(crate) struct MessageInner {
    ctx: Rc<Context>,
    handle: NativeHandle,
    released: Cell<bool>,
}

impl MessageInner {
    fn finalize(&self) -> Result<(), BindError> {
        begin_finalize(&self.released, WrapperKind::Message, self.handle)?;
        let release = self.ctx.transport.release(self.handle);
        log::debug!("bridge: finalized message {}", self.handle);
        first_failure([release])
    }
}

impl Registered for MessageInner {
    fn is_released(&self) -> bool {
        self.released.get()
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn std::any::Any> {
        self
    }
}

impl Wrapped for MessageInner {
    fn mark_released(&self) {
        self.released.set(true);
    }
}

impl Drop for MessageInner {
    fn drop(&mut self) {
        if !self.released.get() {
            if let Err(err) = self.finalize() {
                log::warn!("bridge: implicit finalize of message {}: {err}", self.handle);
            }
        }
        self.ctx.evict(self.handle, self as *const Self as usize);
    }
}

/// Host wrapper around a native message.
#[derive(Clone)]
pub struct Message {
    inner: Rc<MessageInner>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("handle", &self.inner.handle)
            .field("finalized", &self.inner.released.get())
            .finish()
    }
}

impl Message {
    pub(crate) fn wrap(
        ctx: &Rc<Context>,
        handle: NativeHandle,
        acquire: Acquire,
    ) -> Result<Self, BindError> {
        let (inner, _) = ctx.wrap(handle, WrapperKind::Message, acquire, || {
            Rc::new(MessageInner { ctx: Rc::clone(ctx), handle, released: Cell::new(false) })
        })?;
        Ok(Self { inner })
    }

    pub(crate) fn live(&self) -> Result<NativeHandle, BindError> {
        if self.inner.released.get() {
            return Err(BindError::invalid_argument(format!(
                "message {} has been finalized",
                self.inner.handle
            )));
        }
        Ok(self.inner.handle)
    }

    pub fn handle(&self) -> NativeHandle {
        self.inner.handle
    }

    pub fn ptr_eq(&self, other: &Message) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.released.get()
    }

    pub fn header(&self) -> Result<MessageHeader, BindError> {
        Ok(self.inner.ctx.transport.message_header(self.live()?)?)
    }

    /// The message type as `(host constant, protocol name)`, for example
    /// `("DBUS_MESSAGE_TYPE_SIGNAL", "signal")`.
    pub fn get_type(&self) -> Result<(&'static str, &'static str), BindError> {
        let msg_type = self.header()?.msg_type;
        Ok((msg_type.as_host_str(), msg_type.as_protocol_str()))
    }

    pub fn finalize(&self) -> Result<(), BindError> {
        self.inner.finalize()
    }
}

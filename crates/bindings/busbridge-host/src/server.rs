use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use busbridge_transport::NativeHandle;

use crate::registry::{Registered, WrapperKind};
use crate::runtime::{begin_finalize, first_failure, Acquire, CloseOnFinalize, Context, Wrapped};
use crate::{BindError, Connection};

pub(crate) struct ServerInner {
    ctx: Rc<Context>,
    handle: NativeHandle,
    released: Cell<bool>,
}

impl ServerInner {
    fn live(&self) -> Result<NativeHandle, BindError> {
        if self.released.get() {
            return Err(BindError::invalid_argument(format!(
                "server {} has been finalized",
                self.handle
            )));
        }
        Ok(self.handle)
    }

    fn finalize(&self) -> Result<(), BindError> {
        begin_finalize(&self.released, WrapperKind::Server, self.handle)?;
        let transport = &self.ctx.transport;
        let disconnect = transport.server_disconnect(self.handle);
        let release = transport.release(self.handle);
        log::debug!("bridge: finalized server {}", self.handle);
        first_failure([disconnect, release])
    }
}

impl Registered for ServerInner {
    fn is_released(&self) -> bool {
        self.released.get()
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn std::any::Any> {
        self
    }
}

impl Wrapped for ServerInner {
    fn mark_released(&self) {
        self.released.set(true);
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if !self.released.get() {
            if let Err(err) = self.finalize() {
                log::warn!("bridge: implicit finalize of server {}: {err}", self.handle);
            }
        }
        self.ctx.evict(self.handle, self as *const Self as usize);
    }
}

/// Host wrapper around a listening server.
#[derive(Clone)]
pub struct Server {
    inner: Rc<ServerInner>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("handle", &self.inner.handle)
            .field("finalized", &self.inner.released.get())
            .finish()
    }
}

impl Server {
    pub(crate) fn wrap(ctx: &Rc<Context>, handle: NativeHandle) -> Result<Self, BindError> {
        let (inner, _) = ctx.wrap(handle, WrapperKind::Server, Acquire::Adopt, || {
            Rc::new(ServerInner { ctx: Rc::clone(ctx), handle, released: Cell::new(false) })
        })?;
        Ok(Self { inner })
    }

    pub fn handle(&self) -> NativeHandle {
        self.inner.handle
    }

    pub fn ptr_eq(&self, other: &Server) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stops listening. The wrapper stays valid until finalized.
    pub fn disconnect(&self) -> Result<(), BindError> {
        Ok(self.inner.ctx.transport.server_disconnect(self.inner.live()?)?)
    }

    pub fn is_connected(&self) -> Result<bool, BindError> {
        Ok(self.inner.ctx.transport.server_is_connected(self.inner.live()?))
    }

    /// Address clients can connect to, including the server's guid.
    pub fn address(&self) -> Result<Option<String>, BindError> {
        Ok(self.inner.ctx.transport.server_address(self.inner.live()?))
    }

    /// Takes the next incoming connection, if any. Finalizing the returned
    /// wrapper closes the connection.
    pub fn accept(&self) -> Result<Option<Connection>, BindError> {
        let handle = self.inner.live()?;
        match self.inner.ctx.transport.server_accept(handle)? {
            Some(conn) => Connection::wrap(
                &self.inner.ctx,
                conn,
                WrapperKind::Connection,
                Acquire::Adopt,
                CloseOnFinalize::Close,
            )
            .map(Some),
            None => Ok(None),
        }
    }

    pub fn finalize(&self) -> Result<(), BindError> {
        self.inner.finalize()
    }
}

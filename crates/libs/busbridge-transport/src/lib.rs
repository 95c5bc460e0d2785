//! Boundary between the binding layer and the native bus transport.
//!
//! The binding never touches transport objects directly. It holds
//! [`NativeHandle`]s and drives them through the [`Transport`] trait, which
//! models the reference-counted connection, server, and message primitives of
//! the underlying bus library. [`LoopbackTransport`] implements the trait in
//! memory so the binding can run without a system bus.

pub mod error;
pub mod handle;
pub mod loopback;
pub mod transport;

pub use error::{error_names, TransportError};
pub use handle::NativeHandle;
pub use loopback::LoopbackTransport;
pub use transport::{FilterHook, Transport};

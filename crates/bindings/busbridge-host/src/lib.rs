//! # busbridge-host
//!
//! Host-facing bindings for a reference-counted message-bus transport.
//!
//! A host runtime sees connections, buses, servers, and messages as wrapper
//! values. This crate keeps exactly one wrapper alive per native object,
//! settles native reference counts as wrappers are created and finalized,
//! and runs host filter callables from the transport's dispatch callback.
//!
//! ## Example
//!
//! ```rust
//! use std::rc::Rc;
//!
//! use busbridge_host::{Filter, Runtime};
//! use busbridge_protocol::{BusType, HandlerResult, MatchRule};
//! use busbridge_transport::LoopbackTransport;
//!
//! let runtime = Runtime::new(Rc::new(LoopbackTransport::new()));
//! let bus = runtime.bus_get(BusType::Session).unwrap();
//! bus.add_match(&MatchRule::new().msg_type("signal").interface("com.example.Foo"))
//!     .unwrap();
//! bus.add_filter(Filter::new(|_, _| Ok(HandlerResult::NotYetHandled))).unwrap();
//!
//! let again = runtime.bus_get(BusType::Session).unwrap();
//! assert!(again.ptr_eq(&bus));
//! assert_eq!(again.filter_count(), 1);
//! ```

pub mod config;
mod connection;
pub mod error;
pub mod filter;
mod message;
pub mod record;
pub mod registry;
mod runtime;
mod server;

pub use config::{BridgeConfig, ConfigError};
pub use connection::{Bus, Connection};
pub use error::{BindError, FilterError};
pub use filter::{dispatch_chain, Filter};
pub use message::Message;
pub use record::{MethodCallRecord, SignalRecord};
pub use registry::{IdentityRegistry, WrapperKind};
pub use runtime::{Acquire, CloseOnFinalize, Runtime};
pub use server::Server;

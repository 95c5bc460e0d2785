//! # busbridge-protocol
//!
//! Pure, transport-independent pieces of the message-bus protocol that the
//! binding layer needs before it hands anything to the native transport:
//!
//! - [`names`]: grammar checks for bus names, unique connection names,
//!   interface names, member names, and object paths
//! - [`match_rule`]: the structured [`MatchRule`] and its `key='value'`
//!   serialization
//! - [`types`]: bus/message/dispatch enums and the string constants the host
//!   runtime exchanges with the binding
//!
//! ## Example
//!
//! ```rust
//! use busbridge_protocol::{validate, MatchRule, NameKind};
//!
//! assert_eq!(validate(":1.42", NameKind::UniqueConnection), Ok(5));
//! assert!(validate("1.foo", NameKind::Bus).is_err());
//!
//! let rule = MatchRule::new()
//!     .msg_type("signal")
//!     .interface("com.example.Foo")
//!     .member("Bar");
//! assert_eq!(
//!     rule.build().unwrap(),
//!     "type='signal',interface='com.example.Foo',member='Bar'"
//! );
//! ```

pub mod match_rule;
pub mod names;
pub mod types;

pub use match_rule::{MatchRule, MatchRuleError};
pub use names::{is_valid, validate, NameError, NameKind};
pub use types::{
    BusType, DispatchStatus, HandlerResult, MessageHeader, MessageType, UnknownConstant,
};

/// Longest bus, interface, unique connection, or member name the protocol accepts.
pub const MAXIMUM_NAME_LENGTH: usize = 255;

/// Longest serialized match rule the bus daemon accepts.
pub const MAXIMUM_MATCH_RULE_LENGTH: usize = 1024;

/// Number of `argN` indices a match rule may constrain (`arg0` through `arg62`).
pub const MAXIMUM_MATCH_RULE_ARG_NUMBER: u32 = 63;

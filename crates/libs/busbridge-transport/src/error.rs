/// Well-known error names the transport reports.
pub mod error_names {
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const BAD_ADDRESS: &str = "org.freedesktop.DBus.Error.BadAddress";
    pub const ADDRESS_IN_USE: &str = "org.freedesktop.DBus.Error.AddressInUse";
    pub const NO_SERVER: &str = "org.freedesktop.DBus.Error.NoServer";
    pub const DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const MATCH_RULE_INVALID: &str = "org.freedesktop.DBus.Error.MatchRuleInvalid";
    pub const MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";
}

/// An error reported by the native transport: a bus error name plus a
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct TransportError {
    pub name: String,
    pub message: String,
}

impl TransportError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self { name: name.into(), message: message.into() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(error_names::FAILED, message)
    }

    pub fn bad_address(message: impl Into<String>) -> Self {
        Self::new(error_names::BAD_ADDRESS, message)
    }

    pub fn address_in_use(address: &str) -> Self {
        Self::new(error_names::ADDRESS_IN_USE, format!("address '{address}' is already in use"))
    }

    pub fn no_server(address: &str) -> Self {
        Self::new(error_names::NO_SERVER, format!("no server listening on '{address}'"))
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(error_names::DISCONNECTED, message)
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(error_names::INVALID_ARGS, message)
    }

    pub fn match_rule_invalid(message: impl Into<String>) -> Self {
        Self::new(error_names::MATCH_RULE_INVALID, message)
    }

    pub fn match_rule_not_found(rule: &str) -> Self {
        Self::new(error_names::MATCH_RULE_NOT_FOUND, format!("no match rule '{rule}' registered"))
    }

    /// The handle does not name a live transport object.
    pub fn unknown_handle(handle: crate::NativeHandle) -> Self {
        Self::failed(format!("unknown handle {handle}"))
    }
}

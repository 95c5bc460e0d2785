use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A string the host passed where one of the protocol constants was expected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("parameter is not a valid {expected} ({value})")]
pub struct UnknownConstant {
    pub expected: &'static str,
    pub value: String,
}

macro_rules! host_constants {
    (
        $name:ident, $expected:literal {
            $($variant:ident => $constant:literal),+ $(,)?
        }
    ) => {
        impl $name {
            /// All variants, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// The constant the host runtime uses for this value.
            pub fn as_host_str(self) -> &'static str {
                match self {
                    $($name::$variant => $constant),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownConstant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($constant => Ok($name::$variant),)+
                    _ => Err(UnknownConstant { expected: $expected, value: value.to_string() }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_host_str())
            }
        }
    };
}

// ── Buses ─────────────────────────────────────────────────────────────────────

/// Which well-known message bus to attach to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusType {
    #[default]
    Session,
    System,
    Starter,
}

host_constants!(BusType, "bus type" {
    Session => "DBUS_BUS_SESSION",
    System => "DBUS_BUS_SYSTEM",
    Starter => "DBUS_BUS_STARTER",
});

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Invalid,
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

host_constants!(MessageType, "message type" {
    Invalid => "DBUS_MESSAGE_TYPE_INVALID",
    MethodCall => "DBUS_MESSAGE_TYPE_METHOD_CALL",
    MethodReturn => "DBUS_MESSAGE_TYPE_METHOD_RETURN",
    Error => "DBUS_MESSAGE_TYPE_ERROR",
    Signal => "DBUS_MESSAGE_TYPE_SIGNAL",
});

impl MessageType {
    /// The lowercase protocol spelling, as used by `type='…'` in match rules.
    pub fn as_protocol_str(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::MethodCall => "method_call",
            Self::MethodReturn => "method_return",
            Self::Error => "error",
            Self::Signal => "signal",
        }
    }

    /// Parses a match-rule `type` value. `invalid` is not a matchable type.
    pub fn from_protocol_str(value: &str) -> Option<Self> {
        match value {
            "method_call" => Some(Self::MethodCall),
            "method_return" => Some(Self::MethodReturn),
            "error" => Some(Self::Error),
            "signal" => Some(Self::Signal),
            _ => None,
        }
    }
}

/// Envelope fields of a message. The body is not modelled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    /// Zero until the message has been sent.
    pub serial: u32,
    pub reply_serial: Option<u32>,
    pub sender: Option<String>,
    pub destination: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
}

impl MessageHeader {
    pub fn new(msg_type: MessageType) -> Self {
        Self { msg_type, ..Self::default() }
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            ..Self::new(MessageType::Signal)
        }
    }

    pub fn method_call(
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        method: &str,
    ) -> Self {
        Self {
            destination: destination.map(str::to_string),
            path: Some(path.to_string()),
            interface: interface.map(str::to_string),
            member: Some(method.to_string()),
            ..Self::new(MessageType::MethodCall)
        }
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Verdict of a message filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerResult {
    Handled,
    NotYetHandled,
    NeedMemory,
}

host_constants!(HandlerResult, "handler result" {
    Handled => "DBUS_HANDLER_RESULT_HANDLED",
    NotYetHandled => "DBUS_HANDLER_RESULT_NOT_YET_HANDLED",
    NeedMemory => "DBUS_HANDLER_RESULT_NEED_MEMORY",
});

impl HandlerResult {
    /// Whether this verdict ends a filter chain.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::NotYetHandled)
    }
}

/// State of a connection's incoming queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    DataRemains,
    Complete,
    NeedMemory,
}

host_constants!(DispatchStatus, "dispatch status" {
    DataRemains => "DBUS_DISPATCH_DATA_REMAINS",
    Complete => "DBUS_DISPATCH_COMPLETE",
    NeedMemory => "DBUS_DISPATCH_NEED_MEMORY",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_constants_parse_back() {
        for bus in BusType::ALL {
            assert_eq!(bus.as_host_str().parse::<BusType>(), Ok(*bus));
        }
        for msg_type in MessageType::ALL {
            assert_eq!(msg_type.as_host_str().parse::<MessageType>(), Ok(*msg_type));
        }
        assert_eq!(
            "DBUS_HANDLER_RESULT_NEED_MEMORY".parse::<HandlerResult>(),
            Ok(HandlerResult::NeedMemory)
        );
    }

    #[test]
    fn unknown_constant_reports_value() {
        let err = "DBUS_BUS_NOWHERE".parse::<BusType>().unwrap_err();
        assert_eq!(err.to_string(), "parameter is not a valid bus type (DBUS_BUS_NOWHERE)");
        assert!("DBUS_MESSAGE_TYPE_METHOD_CALL ".parse::<MessageType>().is_err());
    }

    #[test]
    fn protocol_spelling_excludes_invalid() {
        assert_eq!(MessageType::from_protocol_str("signal"), Some(MessageType::Signal));
        assert_eq!(MessageType::from_protocol_str("invalid"), None);
        assert_eq!(MessageType::MethodReturn.as_protocol_str(), "method_return");
    }

    #[test]
    fn bus_type_uses_lowercase_in_config() {
        let parsed: BusType = serde_json::from_str("\"system\"").expect("parse");
        assert_eq!(parsed, BusType::System);
    }
}

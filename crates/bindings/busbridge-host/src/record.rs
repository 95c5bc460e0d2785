//! Structured records passed in by the host in place of positional arguments.
//!
//! Unknown keys are ignored. A recognized key holding anything other than a
//! string, or a missing required key, is an invalid argument.

use busbridge_protocol::MatchRule;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::BindError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MethodCallRecord {
    #[serde(default)]
    pub destination: Option<String>,
    pub path: String,
    #[serde(default)]
    pub interface: Option<String>,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SignalRecord {
    pub path: String,
    pub interface: String,
    pub name: String,
}

impl MethodCallRecord {
    pub fn from_value(record: &Value) -> Result<Self, BindError> {
        parse(record, "method call")
    }
}

impl SignalRecord {
    pub fn from_value(record: &Value) -> Result<Self, BindError> {
        parse(record, "signal")
    }
}

/// Reads a match-rule record: `type`, `sender`, `interface`, `member`,
/// `path`, `destination`, and an `arg` object keyed by argument index.
pub fn match_rule_from_value(record: &Value) -> Result<MatchRule, BindError> {
    parse(record, "match rule")
}

fn parse<T: DeserializeOwned>(record: &Value, what: &str) -> Result<T, BindError> {
    if !record.is_object() {
        return Err(BindError::invalid_argument(format!("{what} must be described by a record")));
    }
    T::deserialize(record)
        .map_err(|err| BindError::invalid_argument(format!("{what} record: {err}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn method_call_record_ignores_unknown_keys() {
        let record = json!({
            "path": "/org/example",
            "method": "Ping",
            "comment": "not a field"
        });
        let parsed = MethodCallRecord::from_value(&record).expect("record");
        assert_eq!(parsed.path, "/org/example");
        assert_eq!(parsed.destination, None);
        assert_eq!(parsed.interface, None);
    }

    #[test]
    fn rejects_non_string_fields_and_missing_keys() {
        let err = MethodCallRecord::from_value(&json!({ "path": 7, "method": "Ping" }))
            .unwrap_err();
        assert!(matches!(err, BindError::InvalidArgument(_)));

        let err = SignalRecord::from_value(&json!({ "path": "/", "interface": "a.b" }))
            .unwrap_err();
        assert!(matches!(err, BindError::InvalidArgument(_)));

        let err = SignalRecord::from_value(&json!(["/", "a.b", "C"])).unwrap_err();
        assert!(matches!(err, BindError::InvalidArgument(_)));
    }

    #[test]
    fn match_rule_record_reads_arg_table() {
        let rule = match_rule_from_value(&json!({
            "type": "signal",
            "arg": { "0": "zero", "3": "three" }
        }))
        .expect("record");
        assert_eq!(rule.msg_type.as_deref(), Some("signal"));
        assert_eq!(rule.arg.len(), 2);
        assert!(match_rule_from_value(&json!({ "member": false })).is_err());
    }
}

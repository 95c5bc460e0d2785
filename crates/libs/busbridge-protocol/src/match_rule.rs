//! Structured match rules and their `key='value'` string form.
//!
//! Fields are always emitted in the order `type`, `sender`, `interface`,
//! `member`, `path`, `destination`, then `argN` in ascending `N`, so two equal
//! rules always serialize to the same string. The bus daemon compares rules
//! textually on removal, which makes that ordering load-bearing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::names::{validate, NameError, NameKind};
use crate::types::{MessageHeader, MessageType};
use crate::{MAXIMUM_MATCH_RULE_ARG_NUMBER, MAXIMUM_MATCH_RULE_LENGTH};

/// Errors from building or parsing a match rule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchRuleError {
    #[error(transparent)]
    InvalidName(#[from] NameError),

    #[error("'{0}' is not a valid type")]
    InvalidType(String),

    #[error("arg{index} is out of range (must be below arg{})", MAXIMUM_MATCH_RULE_ARG_NUMBER)]
    ArgOutOfRange { index: u32 },

    #[error("match rule is too long ({length} bytes, maximum {max})")]
    TooLong { length: usize, max: usize },

    #[error("unknown match rule key '{0}'")]
    UnknownKey(String),

    #[error("malformed match rule: {0}")]
    Malformed(String),
}

/// A subscription filter, as handed to the bus daemon by `add_match`.
///
/// Absent fields do not constrain anything. `arg` maps an argument index in
/// `0..63` to the string value it must equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchRule {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub arg: BTreeMap<u32, String>,
}

impl MatchRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn msg_type(mut self, value: impl Into<String>) -> Self {
        self.msg_type = Some(value.into());
        self
    }

    pub fn sender(mut self, value: impl Into<String>) -> Self {
        self.sender = Some(value.into());
        self
    }

    pub fn interface(mut self, value: impl Into<String>) -> Self {
        self.interface = Some(value.into());
        self
    }

    pub fn member(mut self, value: impl Into<String>) -> Self {
        self.member = Some(value.into());
        self
    }

    pub fn path(mut self, value: impl Into<String>) -> Self {
        self.path = Some(value.into());
        self
    }

    pub fn destination(mut self, value: impl Into<String>) -> Self {
        self.destination = Some(value.into());
        self
    }

    pub fn arg(mut self, index: u32, value: impl Into<String>) -> Self {
        self.arg.insert(index, value.into());
        self
    }

    /// True when no field is set; such a rule matches every message.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Validates every present field and serializes the rule.
    pub fn build(&self) -> Result<String, MatchRuleError> {
        let mut parts: Vec<String> = Vec::new();

        if let Some(msg_type) = &self.msg_type {
            if MessageType::from_protocol_str(msg_type).is_none() {
                return Err(MatchRuleError::InvalidType(msg_type.clone()));
            }
            parts.push(format!("type='{msg_type}'"));
        }
        let named = [
            ("sender", &self.sender, NameKind::BusOrUniqueConnection),
            ("interface", &self.interface, NameKind::Interface),
            ("member", &self.member, NameKind::Member),
            ("path", &self.path, NameKind::ObjectPath),
            ("destination", &self.destination, NameKind::UniqueConnection),
        ];
        for (key, value, kind) in named {
            if let Some(value) = value {
                validate(value, kind)?;
                parts.push(format!("{key}='{value}'"));
            }
        }
        for (index, value) in &self.arg {
            if *index >= MAXIMUM_MATCH_RULE_ARG_NUMBER {
                return Err(MatchRuleError::ArgOutOfRange { index: *index });
            }
            parts.push(format!("arg{index}='{}'", escape_value(value)));
        }

        let rule = parts.join(",");
        if rule.len() > MAXIMUM_MATCH_RULE_LENGTH {
            return Err(MatchRuleError::TooLong {
                length: rule.len(),
                max: MAXIMUM_MATCH_RULE_LENGTH,
            });
        }
        Ok(rule)
    }

    /// Parses the serialized form produced by [`MatchRule::build`] (or any
    /// equivalent rule written by hand) and validates it the same way.
    pub fn parse(rule: &str) -> Result<Self, MatchRuleError> {
        let mut parsed = Self::default();
        let mut rest = rule.trim();
        while !rest.is_empty() {
            let eq = rest
                .find('=')
                .ok_or_else(|| MatchRuleError::Malformed(format!("missing '=' in '{rest}'")))?;
            let key = rest[..eq].trim();
            let (value, remaining) = split_value(&rest[eq + 1..])
                .ok_or_else(|| MatchRuleError::Malformed(format!("unterminated quote in '{rule}'")))?;
            parsed.set_field(key, value)?;
            rest = remaining.strip_prefix(',').unwrap_or(remaining).trim_start();
        }
        parsed.build()?;
        Ok(parsed)
    }

    /// Whether a message with this envelope satisfies the rule.
    ///
    /// `argN` constraints need a message body, which headers do not carry, so
    /// a rule with any `arg` entry never matches.
    pub fn matches(&self, header: &MessageHeader) -> bool {
        if !self.arg.is_empty() {
            return false;
        }
        if let Some(msg_type) = &self.msg_type {
            if msg_type != header.msg_type.as_protocol_str() {
                return false;
            }
        }
        let pairs = [
            (&self.sender, &header.sender),
            (&self.interface, &header.interface),
            (&self.member, &header.member),
            (&self.path, &header.path),
            (&self.destination, &header.destination),
        ];
        pairs.iter().all(|(wanted, actual)| match wanted {
            Some(wanted) => actual.as_deref() == Some(wanted.as_str()),
            None => true,
        })
    }

    fn set_field(&mut self, key: &str, value: String) -> Result<(), MatchRuleError> {
        let slot = match key {
            "type" => &mut self.msg_type,
            "sender" => &mut self.sender,
            "interface" => &mut self.interface,
            "member" => &mut self.member,
            "path" => &mut self.path,
            "destination" => &mut self.destination,
            _ => {
                let index = key
                    .strip_prefix("arg")
                    .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
                    .and_then(|digits| digits.parse::<u32>().ok())
                    .ok_or_else(|| MatchRuleError::UnknownKey(key.to_string()))?;
                if self.arg.insert(index, value).is_some() {
                    return Err(MatchRuleError::Malformed(format!("duplicate key '{key}'")));
                }
                return Ok(());
            }
        };
        if slot.replace(value).is_some() {
            return Err(MatchRuleError::Malformed(format!("duplicate key '{key}'")));
        }
        Ok(())
    }
}

/// Apostrophes cannot appear inside a quoted value; the protocol spells them
/// as close-quote, escaped apostrophe, reopen-quote.
fn escape_value(value: &str) -> String {
    value.replace('\'', r"'\''")
}

/// Reads one value up to the next unquoted `,`. Returns the unescaped value
/// and the unread input (starting at the `,`, or empty).
fn split_value(input: &str) -> Option<(String, &str)> {
    let mut value = String::new();
    let mut in_quotes = false;
    let mut chars = input.char_indices().peekable();
    while let Some((index, c)) = chars.next() {
        match c {
            '\'' => in_quotes = !in_quotes,
            '\\' if !in_quotes && matches!(chars.peek(), Some((_, '\''))) => {
                value.push('\'');
                chars.next();
            }
            ',' if !in_quotes => return Some((value, &input[index..])),
            other => value.push(other),
        }
    }
    (!in_quotes).then_some((value, ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_fields_in_fixed_order() {
        let rule = MatchRule::new()
            .member("Bar")
            .interface("com.example.Foo")
            .msg_type("signal");
        assert_eq!(
            rule.build().expect("build"),
            "type='signal',interface='com.example.Foo',member='Bar'"
        );
    }

    #[test]
    fn args_follow_named_fields_in_ascending_order() {
        let rule = MatchRule::new()
            .arg(2, "two")
            .arg(0, "zero")
            .path("/org/example")
            .sender(":1.9")
            .destination(":1.10");
        assert_eq!(
            rule.build().expect("build"),
            "sender=':1.9',path='/org/example',destination=':1.10',arg0='zero',arg2='two'"
        );
    }

    #[test]
    fn empty_rule_serializes_to_empty_string() {
        assert!(MatchRule::new().is_empty());
        assert_eq!(MatchRule::new().build().expect("build"), "");
    }

    #[test]
    fn rejects_invalid_fields() {
        assert_eq!(
            MatchRule::new().msg_type("broadcast").build(),
            Err(MatchRuleError::InvalidType("broadcast".into()))
        );
        assert_eq!(
            MatchRule::new().interface("nodots").build(),
            Err(MatchRuleError::InvalidName(NameError::new("nodots", NameKind::Interface)))
        );
        assert_eq!(
            MatchRule::new().destination("com.example.Foo").build(),
            Err(MatchRuleError::InvalidName(NameError::new(
                "com.example.Foo",
                NameKind::UniqueConnection
            )))
        );
        assert_eq!(
            MatchRule::new().arg(63, "x").build(),
            Err(MatchRuleError::ArgOutOfRange { index: 63 })
        );
        assert_eq!(MatchRule::new().arg(62, "x").build().as_deref(), Ok("arg62='x'"));
    }

    #[test]
    fn rejects_rules_over_the_length_limit() {
        let long = "v".repeat(MAXIMUM_MATCH_RULE_LENGTH);
        let err = MatchRule::new().arg(0, long).build().unwrap_err();
        assert!(matches!(err, MatchRuleError::TooLong { max: MAXIMUM_MATCH_RULE_LENGTH, .. }));
    }

    #[test]
    fn escapes_apostrophes_in_arg_values() {
        let rule = MatchRule::new().arg(0, "it's");
        let text = rule.build().expect("build");
        assert_eq!(text, r"arg0='it'\''s'");
        assert_eq!(MatchRule::parse(&text).expect("parse"), rule);
    }

    #[test]
    fn parses_its_own_output() {
        let rule = MatchRule::new()
            .msg_type("method_call")
            .sender("com.example.Sender")
            .member("Ping")
            .arg(1, "a,b");
        let text = rule.build().expect("build");
        assert_eq!(MatchRule::parse(&text).expect("parse"), rule);
    }

    #[test]
    fn parse_rejects_unknown_and_duplicate_keys() {
        assert_eq!(
            MatchRule::parse("eavesdrop='true'"),
            Err(MatchRuleError::UnknownKey("eavesdrop".into()))
        );
        assert_eq!(
            MatchRule::parse("arg0namespace='x'"),
            Err(MatchRuleError::UnknownKey("arg0namespace".into()))
        );
        assert!(matches!(
            MatchRule::parse("member='A',member='B'"),
            Err(MatchRuleError::Malformed(_))
        ));
        assert!(matches!(MatchRule::parse("member='A"), Err(MatchRuleError::Malformed(_))));
    }

    #[test]
    fn matches_on_envelope_fields() {
        let header = MessageHeader::signal("/org/example", "com.example.Foo", "Bar");
        assert!(MatchRule::new().matches(&header));
        assert!(MatchRule::new().msg_type("signal").interface("com.example.Foo").matches(&header));
        assert!(!MatchRule::new().msg_type("method_call").matches(&header));
        assert!(!MatchRule::new().member("Baz").matches(&header));
        assert!(!MatchRule::new().sender(":1.1").matches(&header));
        assert!(!MatchRule::new().arg(0, "x").matches(&header));
    }

    #[test]
    fn deserializes_from_a_host_record() {
        let record = serde_json::json!({
            "type": "signal",
            "interface": "com.example.Foo",
            "arg": { "0": "first" }
        });
        let rule: MatchRule = serde_json::from_value(record).expect("record");
        assert_eq!(rule.arg.get(&0).map(String::as_str), Some("first"));
        assert_eq!(
            rule.build().expect("build"),
            "type='signal',interface='com.example.Foo',arg0='first'"
        );
    }
}

//! Name grammar for the five kinds of bus protocol names.
//!
//! Every check returns the byte length of the accepted name so callers that
//! build fixed-size buffers can size them without re-scanning.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::MAXIMUM_NAME_LENGTH;

/// Which grammar a name is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameKind {
    /// Well-known bus name, e.g. `com.example.Service`.
    Bus,
    /// Connection name assigned by the bus daemon, e.g. `:1.42`.
    UniqueConnection,
    /// Interface name, e.g. `com.example.Interface`.
    Interface,
    /// Method or signal name, e.g. `Frobnicate`.
    Member,
    /// Object path, e.g. `/com/example/Object`.
    ObjectPath,
    /// Either a bus name or a unique connection name (the `sender` of a match rule).
    BusOrUniqueConnection,
}

impl NameKind {
    /// Human-readable name used in error messages.
    pub fn describe(self) -> &'static str {
        match self {
            Self::Bus => "bus name",
            Self::UniqueConnection => "unique connection name",
            Self::Interface => "interface name",
            Self::Member => "member name",
            Self::ObjectPath => "object path",
            Self::BusOrUniqueConnection => "bus or unique connection name",
        }
    }
}

impl fmt::Display for NameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// A name rejected by [`validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{value}' is not a valid {kind}")]
pub struct NameError {
    /// The offending input, verbatim.
    pub value: String,
    /// The grammar it was checked against.
    pub kind: NameKind,
}

impl NameError {
    pub fn new(value: impl Into<String>, kind: NameKind) -> Self {
        Self { value: value.into(), kind }
    }
}

#[derive(Clone, Copy)]
struct ElementRules {
    allow_dash: bool,
    allow_leading_digit: bool,
}

const BUS_ELEMENT: ElementRules = ElementRules { allow_dash: true, allow_leading_digit: false };
const UNIQUE_ELEMENT: ElementRules = ElementRules { allow_dash: true, allow_leading_digit: true };
const INTERFACE_ELEMENT: ElementRules =
    ElementRules { allow_dash: false, allow_leading_digit: false };
const PATH_ELEMENT: ElementRules = ElementRules { allow_dash: false, allow_leading_digit: true };

/// Checks `name` against the grammar for `kind`.
///
/// Returns the length in bytes of the accepted name, or a [`NameError`]
/// naming the value and the expected kind.
pub fn validate(name: &str, kind: NameKind) -> Result<usize, NameError> {
    let valid = match kind {
        NameKind::Bus => within_limit(name) && dotted_name_is_valid(name, BUS_ELEMENT),
        NameKind::Interface => within_limit(name) && dotted_name_is_valid(name, INTERFACE_ELEMENT),
        NameKind::UniqueConnection => {
            within_limit(name)
                && name.strip_prefix(':').is_some_and(|rest| dotted_name_is_valid(rest, UNIQUE_ELEMENT))
        }
        NameKind::Member => within_limit(name) && element_is_valid(name, INTERFACE_ELEMENT),
        NameKind::ObjectPath => object_path_is_valid(name),
        NameKind::BusOrUniqueConnection => {
            is_valid(name, NameKind::Bus) || is_valid(name, NameKind::UniqueConnection)
        }
    };
    if valid {
        Ok(name.len())
    } else {
        Err(NameError::new(name, kind))
    }
}

/// Shorthand for `validate(name, kind).is_ok()`.
pub fn is_valid(name: &str, kind: NameKind) -> bool {
    validate(name, kind).is_ok()
}

fn within_limit(name: &str) -> bool {
    name.len() <= MAXIMUM_NAME_LENGTH
}

fn element_is_valid(element: &str, rules: ElementRules) -> bool {
    let bytes = element.as_bytes();
    let Some(&first) = bytes.first() else {
        return false;
    };
    if first.is_ascii_digit() && !rules.allow_leading_digit {
        return false;
    }
    bytes
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'_' || (rules.allow_dash && b == b'-'))
}

fn dotted_name_is_valid(name: &str, rules: ElementRules) -> bool {
    let mut elements = 0usize;
    for element in name.split('.') {
        if !element_is_valid(element, rules) {
            return false;
        }
        elements += 1;
    }
    elements >= 2
}

fn object_path_is_valid(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    match path.strip_prefix('/') {
        Some(rest) => rest.split('/').all(|element| element_is_valid(element, PATH_ELEMENT)),
        None => false,
    }
}

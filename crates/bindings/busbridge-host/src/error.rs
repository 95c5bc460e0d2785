use busbridge_protocol::{MatchRuleError, NameError, UnknownConstant};
use busbridge_transport::TransportError;

/// Error a host callable reports from inside a filter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct FilterError {
    pub message: String,
}

impl FilterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl From<BindError> for FilterError {
    fn from(err: BindError) -> Self {
        Self::new(err.to_string())
    }
}

/// Errors surfaced to host callers.
///
/// Everything except `InternalConsistency` is an ordinary, recoverable
/// failure of the call that produced it. `InternalConsistency` means the
/// registry and the native object graph disagree and the embedding should
/// treat the runtime as broken.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum BindError {
    #[error(transparent)]
    InvalidName(NameError),

    #[error(transparent)]
    MatchRule(MatchRuleError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("it is not allowed to remove an unregistered filter")]
    NotRegistered,

    #[error("filter failed: {0}")]
    Filter(#[from] FilterError),

    #[error("internal consistency error: {0}")]
    InternalConsistency(String),
}

impl BindError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalConsistency(message.into())
    }

    /// Returns `true` when the runtime can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InternalConsistency(_))
    }
}

impl From<NameError> for BindError {
    fn from(err: NameError) -> Self {
        Self::InvalidName(err)
    }
}

impl From<MatchRuleError> for BindError {
    fn from(err: MatchRuleError) -> Self {
        match err {
            MatchRuleError::InvalidName(name) => Self::InvalidName(name),
            other => Self::MatchRule(other),
        }
    }
}

impl From<UnknownConstant> for BindError {
    fn from(err: UnknownConstant) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use busbridge_protocol::NameKind;

    use super::*;

    #[test]
    fn match_rule_name_errors_surface_as_invalid_name() {
        let err = BindError::from(MatchRuleError::InvalidName(NameError::new(
            "x",
            NameKind::Member,
        )));
        assert!(matches!(err, BindError::InvalidName(_)));

        let err = BindError::from(MatchRuleError::ArgOutOfRange { index: 70 });
        assert!(matches!(err, BindError::MatchRule(_)));
    }

    #[test]
    fn only_internal_consistency_is_fatal() {
        assert!(BindError::internal("double finalize").is_fatal());
        assert!(!BindError::NotRegistered.is_fatal());
        assert!(!BindError::from(TransportError::failed("x")).is_fatal());
        assert_eq!(
            BindError::NotRegistered.to_string(),
            "it is not allowed to remove an unregistered filter"
        );
    }
}

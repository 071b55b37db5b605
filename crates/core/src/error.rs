use thiserror::Error;

/// A command was refused by a business rule.
///
/// Raised by command handlers before anything is appended ("stream already
/// active", "scene already exists"). Storage and routing failures are not
/// domain errors and live in `scenelog-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed command input (empty name, negative volume).
    #[error("invalid input: {0}")]
    Validation(String),

    /// The command does not fit the current state (stopping an idle stream).
    #[error("not allowed now: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("unknown {0}")]
    NotFound(String),

    /// The target already exists or was changed concurrently.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Short machine-readable label, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::InvariantViolation(_) => "invariant",
            Self::InvalidId(_) => "invalid_id",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_and_kinds() {
        let err = DomainError::invariant("stream is already active");
        assert_eq!(err.to_string(), "not allowed now: stream is already active");
        assert_eq!(err.kind(), "invariant");
        assert_eq!(DomainError::not_found("scene `BRB`").to_string(), "unknown scene `BRB`");
    }
}

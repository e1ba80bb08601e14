use super::{Event, ScopeKey};
use std::fmt;

/// Reasons a decoded hit cannot be fed to a state machine
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    MissingKey,
    MissingScope(ScopeKey),
    InvalidScopeId(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingKey => write!(f, "key is required"),
            ValidationError::MissingScope(scope) => {
                write!(f, "target-device.{} is required", scope.field())
            }
            ValidationError::InvalidScopeId(id) => {
                write!(f, "invalid scope id '{}': must not contain whitespace", id)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validates an event decoded from the event store for a job scoped by
/// `scope`.
///
/// Validation rules:
/// - Key must be present
/// - The id the job scopes by must be present and free of whitespace
///   (nothing is required for [`ScopeKey::Global`])
///
/// Values may be empty; callbacks decide what an empty value means.
pub fn validate(event: &Event, scope: ScopeKey) -> Result<(), ValidationError> {
    if event.key.is_empty() {
        return Err(ValidationError::MissingKey);
    }
    if scope == ScopeKey::Global {
        return Ok(());
    }

    let id = event.scope(scope);
    if id.is_empty() {
        return Err(ValidationError::MissingScope(scope));
    }
    if !is_valid_device_id(id) {
        return Err(ValidationError::InvalidScopeId(id.to_string()));
    }

    Ok(())
}

fn is_valid_device_id(id: &str) -> bool {
    !id.chars().any(char::is_whitespace)
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    #[test]
    fn test_valid_device_ids() {
        assert!(is_valid_device_id("ITB-1101-D1"));
        assert!(is_valid_device_id("JFSB-B125-CP1"));
    }

    #[test]
    fn test_invalid_device_ids() {
        assert!(!is_valid_device_id("ITB 1101-D1"));
        assert!(!is_valid_device_id("ITB-1101-D1\n"));
    }
}

use itertools::Itertools;

use crate::data::Data;
use std::error;
use std::fmt;
use std::fmt::Display;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Copy)]
pub enum ErrorType {
    /// Server answered with a non-empty `errors` list
    Protocol,
    /// Cache-only read without a snapshot
    CacheMiss,
    /// Response data does not fit the document descriptor
    DescriptorMismatch,
    /// Merge touched a field unknown to the descriptor
    MergeInvariant,
    Transport,
    Cancelled,
    Destroyed,
    Derive,
    Config,
    NotSupported,
    General,
    UnexpectedError,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Error {
    pub error_type: ErrorType,
    pub message: String,
    pub operation: Option<String>,
    pub variables: Option<String>,
}

impl Error {
    pub fn new(error_type: ErrorType, message: String) -> Self {
        Error {
            error_type,
            message,
            operation: None,
            variables: None,
        }
    }

    pub fn from_error<E: Display>(error_type: ErrorType, error: E) -> Self {
        Error::new(error_type, error.to_string())
    }

    pub fn from_result<T, E: Display>(error_type: ErrorType, result: Result<T, E>) -> Result<T, Self> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(Error::from_error(error_type, e)),
        }
    }

    pub fn with_operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_owned());
        self
    }

    pub fn with_variables(mut self, variables: &Data) -> Self {
        self.variables = Some(variables.canonical_string());
        self
    }

    /// Protocol errors reported by the server in the `errors` field of a response.
    pub fn protocol<M: Display>(operation: &str, variables: &Data, messages: &[M]) -> Self {
        Error {
            error_type: ErrorType::Protocol,
            message: format!(
                "Operation '{}' failed: {}",
                operation,
                messages.iter().map(|m| format!("'{}'", m)).join(", ")
            ),
            operation: Some(operation.to_owned()),
            variables: Some(variables.canonical_string()),
        }
    }

    pub fn cache_miss(operation: &str, variables: &Data) -> Self {
        Error {
            error_type: ErrorType::CacheMiss,
            message: format!("No cached result for operation '{}'", operation),
            operation: Some(operation.to_owned()),
            variables: Some(variables.canonical_string()),
        }
    }

    pub fn descriptor_mismatch(message: String) -> Self {
        Error::new(ErrorType::DescriptorMismatch, message)
    }

    pub fn missing_fragment(field: &str, typename: &str) -> Self {
        Error::new(
            ErrorType::DescriptorMismatch,
            format!(
                "Union field '{}' has no inline fragment for typename '{}'",
                field, typename
            ),
        )
    }

    pub fn missing_field(field: &str, on: &str) -> Self {
        Error::new(
            ErrorType::DescriptorMismatch,
            format!("Missing expected field '{}' on '{}'", field, on),
        )
    }

    pub fn unexpected_shape<W: Display>(field: &str, expected: &str, what: W) -> Self {
        Error::new(
            ErrorType::DescriptorMismatch,
            format!("Field '{}' expected {}, got {}", field, expected, what),
        )
    }

    pub fn merge_invariant(field: &str, typename: &str) -> Self {
        Error::new(
            ErrorType::MergeInvariant,
            format!(
                "Field '{}' of '{}' is neither in the record nor in the descriptor",
                field, typename
            ),
        )
    }

    pub fn transport<E: Display>(error: E) -> Self {
        Error::new(ErrorType::Transport, format!("Transport failure: {}", error))
    }

    pub fn cancelled(operation: &str) -> Self {
        Error::new(
            ErrorType::Cancelled,
            format!("Pending request of '{}' was aborted", operation),
        )
        .with_operation(operation)
    }

    pub fn destroyed(operation: &str) -> Self {
        Error::new(
            ErrorType::Destroyed,
            format!("Query record of '{}' has been destroyed", operation),
        )
        .with_operation(operation)
    }

    pub fn derive_failed<E: Display>(field: &str, error: E) -> Self {
        Error::new(
            ErrorType::Derive,
            format!("Derived field '{}' could not be fetched: {}", field, error),
        )
    }

    pub fn config_error(message: String) -> Self {
        Error::new(ErrorType::Config, message)
    }

    pub fn not_supported(message: String) -> Self {
        Error::new(ErrorType::NotSupported, message)
    }

    pub fn general_error(message: String) -> Self {
        Error::new(ErrorType::General, message)
    }

    pub fn unexpected_error(message: String) -> Self {
        Error::new(ErrorType::UnexpectedError, message)
    }

    pub fn is_cache_miss(&self) -> bool {
        self.error_type == ErrorType::CacheMiss
    }

    pub fn is_cancelled(&self) -> bool {
        self.error_type == ErrorType::Cancelled
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.operation, &self.variables) {
            (Some(operation), Some(variables)) => {
                write!(f, "{} ({} with {})", self.message, operation, variables)
            }
            (Some(operation), None) => write!(f, "{} ({})", self.message, operation),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl error::Error for Error {
    fn description(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_protocol_error_context() {
        let variables = Data::from(json!({"id": "u1"}));
        let e = Error::protocol("UserQuery", &variables, &["not found", "denied"]);
        assert_eq!(e.error_type, ErrorType::Protocol);
        assert_eq!(e.operation.as_deref(), Some("UserQuery"));
        assert_eq!(e.variables.as_deref(), Some(r#"{"id":"u1"}"#));
        assert!(e.to_string().contains("'not found', 'denied'"));
    }

    #[test]
    fn test_cache_miss() {
        let e = Error::cache_miss("UserQuery", &Data::Null);
        assert!(e.is_cache_miss());
        assert!(!e.is_cancelled());
    }
}

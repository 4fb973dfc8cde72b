//! Bridge error types

use crate::vm::{status, LuaType, VmError};

/// Boxed error raised by host code behind a registered member
pub type HostError = Box<dyn std::error::Error + Send + Sync>;

/// Errors from projecting a guest value into host types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MarshalError {
    /// Guest value has no host representation
    #[error("Unmarshallable guest value of type {0}")]
    Unmarshallable(LuaType),

    /// Projected value cannot be cast to the requested host type
    #[error("Cannot cast {from} to {to}")]
    Cast {
        /// Kind of the projected value
        from: &'static str,
        /// Requested host type
        to: &'static str,
    },

    /// Deep projection nested further than the configured bound
    #[error("Maximum projection depth exceeded: {0}")]
    MaxDepthExceeded(usize),
}

/// Bridge errors
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Marshalling failure
    #[error(transparent)]
    Marshal(#[from] MarshalError),

    /// No member with that name at any level of the class hierarchy
    #[error("No such member '{name}' in class {class}")]
    NoSuchMember {
        /// Class searched
        class: String,
        /// Requested member
        name: String,
    },

    /// Members with that name exist but none accepts the arguments
    #[error("No overload of '{name}' in class {class} matches the arguments")]
    NoMatchingOverload {
        /// Class searched
        class: String,
        /// Requested member
        name: String,
    },

    /// The resolved host member raised
    #[error("Invocation of '{name}' failed: {source}")]
    Invocation {
        /// Member that was invoked
        name: String,
        /// Error raised by the host code
        #[source]
        source: HostError,
    },

    /// A protected guest call returned a non-zero status
    #[error("{message}")]
    GuestRuntime {
        /// Guest status code
        code: i32,
        /// Prefixed error message
        message: String,
    },

    /// Operation through a released handle or a closed session
    #[error("Handle used after release or session close")]
    UseAfterRelease,

    /// Operation applied to a value that does not support it
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Element position outside `1..=len`
    #[error("Index out of bounds: {position} (length {len})")]
    IndexOutOfBounds {
        /// Requested 1-based position
        position: i64,
        /// Current element count
        len: usize,
    },

    /// Argument outside the accepted range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Guest VM primitive failure
    #[error(transparent)]
    Vm(#[from] VmError),
}

impl BridgeError {
    /// Build a `GuestRuntime` error from a `pcall` status and raw message
    pub fn guest_runtime(code: i32, raw: &str) -> Self {
        let prefix = match code {
            status::ERR_RUN => "Runtime error. ".to_string(),
            status::ERR_SYNTAX => "Syntax error. ".to_string(),
            status::ERR_MEM => "Memory allocation error. ".to_string(),
            status::ERR_ERR => "Error while running the error handler function. ".to_string(),
            other => format!("Guest error code {}. ", other),
        };
        BridgeError::GuestRuntime {
            code,
            message: format!("{}{}", prefix, raw),
        }
    }

    /// Wrap a host error raised by `name`
    pub fn invocation(name: impl Into<String>, source: impl Into<HostError>) -> Self {
        BridgeError::Invocation {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Bridge result
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_guest_runtime_prefixes() {
        let err = BridgeError::guest_runtime(status::ERR_RUN, "boom");
        assert_eq!(err.to_string(), "Runtime error. boom");

        let err = BridgeError::guest_runtime(status::ERR_MEM, "");
        assert_eq!(err.to_string(), "Memory allocation error. ");

        let err = BridgeError::guest_runtime(status::ERR_ERR, "x");
        assert!(err.to_string().starts_with("Error while running the error handler"));

        let err = BridgeError::guest_runtime(status::ERR_SYNTAX, "main:1: unexpected symbol");
        assert!(err.to_string().starts_with("Syntax error. "));

        let err = BridgeError::guest_runtime(9, "odd");
        assert_eq!(err.to_string(), "Guest error code 9. odd");
    }

    #[test]
    fn test_invocation_preserves_source() {
        let err = BridgeError::invocation("f", "host failure");
        assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("host failure"));
    }

    #[test]
    fn test_marshal_error_converts() {
        let err: BridgeError = MarshalError::Unmarshallable(LuaType::None).into();
        assert!(matches!(err, BridgeError::Marshal(_)));
    }
}

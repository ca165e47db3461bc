//! Error types and handling for Phoebus
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for Phoebus operations
pub type Result<T> = std::result::Result<T, PhoebusError>;

/// Main error type for Phoebus
#[derive(Debug, Error)]
pub enum PhoebusError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Inverter register communication errors
    #[error("Modbus error: {message}")]
    Modbus { message: String },

    /// Outlet communication errors
    #[error("Outlet error: {message}")]
    Outlet { message: String },

    /// Outlet session expired or forbidden; reconnect without counting a retry
    #[error("Session error: {message}")]
    Session { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl PhoebusError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        PhoebusError::Config {
            message: message.into(),
        }
    }

    /// Create a new Modbus error
    pub fn modbus<S: Into<String>>(message: S) -> Self {
        PhoebusError::Modbus {
            message: message.into(),
        }
    }

    /// Create a new outlet error
    pub fn outlet<S: Into<String>>(message: S) -> Self {
        PhoebusError::Outlet {
            message: message.into(),
        }
    }

    /// Create a new session error
    pub fn session<S: Into<String>>(message: S) -> Self {
        PhoebusError::Session {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        PhoebusError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        PhoebusError::Io {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        PhoebusError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        PhoebusError::Generic {
            message: message.into(),
        }
    }

    /// Whether this error means the outlet session must be re-established
    /// (expired or forbidden) rather than the device being unreachable.
    pub fn is_session_error(&self) -> bool {
        matches!(self, PhoebusError::Session { .. })
    }
}

impl From<std::io::Error> for PhoebusError {
    fn from(err: std::io::Error) -> Self {
        PhoebusError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for PhoebusError {
    fn from(err: serde_yaml::Error) -> Self {
        PhoebusError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<tapo::Error> for PhoebusError {
    fn from(err: tapo::Error) -> Self {
        use tapo::responses::TapoResponseError;
        match err {
            tapo::Error::Tapo(TapoResponseError::SessionTimeout)
            | tapo::Error::Tapo(TapoResponseError::InvalidCredentials) => {
                PhoebusError::session(format!("{:?}", err))
            }
            other => PhoebusError::outlet(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = PhoebusError::config("test config error");
        assert!(matches!(err, PhoebusError::Config { .. }));

        let err = PhoebusError::modbus("test modbus error");
        assert!(matches!(err, PhoebusError::Modbus { .. }));

        let err = PhoebusError::validation("field", "test validation error");
        assert!(matches!(err, PhoebusError::Validation { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = PhoebusError::config("test error");
        let error_string = format!("{}", err);
        assert_eq!(error_string, "Configuration error: test error");

        let err = PhoebusError::validation("test_field", "invalid value");
        let error_string = format!("{}", err);
        assert_eq!(error_string, "Validation error: test_field - invalid value");
    }

    #[test]
    fn test_session_classification() {
        assert!(PhoebusError::session("expired").is_session_error());
        assert!(!PhoebusError::outlet("unreachable").is_session_error());
    }
}

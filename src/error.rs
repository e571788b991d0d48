//! Error types and handling for Heliocharge
//!
//! This module defines the error types used throughout the engine. Missing
//! data and dispatch failures are ordinary `Err` values that the control loop
//! logs and skips; broken interval invariants are programming errors and panic
//! at the point of detection instead.

use thiserror::Error;

/// Result type alias for Heliocharge operations
pub type Result<T> = std::result::Result<T, HelioError>;

/// Main error type for Heliocharge
#[derive(Debug, Error)]
pub enum HelioError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// A value the computation depends on is not known yet
    #[error("Missing data: {message}")]
    MissingData { message: String },

    /// A protocol collaborator rejected or failed a command
    #[error("Dispatch error: {message}")]
    Dispatch { message: String },

    /// Forecast provider errors
    #[error("Forecast error: {message}")]
    Forecast { message: String },

    /// Price provider errors
    #[error("Price error: {message}")]
    Price { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Network-related errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// API integration errors (Tibber)
    #[error("API error: {message}")]
    Api { message: String },

    /// HTTP/Web server errors
    #[error("Web server error: {message}")]
    Web { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl HelioError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        HelioError::Config {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        HelioError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new missing-data error
    pub fn missing_data<S: Into<String>>(message: S) -> Self {
        HelioError::MissingData {
            message: message.into(),
        }
    }

    /// Create a new dispatch error
    pub fn dispatch<S: Into<String>>(message: S) -> Self {
        HelioError::Dispatch {
            message: message.into(),
        }
    }

    /// Create a new forecast error
    pub fn forecast<S: Into<String>>(message: S) -> Self {
        HelioError::Forecast {
            message: message.into(),
        }
    }

    /// Create a new price error
    pub fn price<S: Into<String>>(message: S) -> Self {
        HelioError::Price {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        HelioError::Io {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        HelioError::Network {
            message: message.into(),
        }
    }

    /// Create a new API error
    pub fn api<S: Into<String>>(message: S) -> Self {
        HelioError::Api {
            message: message.into(),
        }
    }

    /// Create a new web error
    pub fn web<S: Into<String>>(message: S) -> Self {
        HelioError::Web {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        HelioError::Generic {
            message: message.into(),
        }
    }

    /// Whether the error only means "not enough information this tick"
    pub fn is_missing_data(&self) -> bool {
        matches!(self, HelioError::MissingData { .. })
    }
}

impl From<std::io::Error> for HelioError {
    fn from(err: std::io::Error) -> Self {
        HelioError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for HelioError {
    fn from(err: serde_yaml::Error) -> Self {
        HelioError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for HelioError {
    fn from(err: serde_json::Error) -> Self {
        HelioError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "tibber")]
impl From<reqwest::Error> for HelioError {
    fn from(err: reqwest::Error) -> Self {
        HelioError::network(err.to_string())
    }
}

impl From<chrono::ParseError> for HelioError {
    fn from(err: chrono::ParseError) -> Self {
        HelioError::validation("datetime", err.to_string())
    }
}

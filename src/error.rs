//! Error types
//!
//! A single error type shared by providers, dispatchers and the expiry parser.
//! The notifier itself never surfaces these to callers of `register` or
//! `unregister`; it logs them and carries on.

use crate::registry::SourceLocator;

/// Crate result type
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for notifier collaborators
#[derive(Debug)]
pub enum Error {
    /// The provider factory does not know how to reach this locator
    InvalidLocator { locator: String, reason: String },
    /// The upstream connection attempt failed
    ConnectFailed { locator: SourceLocator, reason: String },
    /// The upstream connection attempt did not resolve within the configured timeout
    ConnectTimeout(SourceLocator),
    /// Expiry input could not be interpreted
    InvalidExpiry(String),
    /// Upstream payload was not a JSON object
    InvalidData(String),
    /// The delivery mechanism rejected a notification
    Delivery(String),
    /// I/O error
    Io(std::io::Error),
}

impl Error {
    /// Build an `InvalidLocator` error
    pub fn invalid_locator(locator: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidLocator {
            locator: locator.into(),
            reason: reason.into(),
        }
    }

    /// Build a `ConnectFailed` error
    pub fn connect_failed(locator: &SourceLocator, reason: impl Into<String>) -> Self {
        Error::ConnectFailed {
            locator: locator.clone(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidLocator { locator, reason } => {
                write!(f, "Invalid source locator '{}': {}", locator, reason)
            }
            Error::ConnectFailed { locator, reason } => {
                write!(f, "Connect to {} failed: {}", locator, reason)
            }
            Error::ConnectTimeout(locator) => write!(f, "Connect to {} timed out", locator),
            Error::InvalidExpiry(input) => write!(f, "Invalid expiry: {}", input),
            Error::InvalidData(reason) => write!(f, "Invalid update data: {}", reason),
            Error::Delivery(reason) => write!(f, "Delivery failed: {}", reason),
            Error::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidData(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::invalid_locator("ca://", "missing record name");
        assert_eq!(
            err.to_string(),
            "Invalid source locator 'ca://': missing record name"
        );

        let err = Error::ConnectTimeout(SourceLocator::new("sensorA"));
        assert_eq!(err.to_string(), "Connect to sensorA timed out");
    }

    #[test]
    fn test_io_source() {
        use std::error::Error as _;

        let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::InvalidData(_)));
    }
}

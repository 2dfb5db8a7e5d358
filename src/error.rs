//! Error types
//!
//! One error enum covers registry lookups, argument validation and the
//! subscription lifecycle. It is `Clone` so a single upstream failure can be
//! delivered to every subscriber of the affected stream.

/// Error type for query and subscription operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No descriptor (or derive) registered under this module/method pair
    UnknownMethod { module: String, method: String },
    /// Arguments do not match the descriptor's declared shape
    ArgumentMismatch { query: String, reason: String },
    /// The raw subscription could not be opened
    SourceUnavailable { key: String, reason: String },
    /// A live subscription broke after being established
    UpstreamFailed { key: String, reason: String },
    /// The metadata document could not be loaded
    MetadataInvalid(String),
}

impl Error {
    /// Whether the caller may reasonably retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SourceUnavailable { .. } | Error::UpstreamFailed { .. }
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnknownMethod { module, method } => {
                write!(f, "Unknown method: {}.{}", module, method)
            }
            Error::ArgumentMismatch { query, reason } => {
                write!(f, "Argument mismatch for {}: {}", query, reason)
            }
            Error::SourceUnavailable { key, reason } => {
                write!(f, "Source unavailable for {}: {}", key, reason)
            }
            Error::UpstreamFailed { key, reason } => {
                write!(f, "Upstream failed for {}: {}", key, reason)
            }
            Error::MetadataInvalid(reason) => write!(f, "Invalid metadata: {}", reason),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::MetadataInvalid(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::UnknownMethod {
            module: "democracy".into(),
            method: "nope".into(),
        };
        assert_eq!(err.to_string(), "Unknown method: democracy.nope");

        let err = Error::MetadataInvalid("bad version".into());
        assert_eq!(err.to_string(), "Invalid metadata: bad version");
    }

    #[test]
    fn test_retryable() {
        let unavailable = Error::SourceUnavailable {
            key: "k".into(),
            reason: "refused".into(),
        };
        let mismatch = Error::ArgumentMismatch {
            query: "q".into(),
            reason: "arity".into(),
        };
        assert!(unavailable.is_retryable());
        assert!(!mismatch.is_retryable());
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::MetadataInvalid(_)));
    }
}

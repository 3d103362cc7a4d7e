use thiserror::Error;

/// A convenience `Result` alias using [`MeshError`].
pub type MeshResult<T> = Result<T, MeshError>;

/// Top-level error type for taskmesh.
///
/// Each variant maps to one class of the scheduler's error taxonomy. Callers
/// use [`MeshError::is_retryable`] rather than matching on message text.
#[derive(Error, Debug)]
pub enum MeshError {
    /// A malformed submission, registration or result envelope.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No registered, live and healthy agent declares the capability.
    #[error("No agents available for capability '{capability}'")]
    NoAgentsAvailable { capability: String },

    /// A lookup by id found nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Publishing to the message bus failed.
    #[error("Bus error: {0}")]
    Bus(String),

    /// A checkpoint or outcome-history operation failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The registry's key/value backend failed.
    #[error("Registry error: {0}")]
    Registry(String),

    /// Configuration could not be parsed or is inconsistent.
    #[error("Config error: {0}")]
    Config(String),

    /// An outbound HTTP request failed (health checks, sidecar).
    #[error("HTTP error: {0}")]
    Http(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// Whether repeating the same operation could plausibly succeed.
    ///
    /// Validation failures and missing agents are terminal for the request
    /// that produced them; transport and storage failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::Bus(_)
                | MeshError::Persistence(_)
                | MeshError::Registry(_)
                | MeshError::Http(_)
                | MeshError::Io(_)
        )
    }

    /// HTTP status code used when this error reaches the control plane.
    pub fn status_code(&self) -> u16 {
        match self {
            MeshError::Validation(_) | MeshError::Json(_) => 400,
            MeshError::NotFound(_) => 404,
            MeshError::NoAgentsAvailable { .. } => 503,
            MeshError::Bus(_) | MeshError::Http(_) => 502,
            MeshError::Persistence(_)
            | MeshError::Registry(_)
            | MeshError::Config(_)
            | MeshError::Io(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!MeshError::Validation("bad".into()).is_retryable());
        assert!(!MeshError::NoAgentsAvailable {
            capability: "x".into()
        }
        .is_retryable());
        assert!(MeshError::Bus("down".into()).is_retryable());
        assert!(MeshError::Persistence("locked".into()).is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(MeshError::Validation("x".into()).status_code(), 400);
        assert_eq!(MeshError::NotFound("x".into()).status_code(), 404);
        assert_eq!(
            MeshError::NoAgentsAvailable {
                capability: "x".into()
            }
            .status_code(),
            503
        );
        assert_eq!(MeshError::Bus("x".into()).status_code(), 502);
    }

    #[test]
    fn test_no_agents_message_names_capability() {
        let err = MeshError::NoAgentsAvailable {
            capability: "code-review".into(),
        };
        assert!(err.to_string().contains("code-review"));
    }
}

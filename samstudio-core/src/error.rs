use crate::config::ConfigError;
use crate::types::{AnnotationId, SessionId, ThreadId};
use thiserror::Error;

/// Failures reported by a model backend.
///
/// Cloneable so that one outcome of a de-duplicated embedding computation can
/// be handed to every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("backend call timed out after {0} ms")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend rejected input: {0}")]
    InvalidInput(String),

    #[error("backend resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("embedding is incompatible with the active model: {0}")]
    IncompatibleEmbedding(String),

    #[error("backend returned no mask candidates")]
    EmptyResult,

    #[error("invalid response from backend: {0}")]
    InvalidResponse(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout(_)
                | BackendError::Transport(_)
                | BackendError::ResourceExhausted(_)
                | BackendError::Unavailable(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid prompt: {0}")]
    InvalidPrompt(String),

    #[error("Embedding unavailable for image {image}: {source}")]
    EmbeddingUnavailable {
        image: String,
        #[source]
        source: BackendError,
    },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Annotation {0} already has an open issue thread")]
    ThreadAlreadyOpen(AnnotationId),

    #[error("Mask candidate belongs to image {0}")]
    ForeignCandidate(String),

    #[error("Clipboard is empty")]
    ClipboardEmpty,

    #[error("Issue thread {0} is resolved")]
    ThreadResolved(ThreadId),

    #[error("Annotation not found: {0}")]
    UnknownAnnotation(AnnotationId),

    #[error("Issue thread not found: {0}")]
    UnknownThread(ThreadId),

    #[error("Session not found: {0}")]
    UnknownSession(SessionId),

    #[error("Session {0} is closed")]
    SessionClosed(SessionId),

    #[error("Session {0} was terminated after an invariant violation")]
    SessionTerminated(SessionId),

    #[error("Session limit reached: {0} sessions open and none idle")]
    SessionLimit(usize),

    #[error("Embedding for {0} was evicted while still referenced")]
    CacheEvictedMidFlight(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Client-input or backend failures the caller may retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::InvalidPrompt(_) => true,
            Error::EmbeddingUnavailable { source, .. } => source.is_transient(),
            Error::Backend(e) => e.is_transient(),
            _ => false,
        }
    }

    /// State-policy rejections: normal negative outcomes, not failures.
    pub fn is_policy_rejection(&self) -> bool {
        matches!(
            self,
            Error::ThreadAlreadyOpen(_) | Error::ThreadResolved(_) | Error::SessionLimit(_)
        )
    }

    /// Invariant violations that must terminate the owning session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CacheEvictedMidFlight(_) | Error::InvariantViolation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidPrompt("empty prompt set".to_string());
        assert!(err.to_string().contains("Invalid prompt"));
        assert!(err.to_string().contains("empty prompt set"));

        let err = Error::ThreadAlreadyOpen(AnnotationId(7));
        assert!(err.to_string().contains("#7"));
    }

    #[test]
    fn test_backend_error_conversion() {
        let err: Error = BackendError::Timeout(250).into();
        match err {
            Error::Backend(BackendError::Timeout(ms)) => assert_eq!(ms, 250),
            _ => panic!("Expected Backend(Timeout)"),
        }
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::Backend(BackendError::Timeout(10)).is_retryable());
        assert!(!Error::Backend(BackendError::EmptyResult).is_retryable());
        assert!(Error::EmbeddingUnavailable {
            image: "img".to_string(),
            source: BackendError::ResourceExhausted("oom".to_string()),
        }
        .is_retryable());

        assert!(Error::ThreadAlreadyOpen(AnnotationId(1)).is_policy_rejection());
        assert!(!Error::InvalidPrompt("x".to_string()).is_policy_rejection());

        assert!(Error::CacheEvictedMidFlight("img".to_string()).is_fatal());
        assert!(Error::InvariantViolation("seq".to_string()).is_fatal());
        assert!(!Error::Backend(BackendError::EmptyResult).is_fatal());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        match err {
            Error::Io(_) => {}
            _ => panic!("Expected Io error"),
        }
    }
}

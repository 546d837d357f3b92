//! Engine error taxonomy.
//!
//! Every public [`RetrievalEngine`](crate::service::RetrievalEngine)
//! operation returns `Result<T, RagError>`. At the boundary (CLI, or any
//! future transport) an error is turned into a structured body with
//! [`RagError::to_response`] rather than surfacing as a crash.
//!
//! Provider failures (embedding / summarisation) are absorbed by their
//! wrappers and normally never reach this type; the variant exists so those
//! wrappers can still report what went wrong in logs and tests.

use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    /// Bad caller input: empty title/text, out-of-range chunk index,
    /// missing selector, invalid collection name.
    #[error("{0}")]
    Validation(String),

    /// Unknown document or collection.
    #[error("{0}")]
    NotFound(String),

    /// Batch or document size over a configured ceiling.
    #[error("{0}")]
    Capacity(String),

    /// Embedding or summarisation backend failure.
    #[error("provider error: {0}")]
    Provider(String),

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type RagResult<T> = Result<T, RagError>;

impl RagError {
    pub fn validation(msg: impl Into<String>) -> Self {
        RagError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        RagError::NotFound(msg.into())
    }

    pub fn capacity(msg: impl Into<String>) -> Self {
        RagError::Capacity(msg.into())
    }

    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RagError::Validation(_) => "validation",
            RagError::NotFound(_) => "not_found",
            RagError::Capacity(_) => "capacity",
            RagError::Provider(_) => "provider",
            RagError::Io(_) => "io",
            RagError::Serialization(_) => "serialization",
        }
    }

    /// The `{ "error": ..., "kind": ... }` body returned to callers.
    pub fn to_response(&self) -> Value {
        json!({
            "error": self.to_string(),
            "kind": self.kind(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_response() {
        let err = RagError::validation("title must not be empty");
        assert_eq!(err.kind(), "validation");
        let body = err.to_response();
        assert_eq!(body["error"], "title must not be empty");
        assert_eq!(body["kind"], "validation");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: RagError = io.into();
        assert_eq!(err.kind(), "io");
        assert!(err.to_string().contains("nope"));
    }
}

//! Error taxonomy shared by every artwork component.

use thiserror::Error;

/// Errors raised by the artwork cache.
///
/// Wrapped library errors all surface to callers as `internal`.
#[derive(Error, Debug)]
pub enum ArtworkError {
    /// Album, task or record unknown.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad input, such as an album without an origin URL.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A refresh was rejected by the hourly or daily window.
    #[error("{message}")]
    RateLimited {
        /// Human-readable rejection message.
        message: String,
        /// `hourly` or `daily`.
        limit_type: String,
        /// Seconds until the window admits another request.
        retry_after: u64,
    },

    /// Origin unreachable, non-2xx or unsupported payload.
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Index and filesystem disagree.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Anything unexpected.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Report or metadata encoding failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Image decode or encode failure.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Persistence failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ArtworkError {
    /// Machine-readable error kind exposed to API callers.
    pub fn kind(&self) -> &'static str {
        match self {
            ArtworkError::NotFound(_) => "not_found",
            ArtworkError::Validation(_) => "validation",
            ArtworkError::RateLimited { .. } => "rate_limited",
            ArtworkError::Fetch(_) => "fetch",
            ArtworkError::Integrity(_) => "integrity",
            ArtworkError::Internal(_)
            | ArtworkError::Io(_)
            | ArtworkError::Serialization(_)
            | ArtworkError::Image(_)
            | ArtworkError::Database(_) => "internal",
        }
    }

    /// Shorthand for [`ArtworkError::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        ArtworkError::NotFound(message.into())
    }

    /// Shorthand for [`ArtworkError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        ArtworkError::Validation(message.into())
    }

    /// Shorthand for [`ArtworkError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        ArtworkError::Internal(message.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ArtworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_errors_report_internal_kind() {
        let io = ArtworkError::from(std::io::Error::other("disk"));
        assert_eq!(io.kind(), "internal");
        assert_eq!(ArtworkError::not_found("album 4").kind(), "not_found");
    }

    #[test]
    fn rate_limited_displays_message_only() {
        let err = ArtworkError::RateLimited {
            message: "Hourly refresh limit exceeded (5 per hour)".into(),
            limit_type: "hourly".into(),
            retry_after: 120,
        };
        assert_eq!(
            err.to_string(),
            "Hourly refresh limit exceeded (5 per hour)"
        );
        assert_eq!(err.kind(), "rate_limited");
    }
}

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use tracklist_core::ArtworkError;

pub type AppResult<T> = Result<T, AppError>;

const GENERIC_INTERNAL: &str = "Internal server error";

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
    pub retry_after: Option<u64>,
}

impl AppError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Logs the detail and hides it from the caller.
    pub fn internal(detail: impl fmt::Display) -> Self {
        tracing::error!(error = %detail, "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", GENERIC_INTERNAL)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: u64) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::new(StatusCode::TOO_MANY_REQUESTS, "rate_limited", message)
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "kind": self.kind,
            "message": self.message,
            "status": self.status.as_u16(),
        });
        if let Some(retry_after) = self.retry_after {
            error["retry_after"] = json!(retry_after);
        }

        let mut response = (self.status, Json(json!({ "error": error }))).into_response();
        if let Some(retry_after) = self.retry_after
            && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
        response
    }
}

impl From<ArtworkError> for AppError {
    fn from(err: ArtworkError) -> Self {
        match err {
            ArtworkError::NotFound(msg) => Self::not_found(msg),
            ArtworkError::Validation(msg) => Self::bad_request(msg),
            ArtworkError::RateLimited {
                message,
                retry_after,
                ..
            } => Self::rate_limited(message, retry_after),
            ArtworkError::Fetch(msg) => Self::new(StatusCode::BAD_GATEWAY, "fetch", msg),
            other => Self::internal(other),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn rate_limited_sets_header_and_body() {
        let err: AppError = ArtworkError::RateLimited {
            message: "Hourly refresh limit exceeded (5 per hour)".into(),
            limit_type: "hourly".into(),
            retry_after: 120,
        }
        .into();
        let response = err.into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "120");
        let body = body_json(response).await;
        assert_eq!(body["error"]["kind"], "rate_limited");
        assert_eq!(body["error"]["retry_after"], 120);
        assert_eq!(body["error"]["status"], 429);
    }

    #[tokio::test]
    async fn internal_errors_do_not_leak_detail() {
        let err: AppError = ArtworkError::Internal("pool exhausted at 10.0.0.4".into()).into();
        let body = body_json(err.into_response()).await;
        assert_eq!(body["error"]["kind"], "internal");
        assert_eq!(body["error"]["message"], GENERIC_INTERNAL);
        assert!(body["error"].get("retry_after").is_none());
    }

    #[test]
    fn taxonomy_maps_to_status_codes() {
        let cases = [
            (ArtworkError::not_found("x"), StatusCode::NOT_FOUND),
            (ArtworkError::validation("x"), StatusCode::BAD_REQUEST),
            (ArtworkError::Fetch("x".into()), StatusCode::BAD_GATEWAY),
            (ArtworkError::Integrity("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }
}

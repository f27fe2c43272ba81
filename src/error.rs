use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("upstream billing error: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    Validation(String),
    #[error("webhook signature verification failed")]
    SignatureVerification,
    #[error("no active subscription found")]
    NoActiveSubscription,
    #[error("quote is stale; request a new preview")]
    StaleQuote,
    #[error("upstream outcome ambiguous: {0}")]
    AmbiguousOutcome(String),
    #[error("{0}")]
    Message(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Validation(_) | AppError::SignatureVerification => StatusCode::BAD_REQUEST,
            AppError::NoActiveSubscription | AppError::StaleQuote => StatusCode::CONFLICT,
            AppError::AmbiguousOutcome(_) => StatusCode::BAD_GATEWAY,
            AppError::UpstreamUnavailable(_) | AppError::Upstream(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Db(_) | AppError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if matches!(self, AppError::SignatureVerification) {
            // security event, always logged
            tracing::warn!(error = %self, "rejected request with invalid webhook signature");
        } else {
            tracing::error!(?self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;

use super::connection::ConnectionError;
use super::routing::RoutingError;
use super::writer::WriteError;
use crate::db::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    ConfigurationIncomplete(#[from] RoutingError),

    #[error("database unavailable")]
    ConnectionFailed(#[from] ConnectionError),

    #[error("changes not saved")]
    TransactionFailed(#[from] WriteError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("database error")]
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(id) => ApiError::Conflict(format!("a row with id '{id}' already exists")),
            other => ApiError::Store(other),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::ConfigurationIncomplete(_) => StatusCode::BAD_REQUEST,
            ApiError::ConnectionFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::TransactionFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<String> {
        match self {
            ApiError::ConnectionFailed(err) => Some(err.to_string()),
            ApiError::TransactionFailed(WriteError::TransactionFailed(cause)) => {
                Some(cause.to_string())
            }
            ApiError::Store(err) => Some(err.to_string()),
            _ => None,
        }
    }
}

#[derive(Serialize, Debug)]
pub struct ApiErrorResponse {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, details = ?self.details(), "request failed");
        }

        let body = Json(ApiErrorResponse {
            success: false,
            error: self.to_string(),
            details: self.details(),
        });

        (status, body).into_response()
    }
}

//! Application-wide error types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// The remote API answered with a non-success status code.
    #[error("Remote API returned {status}")]
    Api { status: u16, body: Option<Value> },

    /// A 401 on a private route; the session token has been cleared.
    #[error("Session expired, redirect to {redirect}")]
    Unauthorized { redirect: &'static str },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    /// JSON body carried by a remote error response, if any.
    pub fn response_body(&self) -> Option<&Value> {
        match self {
            Self::Api { body, .. } => body.as_ref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Api { status: 401, .. } => StatusCode::UNAUTHORIZED,
            Self::Api { status: 404, .. } => StatusCode::NOT_FOUND,
            Self::Api { status: 422, .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Api { .. } | Self::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match &self {
            Self::Unauthorized { redirect } => serde_json::json!({
                "error": self.to_string(),
                "redirect": redirect,
            }),
            Self::Api {
                body: Some(remote), ..
            } => serde_json::json!({ "error": self.to_string(), "remote": remote }),
            _ => serde_json::json!({ "error": self.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

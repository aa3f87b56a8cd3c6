//! Error handler for accounts.

use std::collections::BTreeMap;

use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use sqlx::Error as SQLxError;
use thiserror::Error;
use validator::ValidationErrors;

pub type Result<T> = std::result::Result<T, ServerError>;

const INVALID_LINK: &str = "Activation link is invalid";
const INVALID_TOKEN: &str = "Token is invalid or expired";
const UNAUTHORIZED: &str = "Authentication credentials were not provided.";

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error("{field}: {message}")]
    Conflict {
        field: &'static str,
        message: &'static str,
    },

    #[error("{0}")]
    Authentication(&'static str),

    #[error("invalid 'Authorization' header")]
    Unauthorized,

    #[error("invalid activation link")]
    InvalidLink,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("bad request")]
    BadRequest,

    #[error(transparent)]
    Axum(#[from] JsonRejection),

    #[error("SQL request failed: {0}")]
    Sql(#[from] SQLxError),

    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Structure for detailed error responses.
///
/// Field errors are flattened next to `detail`, e.g.
/// `{"old_password": ["Wrong password."]}`.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    #[serde(skip)]
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(flatten)]
    errors: BTreeMap<String, Vec<String>>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = Some(description.into());
        self
    }

    /// Add one message to a field.
    pub fn field(mut self, field: &str, message: &str) -> Self {
        self.errors
            .entry(field.to_owned())
            .or_default()
            .push(message.to_owned());
        self
    }

    /// Automatically add errors field.
    pub fn errors(mut self, errors: &ValidationErrors) -> Self {
        for (field, issues) in errors.field_errors() {
            let messages = self.errors.entry(field.to_string()).or_default();
            messages.extend(issues.iter().map(|issue| issue.to_string()));
        }
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(
        self,
    ) -> std::result::Result<Response, axum::http::Error> {
        if let Ok(body) = serde_json::to_string(&self) {
            Response::builder()
                .status(self.status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.into())
        } else {
            Ok(internal_server_error())
        }
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: Some("Internal server error.".to_owned()),
            errors: BTreeMap::new(),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let bad_request = ResponseError {
            status: StatusCode::BAD_REQUEST.as_u16(),
            detail: None,
            errors: BTreeMap::new(),
        };

        let response = match &self {
            ServerError::Validation(validation_errors) => {
                bad_request.errors(validation_errors)
            },

            ServerError::Conflict { field, message } => {
                bad_request.field(field, message)
            },

            ServerError::Authentication(message) => bad_request
                .details(message)
                .status(StatusCode::UNAUTHORIZED),

            ServerError::Unauthorized => bad_request
                .details(UNAUTHORIZED)
                .status(StatusCode::UNAUTHORIZED),

            ServerError::InvalidLink => bad_request.details(INVALID_LINK),

            ServerError::InvalidToken => bad_request
                .details(INVALID_TOKEN)
                .status(StatusCode::UNAUTHORIZED),

            // Logout failures are all reported the same way, without body.
            ServerError::BadRequest => {
                return StatusCode::BAD_REQUEST.into_response();
            },

            ServerError::Axum(rejection) => bad_request
                .details(&rejection.body_text())
                .status(rejection.status()),

            err => {
                tracing::error!(%err, "server returned 500 status");
                ResponseError::default()
            },
        };

        response
            .into_response()
            .unwrap_or_else(|_| internal_server_error())
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::json!({ "detail": "Internal server error." })
                .to_string()
                .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}

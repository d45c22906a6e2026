//! Canonical error vocabulary for the encrypted content engine.
//!
//! Every component returns one of these kinds; the HTTP layer is the only
//! place that knows about status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum EceError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("range not satisfiable")]
    RangeNotSatisfiable { resource_size: u64 },

    #[error("vault locked")]
    VaultLocked,

    #[error("password required")]
    PasswordRequired,

    #[error("invalid password")]
    InvalidPassword,

    #[error("corrupted data")]
    CorruptedData,

    #[error("invalid header")]
    InvalidHeader,

    #[error("unsupported version")]
    UnsupportedVersion,

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EceError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            EceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            EceError::Unauthorized => StatusCode::UNAUTHORIZED,
            EceError::Forbidden(_) => StatusCode::FORBIDDEN,
            EceError::NotFound(_) => StatusCode::NOT_FOUND,
            EceError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            EceError::VaultLocked => StatusCode::from_u16(423).unwrap(),
            EceError::PasswordRequired => StatusCode::BAD_REQUEST,
            EceError::InvalidPassword => StatusCode::UNAUTHORIZED,
            EceError::CorruptedData => StatusCode::BAD_REQUEST,
            EceError::InvalidHeader => StatusCode::BAD_REQUEST,
            EceError::UnsupportedVersion => StatusCode::BAD_REQUEST,
            EceError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            EceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl IntoResponse for EceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error");
        }

        if let EceError::RangeNotSatisfiable { resource_size } = self {
            let body = serde_json::json!({ "error": "RangeNotSatisfiable" });
            return (
                status,
                [(
                    axum::http::header::CONTENT_RANGE,
                    format!("bytes */{}", resource_size),
                )],
                axum::Json(body),
            )
                .into_response();
        }

        let kind = match &self {
            EceError::InvalidPath(_) => "InvalidPath",
            EceError::BadRequest(_) => "BadRequest",
            EceError::Unauthorized => "Unauthorized",
            EceError::Forbidden(_) => "Forbidden",
            EceError::NotFound(_) => "NotFound",
            EceError::RangeNotSatisfiable { .. } => unreachable!(),
            EceError::VaultLocked => "VaultLocked",
            EceError::PasswordRequired => "PasswordRequired",
            EceError::InvalidPassword => "InvalidPassword",
            EceError::CorruptedData => "CorruptedData",
            EceError::InvalidHeader => "InvalidHeader",
            EceError::UnsupportedVersion => "UnsupportedVersion",
            EceError::NotImplemented(_) => "NotImplemented",
            EceError::Internal(_) => "Internal",
        };

        let body = ErrorBody {
            error: kind.to_string(),
            message: self.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}

pub type EceResult<T> = Result<T, EceError>;

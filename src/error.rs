//! Error types for the gateway and their HTTP rendering.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;

use crate::config::ConfigError;
use crate::retrieval::RetrievalError;

pub const ACCESS_PROHIBITED: &str = "You do not have permission to access this resource. \
Please contact your administrator for assistance.";

pub const SERVER_CONNECTION_ERROR: &str = "Server Connection Error";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Caller is unauthenticated or lacks the required role.
    #[error("{0}")]
    Unauthorized(String),

    /// Upstream could not be reached or answered with a non-success status
    /// before any bytes were streamed.
    #[error("{detail}")]
    UpstreamConnection { status: u16, detail: String },

    /// Upstream dropped the connection after streaming started.
    #[error("Upstream stream interrupted: {0}")]
    MidStream(String),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error("{0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Internal(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn access_prohibited() -> Self {
        GatewayError::Unauthorized(ACCESS_PROHIBITED.to_string())
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::UpstreamConnection { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::MidStream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Retrieval(_) | GatewayError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Config(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "detail": self.to_string() }))
    }
}

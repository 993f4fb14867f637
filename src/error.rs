use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::runtime::Fault;

/// Cap on user-visible error messages. Engine error text can run to kilobytes;
/// anything stored on the record or sent in an event is cut to this length.
pub const MESSAGE_CAP: usize = 140;

/// Truncate a message to [`MESSAGE_CAP`] characters, marking the cut with `...`.
pub fn truncate_message(msg: &str) -> String {
    if msg.chars().count() <= MESSAGE_CAP {
        return msg.to_string();
    }
    let head: String = msg.chars().take(MESSAGE_CAP - 3).collect();
    format!("{}...", head)
}

/// Errors surfaced by provisioning transitions.
///
/// Every variant maps to one policy: validation and exhaustion are rejected
/// synchronously, image/install problems are operator-facing, conflicts are
/// retried once, communication faults trigger reconciliation before failure.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("{0}")]
    ResourceExhausted(String),
    #[error("image missing: {0}")]
    ImageMissing(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("communication failure: {0}")]
    Communication(String),
    #[error("payload install failed: {0}")]
    Install(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<Fault> for ProvisionError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Conflict(m) | Fault::PortInUse(m) => ProvisionError::Conflict(m),
            Fault::Communication(m) => ProvisionError::Communication(m),
            Fault::NotFound(m) => ProvisionError::NotFound(m),
            Fault::ImageMissing(m) => ProvisionError::ImageMissing(m),
            Fault::Other(m) => ProvisionError::Internal(anyhow::anyhow!(m)),
        }
    }
}

/// HTTP-boundary error. Converts the provisioning taxonomy into status codes
/// and a JSON `{"error": ...}` body.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<ProvisionError> for AppError {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::Validation(m) => AppError::BadRequest(m),
            ProvisionError::NotFound(m) => AppError::NotFound(m),
            ProvisionError::Conflict(m) | ProvisionError::ResourceExhausted(m) => {
                AppError::Conflict(m)
            }
            ProvisionError::ImageMissing(m)
            | ProvisionError::Communication(m)
            | ProvisionError::Install(m) => AppError::Internal(anyhow::anyhow!(m)),
            ProvisionError::Internal(e) => AppError::Internal(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Internal(e) => {
                tracing::error!("internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".into(),
                )
            }
        };
        (
            status,
            axum::Json(serde_json::json!({ "error": truncate_message(&message) })),
        )
            .into_response()
    }
}

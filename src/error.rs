use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

use crate::models::SlotStatus;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub batch_index: usize,
    pub rows: usize,
    pub error: String,
}

/// Faults only. Conflict, Expired and Declined are returned as outcome values.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("reservation {reservation_id} is inconsistent: {detail}")]
    Inconsistency {
        reservation_id: String,
        detail: String,
    },
    #[error("slot transition {from} -> {to} is not allowed")]
    InvalidTransition { from: SlotStatus, to: SlotStatus },
    #[error("generation created {created} slots before {} batch(es) failed", failed_batches.len())]
    Generation {
        created: u64,
        failed_batches: Vec<BatchFailure>,
    },
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation(message.into())
    }

    /// Infrastructure hiccups worth another attempt at the transport boundary.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Store(err) => match err {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
                sqlx::Error::Database(db) => {
                    // SQLITE_BUSY (5) / SQLITE_LOCKED (6), extended codes included
                    db.code()
                        .and_then(|code| code.parse::<i32>().ok())
                        .map(|code| matches!(code & 0xff, 5 | 6))
                        .unwrap_or(false)
                }
                _ => false,
            },
            _ => false,
        }
    }
}

impl ResponseError for EngineError {
    fn status_code(&self) -> StatusCode {
        match self {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            EngineError::Validation(message) => json!({ "error": "validation", "message": message }),
            EngineError::Generation {
                created,
                failed_batches,
            } => json!({
                "error": "generation_failed",
                "createdCount": created,
                "failedBatches": failed_batches,
            }),
            EngineError::Inconsistency { reservation_id, .. } => json!({
                "error": "inconsistent_settlement",
                "reservationId": reservation_id,
            }),
            _ => json!({ "error": "internal" }),
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}

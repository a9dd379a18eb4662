use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::broadcast;

use crate::{
    config::AppConfig,
    models::{SlotStatus, TimeSlotRow},
    payments::PaymentAuthorizer,
    retry::RetryPolicy,
};

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub config: AppConfig,
    pub authorizer: Arc<dyn PaymentAuthorizer>,
    pub retry: RetryPolicy,
    pub events: broadcast::Sender<SlotEvent>,
}

impl AppState {
    /// Broadcasts to SSE subscribers; having none is not an error.
    pub fn publish(&self, event: SlotEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotEvent {
    pub kind: String,
    pub slot_id: Option<String>,
    pub status: Option<SlotStatus>,
    pub session_date: Option<String>,
    pub start_time: Option<String>,
    pub coach_id: Option<String>,
    pub branch_id: Option<String>,
    pub count: Option<u64>,
}

impl SlotEvent {
    pub fn from_row(kind: &str, row: &TimeSlotRow) -> Self {
        Self {
            kind: kind.to_string(),
            slot_id: Some(row.id.clone()),
            status: row.status(),
            session_date: Some(row.session_date.clone()),
            start_time: Some(row.start_time.clone()),
            coach_id: Some(row.coach_id.clone()),
            branch_id: Some(row.branch_id.clone()),
            count: None,
        }
    }

    /// Bulk changes (generation, sweeps) are announced as a count rather than per slot.
    pub fn bulk(kind: &str, branch_id: Option<&str>, count: u64) -> Self {
        Self {
            kind: kind.to_string(),
            slot_id: None,
            status: None,
            session_date: None,
            start_time: None,
            coach_id: None,
            branch_id: branch_id.map(str::to_string),
            count: Some(count),
        }
    }
}

//! Proactive reclamation of lapsed holds. Only shortens how long an abandoned slot stays
//! reserved; every read and write path still detects expiry on its own.
//!
//! Lapsed holds whose payment was already authorized are never expired; the sweep retries
//! their booking instead.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::{task::JoinHandle, time};

use crate::{
    error::Result,
    payments, reservations,
    state::{AppState, SlotEvent},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: u64,
    pub finalized: u64,
}

pub async fn sweep_once(state: &AppState, now: DateTime<Utc>) -> Result<SweepReport> {
    let reclaimed = reservations::expire_due(&state.db, now).await?;
    if reclaimed > 0 {
        log::info!("Expiry sweep reclaimed {reclaimed} slot(s)");
        state.publish(SlotEvent::bulk("slots_reclaimed", None, reclaimed));
    }

    let finalized = payments::finalize_authorized(&state.db, now).await?;
    if finalized > 0 {
        log::info!("Expiry sweep finalized {finalized} authorized reservation(s)");
        state.publish(SlotEvent::bulk("slots_booked", None, finalized));
    }
    Ok(SweepReport {
        reclaimed,
        finalized,
    })
}

/// Starts the sweep loop; `None` when the interval is zero.
pub fn spawn(state: AppState, interval_secs: u64) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        log::info!("Expiry sweep disabled; holds are reclaimed on access");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = sweep_once(&state, Utc::now()).await {
                log::error!("Expiry sweep failed: {err}");
            }
        }
    }))
}

//! Time-boxed holds on slots while payment is completed.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use crate::{
    auth::new_id,
    config::EngineConfig,
    error::{EngineError, Result},
    ledger::{self, SlotChange, TransitionOutcome},
    models::{timestamp, ReservationRow, ReservationStatus, SlotStatus},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved {
        reservation_id: String,
        slot_id: String,
        expires_at: DateTime<Utc>,
    },
    /// Someone else holds or booked the slot.
    Conflict,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    Expired,
    NotFound,
}

pub(crate) const RESERVATION_COLUMNS: &str = "id, user_id, slot_id, amount, status, created_at, expires_at, \
     authorized_at, authorization_ref, card_last_four, resolved_at";

pub async fn get_reservation(
    conn: &mut SqliteConnection,
    reservation_id: &str,
) -> Result<Option<ReservationRow>> {
    let row = sqlx::query_as::<_, ReservationRow>(&format!(
        "SELECT {RESERVATION_COLUMNS} FROM payments WHERE id = ? LIMIT 1"
    ))
    .bind(reservation_id)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

/// Moves a still-pending reservation to a terminal status; false if it was already resolved.
/// Once a payment is authorized the only way out of `pending` is `completed`.
pub(crate) async fn resolve(
    conn: &mut SqliteConnection,
    reservation_id: &str,
    to: ReservationStatus,
    now: DateTime<Utc>,
) -> Result<bool> {
    let guard = if to == ReservationStatus::Completed {
        ""
    } else {
        " AND authorized_at IS NULL"
    };
    let result = sqlx::query(&format!(
        "UPDATE payments SET status = ?, resolved_at = ? WHERE id = ? AND status = ?{guard}"
    ))
    .bind(to.as_str())
    .bind(timestamp(now))
    .bind(reservation_id)
    .bind(ReservationStatus::Pending.as_str())
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Ends a pending reservation as `to` and hands the slot back to the pool in the same
/// unit of work.
pub(crate) async fn resolve_and_release(
    conn: &mut SqliteConnection,
    reservation: &ReservationRow,
    to: ReservationStatus,
    now: DateTime<Utc>,
) -> Result<bool> {
    if !resolve(&mut *conn, &reservation.id, to, now).await? {
        return Ok(false);
    }

    let released = ledger::transition(
        &mut *conn,
        &reservation.slot_id,
        SlotStatus::Reserved,
        SlotStatus::Available,
        SlotChange::Release {
            holder: &reservation.user_id,
        },
    )
    .await?;
    if released == TransitionOutcome::Conflict {
        log::warn!(
            "Reservation {} resolved as {} but slot {} was no longer held by {}",
            reservation.id,
            to.as_str(),
            reservation.slot_id,
            reservation.user_id
        );
    }
    Ok(true)
}

/// Expires one lapsed reservation. Holds whose payment was already authorized are left for
/// settlement to finish.
pub async fn expire_reservation(
    pool: &SqlitePool,
    reservation: &ReservationRow,
    now: DateTime<Utc>,
) -> Result<bool> {
    if reservation.authorized_at.is_some() || !reservation.is_past_due(now) {
        return Ok(false);
    }
    let mut tx = pool.begin().await?;
    let expired =
        resolve_and_release(&mut tx, reservation, ReservationStatus::Expired, now).await?;
    tx.commit().await?;
    if expired {
        log::info!(
            "Reservation {} expired; slot {} reclaimed",
            reservation.id,
            reservation.slot_id
        );
    }
    Ok(expired)
}

/// Sweeps every lapsed, unauthorized hold. Returns how many were reclaimed.
pub async fn expire_due(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64> {
    let lapsed = sqlx::query_as::<_, ReservationRow>(&format!(
        r#"SELECT {RESERVATION_COLUMNS} FROM payments
           WHERE status = ? AND authorized_at IS NULL AND expires_at < ?
           ORDER BY expires_at"#
    ))
    .bind(ReservationStatus::Pending.as_str())
    .bind(timestamp(now))
    .fetch_all(pool)
    .await?;

    let mut reclaimed = 0;
    for reservation in &lapsed {
        if expire_reservation(pool, reservation, now).await? {
            reclaimed += 1;
        }
    }
    Ok(reclaimed)
}

/// Reads a reservation, applying lazy expiry first.
pub async fn load_current(
    pool: &SqlitePool,
    reservation_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<ReservationRow>> {
    let mut conn = pool.acquire().await?;
    let Some(reservation) = get_reservation(&mut conn, reservation_id).await? else {
        return Ok(None);
    };
    drop(conn);

    if reservation.status() == Some(ReservationStatus::Pending)
        && expire_reservation(pool, &reservation, now).await?
    {
        let mut conn = pool.acquire().await?;
        return get_reservation(&mut conn, reservation_id).await;
    }
    Ok(Some(reservation))
}

/// Claims an available slot for `user_id` and opens a pending reservation that lapses after
/// the configured TTL.
pub async fn reserve(
    pool: &SqlitePool,
    config: &EngineConfig,
    slot_id: &str,
    user_id: &str,
    amount: i64,
    now: DateTime<Utc>,
) -> Result<ReserveOutcome> {
    if slot_id.trim().is_empty() || user_id.trim().is_empty() {
        return Err(EngineError::validation("slotId and userId are required"));
    }
    if amount <= 0 {
        return Err(EngineError::validation("amount must be positive"));
    }

    let expires_at = now + config.reservation_ttl();
    match claim(pool, slot_id, user_id, amount, now, expires_at).await {
        Err(err) if err.is_transient() => {
            // The write lock stayed with a concurrent claim past the busy timeout.
            let mut conn = pool.acquire().await?;
            match ledger::get_slot(&mut conn, slot_id).await? {
                Some(slot) if slot.status() != Some(SlotStatus::Available) => {
                    log::debug!("Claim on slot {slot_id} by {user_id} lost to a concurrent hold: {err}");
                    Ok(ReserveOutcome::Conflict)
                }
                _ => Err(err),
            }
        }
        outcome => outcome,
    }
}

async fn claim(
    pool: &SqlitePool,
    slot_id: &str,
    user_id: &str,
    amount: i64,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<ReserveOutcome> {
    let mut tx = pool.begin().await?;

    // Opens with a write so the transaction holds the write lock before it reads anything.
    // A lapsed hold on this slot is reclaimed here, ahead of the claim.
    let lapsed: Option<(String, String)> = sqlx::query_as(
        r#"UPDATE payments SET status = ?, resolved_at = ?
           WHERE slot_id = ? AND status = ? AND authorized_at IS NULL AND expires_at < ?
           RETURNING id, user_id"#,
    )
    .bind(ReservationStatus::Expired.as_str())
    .bind(timestamp(now))
    .bind(slot_id)
    .bind(ReservationStatus::Pending.as_str())
    .bind(timestamp(now))
    .fetch_optional(&mut *tx)
    .await?;
    if let Some((lapsed_id, holder)) = lapsed {
        let released = ledger::transition(
            &mut tx,
            slot_id,
            SlotStatus::Reserved,
            SlotStatus::Available,
            SlotChange::Release { holder: &holder },
        )
        .await?;
        if released == TransitionOutcome::Conflict {
            log::warn!("Reservation {lapsed_id} expired but slot {slot_id} was no longer held by {holder}");
        }
        log::info!("Reservation {lapsed_id} expired on contention for slot {slot_id}");
    }

    let claimed = ledger::transition(
        &mut tx,
        slot_id,
        SlotStatus::Available,
        SlotStatus::Reserved,
        SlotChange::Hold {
            user_id,
            reserved_at: now,
            expires_at,
        },
    )
    .await?;

    if claimed == TransitionOutcome::Conflict {
        let exists = ledger::get_slot(&mut tx, slot_id).await?.is_some();
        // Keep any expiry reclaimed above even though this claim lost.
        tx.commit().await?;
        return Ok(if exists {
            ReserveOutcome::Conflict
        } else {
            ReserveOutcome::NotFound
        });
    }

    let reservation_id = new_id();
    sqlx::query(
        r#"INSERT INTO payments (id, user_id, slot_id, amount, status, created_at, expires_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&reservation_id)
    .bind(user_id)
    .bind(slot_id)
    .bind(amount)
    .bind(ReservationStatus::Pending.as_str())
    .bind(timestamp(now))
    .bind(timestamp(expires_at))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    log::info!("Slot {slot_id} reserved by {user_id} until {expires_at} ({reservation_id})");
    Ok(ReserveOutcome::Reserved {
        reservation_id,
        slot_id: slot_id.to_string(),
        expires_at,
    })
}

/// Gives a pending hold back. Only the reservation owner may cancel, and only before the
/// payment was authorized.
pub async fn cancel(
    pool: &SqlitePool,
    reservation_id: &str,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<CancelOutcome> {
    let mut conn = pool.acquire().await?;
    let reservation = get_reservation(&mut conn, reservation_id).await?;
    drop(conn);

    let Some(reservation) = reservation.filter(|row| row.user_id == user_id) else {
        return Ok(CancelOutcome::NotFound);
    };

    match reservation.status() {
        Some(ReservationStatus::Pending) => {}
        Some(ReservationStatus::Expired) => return Ok(CancelOutcome::Expired),
        _ => return Ok(CancelOutcome::NotFound),
    }
    if reservation.authorized_at.is_some() {
        return Ok(CancelOutcome::NotFound);
    }
    if reservation.is_past_due(now) {
        expire_reservation(pool, &reservation, now).await?;
        return Ok(CancelOutcome::Expired);
    }

    let mut tx = pool.begin().await?;
    let cancelled =
        resolve_and_release(&mut tx, &reservation, ReservationStatus::Cancelled, now).await?;
    tx.commit().await?;

    if cancelled {
        log::info!(
            "Reservation {} cancelled; slot {} released",
            reservation.id,
            reservation.slot_id
        );
        Ok(CancelOutcome::Cancelled)
    } else {
        Ok(CancelOutcome::NotFound)
    }
}

//! Settles reservations against a payment authorization decision.
//!
//! Authorization is recorded on the reservation before the booking is finalised, so a
//! settlement that fails halfway can be retried without asking the gateway a second time.
//! Finalisation (reservation `completed`, slot `booked`, booking row) is one transaction.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::{
    auth::new_id,
    bookings,
    error::{EngineError, Result},
    ledger::{self, SlotChange, TransitionOutcome},
    models::{timestamp, ReservationRow, ReservationStatus, SlotStatus},
    reservations,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDetails {
    pub card_number: String,
    pub expiry_month: u32,
    pub expiry_year: i32,
    pub cvv: String,
    pub cardholder_name: String,
}

impl PaymentDetails {
    fn digits(&self) -> String {
        self.card_number
            .chars()
            .filter(|c| !matches!(c, ' ' | '-'))
            .collect()
    }

    pub fn validate(&self, today: NaiveDate) -> Result<()> {
        let digits = self.digits();
        if !(12..=19).contains(&digits.len()) || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(EngineError::validation("card number must be 12-19 digits"));
        }
        if !(1..=12).contains(&self.expiry_month) {
            return Err(EngineError::validation("expiry month must be between 1 and 12"));
        }
        let expiry = (self.expiry_year, self.expiry_month);
        if expiry < (today.year(), today.month()) {
            return Err(EngineError::validation("card has expired"));
        }
        if !(3..=4).contains(&self.cvv.len()) || !self.cvv.chars().all(|c| c.is_ascii_digit()) {
            return Err(EngineError::validation("cvv must be 3 or 4 digits"));
        }
        if self.cardholder_name.trim().is_empty() {
            return Err(EngineError::validation("cardholder name is required"));
        }
        Ok(())
    }

    pub fn last_four(&self) -> String {
        let digits = self.digits();
        digits[digits.len().saturating_sub(4)..].to_string()
    }
}

pub struct AuthorizationRequest<'a> {
    pub reservation_id: &'a str,
    pub user_id: &'a str,
    pub amount: i64,
    pub details: &'a PaymentDetails,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationDecision {
    Approved { reference: String },
    Declined { reason: String },
}

/// The external gateway boundary.
pub trait PaymentAuthorizer: Send + Sync {
    fn authorize(&self, request: &AuthorizationRequest<'_>) -> AuthorizationDecision;

    /// Releases an approval that could not be applied to its reservation.
    fn void(&self, reference: &str) {
        log::warn!("Authorization {reference} must be voided");
    }
}

/// Stand-in gateway that approves with a fixed probability.
#[derive(Debug, Clone)]
pub struct SimulatedGateway {
    success_rate: f64,
}

impl SimulatedGateway {
    pub fn new(success_rate: f64) -> Self {
        Self {
            success_rate: success_rate.clamp(0.0, 1.0),
        }
    }
}

impl PaymentAuthorizer for SimulatedGateway {
    fn authorize(&self, request: &AuthorizationRequest<'_>) -> AuthorizationDecision {
        if rand::thread_rng().gen_bool(self.success_rate) {
            AuthorizationDecision::Approved {
                reference: format!("sim_{}", new_id()),
            }
        } else {
            log::info!(
                "Simulated gateway declined {} for reservation {}",
                request.amount,
                request.reservation_id
            );
            AuthorizationDecision::Declined {
                reason: "card declined by issuer".to_string(),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub reservation_id: String,
    pub booking_id: String,
    pub amount: i64,
    pub card_last_four: Option<String>,
    pub authorization_ref: Option<String>,
    pub session_date: String,
    pub start_time: String,
    pub end_time: String,
    pub paid_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    Booked { booking_id: String, receipt: Receipt },
    Declined { reason: String },
    /// The hold lapsed before payment; the slot is available again.
    Expired,
    NotFound,
}

async fn receipt_for(
    pool: &SqlitePool,
    reservation: &ReservationRow,
    booking_id: String,
) -> Result<Receipt> {
    let mut conn = pool.acquire().await?;
    let slot = ledger::get_slot(&mut conn, &reservation.slot_id).await?;
    let (session_date, start_time, end_time) = slot
        .map(|slot| (slot.session_date, slot.start_time, slot.end_time))
        .unwrap_or_default();
    Ok(Receipt {
        reservation_id: reservation.id.clone(),
        booking_id,
        amount: reservation.amount,
        card_last_four: reservation.card_last_four.clone(),
        authorization_ref: reservation.authorization_ref.clone(),
        session_date,
        start_time,
        end_time,
        paid_at: reservation.resolved_at.clone(),
    })
}

/// The booking of an already-completed reservation; a completed reservation without one
/// is an inconsistency, not a retryable state.
async fn existing_booking(pool: &SqlitePool, reservation: &ReservationRow) -> Result<SettleOutcome> {
    let mut conn = pool.acquire().await?;
    let booking = bookings::find_by_reservation(&mut conn, &reservation.id).await?;
    drop(conn);

    match booking {
        Some(booking) => {
            let receipt = receipt_for(pool, reservation, booking.id.clone()).await?;
            Ok(SettleOutcome::Booked {
                booking_id: booking.id,
                receipt,
            })
        }
        None => {
            log::error!(
                "Reservation {} is completed but has no booking",
                reservation.id
            );
            Err(EngineError::Inconsistency {
                reservation_id: reservation.id.clone(),
                detail: "completed reservation has no booking".to_string(),
            })
        }
    }
}

async fn record_authorization(
    pool: &SqlitePool,
    reservation_id: &str,
    reference: &str,
    card_last_four: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"UPDATE payments
           SET authorized_at = ?, authorization_ref = ?, card_last_four = ?
           WHERE id = ? AND status = ? AND authorized_at IS NULL AND expires_at >= ?"#,
    )
    .bind(timestamp(now))
    .bind(reference)
    .bind(card_last_four)
    .bind(reservation_id)
    .bind(ReservationStatus::Pending.as_str())
    .bind(timestamp(now))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Completes the reservation, books the slot and writes the booking atomically. Any failure
/// rolls all three back and leaves the authorized reservation pending for a retry. `None`
/// means a concurrent settlement completed the reservation first.
async fn finalize(
    pool: &SqlitePool,
    reservation: &ReservationRow,
    now: DateTime<Utc>,
) -> Result<Option<String>> {
    let inconsistency = |detail: String| {
        log::error!(
            "Settlement of reservation {} rolled back: {detail}",
            reservation.id
        );
        EngineError::Inconsistency {
            reservation_id: reservation.id.clone(),
            detail,
        }
    };

    let mut tx = pool.begin().await?;

    if !reservations::resolve(&mut tx, &reservation.id, ReservationStatus::Completed, now).await? {
        tx.rollback().await?;
        return Ok(None);
    }

    let booked = ledger::transition(
        &mut tx,
        &reservation.slot_id,
        SlotStatus::Reserved,
        SlotStatus::Booked,
        SlotChange::Book {
            holder: &reservation.user_id,
            booked_at: now,
        },
    )
    .await?;
    if booked == TransitionOutcome::Conflict {
        return Err(inconsistency(format!(
            "slot {} is no longer held by {}",
            reservation.slot_id, reservation.user_id
        )));
    }

    let booking_id = match bookings::record(
        &mut tx,
        &reservation.user_id,
        &reservation.slot_id,
        Some(&reservation.id),
        now,
    )
    .await
    {
        Ok(booking_id) => booking_id,
        Err(err) if err.is_transient() => return Err(err),
        Err(err) => return Err(inconsistency(format!("booking insert failed: {err}"))),
    };

    tx.commit().await?;
    Ok(Some(booking_id))
}

async fn release_declined(
    pool: &SqlitePool,
    reservation: &ReservationRow,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    reservations::resolve_and_release(&mut tx, reservation, ReservationStatus::Failed, now).await?;
    tx.commit().await?;
    Ok(())
}

/// Finishes reservations whose payment was authorized but whose booking never landed, once
/// their hold has lapsed. Returns how many were booked; failures are logged and left pending
/// for the next pass.
pub async fn finalize_authorized(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64> {
    let stranded = sqlx::query_as::<_, ReservationRow>(&format!(
        r#"SELECT {} FROM payments
           WHERE status = ? AND authorized_at IS NOT NULL AND expires_at < ?
           ORDER BY expires_at"#,
        reservations::RESERVATION_COLUMNS
    ))
    .bind(ReservationStatus::Pending.as_str())
    .bind(timestamp(now))
    .fetch_all(pool)
    .await?;

    let mut booked = 0;
    for reservation in &stranded {
        match finalize(pool, reservation, now).await {
            Ok(Some(booking_id)) => {
                log::info!(
                    "Authorized reservation {} finalized late; slot {} booked as {booking_id}",
                    reservation.id,
                    reservation.slot_id
                );
                booked += 1;
            }
            Ok(None) => {}
            Err(err) => log::error!(
                "Authorized reservation {} (ref {}) still cannot be booked: {err}",
                reservation.id,
                reservation.authorization_ref.as_deref().unwrap_or("-")
            ),
        }
    }
    Ok(booked)
}

/// Settles `reservation_id` for `user_id`.
///
/// Re-settling a completed reservation returns its existing booking. A lapsed hold is
/// expired and reported as `Expired`; a decline fails the reservation and frees the slot.
pub async fn settle(
    pool: &SqlitePool,
    authorizer: &dyn PaymentAuthorizer,
    reservation_id: &str,
    user_id: &str,
    details: &PaymentDetails,
    now: DateTime<Utc>,
) -> Result<SettleOutcome> {
    let mut conn = pool.acquire().await?;
    let reservation = reservations::get_reservation(&mut conn, reservation_id).await?;
    drop(conn);

    let Some(mut reservation) = reservation.filter(|row| row.user_id == user_id) else {
        return Ok(SettleOutcome::NotFound);
    };

    match reservation.status() {
        Some(ReservationStatus::Pending) => {}
        Some(ReservationStatus::Completed) => return existing_booking(pool, &reservation).await,
        Some(ReservationStatus::Expired) => return Ok(SettleOutcome::Expired),
        _ => return Ok(SettleOutcome::NotFound),
    }

    if reservation.authorized_at.is_none() {
        if reservation.is_past_due(now) {
            reservations::expire_reservation(pool, &reservation, now).await?;
            return Ok(SettleOutcome::Expired);
        }
        details.validate(now.date_naive())?;

        let decision = authorizer.authorize(&AuthorizationRequest {
            reservation_id: &reservation.id,
            user_id: &reservation.user_id,
            amount: reservation.amount,
            details,
        });

        match decision {
            AuthorizationDecision::Declined { reason } => {
                // The decline stands even if the release fails; the hold then lapses on its TTL.
                match release_declined(pool, &reservation, now).await {
                    Ok(()) => log::info!(
                        "Payment for reservation {} declined ({reason}); slot {} released",
                        reservation.id,
                        reservation.slot_id
                    ),
                    Err(err) => log::warn!(
                        "Payment for reservation {} declined ({reason}) but slot {} stays held until {}: {err}",
                        reservation.id,
                        reservation.slot_id,
                        reservation.expires_at
                    ),
                }
                return Ok(SettleOutcome::Declined { reason });
            }
            AuthorizationDecision::Approved { reference } => {
                let last_four = details.last_four();
                if !record_authorization(pool, &reservation.id, &reference, &last_four, now)
                    .await?
                {
                    // Resolved concurrently (cancel, sweep) while the gateway was deciding.
                    authorizer.void(&reference);
                    let current = reservations::load_current(pool, &reservation.id, now).await?;
                    return match current.as_ref().and_then(|row| row.status()) {
                        Some(ReservationStatus::Expired) => Ok(SettleOutcome::Expired),
                        Some(ReservationStatus::Completed) => match current {
                            Some(row) => existing_booking(pool, &row).await,
                            None => Ok(SettleOutcome::NotFound),
                        },
                        _ => Ok(SettleOutcome::NotFound),
                    };
                }
                reservation.authorized_at = Some(timestamp(now));
                reservation.authorization_ref = Some(reference);
                reservation.card_last_four = Some(last_four);
            }
        }
    } else {
        log::info!(
            "Reservation {} already authorized; resuming settlement",
            reservation.id
        );
    }

    let Some(booking_id) = finalize(pool, &reservation, now).await? else {
        let mut conn = pool.acquire().await?;
        let current = reservations::get_reservation(&mut conn, &reservation.id).await?;
        drop(conn);
        return match current {
            Some(row) if row.status() == Some(ReservationStatus::Completed) => {
                existing_booking(pool, &row).await
            }
            _ => Ok(SettleOutcome::NotFound),
        };
    };
    reservation.status = ReservationStatus::Completed.as_str().to_string();
    reservation.resolved_at = Some(timestamp(now));

    log::info!(
        "Reservation {} settled; slot {} booked as {booking_id}",
        reservation.id,
        reservation.slot_id
    );
    let receipt = receipt_for(pool, &reservation, booking_id.clone()).await?;
    Ok(SettleOutcome::Booked {
        booking_id,
        receipt,
    })
}

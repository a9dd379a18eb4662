use actix_web::{web, HttpResponse, Result};
use actix_web_httpauth::middleware::HttpAuthentication;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::{
    auth::{basic_validator, AuthUser},
    bookings,
    db::log_activity,
    ledger::{self, SlotFilter},
    models::TimeSlotRow,
    payments::{self, PaymentDetails, SettleOutcome},
    reservations::{self, CancelOutcome, ReserveOutcome},
    routes::{events, forbidden, not_found},
    state::{AppState, SlotEvent},
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReserveRequest {
    slot_id: String,
    user_id: Option<String>,
    amount: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequest {
    reservation_id: String,
    user_id: Option<String>,
    payment_details: PaymentDetails,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest {
    reservation_id: String,
    user_id: Option<String>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .wrap(HttpAuthentication::basic(basic_validator))
            .configure(events::configure)
            .service(web::resource("/sessions").route(web::get().to(list_sessions)))
            .service(web::resource("/reserve-session").route(web::post().to(reserve_session)))
            .service(web::resource("/process-payment").route(web::post().to(process_payment)))
            .service(web::resource("/cancel-payment").route(web::post().to(cancel_payment)))
            .service(web::resource("/reservations/{id}").route(web::get().to(reservation_detail)))
            .service(web::resource("/my-bookings").route(web::get().to(my_bookings))),
    );
}

/// The user a request acts for: the body's `userId` when the caller may act for it,
/// otherwise the caller. `None` means the caller named someone else.
fn acting_user(auth: &AuthUser, requested: Option<&str>) -> Option<String> {
    match requested.map(str::trim).filter(|id| !id.is_empty()) {
        Some(user_id) if auth.may_act_for(user_id) => Some(user_id.to_string()),
        Some(_) => None,
        None => Some(auth.id.clone()),
    }
}

/// Best-effort lookup for events and audit entries; a failed read only drops the notification.
async fn reservation_slot(state: &AppState, reservation_id: &str) -> Option<TimeSlotRow> {
    let mut conn = state.db.acquire().await.ok()?;
    let reservation = reservations::get_reservation(&mut conn, reservation_id)
        .await
        .ok()
        .flatten()?;
    ledger::get_slot(&mut conn, &reservation.slot_id)
        .await
        .ok()
        .flatten()
}

async fn slot_row(state: &AppState, slot_id: &str) -> Option<TimeSlotRow> {
    let mut conn = state.db.acquire().await.ok()?;
    ledger::get_slot(&mut conn, slot_id).await.ok().flatten()
}

async fn list_sessions(
    state: web::Data<AppState>,
    query: web::Query<SlotFilter>,
) -> Result<HttpResponse> {
    let filter = query.into_inner();
    let now = Utc::now();
    let reclaimed = state
        .retry
        .retry_transient(|| reservations::expire_due(&state.db, now))
        .await?;
    if reclaimed > 0 {
        state.publish(SlotEvent::bulk("slots_reclaimed", None, reclaimed));
    }

    let rows = state
        .retry
        .retry_transient(|| ledger::list_available(&state.db, &filter, now.date_naive()))
        .await?;
    Ok(HttpResponse::Ok().json(rows))
}

async fn reserve_session(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    body: web::Json<ReserveRequest>,
) -> Result<HttpResponse> {
    let body = body.into_inner();
    let Some(user_id) = acting_user(&auth, body.user_id.as_deref()) else {
        return Ok(forbidden());
    };

    let outcome = state
        .retry
        .retry_transient(|| {
            reservations::reserve(
                &state.db,
                &state.config.engine,
                &body.slot_id,
                &user_id,
                body.amount,
                Utc::now(),
            )
        })
        .await?;

    match outcome {
        ReserveOutcome::Reserved {
            reservation_id,
            slot_id,
            expires_at,
        } => {
            log_activity(
                &state.db,
                "slot_reserved",
                &format!("Slot {slot_id} reserved until {expires_at}."),
                Some(&user_id),
                Some(&slot_id),
            )
            .await;
            if let Some(slot) = slot_row(&state, &slot_id).await {
                state.publish(SlotEvent::from_row("slot_reserved", &slot));
            }
            Ok(HttpResponse::Ok().json(json!({
                "reservationId": reservation_id,
                "slotId": slot_id,
                "expiresAt": expires_at,
            })))
        }
        ReserveOutcome::Conflict | ReserveOutcome::NotFound => Ok(not_found("slot_unavailable")),
    }
}

async fn process_payment(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    body: web::Json<PaymentRequest>,
) -> Result<HttpResponse> {
    let body = body.into_inner();
    let Some(user_id) = acting_user(&auth, body.user_id.as_deref()) else {
        return Ok(forbidden());
    };

    let outcome = state
        .retry
        .retry_transient(|| {
            payments::settle(
                &state.db,
                state.authorizer.as_ref(),
                &body.reservation_id,
                &user_id,
                &body.payment_details,
                Utc::now(),
            )
        })
        .await?;

    match outcome {
        SettleOutcome::Booked {
            booking_id,
            receipt,
        } => {
            if let Some(slot) = reservation_slot(&state, &receipt.reservation_id).await {
                log_activity(
                    &state.db,
                    "slot_booked",
                    &format!("Slot {} booked ({booking_id}).", slot.id),
                    Some(&user_id),
                    Some(&slot.id),
                )
                .await;
                state.publish(SlotEvent::from_row("slot_booked", &slot));
            }
            Ok(HttpResponse::Ok().json(json!({
                "bookingId": booking_id,
                "receipt": receipt,
            })))
        }
        SettleOutcome::Declined { reason } => {
            if let Some(slot) = reservation_slot(&state, &body.reservation_id).await {
                log_activity(
                    &state.db,
                    "payment_declined",
                    &format!("Payment declined: {reason}."),
                    Some(&user_id),
                    Some(&slot.id),
                )
                .await;
                state.publish(SlotEvent::from_row("slot_released", &slot));
            }
            Ok(HttpResponse::BadRequest().json(json!({
                "error": "payment_declined",
                "reason": reason,
            })))
        }
        SettleOutcome::Expired => {
            if let Some(slot) = reservation_slot(&state, &body.reservation_id).await {
                state.publish(SlotEvent::from_row("slot_released", &slot));
            }
            Ok(HttpResponse::BadRequest().json(json!({ "error": "reservation_expired" })))
        }
        SettleOutcome::NotFound => Ok(not_found("reservation_not_found")),
    }
}

async fn cancel_payment(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    body: web::Json<CancelRequest>,
) -> Result<HttpResponse> {
    let body = body.into_inner();
    let Some(user_id) = acting_user(&auth, body.user_id.as_deref()) else {
        return Ok(forbidden());
    };

    let outcome = state
        .retry
        .retry_transient(|| {
            reservations::cancel(&state.db, &body.reservation_id, &user_id, Utc::now())
        })
        .await?;

    match outcome {
        CancelOutcome::Cancelled => {
            if let Some(slot) = reservation_slot(&state, &body.reservation_id).await {
                log_activity(
                    &state.db,
                    "reservation_cancelled",
                    "Reservation cancelled.",
                    Some(&user_id),
                    Some(&slot.id),
                )
                .await;
                state.publish(SlotEvent::from_row("slot_released", &slot));
            }
            Ok(HttpResponse::Ok().json(json!({ "ok": true })))
        }
        CancelOutcome::Expired => Ok(not_found("reservation_expired")),
        CancelOutcome::NotFound => Ok(not_found("reservation_not_found")),
    }
}

async fn reservation_detail(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let reservation_id = path.into_inner();
    let row = state
        .retry
        .retry_transient(|| reservations::load_current(&state.db, &reservation_id, Utc::now()))
        .await?;

    match row {
        Some(row) if auth.may_act_for(&row.user_id) => Ok(HttpResponse::Ok().json(row)),
        _ => Ok(not_found("reservation_not_found")),
    }
}

async fn my_bookings(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse> {
    let rows = state
        .retry
        .retry_transient(|| bookings::list_for_user(&state.db, &auth.id))
        .await?;
    Ok(HttpResponse::Ok().json(rows))
}

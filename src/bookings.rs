//! Durable record of completed purchases. The only writer of `bookings` rows.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use crate::{
    auth::new_id,
    error::Result,
    models::{timestamp, BookingRow, BookingSummaryRow, BOOKING_CONFIRMED},
};

/// Appends a confirmed booking. Runs on the caller's connection so settlement can make it
/// part of the same transaction as the reservation and slot writes.
pub async fn record(
    conn: &mut SqliteConnection,
    user_id: &str,
    slot_id: &str,
    reservation_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<String> {
    let booking_id = new_id();
    sqlx::query(
        r#"INSERT INTO bookings (id, user_id, slot_id, payment_id, status, created_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&booking_id)
    .bind(user_id)
    .bind(slot_id)
    .bind(reservation_id)
    .bind(BOOKING_CONFIRMED)
    .bind(timestamp(now))
    .execute(conn)
    .await?;
    Ok(booking_id)
}

pub async fn find_by_reservation(
    conn: &mut SqliteConnection,
    reservation_id: &str,
) -> Result<Option<BookingRow>> {
    let row = sqlx::query_as::<_, BookingRow>(
        r#"SELECT id, user_id, slot_id, payment_id, status, created_at
           FROM bookings
           WHERE payment_id = ?
           LIMIT 1"#,
    )
    .bind(reservation_id)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

/// "My sessions": every booking of `user_id`, soonest session first.
pub async fn list_for_user(pool: &SqlitePool, user_id: &str) -> Result<Vec<BookingSummaryRow>> {
    let rows = sqlx::query_as::<_, BookingSummaryRow>(
        r#"SELECT b.id, b.slot_id, b.payment_id, b.status, b.created_at,
                  s.coach_id, c.display_name AS coach_name, s.branch_id,
                  s.session_date, s.start_time, s.end_time
           FROM bookings b
           JOIN coach_sessions s ON s.id = b.slot_id
           LEFT JOIN coaches c ON c.id = s.coach_id
           WHERE b.user_id = ?
           ORDER BY s.session_date, s.start_time"#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::test_pool, ledger::insert_slot};

    #[actix_web::test]
    async fn bookings_are_listed_per_user_in_session_order() {
        let pool = test_pool().await;
        let later = insert_slot(&pool, "coach", "2026-03-04", "09:00").await;
        let sooner = insert_slot(&pool, "coach", "2026-03-02", "18:00").await;
        let other = insert_slot(&pool, "coach", "2026-03-03", "09:00").await;

        let mut conn = pool.acquire().await.unwrap();
        let now = Utc::now();
        record(&mut conn, "u1", &later, Some("r1"), now).await.unwrap();
        let first = record(&mut conn, "u1", &sooner, Some("r2"), now).await.unwrap();
        record(&mut conn, "u2", &other, Some("r3"), now).await.unwrap();

        let found = find_by_reservation(&mut conn, "r2").await.unwrap().unwrap();
        assert_eq!(found.id, first);
        drop(conn);

        let mine = list_for_user(&pool, "u1").await.unwrap();
        let dates: Vec<&str> = mine.iter().map(|row| row.session_date.as_str()).collect();
        assert_eq!(dates, vec!["2026-03-02", "2026-03-04"]);
        assert!(mine.iter().all(|row| row.status == BOOKING_CONFIRMED));
    }

    #[actix_web::test]
    async fn one_booking_per_reservation() {
        let pool = test_pool().await;
        let slot = insert_slot(&pool, "coach", "2026-03-02", "09:00").await;
        let mut conn = pool.acquire().await.unwrap();

        record(&mut conn, "u1", &slot, Some("r1"), Utc::now()).await.unwrap();
        assert!(record(&mut conn, "u1", &slot, Some("r1"), Utc::now()).await.is_err());
    }
}

//! Authority on slot status. Every status write is a compare-and-set on the current status.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use sqlx::{SqliteConnection, SqlitePool};

use crate::{
    error::{EngineError, Result},
    models::{format_date, timestamp, AvailableSlotRow, SlotStatus, TimeSlotRow},
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotFilter {
    pub date: Option<NaiveDate>,
    pub coach_id: Option<String>,
    pub branch_id: Option<String>,
    pub level: Option<String>,
}

/// The field writes that accompany a status change; each variant implies its from/to pair.
#[derive(Debug, Clone, Copy)]
pub enum SlotChange<'a> {
    /// `available -> reserved`
    Hold {
        user_id: &'a str,
        reserved_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    /// `reserved -> available`, only while `holder` still owns the hold.
    Release { holder: &'a str },
    /// `reserved -> booked`, only while `holder` still owns the hold.
    Book {
        holder: &'a str,
        booked_at: DateTime<Utc>,
    },
}

impl SlotChange<'_> {
    pub fn from_status(&self) -> SlotStatus {
        match self {
            SlotChange::Hold { .. } => SlotStatus::Available,
            SlotChange::Release { .. } | SlotChange::Book { .. } => SlotStatus::Reserved,
        }
    }

    pub fn to_status(&self) -> SlotStatus {
        match self {
            SlotChange::Hold { .. } => SlotStatus::Reserved,
            SlotChange::Release { .. } => SlotStatus::Available,
            SlotChange::Book { .. } => SlotStatus::Booked,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The slot was not in the expected state (or hold) at write time.
    Conflict,
}

const SLOT_COLUMNS: &str = "id, coach_id, branch_id, schedule_entry_id, session_date, start_time, \
     end_time, status, reserved_by, reserved_at, reservation_expires_at, booked_at";

pub async fn get_slot(conn: &mut SqliteConnection, slot_id: &str) -> Result<Option<TimeSlotRow>> {
    let row = sqlx::query_as::<_, TimeSlotRow>(&format!(
        "SELECT {SLOT_COLUMNS} FROM coach_sessions WHERE id = ? LIMIT 1"
    ))
    .bind(slot_id)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

/// Conditional status write. Succeeds only when the row still carries the expected status
/// (and, for releases and bookings, the expected holder) at the moment of the update.
pub async fn transition(
    conn: &mut SqliteConnection,
    slot_id: &str,
    from: SlotStatus,
    to: SlotStatus,
    change: SlotChange<'_>,
) -> Result<TransitionOutcome> {
    if change.from_status() != from || change.to_status() != to {
        return Err(EngineError::InvalidTransition { from, to });
    }

    let result = match change {
        SlotChange::Hold {
            user_id,
            reserved_at,
            expires_at,
        } => {
            sqlx::query(
                r#"UPDATE coach_sessions
                   SET status = ?, reserved_by = ?, reserved_at = ?, reservation_expires_at = ?
                   WHERE id = ? AND status = ?"#,
            )
            .bind(to.as_str())
            .bind(user_id)
            .bind(timestamp(reserved_at))
            .bind(timestamp(expires_at))
            .bind(slot_id)
            .bind(from.as_str())
            .execute(conn)
            .await?
        }
        SlotChange::Release { holder } => {
            sqlx::query(
                r#"UPDATE coach_sessions
                   SET status = ?, reserved_by = NULL, reserved_at = NULL, reservation_expires_at = NULL
                   WHERE id = ? AND status = ? AND reserved_by = ?"#,
            )
            .bind(to.as_str())
            .bind(slot_id)
            .bind(from.as_str())
            .bind(holder)
            .execute(conn)
            .await?
        }
        SlotChange::Book { holder, booked_at } => {
            sqlx::query(
                r#"UPDATE coach_sessions
                   SET status = ?, reserved_at = NULL, reservation_expires_at = NULL, booked_at = ?
                   WHERE id = ? AND status = ? AND reserved_by = ?"#,
            )
            .bind(to.as_str())
            .bind(timestamp(booked_at))
            .bind(slot_id)
            .bind(from.as_str())
            .bind(holder)
            .execute(conn)
            .await?
        }
    };

    if result.rows_affected() == 1 {
        log::debug!("slot {slot_id}: {from} -> {to}");
        Ok(TransitionOutcome::Applied)
    } else {
        Ok(TransitionOutcome::Conflict)
    }
}

/// Bookable slots from `today` onwards. Callers run expiry detection first so lapsed holds
/// are already back in `available`.
pub async fn list_available(
    pool: &SqlitePool,
    filter: &SlotFilter,
    today: NaiveDate,
) -> Result<Vec<AvailableSlotRow>> {
    let rows = sqlx::query_as::<_, AvailableSlotRow>(
        r#"SELECT s.id, s.coach_id, c.display_name AS coach_name, c.level AS coach_level,
                  s.branch_id, s.session_date, s.start_time, s.end_time
           FROM coach_sessions s
           LEFT JOIN coaches c ON c.id = s.coach_id
           WHERE s.status = ?1
             AND s.session_date >= ?2
             AND (?3 IS NULL OR s.session_date = ?3)
             AND (?4 IS NULL OR s.coach_id = ?4)
             AND (?5 IS NULL OR s.branch_id = ?5)
             AND (?6 IS NULL OR c.level = ?6)
           ORDER BY s.session_date, s.start_time, s.coach_id"#,
    )
    .bind(SlotStatus::Available.as_str())
    .bind(format_date(today))
    .bind(filter.date.map(format_date))
    .bind(filter.coach_id.as_deref())
    .bind(filter.branch_id.as_deref())
    .bind(filter.level.as_deref())
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
pub(crate) async fn insert_slot(pool: &SqlitePool, coach_id: &str, date: &str, start: &str) -> String {
    let id = crate::auth::new_id();
    sqlx::query(
        r#"INSERT INTO coach_sessions
           (id, coach_id, branch_id, session_date, start_time, end_time, status, created_at)
           VALUES (?, ?, 'north', ?, ?, ?, 'available', ?)"#,
    )
    .bind(&id)
    .bind(coach_id)
    .bind(date)
    .bind(start)
    .bind(start)
    .bind(timestamp(Utc::now()))
    .execute(pool)
    .await
    .expect("insert slot");
    id
}

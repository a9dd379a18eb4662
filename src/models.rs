use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde::Serialize;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_PLAYER: &str = "player";

pub const BOOKING_CONFIRMED: &str = "confirmed";

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Available,
    Reserved,
    Booked,
}

impl SlotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotStatus::Available => "available",
            SlotStatus::Reserved => "reserved",
            SlotStatus::Booked => "booked",
        }
    }
}

impl FromStr for SlotStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "available" => Ok(SlotStatus::Available),
            "reserved" => Ok(SlotStatus::Reserved),
            "booked" => Ok(SlotStatus::Booked),
            other => Err(format!("unknown slot status '{other}'")),
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Completed,
    Cancelled,
    Expired,
    Failed,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Expired => "expired",
            ReservationStatus::Failed => "failed",
        }
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(ReservationStatus::Pending),
            "completed" => Ok(ReservationStatus::Completed),
            "cancelled" => Ok(ReservationStatus::Cancelled),
            "expired" => Ok(ReservationStatus::Expired),
            "failed" => Ok(ReservationStatus::Failed),
            other => Err(format!("unknown reservation status '{other}'")),
        }
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub role: String,
    pub password_hash: String,
    pub active: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntryRow {
    pub id: String,
    pub coach_id: String,
    pub branch_id: String,
    pub day_of_week: String,
    pub start_time: String,
    pub end_time: String,
    pub session_duration_minutes: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TimeSlotRow {
    pub id: String,
    pub coach_id: String,
    pub branch_id: String,
    pub schedule_entry_id: Option<String>,
    pub session_date: String,
    pub start_time: String,
    pub end_time: String,
    pub status: String,
    pub reserved_by: Option<String>,
    pub reserved_at: Option<String>,
    pub reservation_expires_at: Option<String>,
    pub booked_at: Option<String>,
}

impl TimeSlotRow {
    pub fn status(&self) -> Option<SlotStatus> {
        self.status.parse().ok()
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AvailableSlotRow {
    pub id: String,
    pub coach_id: String,
    pub coach_name: Option<String>,
    pub coach_level: Option<String>,
    pub branch_id: String,
    pub session_date: String,
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRow {
    pub id: String,
    pub user_id: String,
    pub slot_id: String,
    pub amount: i64,
    pub status: String,
    pub created_at: String,
    pub expires_at: String,
    pub authorized_at: Option<String>,
    pub authorization_ref: Option<String>,
    pub card_last_four: Option<String>,
    pub resolved_at: Option<String>,
}

impl ReservationRow {
    pub fn status(&self) -> Option<ReservationStatus> {
        self.status.parse().ok()
    }

    /// A hold is past due once `now` is strictly after its expiry instant.
    pub fn is_past_due(&self, now: DateTime<Utc>) -> bool {
        match parse_timestamp(&self.expires_at) {
            Some(expires_at) => now > expires_at,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BookingRow {
    pub id: String,
    pub user_id: String,
    pub slot_id: String,
    pub payment_id: Option<String>,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BookingSummaryRow {
    pub id: String,
    pub slot_id: String,
    pub payment_id: Option<String>,
    pub status: String,
    pub created_at: String,
    pub coach_id: String,
    pub coach_name: Option<String>,
    pub branch_id: String,
    pub session_date: String,
    pub start_time: String,
    pub end_time: String,
}

/// Fixed-width RFC 3339 so stored timestamps sort chronologically as text.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_time(value: &str) -> Option<NaiveTime> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, TIME_FORMAT)
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_sort_as_text() {
        let early = Utc.with_ymd_and_hms(2026, 3, 1, 9, 5, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(timestamp(early), "2026-03-01T09:05:00.000Z");
        assert!(timestamp(early) < timestamp(late));
        assert_eq!(parse_timestamp(&timestamp(late)), Some(late));
    }

    #[test]
    fn parse_time_accepts_seconds_suffix() {
        assert_eq!(parse_time("09:30"), NaiveTime::from_hms_opt(9, 30, 0));
        assert_eq!(parse_time("09:30:00"), NaiveTime::from_hms_opt(9, 30, 0));
        assert_eq!(parse_time("9h30"), None);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [SlotStatus::Available, SlotStatus::Reserved, SlotStatus::Booked] {
            assert_eq!(status.as_str().parse::<SlotStatus>(), Ok(status));
        }
        assert!("cancelled".parse::<SlotStatus>().is_err());
        assert_eq!(
            "expired".parse::<ReservationStatus>(),
            Ok(ReservationStatus::Expired)
        );
    }
}

//! Recurring weekly coach availability, the input to slot generation.

use chrono::{Utc, Weekday};
use serde::Deserialize;
use sqlx::SqlitePool;

use crate::{
    auth::new_id,
    error::{EngineError, Result},
    models::{parse_time, timestamp, ScheduleEntryRow},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntryInput {
    pub coach_id: String,
    pub branch_id: String,
    pub day_of_week: String,
    pub start_time: String,
    pub end_time: String,
    pub session_duration_minutes: i64,
}

/// A stored entry that passed validation, with its window in minutes since midnight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklyWindow {
    pub entry_id: String,
    pub coach_id: String,
    pub branch_id: String,
    pub weekday: Weekday,
    pub start_minute: u32,
    pub end_minute: u32,
    pub duration_minutes: u32,
}

pub fn parse_weekday(value: &str) -> Option<Weekday> {
    match value.trim().to_ascii_lowercase().as_str() {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" => Some(Weekday::Tue),
        "wednesday" | "wed" => Some(Weekday::Wed),
        "thursday" | "thu" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

pub fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

fn minute_of_day(value: &str) -> Option<u32> {
    use chrono::Timelike;
    parse_time(value).map(|time| time.hour() * 60 + time.minute())
}

impl ScheduleEntryInput {
    fn validate(&self) -> std::result::Result<Weekday, String> {
        if self.coach_id.trim().is_empty() {
            return Err("coachId is required".to_string());
        }
        if self.branch_id.trim().is_empty() {
            return Err("branchId is required".to_string());
        }
        let weekday = parse_weekday(&self.day_of_week)
            .ok_or_else(|| format!("unknown dayOfWeek '{}'", self.day_of_week))?;
        let start = minute_of_day(&self.start_time)
            .ok_or_else(|| format!("startTime '{}' is not HH:MM", self.start_time))?;
        let end = minute_of_day(&self.end_time)
            .ok_or_else(|| format!("endTime '{}' is not HH:MM", self.end_time))?;
        if start >= end {
            return Err("startTime must be before endTime".to_string());
        }
        if self.session_duration_minutes <= 0 {
            return Err("sessionDurationMinutes must be positive".to_string());
        }
        if self.session_duration_minutes > i64::from(end - start) {
            return Err(
                "sessionDurationMinutes must fit between startTime and endTime".to_string(),
            );
        }
        Ok(weekday)
    }
}

impl WeeklyWindow {
    /// Entries that cannot be generated from are skipped with a warning, never fatal.
    pub fn from_row(row: &ScheduleEntryRow) -> Option<Self> {
        let Some(weekday) = parse_weekday(&row.day_of_week) else {
            log::warn!(
                "Skipping schedule entry {}: unknown dayOfWeek '{}'",
                row.id,
                row.day_of_week
            );
            return None;
        };
        let (Some(start_minute), Some(end_minute)) =
            (minute_of_day(&row.start_time), minute_of_day(&row.end_time))
        else {
            log::warn!(
                "Skipping schedule entry {}: malformed window {}-{}",
                row.id,
                row.start_time,
                row.end_time
            );
            return None;
        };
        if start_minute >= end_minute || row.session_duration_minutes <= 0 {
            log::warn!(
                "Skipping schedule entry {}: empty window or non-positive duration",
                row.id
            );
            return None;
        }
        let duration_minutes = match u32::try_from(row.session_duration_minutes) {
            Ok(minutes) if minutes <= end_minute - start_minute => minutes,
            _ => {
                log::warn!(
                    "Skipping schedule entry {}: {}-minute sessions do not fit {}-{}",
                    row.id,
                    row.session_duration_minutes,
                    row.start_time,
                    row.end_time
                );
                return None;
            }
        };

        Some(Self {
            entry_id: row.id.clone(),
            coach_id: row.coach_id.clone(),
            branch_id: row.branch_id.clone(),
            weekday,
            start_minute,
            end_minute,
            duration_minutes,
        })
    }
}

pub async fn list_entries(
    pool: &SqlitePool,
    branch_id: Option<&str>,
) -> Result<Vec<ScheduleEntryRow>> {
    let rows = sqlx::query_as::<_, ScheduleEntryRow>(
        r#"SELECT id, coach_id, branch_id, day_of_week, start_time, end_time, session_duration_minutes
           FROM coach_schedules
           WHERE (?1 IS NULL OR branch_id = ?1)
           ORDER BY branch_id, coach_id, day_of_week, start_time"#,
    )
    .bind(branch_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Stores every valid entry and reports the rejected ones by index.
pub async fn import_entries(
    pool: &SqlitePool,
    entries: &[ScheduleEntryInput],
) -> Result<(Vec<String>, Vec<(usize, String)>)> {
    let mut created = Vec::new();
    let mut rejected = Vec::new();
    let now = timestamp(Utc::now());

    for (index, entry) in entries.iter().enumerate() {
        let weekday = match entry.validate() {
            Ok(weekday) => weekday,
            Err(reason) => {
                rejected.push((index, reason));
                continue;
            }
        };
        let id = new_id();
        sqlx::query(
            r#"INSERT INTO coach_schedules
               (id, coach_id, branch_id, day_of_week, start_time, end_time, session_duration_minutes, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(entry.coach_id.trim())
        .bind(entry.branch_id.trim())
        .bind(weekday_name(weekday))
        .bind(entry.start_time.trim())
        .bind(entry.end_time.trim())
        .bind(entry.session_duration_minutes)
        .bind(&now)
        .execute(pool)
        .await?;
        created.push(id);
    }

    Ok((created, rejected))
}

pub async fn delete_entry(pool: &SqlitePool, entry_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM coach_schedules WHERE id = ?")
        .bind(entry_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn upsert_coach(
    pool: &SqlitePool,
    coach_id: &str,
    display_name: &str,
    level: Option<&str>,
) -> Result<()> {
    if coach_id.trim().is_empty() || display_name.trim().is_empty() {
        return Err(EngineError::validation("coach id and display name are required"));
    }
    sqlx::query(
        r#"INSERT INTO coaches (id, display_name, level, created_at)
           VALUES (?, ?, ?, ?)
           ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name, level = excluded.level"#,
    )
    .bind(coach_id.trim())
    .bind(display_name.trim())
    .bind(level.map(str::trim).filter(|value| !value.is_empty()))
    .bind(timestamp(Utc::now()))
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) async fn insert_raw_entry(
    pool: &SqlitePool,
    coach_id: &str,
    branch_id: &str,
    day_of_week: &str,
    start_time: &str,
    end_time: &str,
    duration: i64,
) -> String {
    let id = new_id();
    sqlx::query(
        r#"INSERT INTO coach_schedules
           (id, coach_id, branch_id, day_of_week, start_time, end_time, session_duration_minutes, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&id)
    .bind(coach_id)
    .bind(branch_id)
    .bind(day_of_week)
    .bind(start_time)
    .bind(end_time)
    .bind(duration)
    .bind(timestamp(Utc::now()))
    .execute(pool)
    .await
    .expect("insert schedule entry");
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn input(day: &str, start: &str, end: &str, duration: i64) -> ScheduleEntryInput {
        ScheduleEntryInput {
            coach_id: "coach-1".to_string(),
            branch_id: "north".to_string(),
            day_of_week: day.to_string(),
            start_time: start.to_string(),
            end_time: end.to_string(),
            session_duration_minutes: duration,
        }
    }

    #[test]
    fn weekday_names_are_case_insensitive() {
        assert_eq!(parse_weekday("Monday"), Some(Weekday::Mon));
        assert_eq!(parse_weekday(" SUN "), Some(Weekday::Sun));
        assert_eq!(parse_weekday("Funday"), None);
    }

    #[test]
    fn window_rows_with_bad_days_are_skipped() {
        let row = ScheduleEntryRow {
            id: "e1".to_string(),
            coach_id: "c".to_string(),
            branch_id: "b".to_string(),
            day_of_week: "someday".to_string(),
            start_time: "09:00".to_string(),
            end_time: "12:00".to_string(),
            session_duration_minutes: 60,
        };
        assert_eq!(WeeklyWindow::from_row(&row), None);

        let row = ScheduleEntryRow {
            day_of_week: "Tuesday".to_string(),
            ..row
        };
        let window = WeeklyWindow::from_row(&row).unwrap();
        assert_eq!(window.weekday, Weekday::Tue);
        assert_eq!((window.start_minute, window.end_minute), (540, 720));

        let row = ScheduleEntryRow {
            session_duration_minutes: i64::from(u32::MAX),
            ..row
        };
        assert_eq!(WeeklyWindow::from_row(&row), None);
    }

    #[test]
    fn sessions_longer_than_the_window_are_rejected() {
        assert!(input("Monday", "09:00", "12:00", 180).validate().is_ok());
        let err = input("Monday", "09:00", "12:00", 181).validate().unwrap_err();
        assert!(err.contains("sessionDurationMinutes"));
        assert!(input("Monday", "09:00", "12:00", i64::from(u32::MAX))
            .validate()
            .is_err());
    }

    #[actix_web::test]
    async fn import_keeps_valid_entries_and_reports_rejects() {
        let pool = test_pool().await;
        let entries = vec![
            input("Monday", "09:00", "12:00", 60),
            input("Moonday", "09:00", "12:00", 60),
            input("Tuesday", "12:00", "09:00", 60),
            input("Friday", "16:00", "18:00", 0),
            input("Saturday", "08:00", "10:00", i64::from(u32::MAX)),
        ];

        let (created, rejected) = import_entries(&pool, &entries).await.unwrap();
        assert_eq!(created.len(), 1);
        let rejected_indexes: Vec<usize> = rejected.iter().map(|(index, _)| *index).collect();
        assert_eq!(rejected_indexes, vec![1, 2, 3, 4]);

        let stored = list_entries(&pool, Some("north")).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].day_of_week, "monday");
        assert!(list_entries(&pool, Some("south")).await.unwrap().is_empty());

        assert!(delete_entry(&pool, &created[0]).await.unwrap());
        assert!(!delete_entry(&pool, &created[0]).await.unwrap());
    }
}

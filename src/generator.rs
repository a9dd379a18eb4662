//! Expands weekly schedule entries into concrete, date-stamped slots.

use chrono::{Datelike, Duration, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::{
    auth::new_id,
    config::EngineConfig,
    error::{BatchFailure, EngineError, Result},
    models::{format_date, timestamp, SlotStatus},
    schedule::{self, WeeklyWindow},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotCandidate {
    pub coach_id: String,
    pub branch_id: String,
    pub schedule_entry_id: String,
    pub session_date: NaiveDate,
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationReport {
    pub candidate_count: usize,
    pub created_count: u64,
    pub batch_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerationReport {
    pub deleted_count: u64,
    pub created_count: u64,
}

fn format_minute(minute: u32) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

/// Walks the window in whole sessions; a trailing remainder shorter than one session is dropped.
pub fn expand_window(window: &WeeklyWindow, date: NaiveDate) -> Vec<SlotCandidate> {
    let mut slots = Vec::new();
    if window.duration_minutes == 0 {
        return slots;
    }
    let mut cursor = window.start_minute;
    while let Some(end) = cursor
        .checked_add(window.duration_minutes)
        .filter(|end| *end <= window.end_minute)
    {
        slots.push(SlotCandidate {
            coach_id: window.coach_id.clone(),
            branch_id: window.branch_id.clone(),
            schedule_entry_id: window.entry_id.clone(),
            session_date: date,
            start_time: format_minute(cursor),
            end_time: format_minute(end),
        });
        cursor = end;
    }
    slots
}

pub fn expand_horizon(
    windows: &[WeeklyWindow],
    horizon_start: NaiveDate,
    horizon_days: u32,
) -> Vec<SlotCandidate> {
    let mut candidates = Vec::new();
    for offset in 0..i64::from(horizon_days) {
        let date = horizon_start + Duration::days(offset);
        let weekday = date.weekday();
        for window in windows.iter().filter(|window| window.weekday == weekday) {
            candidates.extend(expand_window(window, date));
        }
    }
    candidates
}

async fn insert_batch(pool: &SqlitePool, batch: &[SlotCandidate], created_at: &str) -> Result<u64> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "INSERT INTO coach_sessions \
         (id, coach_id, branch_id, schedule_entry_id, session_date, start_time, end_time, status, created_at) ",
    );
    builder.push_values(batch, |mut row, slot| {
        row.push_bind(new_id())
            .push_bind(slot.coach_id.clone())
            .push_bind(slot.branch_id.clone())
            .push_bind(slot.schedule_entry_id.clone())
            .push_bind(format_date(slot.session_date))
            .push_bind(slot.start_time.clone())
            .push_bind(slot.end_time.clone())
            .push_bind(SlotStatus::Available.as_str())
            .push_bind(created_at.to_string());
    });
    builder.push(" ON CONFLICT (coach_id, branch_id, session_date, start_time) DO NOTHING");

    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}

/// Materialises slots for `[horizon_start, horizon_start + horizon_days)`.
///
/// Existing natural keys are left alone, so overlapping runs only count slots they actually
/// created. Batches are independent: a failed batch does not stop the others, and the
/// failure is returned with the number of rows that did land.
pub async fn generate(
    pool: &SqlitePool,
    config: &EngineConfig,
    horizon_start: NaiveDate,
    horizon_days: u32,
    branch_id: Option<&str>,
) -> Result<GenerationReport> {
    let rows = schedule::list_entries(pool, branch_id).await?;
    let windows: Vec<WeeklyWindow> = rows.iter().filter_map(WeeklyWindow::from_row).collect();
    let candidates = expand_horizon(&windows, horizon_start, horizon_days);

    let created_at = timestamp(Utc::now());
    let mut report = GenerationReport {
        candidate_count: candidates.len(),
        ..GenerationReport::default()
    };
    let mut failed_batches = Vec::new();

    for (batch_index, batch) in candidates.chunks(config.batch_size.max(1)).enumerate() {
        report.batch_count += 1;
        match insert_batch(pool, batch, &created_at).await {
            Ok(created) => report.created_count += created,
            Err(err) => {
                log::error!(
                    "Slot batch {batch_index} ({} rows) failed: {err}",
                    batch.len()
                );
                failed_batches.push(BatchFailure {
                    batch_index,
                    rows: batch.len(),
                    error: err.to_string(),
                });
            }
        }
    }

    if !failed_batches.is_empty() {
        return Err(EngineError::Generation {
            created: report.created_count,
            failed_batches,
        });
    }

    log::info!(
        "Generated {} new slots from {} candidates ({} schedule entries, {} days from {})",
        report.created_count,
        report.candidate_count,
        windows.len(),
        horizon_days,
        horizon_start
    );
    Ok(report)
}

/// Drops still-available slots from `from_date` onwards, then generates again.
/// Reserved and booked slots are never touched.
pub async fn regenerate(
    pool: &SqlitePool,
    config: &EngineConfig,
    from_date: NaiveDate,
    horizon_days: u32,
    branch_id: Option<&str>,
) -> Result<RegenerationReport> {
    let deleted = sqlx::query(
        r#"DELETE FROM coach_sessions
           WHERE status = ?1
             AND session_date >= ?2
             AND (?3 IS NULL OR branch_id = ?3)"#,
    )
    .bind(SlotStatus::Available.as_str())
    .bind(format_date(from_date))
    .bind(branch_id)
    .execute(pool)
    .await?
    .rows_affected();

    log::info!("Cleared {deleted} available slots from {from_date} before regeneration");

    let generated = generate(pool, config, from_date, horizon_days, branch_id).await?;
    Ok(RegenerationReport {
        deleted_count: deleted,
        created_count: generated.created_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::test_pool, schedule::insert_raw_entry};
    use chrono::Weekday;

    // 2026-03-02 is a Monday.
    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn window(start: u32, end: u32, duration: u32) -> WeeklyWindow {
        WeeklyWindow {
            entry_id: "entry".to_string(),
            coach_id: "coach".to_string(),
            branch_id: "north".to_string(),
            weekday: Weekday::Mon,
            start_minute: start,
            end_minute: end,
            duration_minutes: duration,
        }
    }

    #[test]
    fn trailing_remainder_is_discarded() {
        let slots = expand_window(&window(9 * 60, 11 * 60 + 30, 60), monday());
        let starts: Vec<&str> = slots.iter().map(|slot| slot.start_time.as_str()).collect();
        assert_eq!(starts, vec!["09:00", "10:00"]);
        assert_eq!(slots[1].end_time, "11:00");
    }

    #[test]
    fn window_shorter_than_a_session_yields_nothing() {
        assert!(expand_window(&window(9 * 60, 9 * 60 + 45, 60), monday()).is_empty());
    }

    #[test]
    fn oversized_sessions_do_not_overflow_the_cursor() {
        assert!(expand_window(&window(9 * 60, 12 * 60, u32::MAX), monday()).is_empty());
        assert!(expand_window(&window(9 * 60, 12 * 60, 0), monday()).is_empty());
    }

    #[test]
    fn horizon_only_matches_the_entry_weekday() {
        let windows = vec![window(18 * 60, 20 * 60, 60)];
        let candidates = expand_horizon(&windows, monday(), 14);
        let dates: Vec<NaiveDate> = candidates.iter().map(|slot| slot.session_date).collect();
        assert_eq!(
            dates,
            vec![
                monday(),
                monday(),
                monday() + Duration::days(7),
                monday() + Duration::days(7)
            ]
        );
    }

    #[test]
    fn horizon_end_is_exclusive() {
        let windows = vec![window(18 * 60, 19 * 60, 60)];
        assert_eq!(expand_horizon(&windows, monday(), 7).len(), 1);
        assert!(expand_horizon(&windows, monday() + Duration::days(1), 6).is_empty());
    }

    #[actix_web::test]
    async fn generation_is_idempotent_across_overlapping_runs() {
        let pool = test_pool().await;
        let config = EngineConfig {
            batch_size: 3,
            ..EngineConfig::default()
        };
        insert_raw_entry(&pool, "coach-a", "north", "Monday", "09:00", "12:00", 60).await;
        insert_raw_entry(&pool, "coach-a", "north", "Wednesday", "17:00", "18:30", 45).await;

        let first = generate(&pool, &config, monday(), 14, None).await.unwrap();
        assert_eq!(first.created_count, 10);
        assert_eq!(first.batch_count, 4);

        let second = generate(&pool, &config, monday(), 14, None).await.unwrap();
        assert_eq!(second.created_count, 0);

        let overlapping = generate(&pool, &config, monday() + Duration::days(7), 14, None)
            .await
            .unwrap();
        assert_eq!(overlapping.created_count, 5);

        let duplicates: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM (
                 SELECT 1 FROM coach_sessions
                 GROUP BY coach_id, branch_id, session_date, start_time
                 HAVING COUNT(*) > 1)"#,
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(duplicates, 0);
    }

    #[actix_web::test]
    async fn unknown_days_are_skipped_not_fatal() {
        let pool = test_pool().await;
        insert_raw_entry(&pool, "coach-a", "north", "Caturday", "09:00", "12:00", 60).await;
        insert_raw_entry(&pool, "coach-a", "north", "Monday", "09:00", "10:00", 60).await;

        let report = generate(&pool, &EngineConfig::default(), monday(), 7, None)
            .await
            .unwrap();
        assert_eq!(report.created_count, 1);
    }

    #[actix_web::test]
    async fn stored_entries_with_oversized_sessions_are_skipped() {
        let pool = test_pool().await;
        insert_raw_entry(&pool, "coach-a", "north", "Monday", "09:00", "12:00", i64::from(u32::MAX))
            .await;
        insert_raw_entry(&pool, "coach-a", "north", "Monday", "14:00", "15:00", 60).await;

        let report = generate(&pool, &EngineConfig::default(), monday(), 7, None)
            .await
            .unwrap();
        assert_eq!(report.candidate_count, 1);
        assert_eq!(report.created_count, 1);
    }

    #[actix_web::test]
    async fn failed_batch_is_reported_while_the_others_commit() {
        let pool = test_pool().await;
        let config = EngineConfig {
            batch_size: 3,
            ..EngineConfig::default()
        };
        insert_raw_entry(&pool, "coach-a", "north", "Monday", "09:00", "12:00", 60).await;
        sqlx::query(
            r#"CREATE TRIGGER block_second_monday BEFORE INSERT ON coach_sessions
               WHEN NEW.session_date = '2026-03-09'
               BEGIN SELECT RAISE(ABORT, 'blocked date'); END"#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let err = generate(&pool, &config, monday(), 21, None).await.unwrap_err();
        let (created, failed_batches) = match err {
            EngineError::Generation {
                created,
                failed_batches,
            } => (created, failed_batches),
            other => panic!("expected a generation failure, got {other:?}"),
        };
        assert_eq!(created, 6);
        assert_eq!(failed_batches.len(), 1);
        assert_eq!(failed_batches[0].batch_index, 1);
        assert_eq!(failed_batches[0].rows, 3);
        assert!(failed_batches[0].error.contains("blocked date"));

        let dates: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT session_date FROM coach_sessions ORDER BY session_date",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(dates, vec!["2026-03-02".to_string(), "2026-03-16".to_string()]);
    }

    #[actix_web::test]
    async fn generation_can_be_scoped_to_a_branch() {
        let pool = test_pool().await;
        insert_raw_entry(&pool, "coach-a", "north", "Monday", "09:00", "10:00", 60).await;
        insert_raw_entry(&pool, "coach-b", "south", "Monday", "09:00", "10:00", 60).await;

        let report = generate(&pool, &EngineConfig::default(), monday(), 7, Some("south"))
            .await
            .unwrap();
        assert_eq!(report.created_count, 1);

        let branches: Vec<String> = sqlx::query_scalar("SELECT branch_id FROM coach_sessions")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(branches, vec!["south".to_string()]);
    }

    #[actix_web::test]
    async fn regeneration_only_clears_available_slots() {
        let pool = test_pool().await;
        let config = EngineConfig::default();
        insert_raw_entry(&pool, "coach-a", "north", "Monday", "09:00", "12:00", 60).await;
        generate(&pool, &config, monday(), 7, None).await.unwrap();

        sqlx::query(
            "UPDATE coach_sessions SET status = 'reserved', reserved_by = 'u1' WHERE start_time = '09:00'",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("UPDATE coach_sessions SET status = 'booked' WHERE start_time = '10:00'")
            .execute(&pool)
            .await
            .unwrap();
        let held: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM coach_sessions WHERE status != 'available' ORDER BY start_time",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        // Schedule change: the 11:00 session moves to the afternoon.
        sqlx::query("DELETE FROM coach_schedules").execute(&pool).await.unwrap();
        insert_raw_entry(&pool, "coach-a", "north", "Monday", "09:00", "11:00", 60).await;
        insert_raw_entry(&pool, "coach-a", "north", "Monday", "14:00", "15:00", 60).await;

        let report = regenerate(&pool, &config, monday(), 7, None).await.unwrap();
        assert_eq!(report.deleted_count, 1);
        assert_eq!(report.created_count, 1);

        let survivors: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM coach_sessions WHERE status != 'available' ORDER BY start_time",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(survivors, held);

        let starts: Vec<String> =
            sqlx::query_scalar("SELECT start_time FROM coach_sessions ORDER BY start_time")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(starts, vec!["09:00", "10:00", "14:00"]);
    }
}

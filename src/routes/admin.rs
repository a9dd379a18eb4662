use actix_web::{web, HttpResponse, Result};
use actix_web_httpauth::middleware::HttpAuthentication;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::{
    auth::{admin_validator, AuthUser},
    db::{create_user, log_activity},
    error::EngineError,
    generator,
    models::{ROLE_ADMIN, ROLE_PLAYER},
    routes::not_found,
    schedule::{self, ScheduleEntryInput},
    state::{AppState, SlotEvent},
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    branch_id: Option<String>,
    horizon_days: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegenerateRequest {
    branch_id: Option<String>,
    from_date: Option<NaiveDate>,
    horizon_days: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BranchQuery {
    branch_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoachPayload {
    id: String,
    display_name: String,
    level: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserCreatePayload {
    username: String,
    display_name: String,
    password: String,
    role: Option<String>,
}

/// Registered ahead of the `/api` scope so admin paths only pass the admin check.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/admin")
            .wrap(HttpAuthentication::basic(admin_validator))
            .service(web::resource("/generate-sessions").route(web::post().to(generate_sessions)))
            .service(
                web::resource("/regenerate-sessions").route(web::post().to(regenerate_sessions)),
            )
            .service(
                web::resource("/schedules")
                    .route(web::get().to(list_schedules))
                    .route(web::post().to(import_schedules)),
            )
            .service(web::resource("/schedules/{id}").route(web::delete().to(delete_schedule)))
            .service(web::resource("/coaches").route(web::post().to(upsert_coach)))
            .service(web::resource("/users").route(web::post().to(create_login))),
    );
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

async fn generate_sessions(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    body: web::Json<GenerateRequest>,
) -> Result<HttpResponse> {
    let body = body.into_inner();
    let Some(branch_id) = non_blank(body.branch_id) else {
        return Err(EngineError::validation("branchId is required").into());
    };
    let horizon_days = body.horizon_days.unwrap_or(state.config.engine.horizon_days).max(1);
    let today = Utc::now().date_naive();

    let report = state
        .retry
        .retry_transient(|| {
            generator::generate(
                &state.db,
                &state.config.engine,
                today,
                horizon_days,
                Some(&branch_id),
            )
        })
        .await?;

    log_activity(
        &state.db,
        "sessions_generated",
        &format!(
            "{} generated {} sessions for {branch_id}.",
            auth.display_name, report.created_count
        ),
        Some(&auth.id),
        None,
    )
    .await;
    state.publish(SlotEvent::bulk(
        "slots_generated",
        Some(&branch_id),
        report.created_count,
    ));
    Ok(HttpResponse::Ok().json(report))
}

async fn regenerate_sessions(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    body: web::Json<RegenerateRequest>,
) -> Result<HttpResponse> {
    let body = body.into_inner();
    let branch_id = non_blank(body.branch_id);
    let from_date = body.from_date.unwrap_or_else(|| Utc::now().date_naive());
    let horizon_days = body.horizon_days.unwrap_or(state.config.engine.horizon_days).max(1);

    let report = state
        .retry
        .retry_transient(|| {
            generator::regenerate(
                &state.db,
                &state.config.engine,
                from_date,
                horizon_days,
                branch_id.as_deref(),
            )
        })
        .await?;

    log_activity(
        &state.db,
        "sessions_regenerated",
        &format!(
            "{} regenerated sessions from {from_date}: {} removed, {} created.",
            auth.display_name, report.deleted_count, report.created_count
        ),
        Some(&auth.id),
        None,
    )
    .await;
    state.publish(SlotEvent::bulk(
        "slots_regenerated",
        branch_id.as_deref(),
        report.created_count,
    ));
    Ok(HttpResponse::Ok().json(report))
}

async fn list_schedules(
    state: web::Data<AppState>,
    query: web::Query<BranchQuery>,
) -> Result<HttpResponse> {
    let branch_id = non_blank(query.into_inner().branch_id);
    let rows = schedule::list_entries(&state.db, branch_id.as_deref()).await?;
    Ok(HttpResponse::Ok().json(rows))
}

async fn import_schedules(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    body: web::Json<Vec<ScheduleEntryInput>>,
) -> Result<HttpResponse> {
    let entries = body.into_inner();
    let (created, rejected) = schedule::import_entries(&state.db, &entries).await?;

    log_activity(
        &state.db,
        "schedules_imported",
        &format!(
            "{} imported {} schedule entries ({} rejected).",
            auth.display_name,
            created.len(),
            rejected.len()
        ),
        Some(&auth.id),
        None,
    )
    .await;

    let rejected: Vec<_> = rejected
        .into_iter()
        .map(|(index, reason)| json!({ "index": index, "reason": reason }))
        .collect();
    Ok(HttpResponse::Ok().json(json!({
        "createdIds": created,
        "rejected": rejected,
    })))
}

async fn delete_schedule(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let entry_id = path.into_inner();
    if schedule::delete_entry(&state.db, &entry_id).await? {
        Ok(HttpResponse::NoContent().finish())
    } else {
        Ok(not_found("schedule_entry_not_found"))
    }
}

async fn upsert_coach(
    state: web::Data<AppState>,
    body: web::Json<CoachPayload>,
) -> Result<HttpResponse> {
    let body = body.into_inner();
    schedule::upsert_coach(&state.db, &body.id, &body.display_name, body.level.as_deref()).await?;
    Ok(HttpResponse::Ok().json(json!({ "ok": true })))
}

async fn create_login(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    body: web::Json<UserCreatePayload>,
) -> Result<HttpResponse> {
    let body = body.into_inner();
    let role = body.role.as_deref().unwrap_or(ROLE_PLAYER);
    let mut errors = Vec::new();
    if body.username.trim().is_empty() {
        errors.push("username is required");
    }
    if body.display_name.trim().is_empty() {
        errors.push("displayName is required");
    }
    if body.password.len() < 8 {
        errors.push("password must be at least 8 characters");
    }
    if role != ROLE_PLAYER && role != ROLE_ADMIN {
        errors.push("role must be player or admin");
    }
    if !errors.is_empty() {
        return Err(EngineError::validation(errors.join("; ")).into());
    }

    let user_id = match create_user(
        &state.db,
        body.username.trim(),
        body.display_name.trim(),
        role,
        &body.password,
    )
    .await
    {
        Ok(user_id) => user_id,
        Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
            return Ok(HttpResponse::Conflict().json(json!({ "error": "username_taken" })));
        }
        Err(err) => return Err(EngineError::from(err).into()),
    };

    log_activity(
        &state.db,
        "user_created",
        &format!("{} created {role} login {}.", auth.display_name, body.username.trim()),
        Some(&auth.id),
        None,
    )
    .await;
    Ok(HttpResponse::Created().json(json!({ "id": user_id, "role": role })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::testing::{auth, test_state, ADMIN, SAM};
    use actix_web::{http::StatusCode, test, App};
    use serde_json::Value;

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state.clone()))
                    .configure(configure),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn players_are_forbidden() {
        let (state, _) = test_state(1.0).await;
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/api/admin/generate-sessions")
            .insert_header(auth(SAM))
            .set_json(json!({ "branchId": "north" }))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn generation_requires_a_branch() {
        let (state, _) = test_state(1.0).await;
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/api/admin/generate-sessions")
            .insert_header(auth(ADMIN))
            .set_json(json!({ "branchId": "  " }))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn imported_schedules_generate_sessions_once() {
        let (state, _) = test_state(1.0).await;
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/api/admin/schedules")
            .insert_header(auth(ADMIN))
            .set_json(json!([
                {
                    "coachId": "coach-a",
                    "branchId": "north",
                    "dayOfWeek": "Monday",
                    "startTime": "09:00",
                    "endTime": "11:00",
                    "sessionDurationMinutes": 60
                },
                {
                    "coachId": "coach-a",
                    "branchId": "north",
                    "dayOfWeek": "Someday",
                    "startTime": "09:00",
                    "endTime": "11:00",
                    "sessionDurationMinutes": 60
                }
            ]))
            .to_request();
        let imported: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(imported["createdIds"].as_array().unwrap().len(), 1);
        assert_eq!(imported["rejected"][0]["index"], 1);

        let generate = || {
            test::TestRequest::post()
                .uri("/api/admin/generate-sessions")
                .insert_header(auth(ADMIN))
                .set_json(json!({ "branchId": "north", "horizonDays": 7 }))
                .to_request()
        };
        // Any 7-day window holds exactly one Monday.
        let first: Value = test::call_and_read_body_json(&app, generate()).await;
        assert_eq!(first["createdCount"], 2);
        let second: Value = test::call_and_read_body_json(&app, generate()).await;
        assert_eq!(second["createdCount"], 0);
        assert_eq!(second["candidateCount"], 2);
    }

    #[actix_web::test]
    async fn admins_provision_player_logins() {
        let (state, _) = test_state(1.0).await;
        let app = app!(state);

        let payload = json!({
            "username": "casey",
            "displayName": "Casey",
            "password": "long-enough"
        });
        let req = test::TestRequest::post()
            .uri("/api/admin/users")
            .insert_header(auth(ADMIN))
            .set_json(&payload)
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["role"], "player");

        let req = test::TestRequest::post()
            .uri("/api/admin/users")
            .insert_header(auth(ADMIN))
            .set_json(&payload)
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::CONFLICT);
    }
}

pub mod admin;
pub mod api;
pub mod events;
pub mod public;

use actix_web::HttpResponse;
use serde_json::json;

pub(crate) fn not_found(error: &str) -> HttpResponse {
    HttpResponse::NotFound().json(json!({ "error": error }))
}

pub(crate) fn forbidden() -> HttpResponse {
    HttpResponse::Forbidden().json(json!({ "error": "forbidden" }))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use actix_web::http::header;
    use tokio::sync::broadcast;

    use crate::{
        config::AppConfig,
        db::{create_user, seed_defaults, test_pool},
        models::ROLE_PLAYER,
        payments::SimulatedGateway,
        retry::RetryPolicy,
        state::AppState,
    };

    /// Basic credentials for the logins created by [`test_state`].
    pub const SAM: &str = "Basic c2FtOnB3";
    pub const ALEX: &str = "Basic YWxleDpwdw==";
    pub const ADMIN: &str = "Basic YWRtaW46YWRtaW4=";
    pub const SAM_WRONG_PASSWORD: &str = "Basic c2FtOndyb25n";

    pub fn auth(value: &'static str) -> (header::HeaderName, &'static str) {
        (header::AUTHORIZATION, value)
    }

    /// State over a fresh in-memory store with the default admin plus players `sam` and `alex`.
    /// Returns the state and sam's user id.
    pub async fn test_state(success_rate: f64) -> (AppState, String) {
        let db = test_pool().await;
        seed_defaults(&db).await.unwrap();
        let sam = create_user(&db, "sam", "Sam", ROLE_PLAYER, "pw").await.unwrap();
        create_user(&db, "alex", "Alex", ROLE_PLAYER, "pw").await.unwrap();
        let (events, _) = broadcast::channel(64);
        let state = AppState {
            db,
            config: AppConfig::from_env(),
            authorizer: Arc::new(SimulatedGateway::new(success_rate)),
            retry: RetryPolicy::new(1, 1, 1, 0.0),
            events,
        };
        (state, sam)
    }
}

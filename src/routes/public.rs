use actix_web::{web, HttpResponse};

use crate::state::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health)));
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => HttpResponse::Ok().body("ok"),
        Err(err) => {
            log::error!("Health check failed: {err}");
            HttpResponse::ServiceUnavailable().body("database unavailable")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::testing::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn health_needs_no_credentials() {
        let (state, _) = test_state(1.0).await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body = test::call_and_read_body(&app, req).await;
        assert_eq!(body, web::Bytes::from_static(b"ok"));
    }
}

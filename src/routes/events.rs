use actix_web::{http::header, web, HttpResponse};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::state::{AppState, SlotEvent};

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventFilter {
    branch_id: Option<String>,
}

/// Registered inside the authenticated `/api` scope.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/events").route(web::get().to(stream_events)));
}

async fn stream_events(state: web::Data<AppState>, query: web::Query<EventFilter>) -> HttpResponse {
    let branch_id = query.into_inner().branch_id;
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |result| {
        // Lagged receivers skip what they missed; clients re-list on reconnect.
        let event = result.ok()?;
        if !matches_branch(&event, branch_id.as_deref()) {
            return None;
        }
        Some(Ok::<web::Bytes, actix_web::Error>(event_to_bytes(&event)))
    });

    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(stream)
}

/// Events without a branch (sweeps) go to everyone.
fn matches_branch(event: &SlotEvent, branch_id: Option<&str>) -> bool {
    match (branch_id, event.branch_id.as_deref()) {
        (Some(wanted), Some(actual)) => wanted == actual,
        _ => true,
    }
}

fn event_to_bytes(event: &SlotEvent) -> web::Bytes {
    let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    web::Bytes::from(format!("event: {}\ndata: {}\n\n", event.kind, payload))
}

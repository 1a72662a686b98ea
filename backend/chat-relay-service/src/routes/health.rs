use crate::state::AppState;
use actix_web::{get, web, HttpResponse};
use serde_json::json;

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let relay = &state.relay;
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "sessions": relay.registry().len(),
        "rooms": relay.membership().room_count(),
        "fanout": {
            "delivered": relay.stats().delivered(),
            "dropped": relay.stats().dropped(),
        },
    }))
}

#[get("/metrics")]
pub async fn metrics() -> HttpResponse {
    crate::metrics::metrics_handler().await
}

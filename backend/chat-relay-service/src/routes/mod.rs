pub mod health;
pub mod rooms;
pub mod wsroute;

use crate::auth::Credentials;
use crate::error::AppError;
use crate::models::Principal;
use crate::state::AppState;
use actix_web::{web, HttpRequest};
use tracing::warn;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(wsroute::ws_handler)
        .service(rooms::join_room)
        .service(rooms::leave_room)
        .service(health::health)
        .service(health::metrics);
}

/// Resolves the caller from the Bearer header or `auth` query parameter
pub(crate) async fn authenticate(req: &HttpRequest, state: &AppState) -> Result<Principal, AppError> {
    let credentials = Credentials::from_request(req);
    state
        .authenticator
        .authenticate(&credentials)
        .await
        .map_err(|e| {
            warn!(path = %req.path(), error = %e, "request rejected");
            AppError::Unauthorized
        })
}

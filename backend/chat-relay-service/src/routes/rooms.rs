//! Room membership endpoints
//!
//! Joining or leaving takes effect on the caller's live session immediately,
//! so messages to a newly joined room arrive without reconnecting.

use super::authenticate;
use crate::error::AppError;
use crate::state::AppState;
use actix_web::{post, web, HttpRequest, HttpResponse};
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMembershipResponse {
    pub room_id: String,
    pub user_id: String,
    pub joined: bool,
}

/// POST /rooms/{room_id}/join
#[post("/rooms/{room_id}/join")]
pub async fn join_room(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let principal = authenticate(&req, &state).await?;
    let room_id = path.into_inner();

    state
        .relay
        .join_room(&room_id, &principal.user_id)
        .await
        .map_err(|e| {
            error!(room_id = %room_id, user_id = %principal.user_id, error = %e, "failed to join room");
            AppError::from(e)
        })?;

    Ok(HttpResponse::Ok().json(RoomMembershipResponse {
        room_id,
        user_id: principal.user_id,
        joined: true,
    }))
}

/// POST /rooms/{room_id}/leave
#[post("/rooms/{room_id}/leave")]
pub async fn leave_room(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let principal = authenticate(&req, &state).await?;
    let room_id = path.into_inner();

    state
        .relay
        .leave_room(&room_id, &principal.user_id)
        .await
        .map_err(|e| {
            error!(room_id = %room_id, user_id = %principal.user_id, error = %e, "failed to leave room");
            AppError::from(e)
        })?;

    Ok(HttpResponse::Ok().json(RoomMembershipResponse {
        room_id,
        user_id: principal.user_id,
        joined: false,
    }))
}

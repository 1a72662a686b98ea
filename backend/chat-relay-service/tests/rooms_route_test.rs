mod common;

use actix_web::{test, web, App};
use async_trait::async_trait;
use chat_relay_service::auth::{AuthError, Authenticator, Credentials};
use chat_relay_service::models::Principal;
use chat_relay_service::routes;
use chat_relay_service::state::AppState;
use common::{connect, harness};
use std::sync::Arc;
use std::time::Duration;

/// Accepts `<user>-token` for alice and bob
struct StaticTokens;

#[async_trait]
impl Authenticator for StaticTokens {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Principal, AuthError> {
        match credentials.token() {
            Some("alice-token") => Ok(Principal::new("alice", "Alice")),
            Some("bob-token") => Ok(Principal::new("bob", "Bob")),
            Some(other) => Err(AuthError::InvalidToken(other.to_string())),
            None => Err(AuthError::MissingToken),
        }
    }
}

#[actix_web::test]
async fn test_join_and_leave_apply_to_live_session() {
    let h = harness(16, &[("alice", "R1"), ("bob", "R9")]).await;
    let mut alice = connect(&h.relay, "alice", "Alice").await;
    let mut bob = connect(&h.relay, "bob", "Bob").await;

    let state = AppState {
        relay: h.relay.clone(),
        authenticator: Arc::new(StaticTokens),
    };
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(routes::configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/rooms/R9/join")
        .insert_header(("Authorization", "Bearer alice-token"))
        .to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["roomId"], "R9");
    assert_eq!(body["userId"], "alice");
    assert_eq!(body["joined"], true);

    // no reconnect needed
    bob.send_chat("R9", "welcome");
    assert_eq!(alice.next_frame().await["content"], "welcome");
    assert_eq!(bob.next_frame().await["content"], "welcome");

    let req = test::TestRequest::post()
        .uri("/rooms/R9/leave?auth=alice-token")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    bob.send_chat("R9", "gone");
    assert_eq!(bob.next_frame().await["content"], "gone");
    alice.assert_silent(Duration::from_millis(200)).await;
    assert!(!h.relay.membership().participants_of("R9").contains("alice"));
}

#[actix_web::test]
async fn test_join_requires_authentication() {
    let h = harness(16, &[]).await;
    let state = AppState {
        relay: h.relay.clone(),
        authenticator: Arc::new(StaticTokens),
    };
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(routes::configure),
    )
    .await;

    let req = test::TestRequest::post().uri("/rooms/R1/join").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    let req = test::TestRequest::post()
        .uri("/rooms/R1/join")
        .insert_header(("Authorization", "Bearer forged"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    assert!(h.relay.membership().participants_of("R1").is_empty());
}

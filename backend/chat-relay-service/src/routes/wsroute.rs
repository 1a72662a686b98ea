use super::authenticate;
use crate::error::AppError;
use crate::state::AppState;
use crate::websocket::{ClientFrame, FrameSink, TransportError};
use actix_web::{get, web, HttpRequest, HttpResponse};
use actix_ws::Message;
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;
use tracing::{error, warn};

type ClientFrames = Pin<Box<dyn Stream<Item = Result<ClientFrame, TransportError>>>>;

/// Adapts the actix-ws message stream to the session's frame model.
/// Pings are answered here and never reach the session.
fn client_frames(messages: actix_ws::MessageStream, session: actix_ws::Session) -> ClientFrames {
    Box::pin(stream::unfold(
        (messages, session),
        |(mut messages, mut session)| async move {
            loop {
                let frame = match messages.next().await? {
                    Ok(Message::Text(text)) => Ok(ClientFrame::Text(text.to_string())),
                    Ok(Message::Binary(_)) => Ok(ClientFrame::Binary),
                    Ok(Message::Close(_)) => Ok(ClientFrame::Close),
                    Ok(Message::Ping(bytes)) => {
                        if session.pong(&bytes).await.is_err() {
                            Err(TransportError("socket closed while answering ping".into()))
                        } else {
                            continue;
                        }
                    }
                    Ok(Message::Pong(_)) | Ok(Message::Nop) | Ok(Message::Continuation(_)) => {
                        continue
                    }
                    Err(e) => Err(TransportError(e.to_string())),
                };
                return Some((frame, (messages, session)));
            }
        },
    ))
}

struct WsSink(Option<actix_ws::Session>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        let session = self
            .0
            .as_mut()
            .ok_or_else(|| TransportError("socket already closed".into()))?;
        session
            .text(text)
            .await
            .map_err(|_| TransportError("socket closed".into()))
    }

    async fn close(&mut self) {
        if let Some(session) = self.0.take() {
            let _ = session.close(None).await;
        }
    }
}

/// Upgrades an authenticated client to a relay session
#[get("/websocket")]
pub async fn ws_handler(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let principal = authenticate(&req, &state).await?;

    let (response, ws_session, messages) = actix_ws::handle(&req, body).map_err(|e| {
        warn!(error = %e, "websocket handshake failed");
        AppError::Internal
    })?;

    let session = state.relay.open_session(principal).await.map_err(|e| {
        error!(error = %e, "failed to load room membership");
        AppError::from(e)
    })?;

    let reader = client_frames(messages, ws_session.clone());
    let writer = WsSink(Some(ws_session));

    // actix payload streams are !Send, so the session runs on the worker's local set
    actix_rt::spawn(async move {
        let _ = session.run(reader, writer).await;
    });

    Ok(response)
}

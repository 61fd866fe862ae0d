//! Progress subscription over a websocket
//!
//! The server pushes snapshot frames of one job and a final `done` frame. A client may
//! send `{"heart":1}` to get a pong back, or `{"message":"abort"}` to end the stream.
//! A client that sends nothing for the heartbeat timeout is disconnected.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use release_api::models::ClientFrame;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::ReleaseError;
use crate::models::result::JobKind;
use crate::progress::watcher::Frame;
use crate::server::handlers::ApiError;
use crate::server::state::ServerState;
use crate::service::Subscription;

pub async fn progress_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Path((kind, id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    let kind: JobKind = kind.parse().map_err(ReleaseError::ValidationError)?;
    let subscription = state.service.subscribe(kind, id).await?;
    let heartbeat_timeout = state.heartbeat_timeout;
    Ok(ws.on_upgrade(move |socket| stream_progress(socket, subscription, heartbeat_timeout)))
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ReleaseError> {
    let text = serde_json::to_string(frame)?;
    socket
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| ReleaseError::ServerError(e.to_string()))
}

async fn stream_progress(mut socket: WebSocket, mut subscription: Subscription, heartbeat_timeout: Duration) {
    let mut deadline = Instant::now() + heartbeat_timeout;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => {
                debug!("Subscriber silent for {:?}, disconnecting", heartbeat_timeout);
                break;
            }
            frame = subscription.frames.recv() => {
                let Some(frame) = frame else { break };
                let done = frame == Frame::Done;
                if let Err(e) = send_frame(&mut socket, &frame).await {
                    debug!("Subscriber went away: {}", e);
                    return;
                }
                if done {
                    break;
                }
            }
            msg = socket.recv() => {
                if matches!(msg, Some(Ok(_))) {
                    deadline = Instant::now() + heartbeat_timeout;
                }
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let client: ClientFrame = match serde_json::from_str(text.as_str()) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("Ignoring malformed client frame: {}", e);
                                continue;
                            }
                        };
                        if client.is_abort() {
                            debug!("Subscriber aborted");
                            break;
                        }
                        if client.is_heartbeat() && send_frame(&mut socket, &Frame::Pong).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Err(e)) => {
                        debug!("Websocket error: {}", e);
                        return;
                    }
                    _ => {}
                }
            }
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

//! Progress subscriptions over a live websocket

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use common::{commit, flow, Harness};

use release_engine::adapters::build_server::FlowStatus;
use release_engine::build::controller::BuildOrder;
use release_engine::client::follow::progress_url;
use release_engine::models::app::AppModule;
use release_engine::models::deploy::DeployMode;
use release_engine::models::result::JobKind;
use release_engine::models::JobId;
use release_engine::progress::watcher::{self, Frame};
use release_engine::server::serve::router;
use release_engine::server::state::ServerState;
use release_engine::service::ReleaseService;

const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(200);

/// Serve the engine on an ephemeral port; returns its base URL and a build in progress
async fn serve(h: &Harness) -> (String, JobId) {
    h.build_server.set_flows(vec![flow(FlowStatus::InProgress, &[])]);
    let id = h
        .builds
        .request_build(BuildOrder::new("web", commit("abc123")))
        .await
        .unwrap();

    let service = ReleaseService::new(
        h.builds.clone(),
        h.deploys.clone(),
        h.stores.clone(),
        watcher::Options {
            interval: Duration::from_millis(10),
            confirmations: 2,
            max_polls: 10_000,
        },
    );
    let state = ServerState::new(Arc::new(service)).with_heartbeat_timeout(HEARTBEAT_TIMEOUT);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router(Arc::new(state))).await });

    (format!("http://{}", addr), id)
}

fn harness() -> Harness {
    Harness::new(vec![AppModule::new("web", DeployMode::Kubernetes)], &[])
}

#[tokio::test]
async fn test_silent_subscriber_is_disconnected() {
    let h = harness();
    let (server_url, id) = serve(&h).await;
    let url = progress_url(&server_url, JobKind::Build, &id).unwrap();
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    let connected = Instant::now();

    let mut snapshots = 0;
    let closed = timeout(Duration::from_secs(5), async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let frame: Frame = serde_json::from_str(text.as_str()).unwrap();
                    assert!(matches!(frame, Frame::Snapshot { .. }));
                    snapshots += 1;
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    assert!(closed.is_ok(), "subscriber was never disconnected");
    assert!(connected.elapsed() >= HEARTBEAT_TIMEOUT / 2);
    assert!(snapshots >= 1);
}

#[tokio::test]
async fn test_heartbeats_keep_the_subscription_open() {
    let h = harness();
    let (server_url, id) = serve(&h).await;
    let url = progress_url(&server_url, JobKind::Build, &id).unwrap();
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

    // well past the timeout, one heartbeat at a time
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let heart = serde_json::json!({"heart": 1}).to_string();
        ws.send(Message::Text(heart.into())).await.unwrap();

        let pong = timeout(Duration::from_secs(2), async {
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    if serde_json::from_str::<Frame>(text.as_str()).unwrap() == Frame::Pong {
                        return true;
                    }
                }
            }
            false
        })
        .await;
        assert_eq!(pong, Ok(true));
    }
}

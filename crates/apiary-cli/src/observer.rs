//! HTTP observer: status endpoint and the SSE event stream.
//!
//! Each `/events` connection gets an initial `snapshot` frame, then one
//! SSE record per hub event, plus heartbeat comments. A per-connection
//! bounded buffer protects the bus: a client that cannot keep up is
//! disconnected and reconnects for a fresh snapshot.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use apiary_core::{Hub, HubEvent};

use anyhow::{Context, Result};

/// Depth of the per-connection outbound buffer.
const CONNECTION_BUFFER: usize = 64;

pub fn build_router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/status", get(status))
        .route("/events", get(events))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(hub)
}

/// Run the observer in the foreground until Ctrl+C.
pub async fn run_serve(hub: Arc<Hub>, bind: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid observer address {bind}:{port}"))?;
    let app = build_router(hub);
    tracing::info!("apiary observer listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("apiary observer shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    let status = hub.status();
    let html = format!(
        "<!DOCTYPE html>\
<html><head><title>apiary</title></head><body>\
<h1>apiary hub</h1>\
<p><a href=\"/status\">/status</a> | <a href=\"/events\">/events</a></p>\
<table>\
<tr><th>agents</th><td>{} ({} running)</td></tr>\
<tr><th>tasks</th><td>{}</td></tr>\
<tr><th>pending solicitations</th><td>{}</td></tr>\
<tr><th>leased ports</th><td>{}</td></tr>\
</table>\
</body></html>",
        status.agents_total,
        status.agents_running,
        status.tasks_total,
        status.solicitations_pending,
        status.ports_leased,
    );
    Html(html)
}

async fn status(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    Json(hub.status())
}

async fn events(
    State(hub): State<Arc<Hub>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Event>(CONNECTION_BUFFER);

    let snapshot = hub.snapshot();
    let bus = hub.subscribe();
    let cancel = hub.cancellation();
    let write_timeout = Duration::from_millis(hub.config().timeouts.sse_write_timeout_ms.max(1));
    let heartbeat = Duration::from_secs(hub.config().timeouts.heartbeat_s.max(1));

    tokio::spawn(async move {
        relay(snapshot, bus, cancel, tx, write_timeout, heartbeat).await;
    });

    Sse::new(ReceiverStream::new(rx).map(Ok))
}

/// Pump one connection: snapshot, then deltas and heartbeats until the
/// client stalls, the bus overflows, or the hub shuts down.
async fn relay(
    snapshot: apiary_core::hub::HubSnapshot,
    mut bus: broadcast::Receiver<HubEvent>,
    cancel: CancellationToken,
    tx: mpsc::Sender<Event>,
    write_timeout: Duration,
    heartbeat: Duration,
) {
    let snapshot_frame = match serde_json::to_string(&snapshot) {
        Ok(json) => Event::default().event("snapshot").data(json),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize snapshot");
            return;
        }
    };
    if push(&tx, snapshot_frame, write_timeout).await.is_err() {
        return;
    }

    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Final frame so clients see a deliberate close.
                let _ = push(&tx, Event::default().comment("hub shutting down"), write_timeout).await;
                break;
            }
            _ = ticker.tick() => {
                if push(&tx, Event::default().comment("heartbeat"), write_timeout).await.is_err() {
                    break;
                }
            }
            received = bus.recv() => match received {
                Ok(event) => {
                    let data = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to serialize event");
                            continue;
                        }
                    };
                    let frame = Event::default().event(event.kind()).data(data);
                    if push(&tx, frame, write_timeout).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // The client fell too far behind; close so it
                    // reconnects for a fresh snapshot.
                    tracing::warn!(skipped, "observer connection lagged, closing");
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Push one frame into the connection buffer, bounded by the write
/// timeout. An error means the connection is dead or stalled.
async fn push(tx: &mpsc::Sender<Event>, event: Event, write_timeout: Duration) -> Result<(), ()> {
    match tokio::time::timeout(write_timeout, tx.send(event)).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::collections::HashMap;
    use tower::ServiceExt;

    use apiary_core::agent::{AgentRole, AgentSpecialty, SpawnOptions};
    use apiary_test_utils::test_hub;

    fn spawn_opts(name: &str) -> SpawnOptions {
        SpawnOptions {
            name: name.to_string(),
            role: AgentRole::Worker,
            specialty: AgentSpecialty::Front,
            model: None,
            branch: None,
            required_ports: vec![],
            wait_for_ports: false,
            env: HashMap::new(),
        }
    }

    async fn get_response(hub: Arc<Hub>, uri: &str) -> axum::response::Response {
        build_router(hub)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    /// Read SSE frames until one separated by a blank line matches `pred`.
    async fn read_frame_matching(
        stream: &mut (impl Stream<Item = Result<axum::body::Bytes, axum::Error>> + Unpin),
        pred: impl Fn(&str) -> bool,
    ) -> String {
        let mut buffer = String::new();
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                while let Some(end) = buffer.find("\n\n") {
                    let frame = buffer[..end].to_string();
                    buffer.drain(..end + 2);
                    if pred(&frame) {
                        return frame;
                    }
                }
                let chunk = stream
                    .next()
                    .await
                    .expect("stream ended early")
                    .expect("stream errored");
                buffer.push_str(std::str::from_utf8(&chunk).unwrap());
            }
        })
        .await
        .expect("timed out waiting for frame")
    }

    #[tokio::test]
    async fn index_returns_html() {
        let t = test_hub();
        let resp = get_response(t.hub.clone(), "/").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/html"));
    }

    #[tokio::test]
    async fn status_matches_hub_counters() {
        let t = test_hub();
        t.hub.spawn_agent(spawn_opts("drone-1")).await.unwrap();

        let resp = get_response(t.hub.clone(), "/status").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 1_048_576).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["agents_total"], 1);
        assert_eq!(json["agents_running"], 1);
        assert_eq!(json["tasks_total"], 0);
    }

    #[tokio::test]
    async fn events_starts_with_snapshot_then_streams_deltas() {
        let t = test_hub();
        t.hub.spawn_agent(spawn_opts("drone-1")).await.unwrap();

        let resp = get_response(t.hub.clone(), "/events").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/event-stream"));

        let mut stream = resp.into_body().into_data_stream();

        // First frame is the snapshot, carrying the existing agent.
        let snapshot = read_frame_matching(&mut stream, |f| f.contains("event: snapshot")).await;
        assert!(snapshot.contains("drone-1"));

        // A spawn after connect arrives as a delta frame.
        t.hub.spawn_agent(spawn_opts("drone-2")).await.unwrap();
        let delta =
            read_frame_matching(&mut stream, |f| f.contains("event: agent_created")).await;
        assert!(delta.contains("drone-2"));

        // And later snapshots include it.
        let resp = get_response(t.hub.clone(), "/events").await;
        let mut second = resp.into_body().into_data_stream();
        let snapshot =
            read_frame_matching(&mut second, |f| f.contains("event: snapshot")).await;
        assert!(snapshot.contains("drone-2"));
    }

    #[tokio::test]
    async fn hub_close_terminates_the_stream() {
        let t = test_hub();
        let resp = get_response(t.hub.clone(), "/events").await;
        let mut stream = resp.into_body().into_data_stream();
        read_frame_matching(&mut stream, |f| f.contains("event: snapshot")).await;

        t.hub.close().await;

        // The connection drains (final comment frame) and then ends.
        let ended = tokio::time::timeout(Duration::from_secs(3), async {
            while let Some(chunk) = stream.next().await {
                if chunk.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(ended.is_ok(), "stream should end after hub close");
    }
}

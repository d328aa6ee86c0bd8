use std::time::Duration;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use runway_common::{Run, RunStreamEvent, TerminalStatus};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use super::api::{ApiError, SharedState};
use crate::events::Subscription;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// `GET /ws/runs/{id}`: the run's events so far, then live events until the
/// run's stream closes.
pub async fn run_events(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    // Subscribe before reading the run so a finish in between is not missed.
    let subscription = state
        .hub
        .subscribe(&run_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let run = match state
        .launcher
        .orchestrator()
        .store()
        .get_run_info(&run_id)
        .await
    {
        Ok(run) => run,
        Err(e) => {
            drop(subscription);
            state.hub.release(&run_id);
            return Err(e.into());
        }
    };

    let (backlog, rx) = match subscription {
        Subscription::Open { backlog, rx } if finished_event(&run).is_none() => (backlog, rx),
        subscription => {
            drop(subscription);
            state.hub.release(&run_id);
            let closing = finished_event(&run)
                .map(|event| serde_json::to_string(&event))
                .transpose()
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            return Ok(ws
                .on_upgrade(move |socket| send_and_close(socket, closing))
                .into_response());
        }
    };

    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, run_id, backlog, rx))
        .into_response())
}

/// The closing event of a run that already finished.
fn finished_event(run: &Run) -> Option<RunStreamEvent> {
    let status = TerminalStatus::try_from(run.status).ok()?;
    Some(RunStreamEvent::RunFinished {
        run_id: run.id.clone(),
        status,
        timestamp: run.finished_at.unwrap_or(run.updated_at),
    })
}

async fn send_and_close(mut socket: WebSocket, closing: Option<String>) {
    if let Some(json) = closing
        && socket.send(Message::Text(json.into())).await.is_err()
    {
        return;
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn handle_socket(
    socket: WebSocket,
    state: SharedState,
    run_id: String,
    backlog: Vec<String>,
    rx: broadcast::Receiver<String>,
) {
    let (mut sender, receiver) = socket.split();
    let mut delivered = true;
    for event in backlog {
        if sender.send(Message::Text(event.into())).await.is_err() {
            delivered = false;
            break;
        }
    }
    if delivered {
        run_socket_loop(&state, &run_id, sender, receiver, rx).await;
    } else {
        drop(rx);
    }
    state.hub.release(&run_id);
    debug!(run_id = %run_id, "event socket closed");
}

/// Forward run events with ping/pong keepalive until the stream closes or
/// the client goes away. Every ping tick also re-reads the run, so a run
/// that finishes in another process still ends the socket.
async fn run_socket_loop(
    state: &SharedState,
    run_id: &str,
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if let Some(json) = finished_elsewhere(state, run_id).await {
                    if sender.send(Message::Text(json.into())).await.is_ok() {
                        let _ = sender.send(Message::Close(None)).await;
                    }
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "event socket lagged");
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// The closing event of a run that reached a terminal status without this
/// process writing its `run-finished`.
async fn finished_elsewhere(state: &SharedState, run_id: &str) -> Option<String> {
    let orchestrator = state.launcher.orchestrator();
    if orchestrator.cancels().contains(run_id) {
        return None;
    }
    let run = orchestrator.store().get_run_info(run_id).await.ok()?;
    let event = finished_event(&run)?;
    serde_json::to_string(&event).ok()
}

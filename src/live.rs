//! Live-update channel: the WebSocket endpoint streaming terminal output
//! to the browser and receiving save/run events from it.
//!
//! Delivery is scoped per identity: each connection subscribes to its own
//! identity's channel only, so one user's output never reaches another's
//! terminal.

use crate::files;
use crate::runner;
use crate::session;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

const BACKLOG_LINES: usize = 10;

/// Inbound browser events.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Inbound {
    TerminalCommand { command: String },
    SaveFile { filename: String, content: String },
    RunCode { filename: String },
}

fn outbound(line: &str) -> String {
    serde_json::json!({ "event": "terminal_output", "output": line }).to_string()
}

/// Push one output line onto an identity's live channel. A channel with no
/// connected subscribers drops the line, matching a disconnected browser
/// missing live output.
pub async fn emit(state: &AppState, user_id: i64, line: &str) {
    let tx = state.live_channel(user_id).await;
    let _ = tx.send(outbound(line));
}

/// WebSocket upgrade. The identity is resolved from the cookie or socket
/// address here and fixed for the connection's lifetime.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let identity = match session::resolve_or_create(&state, &headers, addr).await {
        Ok(resolved) => Some((resolved.user_id, resolved.username)),
        Err(e) => {
            warn!(error = %e, "could not resolve identity for live connection");
            None
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

async fn handle_socket(socket: WebSocket, state: AppState, identity: Option<(i64, String)>) {
    let (mut sender, mut receiver) = socket.split();

    let Some((user_id, username)) = identity else {
        let _ = sender.send(Message::Text(outbound("[SYSTEM] Welcome to webpad"))).await;
        return;
    };
    info!(user_id, username = %username, "live connection opened");

    // Replay recent install history before any live traffic.
    let store = state.store.clone();
    let backlog = tokio::task::spawn_blocking(move || store.recent_lib_outputs(user_id, BACKLOG_LINES)).await;
    match backlog {
        Ok(Ok(outputs)) => {
            for output in outputs {
                if sender.send(Message::Text(outbound(&output))).await.is_err() {
                    return;
                }
            }
        }
        Ok(Err(e)) => warn!(user_id, error = %e, "could not load backlog"),
        Err(e) => warn!(user_id, error = %e, "backlog task failed"),
    }
    let connected = format!("[SYSTEM] Connected as {username}");
    if sender.send(Message::Text(outbound(&connected))).await.is_err() {
        return;
    }

    // Subscribe before reading inbound events so no output of a run we
    // trigger is missed.
    let mut rx = state.live_channel(user_id).await.subscribe();

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if sender.send(Message::Text(msg)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(user_id, skipped, "live channel lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                dispatch(&recv_state, user_id, &text);
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    info!(user_id, "live connection closed");
}

/// Handle one inbound event in a spawned task so the socket read loop
/// never blocks on a long-running process. Malformed events are logged
/// and skipped.
fn dispatch(state: &AppState, user_id: i64, text: &str) {
    let event: Inbound = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(user_id, error = %e, "ignoring malformed live event");
            return;
        }
    };

    let state = state.clone();
    tokio::spawn(async move {
        match event {
            Inbound::TerminalCommand { command } => {
                runner::run_shell_command(&state, user_id, &command).await;
            }
            Inbound::SaveFile { filename, content } => {
                files::save_file(&state, user_id, &filename, &content).await;
            }
            Inbound::RunCode { filename } => {
                runner::run_saved_file(&state, user_id, &filename).await;
            }
        }
    });
}

// crates/challengectl-api/src/ws.rs
// ============================================================================
// Module: Event WebSocket
// Description: The bidirectional event channel realized as a WebSocket
//              endpoint carrying JSON `Event` frames.
// Purpose: Give subscribers a live feed of dispatch state changes with a
//          one-shot initial snapshot, without ever blocking a publisher.
// Dependencies: axum, challengectl-core, tokio
// ============================================================================

//! ## Overview
//! Every connection first receives a snapshot of every challenge and runner
//! as synthetic `Event` frames, then a live feed of whatever `EventBus`
//! broadcasts afterward. A lagging subscriber (`broadcast::error::RecvError::
//! Lagged`) is not disconnected: it is told how many frames it missed via a
//! synthetic resync notice and continues receiving fresh events; there are no
//! delivery guarantees beyond that.

// ============================================================================
// SECTION: Imports
// ============================================================================

use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::response::Response;
use challengectl_core::Event;
use tokio::sync::broadcast;

use crate::state::AppState;

/// Upgrades the connection and hands it off to [`run_socket`].
pub async fn events_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| run_socket(socket, state))
}

async fn run_socket(mut socket: WebSocket, state: AppState) {
    if send_snapshot(&mut socket, &state).await.is_err() {
        return;
    }

    let mut receiver = state.events.subscribe();
    loop {
        tokio::select! {
            event = receiver.recv() => {
                match event {
                    Ok(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let notice = serde_json::json!({"kind": "resync", "skipped": skipped});
                        if socket.send(Message::Text(notice.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

async fn send_snapshot(socket: &mut WebSocket, state: &AppState) -> Result<(), axum::Error> {
    let challenges = state.dispatch.list_challenges().await.unwrap_or_default();
    for challenge in challenges {
        send_event(socket, &Event::ChallengeAssigned { challenge }).await?;
    }
    Ok(())
}

async fn send_event(socket: &mut WebSocket, event: &Event) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(&WireEvent::from(event)).unwrap_or_else(|_| "{}".to_owned());
    socket.send(Message::Text(payload.into())).await
}

/// JSON-serializable mirror of [`Event`]; kept separate because `Event`
/// itself deliberately carries no `serde` derive (it is an in-process-only
/// type shared with `challengectl-dispatch`, which has no reason to depend
/// on `serde`).
#[derive(Debug, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireEvent {
    ChallengeAssigned { challenge: challengectl_core::Challenge },
    TransmissionComplete { transmission: challengectl_core::Transmission, synthetic_reason: Option<String> },
    RunnerStatus { runner_id: challengectl_core::RunnerId, status: challengectl_core::RunnerStatus },
    Disown { challenge_id: challengectl_core::ChallengeId, runner_id: challengectl_core::RunnerId },
}

impl From<&Event> for WireEvent {
    fn from(event: &Event) -> Self {
        match event {
            Event::ChallengeAssigned { challenge } => Self::ChallengeAssigned { challenge: challenge.clone() },
            Event::TransmissionComplete { transmission, synthetic_reason } => Self::TransmissionComplete { transmission: transmission.clone(), synthetic_reason: synthetic_reason.clone() },
            Event::RunnerStatus { runner_id, status } => Self::RunnerStatus { runner_id: runner_id.clone(), status: *status },
            Event::Disown { challenge_id, runner_id } => Self::Disown { challenge_id: challenge_id.clone(), runner_id: runner_id.clone() },
        }
    }
}

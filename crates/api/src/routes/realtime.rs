use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, State};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use haggle_domain::events::ChatEvent;
use haggle_domain::identity::ActorIdentity;
use haggle_infra::realtime::ConnectionHandle;
use serde::{Deserialize, Serialize};
use tokio::time::interval;

use super::actor_identity;
use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::observability;
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientFrame {
    Join {
        conversation_id: String,
    },
    Leave {
        conversation_id: String,
    },
    Typing {
        conversation_id: String,
        #[serde(default = "default_typing")]
        is_typing: bool,
    },
}

fn default_typing() -> bool {
    true
}

/// Server frames that acknowledge client actions. Chat events use the same
/// `{"event","data"}` envelope.
#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
enum ControlFrame {
    Connected {
        connection_id: String,
        user_id: String,
    },
    Joined {
        conversation_id: String,
    },
    Left {
        conversation_id: String,
    },
    Error {
        message: String,
    },
}

pub(super) async fn chat_socket(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let actor = actor_identity(&auth)?;
    Ok(ws.on_upgrade(move |socket| run_socket(socket, state, actor)))
}

async fn run_socket(socket: WebSocket, state: AppState, actor: ActorIdentity) {
    let (handle, mut events) = ConnectionHandle::new(actor.user_id.clone());
    if let Some(displaced) = state.presence.register(handle.clone()).await {
        tracing::debug!(
            user_id = %actor.user_id,
            displaced_connection_id = %displaced.connection_id,
            "newer connection replaced presence entry"
        );
    }
    observability::register_ws_connection_opened();
    tracing::info!(
        user_id = %actor.user_id,
        connection_id = %handle.connection_id,
        "chat socket connected"
    );

    let (mut sender, mut incoming) = socket.split();
    let connected = ControlFrame::Connected {
        connection_id: handle.connection_id.clone(),
        user_id: actor.user_id.clone(),
    };

    if send_json(&mut sender, &connected).await.is_ok() {
        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if send_json(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                frame = incoming.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = handle_client_frame(&state, &actor, &handle, &text).await {
                                if send_json(&mut sender, &reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
                _ = heartbeat.tick() => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    let rooms_left = state.rooms.leave_all(&handle.connection_id).await;
    state
        .presence
        .unregister(&actor.user_id, &handle.connection_id)
        .await;
    observability::register_ws_connection_closed();
    tracing::info!(
        user_id = %actor.user_id,
        connection_id = %handle.connection_id,
        rooms_left,
        "chat socket closed"
    );
}

async fn handle_client_frame(
    state: &AppState,
    actor: &ActorIdentity,
    handle: &ConnectionHandle,
    text: &str,
) -> Option<ControlFrame> {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            observability::register_ws_client_frame("unknown", "invalid");
            return Some(ControlFrame::Error {
                message: format!("invalid frame: {err}"),
            });
        }
    };

    match frame {
        ClientFrame::Join { conversation_id } => {
            if let Err(err) = state.chat.assert_participant(actor, &conversation_id).await {
                observability::register_ws_client_frame("join", "rejected");
                return Some(ControlFrame::Error {
                    message: err.to_string(),
                });
            }
            state.rooms.join(&conversation_id, handle.clone()).await;
            observability::register_ws_client_frame("join", "ok");
            Some(ControlFrame::Joined { conversation_id })
        }
        ClientFrame::Leave { conversation_id } => {
            state
                .rooms
                .leave(&conversation_id, &handle.connection_id)
                .await;
            observability::register_ws_client_frame("leave", "ok");
            Some(ControlFrame::Left { conversation_id })
        }
        ClientFrame::Typing {
            conversation_id,
            is_typing,
        } => {
            if let Err(err) = state.chat.assert_participant(actor, &conversation_id).await {
                observability::register_ws_client_frame("typing", "rejected");
                return Some(ControlFrame::Error {
                    message: err.to_string(),
                });
            }
            let event = ChatEvent::UserTyping {
                conversation_id,
                user_id: actor.user_id.clone(),
                is_typing,
            };
            state
                .broadcaster
                .relay_to_room(&event, &handle.connection_id)
                .await;
            observability::register_ws_client_frame("typing", "ok");
            None
        }
    }
}

async fn send_json<T: Serialize>(
    sender: &mut SplitSink<WebSocket, Message>,
    value: &T,
) -> Result<(), axum::Error> {
    let payload = match serde_json::to_string(value) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(error = %err, "failed to encode socket frame");
            return Ok(());
        }
    };
    sender.send(Message::Text(payload)).await
}

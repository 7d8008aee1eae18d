// =============================================================================
// WebSocket Handler — EventBus subscription endpoint
// =============================================================================
//
// Clients connect to `/ws/{channel}?token=<token>`, which subscribes the
// connection to that channel immediately. After that, a client can send a
// JSON control message to manage additional subscriptions on the same
// socket: `{"type":"subscribe","channel":"..."}` joins another channel and
// replies `{"type":"subscribed","channel":"..."}`; `{"type":"unsubscribe",
// "channel":"..."}` leaves one; `{"type":"get_statistics"}` returns the
// bus's current subscriber counts. Anything else — malformed JSON, an
// unknown channel, an unrecognised message type — gets back
// `{"type":"error","message":"..."}`. Ping frames get Pong replies.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::auth::validate_token;
use crate::app_state::AppState;
use crate::error::BusDeliveryError;
use crate::event_bus::{BusStatistics, Envelope, Subscriber, SubscriberState};
use crate::types::Channel;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    GetStatistics,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Subscribed { channel: String },
    Unsubscribed { channel: String },
    Statistics {
        #[serde(flatten)]
        stats: BusStatistics,
    },
    Error {
        message: String,
    },
}

/// Forwards published envelopes to a single WebSocket connection over an
/// mpsc channel; the connection's recv/send loop drains the other end. The
/// same instance is reused across every channel the connection joins, so
/// the bus always sees one subscriber id per socket, not one per channel.
struct WsSubscriber {
    id: Uuid,
    sender: mpsc::Sender<Envelope>,
    connected: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Subscriber for WsSubscriber {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), BusDeliveryError> {
        self.sender
            .send(envelope.clone())
            .await
            .map_err(|_| BusDeliveryError("subscriber channel closed".to_string()))
    }

    fn state(&self) -> SubscriberState {
        if self.connected.load(Ordering::Acquire) {
            SubscriberState::Connected
        } else {
            SubscriberState::Disconnected
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    let channel = match Channel::parse(&channel) {
        Some(c) => c,
        None => {
            warn!(channel, "WebSocket connection rejected: unknown channel");
            return (axum::http::StatusCode::NOT_FOUND, "Unknown channel").into_response();
        }
    };

    info!(%channel, "WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, channel))
        .into_response()
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>, channel: Channel) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Envelope>(64);
    let id = Uuid::new_v4();
    let connected = Arc::new(AtomicBool::new(true));
    let subscriber: Arc<WsSubscriber> = Arc::new(WsSubscriber {
        id,
        sender: tx,
        connected: connected.clone(),
    });

    state.bus.subscribe(channel, subscriber.clone()).await;

    loop {
        tokio::select! {
            Some(envelope) = rx.recv() => {
                let json = match serde_json::to_string(&envelope) {
                    Ok(j) => j,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize envelope");
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(%channel, "WebSocket close frame received");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_message(&state, &subscriber, &text).await;
                        let json = match serde_json::to_string(&reply) {
                            Ok(j) => j,
                            Err(e) => {
                                warn!(error = %e, "failed to serialize server message");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(%channel, error = %e, "WebSocket receive error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    connected.store(false, Ordering::Release);
    state.bus.unsubscribe(id).await;
    info!(%channel, "WebSocket connection closed");
}

async fn handle_client_message(
    state: &AppState,
    subscriber: &Arc<WsSubscriber>,
    text: &str,
) -> ServerMessage {
    let parsed: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!(msg = %text, error = %e, "unparseable client message");
            return ServerMessage::Error { message: format!("invalid message: {e}") };
        }
    };

    match parsed {
        ClientMessage::Subscribe { channel } => match Channel::parse(&channel) {
            Some(c) => {
                state.bus.subscribe(c, subscriber.clone()).await;
                ServerMessage::Subscribed { channel: c.as_str().to_string() }
            }
            None => ServerMessage::Error { message: format!("unknown channel: {channel}") },
        },
        ClientMessage::Unsubscribe { channel } => match Channel::parse(&channel) {
            Some(c) => {
                state.bus.unsubscribe_from(subscriber.id(), c).await;
                ServerMessage::Unsubscribed { channel: c.as_str().to_string() }
            }
            None => ServerMessage::Error { message: format!("unknown channel: {channel}") },
        },
        ClientMessage::GetStatistics => ServerMessage::Statistics { stats: state.bus.statistics().await },
    }
}

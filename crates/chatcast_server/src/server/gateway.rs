#![forbid(unsafe_code)]

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{any, get};
use chatcast_domain::{ChannelIds, ChannelName, IdentifierSource};
use chatcast_platform::ChannelInfo;
use chatcast_platform::kick::SubscribeRequest;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::server::health::HealthState;
use crate::server::manager::ConnectionManager;
use crate::server::messages::{BadgeDataPayload, ClientMessage, ServerMessage};
use crate::server::room_hub::{RoomHub, RoomItem};
use crate::server::services::Services;

const SESSION_OUT_CAPACITY: usize = 256;

/// Shared gateway state.
#[derive(Clone)]
pub struct AppState {
	pub manager: ConnectionManager,
	pub hub: RoomHub,
	pub services: Arc<Services>,
	pub health: HealthState,
}

/// Build the gateway router: the WebSocket endpoint plus health routes.
pub fn build_router(state: AppState) -> Router {
	Router::new()
		.route("/ws", any(ws_handler))
		.route("/healthz", get(healthz))
		.route("/readyz", get(readyz))
		.layer(TraceLayer::new_for_http())
		.layer(CorsLayer::permissive())
		.with_state(state)
}

async fn healthz() -> &'static str {
	"ok"
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
	if state.health.is_ready() {
		(StatusCode::OK, "ready")
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
	}
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
	ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One downstream subscriber session: bound to at most one channel at a
/// time; joining another channel leaves the previous one first.
struct Session {
	id: String,
	channel: Option<ChannelName>,
	forward_task: Option<JoinHandle<()>>,
}

async fn handle_socket(socket: WebSocket, state: AppState) {
	let (mut ws_sender, mut ws_receiver) = socket.split();
	let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(SESSION_OUT_CAPACITY);

	let mut session = Session {
		id: Uuid::new_v4().to_string(),
		channel: None,
		forward_task: None,
	};
	info!(session = %session.id, "gateway client connected");
	metrics::counter!("chatcast_gateway_sessions_total").increment(1);

	let mut send_task = tokio::spawn(async move {
		while let Some(message) = out_rx.recv().await {
			let Ok(text) = message.to_ws_text() else {
				continue;
			};
			if ws_sender.send(Message::Text(text.into())).await.is_err() {
				break;
			}
		}
	});

	loop {
		tokio::select! {
			frame = ws_receiver.next() => {
				match frame {
					Some(Ok(Message::Text(text))) => {
						match ClientMessage::from_ws_text(&text) {
							Ok(ClientMessage::JoinChannel(name)) => {
								handle_join(&state, &mut session, &name, &out_tx).await;
							}
							Ok(ClientMessage::LeaveChannel) => {
								leave_current_channel(&state, &mut session).await;
							}
							Ok(ClientMessage::BadgeData(payload)) => {
								handle_badge_data(&state, payload).await;
							}
							Err(err) => {
								debug!(session = %session.id, error = %err, "unparseable client frame");
								let _ = out_tx.send(ServerMessage::ConnectionError("invalid message".to_string())).await;
							}
						}
					}
					Some(Ok(Message::Close(_))) | None => break,
					Some(Ok(_)) => {}
					Some(Err(err)) => {
						debug!(session = %session.id, error = %err, "gateway socket error");
						break;
					}
				}
			}
			_ = &mut send_task => break,
		}
	}

	// Disconnect implies leave.
	leave_current_channel(&state, &mut session).await;
	send_task.abort();
	info!(session = %session.id, "gateway client disconnected");
}

async fn handle_join(state: &AppState, session: &mut Session, name: &str, out_tx: &mpsc::Sender<ServerMessage>) {
	let Ok(channel) = ChannelName::new(name) else {
		let _ = out_tx
			.send(ServerMessage::ConnectionError(format!("invalid channel name: {name}")))
			.await;
		return;
	};

	// Rejoining moves the session: leave the previous channel first.
	if session.channel.as_ref() == Some(&channel) {
		debug!(session = %session.id, channel = %channel, "already joined");
		return;
	}
	leave_current_channel(state, session).await;

	info!(session = %session.id, channel = %channel, "joining channel");

	// Subscribe before acquiring so the optimistic connect announcement
	// cannot slip past this session.
	let mut room_rx = state.hub.subscribe(channel.clone()).await;

	match state.manager.acquire(channel.clone()).await {
		Ok(outcome) => {
			let forward_out = out_tx.clone();
			let forward_channel = channel.clone();
			session.forward_task = Some(tokio::spawn(async move {
				while let Some(item) = room_rx.recv().await {
					match item {
						RoomItem::Event(event) => {
							if forward_out.send(event).await.is_err() {
								break;
							}
						}
						RoomItem::Lagged { dropped } => {
							warn!(channel = %forward_channel, dropped, "session lagged; events dropped");
						}
					}
				}
			}));
			session.channel = Some(channel.clone());

			if !outcome.created {
				// The connection's own announcement already happened; give
				// the late joiner its connected signal directly.
				let _ = out_tx
					.send(ServerMessage::ChannelConnected(ChannelInfo::placeholder(&channel)))
					.await;
			}

			let emote_services = state.services.clone();
			let emote_out = out_tx.clone();
			let emote_channel = channel;
			tokio::spawn(async move {
				let emotes = emote_services.emotes.load_channel_emotes(&emote_channel).await;
				let _ = emote_out.send(ServerMessage::EmotesLoaded(emotes)).await;
			});
		}
		Err(err) => {
			warn!(session = %session.id, channel = %channel, error = %err, "join failed");
			metrics::counter!("chatcast_gateway_join_failures_total").increment(1);
			drop(room_rx);
			state.hub.prune(&channel).await;
			let _ = out_tx
				.send(ServerMessage::ConnectionError(format!("Failed to connect to channel: {name}")))
				.await;
		}
	}
}

async fn leave_current_channel(state: &AppState, session: &mut Session) {
	let Some(channel) = session.channel.take() else {
		return;
	};

	info!(session = %session.id, channel = %channel, "leaving channel");
	if let Some(task) = session.forward_task.take() {
		task.abort();
	}
	state.hub.prune(&channel).await;
	state.manager.release(channel).await;
}

/// Feed client-harvested badge data into the badge cache and the identifier
/// hint path; when the pair completes, trigger the pending subscribe.
async fn handle_badge_data(state: &AppState, payload: BadgeDataPayload) {
	let Ok(channel) = ChannelName::new(&payload.channel_name) else {
		return;
	};

	info!(
		channel = %channel,
		badges = payload.subscriber_badges.len(),
		"received client badge data"
	);
	state.services.badges.cache_badges_from_client(&channel, &payload.subscriber_badges);

	let mut hints = ChannelIds::default();
	if let Some(info) = &payload.channel_info
		&& let Some(chatroom_id) = plausible_hint(&info.chatroom.id)
	{
		hints.chatroom_id = Some(chatroom_id);
	}
	if let Some(first) = payload.subscriber_badges.first()
		&& let Some(raw) = &first.channel_id
		&& let Some(channel_id) = plausible_hint(&json_value_to_plain(raw))
	{
		hints.channel_id = Some(channel_id);
	}

	if !hints.is_empty() {
		state.services.identifier_cache.store_hint(&channel, &hints);
	}

	let ids = state.services.identifier_cache.get(&channel);
	if ids.is_complete() {
		state
			.manager
			.subscribe_upstream(
				channel,
				SubscribeRequest {
					ids,
					source: IdentifierSource::Confirmed,
				},
			)
			.await;
	}
}

/// A usable identifier hint is plain digits; placeholders are not hints.
fn plausible_hint(value: &str) -> Option<String> {
	let value = value.trim();
	if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
		return None;
	}
	Some(value.to_string())
}

fn json_value_to_plain(value: &serde_json::Value) -> String {
	match value {
		serde_json::Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}

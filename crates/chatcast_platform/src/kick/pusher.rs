#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context as _;
use chatcast_domain::{ChannelIds, ChannelName, IdentifierSource};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::assets::builtin_badge_image;
use crate::{
	Badge, ChannelInfo, ChatUser, ConnectionEvent, ConnectionEventTx, ConnectionState, Emote, KickBadge,
	NormalizedChatMessage, UserIdentity, new_message_id,
};

/// Static Pusher application key used by Kick's web client.
pub const PUSHER_APP_KEY: &str = "32cbd69e4b950bf97679";
/// Pusher cluster Kick runs on.
pub const PUSHER_CLUSTER: &str = "us2";

const DEFAULT_INACTIVITY_WINDOW: Duration = Duration::from_secs(120);
const CONTROL_CHANNEL_CAPACITY: usize = 16;

/// Inbound event names that carry a chat message. The broker's actual
/// message event is `App\Events\ChatMessageEvent`; the close variants are
/// kept because the topic contract is undocumented. Matched case-exactly.
const CHAT_EVENT_NAMES: &[&str] = &[
	"App\\Events\\ChatMessageEvent",
	"ChatMessageEvent",
	"chat_message",
	"message",
	"chatroom_message",
	"App\\Events\\ChatMessage",
	"App\\Events\\MessageEvent",
];

/// The chat-bearing event name set (case-exact).
pub fn chat_event_names() -> &'static [&'static str] {
	CHAT_EVENT_NAMES
}

/// Broker connect URL for a cluster/app-key pair.
pub fn pusher_ws_url(cluster: &str, app_key: &str) -> String {
	format!("wss://ws-{cluster}.pusher.com/app/{app_key}?protocol=7&client=js&version=4.3.1&flash=false")
}

/// Topic names derived from a complete identifier pair.
///
/// All six are subscribed because the message-carrying topic is not
/// contractually documented; this exact set must be preserved.
pub fn derive_topics(ids: &ChannelIds) -> Option<[String; 6]> {
	let chatroom_id = ids.chatroom_id.as_deref()?;
	let channel_id = ids.channel_id.as_deref()?;
	Some([
		format!("chatroom_{chatroom_id}"),
		format!("chatrooms.{chatroom_id}.v2"),
		format!("chatrooms.{chatroom_id}"),
		format!("channel_{channel_id}"),
		format!("channel.{channel_id}"),
		format!("predictions-channel-{channel_id}"),
	])
}

/// Upstream connection settings.
#[derive(Debug, Clone)]
pub struct PusherConfig {
	/// Full broker URL; override for tests against a local listener.
	pub ws_url: String,

	/// Window with no identifiers and no messages before the connection
	/// self-reports inactivity.
	pub inactivity_window: Duration,
}

impl Default for PusherConfig {
	fn default() -> Self {
		Self {
			ws_url: pusher_ws_url(PUSHER_CLUSTER, PUSHER_APP_KEY),
			inactivity_window: DEFAULT_INACTIVITY_WINDOW,
		}
	}
}

/// Request to enter the `Subscribing` state with a resolved identifier pair.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
	pub ids: ChannelIds,
	pub source: IdentifierSource,
}

#[derive(Debug)]
enum ConnectionControl {
	Subscribe(SubscribeRequest),
	Shutdown,
}

/// Handle to one live upstream connection for one channel.
///
/// Owns the control half; the socket and state machine run in a spawned task
/// that emits `ConnectionEvent`s until shutdown or socket failure. Does not
/// reconnect: the connection manager constructs a fresh instance on demand.
#[derive(Debug)]
pub struct UpstreamConnection {
	channel: ChannelName,
	control_tx: mpsc::Sender<ConnectionControl>,
}

impl UpstreamConnection {
	/// Open the socket and start the connection task.
	///
	/// Fails fast when the broker is unreachable so the caller never retains
	/// a half-built entry. The optimistic `ChannelConnected` event fires once
	/// the broker acknowledges the connection.
	pub async fn connect(channel: ChannelName, cfg: PusherConfig, events_tx: ConnectionEventTx) -> anyhow::Result<Self> {
		let (ws, _) = tokio_tungstenite::connect_async(cfg.ws_url.as_str())
			.await
			.with_context(|| format!("pusher connect for channel {channel}"))?;

		info!(channel = %channel, url = %cfg.ws_url, "pusher socket opened");
		metrics::counter!("chatcast_pusher_connects_total").increment(1);

		let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
		tokio::spawn(run_connection(channel.clone(), cfg, ws, control_rx, events_tx));

		Ok(Self { channel, control_tx })
	}

	pub fn channel(&self) -> &ChannelName {
		&self.channel
	}

	/// Trigger the `Subscribing` transition with a resolved identifier pair.
	/// Event-driven only; there is no timer that forces this.
	pub async fn subscribe(&self, request: SubscribeRequest) {
		let _ = self.control_tx.send(ConnectionControl::Subscribe(request)).await;
	}

	/// Tear the connection down. Idempotent; observable downstream only as
	/// the absence of further events.
	pub fn shutdown(&self) {
		let _ = self.control_tx.try_send(ConnectionControl::Shutdown);
	}
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn run_connection(
	channel: ChannelName,
	cfg: PusherConfig,
	mut ws: WsStream,
	mut control_rx: mpsc::Receiver<ConnectionControl>,
	events_tx: ConnectionEventTx,
) {
	let mut state = ConnectionState::SocketOpening;
	let mut pending_subscribe: Option<SubscribeRequest> = None;

	let inactivity = tokio::time::sleep(cfg.inactivity_window);
	tokio::pin!(inactivity);
	let mut inactivity_armed = true;

	loop {
		tokio::select! {
			cmd = control_rx.recv() => {
				match cmd {
					None | Some(ConnectionControl::Shutdown) => {
						debug!(channel = %channel, "pusher connection shutting down");
						let _ = ws.close(None).await;
						break;
					}
					Some(ConnectionControl::Subscribe(request)) => {
						if !request.ids.is_complete() {
							warn!(channel = %channel, "subscribe request with incomplete identifiers; ignoring");
							continue;
						}
						match state {
							ConnectionState::SocketOpening => {
								// Broker has not acknowledged yet; apply on establish.
								pending_subscribe = Some(request);
							}
							ConnectionState::SocketOpen => {
								if send_subscribes(&channel, &mut ws, &request).await {
									state = ConnectionState::Subscribing;
									inactivity_armed = false;
								}
							}
							other => {
								debug!(channel = %channel, state = ?other, "subscribe request in non-subscribable state; ignoring");
							}
						}
					}
				}
			}

			msg = ws.next() => {
				let Some(msg) = msg else {
					warn!(channel = %channel, "pusher socket stream ended");
					let _ = events_tx.send(ConnectionEvent::Error(format!("upstream socket closed for {channel}"))).await;
					state = ConnectionState::Disconnected;
					break;
				};

				match msg {
					Ok(Message::Text(text)) => {
						let Ok(envelope) = serde_json::from_str::<PusherEnvelope>(&text) else {
							debug!(channel = %channel, "unparseable pusher frame; ignoring");
							continue;
						};

						match envelope.event.as_str() {
							"pusher:connection_established" => {
								if state == ConnectionState::SocketOpening {
									state = ConnectionState::SocketOpen;
									info!(channel = %channel, "pusher connection established");
									// Two-phase announcement: optimistic connect with
									// placeholder identifiers, authoritative subscribe later.
									if events_tx
										.send(ConnectionEvent::ChannelConnected(ChannelInfo::placeholder(&channel)))
										.await
										.is_err()
									{
										break;
									}
									if let Some(request) = pending_subscribe.take()
										&& send_subscribes(&channel, &mut ws, &request).await
									{
										state = ConnectionState::Subscribing;
										inactivity_armed = false;
									}
								}
							}
							"pusher_internal:subscription_succeeded" | "pusher:subscription_succeeded" => {
								if state == ConnectionState::Subscribing {
									state = ConnectionState::Subscribed;
									info!(
										channel = %channel,
										topic = envelope.channel.as_deref().unwrap_or(""),
										"pusher subscription acknowledged; channel live"
									);
									metrics::counter!("chatcast_pusher_subscribed_total").increment(1);
								}
							}
							"pusher:subscription_error" => {
								warn!(
									channel = %channel,
									topic = envelope.channel.as_deref().unwrap_or(""),
									"pusher subscription rejected"
								);
								metrics::counter!("chatcast_pusher_subscription_errors_total").increment(1);
							}
							"pusher:ping" => {
								let pong = r#"{"event":"pusher:pong","data":{}}"#;
								if let Err(err) = ws.send(Message::Text(pong.into())).await {
									warn!(channel = %channel, error = %err, "pusher pong send failed");
								}
							}
							event if CHAT_EVENT_NAMES.contains(&event) => {
								match decode_chat_event(&envelope) {
									Ok(message) => {
										inactivity_armed = false;
										metrics::counter!("chatcast_pusher_messages_total").increment(1);
										if events_tx.send(ConnectionEvent::Message(Box::new(message))).await.is_err() {
											break;
										}
									}
									Err(err) => {
										warn!(channel = %channel, error = %err, "chat event decode failed");
									}
								}
							}
							other => {
								// Diagnostics only; unknown frames never alter the state machine.
								debug!(channel = %channel, event = other, "ignoring pusher frame");
							}
						}
					}
					Ok(Message::Close(frame)) => {
						debug!(channel = %channel, ?frame, "pusher socket closed by broker");
						let _ = events_tx.send(ConnectionEvent::Error(format!("upstream socket closed for {channel}"))).await;
						state = ConnectionState::Disconnected;
						break;
					}
					Ok(_) => {}
					Err(err) => {
						warn!(channel = %channel, error = %err, "pusher socket error");
						let _ = events_tx.send(ConnectionEvent::Error(format!("upstream socket error for {channel}: {err}"))).await;
						state = ConnectionState::Disconnected;
						break;
					}
				}
			}

			_ = &mut inactivity, if inactivity_armed => {
				inactivity_armed = false;
				warn!(channel = %channel, window = ?cfg.inactivity_window, "no identifiers or messages within window; reporting inactive");
				metrics::counter!("chatcast_pusher_inactive_total").increment(1);
				if events_tx.send(ConnectionEvent::Inactive).await.is_err() {
					break;
				}
			}
		}
	}

	debug!(channel = %channel, state = ?state, "pusher connection task exited");
}

/// Send one subscribe frame per derived topic. Returns false when the ids
/// turn out incomplete (caller must not transition).
async fn send_subscribes(channel: &ChannelName, ws: &mut WsStream, request: &SubscribeRequest) -> bool {
	let Some(topics) = derive_topics(&request.ids) else {
		return false;
	};

	if !request.source.is_confirmed() {
		warn!(channel = %channel, "subscribing with fallback identifiers (degraded path)");
		metrics::counter!("chatcast_pusher_degraded_subscribes_total").increment(1);
	}

	for topic in &topics {
		let frame = serde_json::json!({
			"event": "pusher:subscribe",
			"data": { "channel": topic },
		});
		debug!(channel = %channel, topic = %topic, "sending pusher subscribe");
		if let Err(err) = ws.send(Message::Text(frame.to_string().into())).await {
			warn!(channel = %channel, topic = %topic, error = %err, "subscribe send failed");
			return false;
		}
	}

	metrics::counter!("chatcast_pusher_subscribe_requests_total").increment(topics.len() as u64);
	true
}

#[derive(Debug, Deserialize)]
struct PusherEnvelope {
	event: String,
	#[serde(default)]
	channel: Option<String>,
	#[serde(default)]
	data: Option<serde_json::Value>,
}

impl PusherEnvelope {
	/// The `data` field arrives as a JSON-encoded string; tolerate an inline
	/// object as well.
	fn data_value(&self) -> anyhow::Result<serde_json::Value> {
		match &self.data {
			Some(serde_json::Value::String(inner)) => {
				serde_json::from_str(inner).context("parse envelope data string")
			}
			Some(other) => Ok(other.clone()),
			None => Err(anyhow::anyhow!("envelope has no data")),
		}
	}
}

#[derive(Debug, Deserialize)]
struct KickChatEvent {
	sender: KickChatSender,
	content: String,
	#[serde(default)]
	created_at: Option<String>,
	#[serde(default)]
	emotes: Vec<KickChatEmote>,
}

#[derive(Debug, Deserialize)]
struct KickChatSender {
	id: serde_json::Value,
	username: String,
	#[serde(default)]
	identity: Option<KickChatIdentity>,
}

#[derive(Debug, Deserialize)]
struct KickChatIdentity {
	#[serde(default)]
	color: Option<String>,
	#[serde(default)]
	badges: Vec<KickBadge>,
}

#[derive(Debug, Deserialize)]
struct KickChatEmote {
	id: serde_json::Value,
	name: String,
	#[serde(default)]
	source: Option<String>,
	#[serde(default)]
	position: Option<u32>,
}

fn json_id_to_string(value: &serde_json::Value) -> String {
	match value {
		serde_json::Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}

fn decode_chat_event(envelope: &PusherEnvelope) -> anyhow::Result<NormalizedChatMessage> {
	let data = envelope.data_value()?;
	let event: KickChatEvent = serde_json::from_value(data).context("decode kick chat event")?;
	Ok(normalize_chat_event(event))
}

fn normalize_chat_event(event: KickChatEvent) -> NormalizedChatMessage {
	let identity = event.identity_or_default();

	let badges: Vec<Badge> = identity
		.badges
		.iter()
		.map(|badge| Badge {
			kind: badge.kind.clone(),
			image: builtin_badge_image(&badge.kind),
			alt: if badge.text.is_empty() {
				badge.kind.clone()
			} else {
				badge.text.clone()
			},
			is_custom: false,
			count: badge.count,
		})
		.collect();

	let emotes: Vec<Emote> = event
		.emotes
		.iter()
		.map(|emote| Emote {
			id: json_id_to_string(&emote.id),
			name: emote.name.clone(),
			source: emote.source.clone().unwrap_or_default(),
			kind: "kick".to_string(),
			position: emote.position,
		})
		.collect();

	let timestamp = event
		.created_at
		.as_deref()
		.and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
		.map(|dt| dt.with_timezone(&Utc))
		.unwrap_or_else(Utc::now);

	let user = ChatUser {
		id: json_id_to_string(&event.sender.id),
		username: event.sender.username.clone(),
		identity,
		cosmetics: None,
	};

	NormalizedChatMessage {
		id: new_message_id(),
		username: event.sender.username,
		content: event.content,
		timestamp,
		badges,
		emotes,
		user,
	}
}

impl KickChatEvent {
	fn identity_or_default(&self) -> UserIdentity {
		match &self.sender.identity {
			Some(identity) => UserIdentity {
				color: identity.color.clone(),
				badges: identity.badges.clone(),
			},
			None => UserIdentity::default(),
		}
	}
}

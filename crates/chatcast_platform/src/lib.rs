#![forbid(unsafe_code)]

pub mod assets;
pub mod discovery;
pub mod http;
pub mod kick;

use chatcast_domain::{ChannelName, IdentifierSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Lifecycle/message events emitted by an upstream connection.
///
/// A single typed stream replaces per-callback registration: the consumer
/// owns the receiving half and teardown is dropping it.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
	/// A decoded, not-yet-enriched chat message.
	Message(Box<NormalizedChatMessage>),

	/// Transport established; `ChannelInfo` may carry placeholder ids until
	/// the authoritative subscribe happens.
	ChannelConnected(ChannelInfo),

	/// Socket-level or subscribe failure, terminal for this connection.
	Error(String),

	/// No identifiers and no traffic within the waiting window; the
	/// connection is eligible for reclamation.
	Inactive,
}

pub type ConnectionEventTx = mpsc::Sender<ConnectionEvent>;
pub type ConnectionEventRx = mpsc::Receiver<ConnectionEvent>;

/// Upstream connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	SocketOpening,
	/// Transport is up, waiting for an identifier pair.
	SocketOpen,
	Subscribing,
	Subscribed,
}

/// One chat event, normalized and ready for enrichment/broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedChatMessage {
	pub id: String,
	pub username: String,
	pub content: String,
	pub timestamp: DateTime<Utc>,
	pub badges: Vec<Badge>,
	pub emotes: Vec<Emote>,
	pub user: ChatUser,
}

/// Message author with raw platform identity and optional cosmetics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatUser {
	pub id: String,
	pub username: String,
	pub identity: UserIdentity,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cosmetics: Option<SevenTvCosmetics>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserIdentity {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub color: Option<String>,
	#[serde(default)]
	pub badges: Vec<KickBadge>,
}

/// Raw badge as carried on a Kick chat event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KickBadge {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub text: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub count: Option<u32>,
}

/// Resolved badge ready for rendering.
///
/// `image` is a URL, inline SVG markup, or an emoji fallback; the overlay
/// decides how to render each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
	#[serde(rename = "type")]
	pub kind: String,
	pub image: String,
	pub alt: String,
	#[serde(rename = "isCustom")]
	pub is_custom: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub count: Option<u32>,
}

/// Emote reference attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Emote {
	pub id: String,
	pub name: String,
	#[serde(default)]
	pub source: String,
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub position: Option<u32>,
}

/// Scope of a catalog emote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmoteScope {
	Global,
	Channel,
}

/// Catalog entry for a loaded 7TV emote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SevenTvEmote {
	pub name: String,
	pub url: String,
	#[serde(rename = "type")]
	pub scope: EmoteScope,
	pub animated: bool,
}

/// Per-user 7TV cosmetic metadata (paint, roles).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SevenTvCosmetics {
	#[serde(default)]
	pub id: String,
	#[serde(default)]
	pub username: String,
	#[serde(default)]
	pub style: SevenTvStyle,
	#[serde(default)]
	pub roles: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub paint: Option<SevenTvPaint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SevenTvStyle {
	#[serde(default)]
	pub color: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub paint_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub badge_id: Option<String>,
}

/// Paint definition resolved via the 7TV GraphQL endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SevenTvPaint {
	pub id: String,
	pub name: String,
	#[serde(default)]
	pub function: String,
	#[serde(default)]
	pub color: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stops: Option<Vec<SevenTvPaintStop>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SevenTvPaintStop {
	pub at: f64,
	pub color: i64,
}

/// Channel metadata announced on `channelConnected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
	pub id: String,
	pub slug: String,
	pub username: String,
	pub chatroom: ChatroomRef,
	#[serde(default)]
	pub subscriber_badges: Vec<SubscriberBadgeInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatroomRef {
	pub id: String,
	pub channel_id: String,
}

/// Subscriber badge definition as served by the Kick channel endpoint and
/// relayed by clients through `badgeData`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberBadgeInfo {
	#[serde(default)]
	pub id: serde_json::Value,
	pub months: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub channel_id: Option<serde_json::Value>,
	pub badge_image: BadgeImage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadgeImage {
	pub src: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub srcset: Option<String>,
}

impl ChannelInfo {
	/// Best-effort metadata for the optimistic connect announcement, before
	/// real identifiers resolve.
	pub fn placeholder(channel: &ChannelName) -> Self {
		Self {
			id: "fallback".to_string(),
			slug: channel.as_str().to_string(),
			username: channel.as_str().to_string(),
			chatroom: ChatroomRef {
				id: "unknown".to_string(),
				channel_id: "unknown".to_string(),
			},
			subscriber_badges: Vec::new(),
		}
	}

	/// Source tag for the identifiers carried by this info.
	pub fn identifier_source(&self) -> IdentifierSource {
		if self.chatroom.id == "unknown" || self.chatroom.id.starts_with("fallback") {
			IdentifierSource::Fallback
		} else {
			IdentifierSource::Confirmed
		}
	}
}

/// Generate an opaque message id.
pub fn new_message_id() -> String {
	Uuid::new_v4().to_string()
}

/// Build a bounded connection event channel pair.
pub fn connection_event_channel(capacity: usize) -> (ConnectionEventTx, ConnectionEventRx) {
	mpsc::channel(capacity)
}

#![forbid(unsafe_code)]

use chatcast_platform::{ChannelInfo, NormalizedChatMessage, SevenTvEmote, SubscriberBadgeInfo};
use serde::{Deserialize, Serialize};

/// Client → server gateway frames.
///
/// Wire shape: `{"type": "<event>", "data": <payload>}` with the event names
/// the overlay clients already speak.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
	/// Bind this session to a channel (leaving any previous one).
	JoinChannel(String),

	/// Unbind from the current channel.
	LeaveChannel,

	/// Badge/identifier data harvested client-side, fed back into the badge
	/// cache and the identifier-hint path.
	BadgeData(BadgeDataPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadgeDataPayload {
	#[serde(rename = "channelName")]
	pub channel_name: String,

	#[serde(default)]
	pub subscriber_badges: Vec<SubscriberBadgeInfo>,

	#[serde(rename = "channelInfo", default, skip_serializing_if = "Option::is_none")]
	pub channel_info: Option<ChannelInfo>,
}

/// Server → client gateway frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
	ChatMessage(NormalizedChatMessage),
	ChannelConnected(ChannelInfo),
	ConnectionError(String),
	EmotesLoaded(Vec<SevenTvEmote>),
}

impl ServerMessage {
	pub fn to_ws_text(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string(self)
	}
}

impl ClientMessage {
	pub fn from_ws_text(text: &str) -> Result<Self, serde_json::Error> {
		serde_json::from_str(text)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn join_channel_frame_round_trips() {
		let frame = ClientMessage::from_ws_text(r#"{"type":"joinChannel","data":"FooBar"}"#).unwrap();
		assert!(matches!(frame, ClientMessage::JoinChannel(ref name) if name == "FooBar"));
	}

	#[test]
	fn leave_channel_frame_has_no_payload() {
		let frame = ClientMessage::from_ws_text(r#"{"type":"leaveChannel"}"#).unwrap();
		assert!(matches!(frame, ClientMessage::LeaveChannel));
	}

	#[test]
	fn badge_data_frame_decodes_client_shape() {
		let text = r#"{
			"type": "badgeData",
			"data": {
				"channelName": "foobar",
				"subscriber_badges": [
					{"id": 1, "channel_id": 4121749, "months": 6, "badge_image": {"src": "https://files.kick.com/b/6"}}
				],
				"channelInfo": {
					"id": "4121749",
					"slug": "foobar",
					"username": "FooBar",
					"chatroom": {"id": "4110233", "channel_id": "4121749"},
					"subscriber_badges": []
				}
			}
		}"#;
		let frame = ClientMessage::from_ws_text(text).unwrap();
		let ClientMessage::BadgeData(payload) = frame else {
			panic!("expected badgeData frame");
		};
		assert_eq!(payload.channel_name, "foobar");
		assert_eq!(payload.subscriber_badges[0].months, 6);
		assert_eq!(payload.channel_info.unwrap().chatroom.id, "4110233");
	}

	#[test]
	fn server_frames_carry_event_names() {
		let text = ServerMessage::ConnectionError("boom".to_string()).to_ws_text().unwrap();
		let value: serde_json::Value = serde_json::from_str(&text).unwrap();
		assert_eq!(value["type"], "connectionError");
		assert_eq!(value["data"], "boom");
	}
}

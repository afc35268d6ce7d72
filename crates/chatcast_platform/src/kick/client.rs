#![forbid(unsafe_code)]

use chatcast_domain::ChannelName;
use serde::Deserialize;
use tracing::debug;

use crate::http::{FetchError, HttpClient};

const KICK_API_BASE: &str = "https://kick.com/api/v2";
const KICK_SITE_BASE: &str = "https://kick.com";

/// Read-only Kick metadata client.
///
/// Covers the channel-info and chatroom-info endpoints plus the public
/// channel page used by the scraping fallback. These endpoints sit behind
/// anti-bot protection, so 403s are an expected outcome, not a bug.
#[derive(Debug, Clone)]
pub struct KickMetadataClient {
	base_url: String,
	site_url: String,
	http: HttpClient,
}

impl KickMetadataClient {
	pub fn new(http: HttpClient) -> Self {
		Self {
			base_url: KICK_API_BASE.to_string(),
			site_url: KICK_SITE_BASE.to_string(),
			http,
		}
	}

	/// Override endpoints, for tests against a local server.
	pub fn with_base_urls(http: HttpClient, base_url: impl Into<String>, site_url: impl Into<String>) -> Self {
		Self {
			base_url: base_url.into(),
			site_url: site_url.into(),
			http,
		}
	}

	/// `GET /api/v2/channels/{slug}`: channel id, user id, chatroom ref and
	/// the subscriber badge set.
	pub async fn channel_info(&self, channel: &ChannelName) -> Result<KickChannelResponse, FetchError> {
		let url = format!("{}/channels/{}", self.base_url, urlencoding::encode(channel.as_str()));
		let resp: KickChannelResponse = self.http.get_json(&url).await?;
		debug!(channel = %channel, id = resp.id, "kick channel info fetched");
		Ok(resp)
	}

	/// `GET /api/v2/channels/{slug}/chatroom`: the chatroom id alone.
	pub async fn chatroom_info(&self, channel: &ChannelName) -> Result<KickChatroomResponse, FetchError> {
		let url = format!(
			"{}/channels/{}/chatroom",
			self.base_url,
			urlencoding::encode(channel.as_str())
		);
		self.http.get_json(&url).await
	}

	/// `GET /{slug}`: the public channel page HTML, input to the scraping
	/// matchers.
	pub async fn channel_page(&self, channel: &ChannelName) -> Result<String, FetchError> {
		let url = format!("{}/{}", self.site_url, urlencoding::encode(channel.as_str()));
		self.http.get_text(&url).await
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct KickChannelResponse {
	pub id: u64,
	#[serde(default)]
	pub user_id: Option<u64>,
	#[serde(default)]
	pub slug: Option<String>,
	#[serde(default)]
	pub user: Option<KickUserRef>,
	#[serde(default)]
	pub chatroom: Option<KickChatroomRef>,
	#[serde(default)]
	pub subscriber_badges: Vec<crate::SubscriberBadgeInfo>,
}

impl KickChannelResponse {
	/// The Kick user id for the broadcaster, wherever the response carries it.
	pub fn resolved_user_id(&self) -> Option<u64> {
		self.user_id.or_else(|| self.user.as_ref().map(|u| u.id))
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct KickUserRef {
	pub id: u64,
	#[serde(default)]
	pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KickChatroomRef {
	pub id: u64,
	#[serde(default)]
	pub channel_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KickChatroomResponse {
	pub id: u64,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn channel_response_parses_nested_user_id() {
		let body = r#"{
			"id": 4121749,
			"slug": "foobar",
			"user": {"id": 4128577, "username": "FooBar"},
			"chatroom": {"id": 4110233, "channel_id": 4121749},
			"subscriber_badges": [
				{"id": 1, "channel_id": 4121749, "months": 6, "badge_image": {"src": "https://files.kick.com/badge/6.png"}}
			]
		}"#;
		let resp: KickChannelResponse = serde_json::from_str(body).unwrap();
		assert_eq!(resp.resolved_user_id(), Some(4128577));
		assert_eq!(resp.chatroom.as_ref().unwrap().id, 4110233);
		assert_eq!(resp.subscriber_badges[0].months, 6);
	}

	#[test]
	fn channel_response_prefers_top_level_user_id() {
		let body = r#"{"id": 1, "user_id": 99, "user": {"id": 7}}"#;
		let resp: KickChannelResponse = serde_json::from_str(body).unwrap();
		assert_eq!(resp.resolved_user_id(), Some(99));
	}
}

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use chatcast_domain::ChannelName;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::http::{FetchError, HttpClient};
use crate::kick::KickMetadataClient;
use crate::{EmoteScope, SevenTvEmote};

const SEVENTV_API_BASE: &str = "https://7tv.io/v3";

/// Global + per-channel 7TV emote sets with name-based text substitution.
///
/// The global set loads once per process lifetime; channel sets load once per
/// channel and stay cached until explicitly cleared.
pub struct EmoteCatalog {
	http: HttpClient,
	kick: KickMetadataClient,
	seventv_base: String,
	global: Mutex<Option<Vec<SevenTvEmote>>>,
	channels: Mutex<HashMap<ChannelName, Vec<SevenTvEmote>>>,
	kick_user_ids: Mutex<HashMap<ChannelName, String>>,
}

impl EmoteCatalog {
	pub fn new(http: HttpClient, kick: KickMetadataClient) -> Self {
		Self::with_base_url(http, kick, SEVENTV_API_BASE)
	}

	/// Override the 7TV endpoint, for tests against a local server.
	pub fn with_base_url(http: HttpClient, kick: KickMetadataClient, seventv_base: impl Into<String>) -> Self {
		Self {
			http,
			kick,
			seventv_base: seventv_base.into(),
			global: Mutex::new(None),
			channels: Mutex::new(HashMap::new()),
			kick_user_ids: Mutex::new(HashMap::new()),
		}
	}

	/// Load (or serve cached) global + channel emotes for a channel, in the
	/// order used for substitution: channel entries shadow global ones.
	pub async fn load_channel_emotes(&self, channel: &ChannelName) -> Vec<SevenTvEmote> {
		self.ensure_global_loaded().await;
		self.ensure_channel_loaded(channel).await;
		let combined = self.all_for_channel(channel);
		info!(channel = %channel, count = combined.len(), "emote catalog ready");
		combined
	}

	/// Cached view, channel entries first. Empty until loads happen.
	pub fn all_for_channel(&self, channel: &ChannelName) -> Vec<SevenTvEmote> {
		let mut combined = self.channels.lock().get(channel).cloned().unwrap_or_default();
		if let Some(global) = self.global.lock().as_ref() {
			combined.extend(global.iter().cloned());
		}
		combined
	}

	/// Rewrite message text: the inline Kick pass first, then name-based
	/// catalog substitution.
	pub fn rewrite_content(&self, channel: &ChannelName, content: &str) -> String {
		let content = rewrite_inline_kick_emotes(content);
		let catalog = self.all_for_channel(channel);
		substitute_catalog_emotes(&content, &catalog)
	}

	pub fn clear_channel(&self, channel: &ChannelName) {
		self.channels.lock().remove(channel);
		self.kick_user_ids.lock().remove(channel);
	}

	pub fn clear_all(&self) {
		*self.global.lock() = None;
		self.channels.lock().clear();
		self.kick_user_ids.lock().clear();
	}

	async fn ensure_global_loaded(&self) {
		if self.global.lock().is_some() {
			return;
		}

		let url = format!("{}/emote-sets/global", self.seventv_base);
		match self.http.get_json::<SevenTvEmoteSetBody>(&url).await {
			Ok(body) => {
				let emotes: Vec<SevenTvEmote> = body
					.emotes
					.into_iter()
					.map(|e| raw_emote_to_catalog(e, EmoteScope::Global))
					.collect();
				info!(count = emotes.len(), "loaded global 7tv emotes");
				metrics::counter!("chatcast_emote_global_loads_total").increment(1);
				*self.global.lock() = Some(emotes);
			}
			Err(err) => {
				// Missed cache population; next demand retries.
				debug!(error = %err, "global 7tv emote load failed");
			}
		}
	}

	async fn ensure_channel_loaded(&self, channel: &ChannelName) {
		if self.channels.lock().contains_key(channel) {
			return;
		}

		let Some(user_id) = self.kick_user_id(channel).await else {
			debug!(channel = %channel, "no kick user id; skipping channel emote load");
			return;
		};

		let url = format!("{}/users/kick/{}", self.seventv_base, user_id);
		match self.http.get_json::<SevenTvUserBody>(&url).await {
			Ok(body) => {
				let emotes: Vec<SevenTvEmote> = body
					.emote_set
					.map(|set| {
						set.emotes
							.into_iter()
							.map(|e| raw_emote_to_catalog(e, EmoteScope::Channel))
							.collect()
					})
					.unwrap_or_default();
				info!(channel = %channel, count = emotes.len(), "loaded channel 7tv emotes");
				metrics::counter!("chatcast_emote_channel_loads_total").increment(1);
				self.channels.lock().insert(channel.clone(), emotes);
			}
			Err(FetchError::NotFound) => {
				// Confirmed: channel is not linked to 7TV.
				debug!(channel = %channel, "channel not linked to 7tv");
				self.channels.lock().insert(channel.clone(), Vec::new());
			}
			Err(err) => {
				debug!(channel = %channel, error = %err, "channel 7tv emote load failed");
			}
		}
	}

	async fn kick_user_id(&self, channel: &ChannelName) -> Option<String> {
		if let Some(cached) = self.kick_user_ids.lock().get(channel) {
			return Some(cached.clone());
		}

		match self.kick.channel_info(channel).await {
			Ok(info) => {
				let user_id = info.resolved_user_id()?.to_string();
				self.kick_user_ids.lock().insert(channel.clone(), user_id.clone());
				Some(user_id)
			}
			Err(err) => {
				debug!(channel = %channel, error = %err, "kick user id lookup failed");
				None
			}
		}
	}
}

/// Replace Kick's inline `[emote:<id>:<name>]` syntax unconditionally,
/// regardless of catalog contents. Malformed references stay literal.
pub fn rewrite_inline_kick_emotes(content: &str) -> String {
	const OPEN: &str = "[emote:";

	let mut out = String::with_capacity(content.len());
	let mut rest = content;

	while let Some(start) = rest.find(OPEN) {
		out.push_str(&rest[..start]);
		let tail = &rest[start + OPEN.len()..];

		let id_end = tail.find(|c: char| !c.is_ascii_digit()).unwrap_or(tail.len());
		let parsed = if id_end > 0 && tail[id_end..].starts_with(':') {
			let name_part = &tail[id_end + 1..];
			let name_end = name_part
				.find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
				.unwrap_or(name_part.len());
			if name_end > 0 && name_part[name_end..].starts_with(']') {
				Some((&tail[..id_end], &name_part[..name_end], id_end + 1 + name_end + 1))
			} else {
				None
			}
		} else {
			None
		};

		match parsed {
			Some((id, name, consumed_after_open)) => {
				out.push_str(&format!(
					"<img src=\"https://files.kick.com/emotes/{id}/fullsize\" class=\"emote kick-emote\" alt=\"{name}\" title=\"{name}\" loading=\"lazy\">"
				));
				rest = &rest[start + OPEN.len() + consumed_after_open..];
			}
			None => {
				out.push_str(OPEN);
				rest = &rest[start + OPEN.len()..];
			}
		}
	}

	out.push_str(rest);
	out
}

/// Word-boundary name substitution against the loaded catalog.
///
/// First match wins per emote name, so with channel entries ordered first a
/// channel emote shadows a same-named global one.
pub fn substitute_catalog_emotes(content: &str, emotes: &[SevenTvEmote]) -> String {
	let mut result = content.to_string();
	let mut seen: HashSet<&str> = HashSet::new();

	for emote in emotes {
		if emote.name.is_empty() || !seen.insert(emote.name.as_str()) {
			continue;
		}
		result = replace_whole_words(&result, &emote.name, &catalog_emote_html(emote));
	}

	result
}

fn catalog_emote_html(emote: &SevenTvEmote) -> String {
	let scope = match emote.scope {
		EmoteScope::Global => "global",
		EmoteScope::Channel => "channel",
	};
	let motion = if emote.animated { "animated" } else { "static" };
	format!(
		"<img src=\"{url}\" class=\"emote seventv-emote {scope}-emote {motion}\" alt=\"{name}\" title=\"{name} (7TV {scope})\" loading=\"lazy\">",
		url = emote.url,
		name = emote.name,
	)
}

fn is_word_char(c: char) -> bool {
	c.is_ascii_alphanumeric() || c == '_'
}

fn replace_whole_words(content: &str, word: &str, replacement: &str) -> String {
	let mut out = String::with_capacity(content.len());
	let mut rest = content;

	while let Some(at) = rest.find(word) {
		let before_ok = rest[..at].chars().next_back().map(|c| !is_word_char(c)).unwrap_or(true);
		let after = &rest[at + word.len()..];
		let after_ok = after.chars().next().map(|c| !is_word_char(c)).unwrap_or(true);

		out.push_str(&rest[..at]);
		if before_ok && after_ok {
			out.push_str(replacement);
		} else {
			out.push_str(word);
		}
		rest = after;
	}

	out.push_str(rest);
	out
}

fn raw_emote_to_catalog(raw: SevenTvRawEmote, scope: EmoteScope) -> SevenTvEmote {
	let animated = raw.data.animated;
	SevenTvEmote {
		name: raw.name,
		url: build_emote_url(&raw.data.host.url, animated),
		scope,
		animated,
	}
}

fn build_emote_url(host_url: &str, animated: bool) -> String {
	let suffix = if animated { "1x.gif" } else { "1x.webp" };
	format!("https:{host_url}/{suffix}")
}

#[derive(Debug, Deserialize)]
struct SevenTvEmoteSetBody {
	#[serde(default)]
	emotes: Vec<SevenTvRawEmote>,
}

#[derive(Debug, Deserialize)]
struct SevenTvRawEmote {
	name: String,
	data: SevenTvRawEmoteData,
}

#[derive(Debug, Deserialize)]
struct SevenTvRawEmoteData {
	#[serde(default)]
	animated: bool,
	host: SevenTvRawHost,
}

#[derive(Debug, Deserialize)]
struct SevenTvRawHost {
	url: String,
}

#[derive(Debug, Deserialize)]
struct SevenTvUserBody {
	#[serde(default)]
	emote_set: Option<SevenTvEmoteSetBody>,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn emote(name: &str, scope: EmoteScope) -> SevenTvEmote {
		SevenTvEmote {
			name: name.to_string(),
			url: format!("https://cdn.7tv.app/emote/{name}/1x.webp"),
			scope,
			animated: false,
		}
	}

	#[test]
	fn inline_kick_emote_is_rewritten_regardless_of_catalog() {
		let out = rewrite_inline_kick_emotes("hi [emote:555:PogChamp] there");
		assert_eq!(
			out,
			"hi <img src=\"https://files.kick.com/emotes/555/fullsize\" class=\"emote kick-emote\" alt=\"PogChamp\" title=\"PogChamp\" loading=\"lazy\"> there"
		);
	}

	#[test]
	fn malformed_inline_references_stay_literal() {
		assert_eq!(rewrite_inline_kick_emotes("[emote:]"), "[emote:]");
		assert_eq!(rewrite_inline_kick_emotes("[emote:abc:Name]"), "[emote:abc:Name]");
		assert_eq!(rewrite_inline_kick_emotes("[emote:12:Name"), "[emote:12:Name");
		assert_eq!(rewrite_inline_kick_emotes("no emotes here"), "no emotes here");
	}

	#[test]
	fn multiple_inline_emotes_all_rewrite() {
		let out = rewrite_inline_kick_emotes("[emote:1:Kappa][emote:2:Pog]");
		assert_eq!(out.matches("<img").count(), 2);
		assert!(out.contains("/emotes/1/fullsize"));
		assert!(out.contains("/emotes/2/fullsize"));
	}

	#[test]
	fn catalog_substitution_respects_word_boundaries() {
		let catalog = vec![emote("Kappa", EmoteScope::Global)];
		let out = substitute_catalog_emotes("Kappa KappaPride (Kappa)", &catalog);
		assert_eq!(out.matches("<img").count(), 2);
		assert!(out.contains("KappaPride"), "partial word must not be replaced");
	}

	#[test]
	fn channel_emotes_shadow_global_ones() {
		let catalog = vec![
			emote("Kappa", EmoteScope::Channel),
			emote("Kappa", EmoteScope::Global),
		];
		let out = substitute_catalog_emotes("Kappa", &catalog);
		assert!(out.contains("channel-emote"));
		assert!(!out.contains("global-emote"));
	}

	#[test]
	fn animated_emotes_get_gif_urls() {
		assert_eq!(build_emote_url("//cdn.7tv.app/emote/xyz", true), "https://cdn.7tv.app/emote/xyz/1x.gif");
		assert_eq!(build_emote_url("//cdn.7tv.app/emote/xyz", false), "https://cdn.7tv.app/emote/xyz/1x.webp");
	}

	#[test]
	fn seventv_payload_decodes() {
		let body = r#"{"emotes":[{"name":"Kappa","data":{"animated":true,"host":{"url":"//cdn.7tv.app/emote/abc"}}}]}"#;
		let set: SevenTvEmoteSetBody = serde_json::from_str(body).unwrap();
		let catalog: Vec<SevenTvEmote> = set
			.emotes
			.into_iter()
			.map(|e| raw_emote_to_catalog(e, EmoteScope::Global))
			.collect();
		assert_eq!(catalog[0].url, "https://cdn.7tv.app/emote/abc/1x.gif");
		assert!(catalog[0].animated);
	}
}

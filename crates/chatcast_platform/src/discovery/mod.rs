#![forbid(unsafe_code)]

//! Identifier discovery: the ordered fallback chain that recovers the
//! `(chatroom_id, channel_id)` pair a channel needs before the upstream
//! subscription can happen.

pub mod browser;
pub mod scrape;

use std::collections::HashMap;
use std::sync::Arc;

use chatcast_domain::{ChannelIds, ChannelName};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::http::FetchError;
use crate::kick::KickMetadataClient;

pub use browser::{BrowserProbe, BrowserSession};

/// Per-field provenance inside the cache.
///
/// Client-supplied hints win: they may come from a session with access to
/// endpoints the server is blocked from, so a resolved value never
/// overwrites a hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldOrigin {
	Hint,
	Resolved,
}

#[derive(Debug, Default)]
struct CacheEntry {
	chatroom_id: Option<(String, FieldOrigin)>,
	channel_id: Option<(String, FieldOrigin)>,
}

impl CacheEntry {
	fn ids(&self) -> ChannelIds {
		ChannelIds {
			chatroom_id: self.chatroom_id.as_ref().map(|(v, _)| v.clone()),
			channel_id: self.channel_id.as_ref().map(|(v, _)| v.clone()),
		}
	}
}

/// Process-lifetime cache of discovered identifiers, keyed by channel name.
///
/// Entries never expire: the mapping is effectively immutable per channel.
/// Partial results are stored as soon as a field is known.
#[derive(Debug, Default)]
pub struct IdentifierCache {
	inner: Mutex<HashMap<ChannelName, CacheEntry>>,
}

impl IdentifierCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, channel: &ChannelName) -> ChannelIds {
		let guard = self.inner.lock();
		guard.get(channel).map(CacheEntry::ids).unwrap_or_default()
	}

	/// Store client-supplied identifier hints. Hints overwrite previously
	/// resolved values for the same field.
	pub fn store_hint(&self, channel: &ChannelName, ids: &ChannelIds) {
		let mut guard = self.inner.lock();
		let entry = guard.entry(channel.clone()).or_default();
		if let Some(chatroom_id) = &ids.chatroom_id {
			entry.chatroom_id = Some((chatroom_id.clone(), FieldOrigin::Hint));
		}
		if let Some(channel_id) = &ids.channel_id {
			entry.channel_id = Some((channel_id.clone(), FieldOrigin::Hint));
		}
		if !ids.is_empty() {
			info!(channel = %channel, ?ids, "cached identifier hints");
		}
	}

	/// Store values discovered by the chain itself. Fills missing fields
	/// only; never overwrites a hint or an earlier resolution.
	pub fn store_resolved(&self, channel: &ChannelName, ids: &ChannelIds) {
		let mut guard = self.inner.lock();
		let entry = guard.entry(channel.clone()).or_default();
		if entry.chatroom_id.is_none()
			&& let Some(chatroom_id) = &ids.chatroom_id
		{
			entry.chatroom_id = Some((chatroom_id.clone(), FieldOrigin::Resolved));
		}
		if entry.channel_id.is_none()
			&& let Some(channel_id) = &ids.channel_id
		{
			entry.channel_id = Some((channel_id.clone(), FieldOrigin::Resolved));
		}
	}

	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().is_empty()
	}
}

/// The ordered discovery chain.
///
/// Strategies, each tried only if the previous yielded nothing for a field:
/// cache (which also holds client hints) → direct API lookup → page-content
/// scraping → headless-browser extraction. Every strategy fails silently and
/// falls through; exhaustion returns whatever partial result accumulated.
pub struct IdentifierDiscovery {
	cache: Arc<IdentifierCache>,
	kick: KickMetadataClient,
	browser: Arc<BrowserSession>,
}

impl IdentifierDiscovery {
	pub fn new(cache: Arc<IdentifierCache>, kick: KickMetadataClient, browser: Arc<BrowserSession>) -> Self {
		Self { cache, kick, browser }
	}

	pub fn cache(&self) -> &Arc<IdentifierCache> {
		&self.cache
	}

	/// Resolve as much of the identifier pair as possible. Fields are cached
	/// and published incrementally; an incomplete result is the explicit
	/// "not found" outcome.
	pub async fn resolve(&self, channel: &ChannelName) -> ChannelIds {
		let mut ids = self.cache.get(channel);
		if ids.is_complete() {
			return ids;
		}

		self.try_api_lookup(channel, &mut ids).await;
		if ids.is_complete() {
			return ids;
		}

		self.try_page_scrape(channel, &mut ids).await;
		if ids.is_complete() {
			return ids;
		}

		self.try_browser(channel, &mut ids).await;

		if !ids.is_complete() {
			warn!(channel = %channel, ?ids, "identifier discovery exhausted without a complete pair");
			metrics::counter!("chatcast_discovery_exhausted_total").increment(1);
		}
		ids
	}

	async fn try_api_lookup(&self, channel: &ChannelName, ids: &mut ChannelIds) {
		match self.kick.channel_info(channel).await {
			Ok(info) => {
				let found = ChannelIds {
					chatroom_id: info.chatroom.as_ref().map(|c| c.id.to_string()),
					channel_id: Some(info.id.to_string()),
				};
				self.publish(channel, ids, &found, "api:channel-info");
			}
			Err(err) => log_strategy_miss(channel, "api:channel-info", &err),
		}

		if ids.chatroom_id.is_some() {
			return;
		}

		match self.kick.chatroom_info(channel).await {
			Ok(chatroom) => {
				let found = ChannelIds::new(Some(chatroom.id.to_string()), None);
				self.publish(channel, ids, &found, "api:chatroom-info");
			}
			Err(err) => log_strategy_miss(channel, "api:chatroom-info", &err),
		}
	}

	async fn try_page_scrape(&self, channel: &ChannelName, ids: &mut ChannelIds) {
		let page = match self.kick.channel_page(channel).await {
			Ok(page) => page,
			Err(err) => {
				log_strategy_miss(channel, "scrape:page-fetch", &err);
				return;
			}
		};

		debug!(channel = %channel, bytes = page.len(), "scraping channel page");
		let found = ChannelIds {
			chatroom_id: if ids.chatroom_id.is_none() {
				scrape::extract_chatroom_id(&page)
			} else {
				None
			},
			channel_id: if ids.channel_id.is_none() {
				scrape::extract_channel_id(&page)
			} else {
				None
			},
		};
		self.publish(channel, ids, &found, "scrape:page");
	}

	async fn try_browser(&self, channel: &ChannelName, ids: &mut ChannelIds) {
		if ids.chatroom_id.is_some() || !self.browser.is_enabled() {
			return;
		}

		if let Some(chatroom_id) = self.browser.extract_chatroom_id(channel).await {
			let found = ChannelIds::new(Some(chatroom_id), None);
			self.publish(channel, ids, &found, "browser");
		}
	}

	fn publish(&self, channel: &ChannelName, ids: &mut ChannelIds, found: &ChannelIds, strategy: &str) {
		if found.is_empty() {
			return;
		}
		self.cache.store_resolved(channel, found);
		ids.merge_missing(found);
		info!(channel = %channel, strategy, ?found, "identifier discovery progress");
		metrics::counter!("chatcast_discovery_hits_total", "strategy" => strategy.to_string()).increment(1);
	}
}

fn log_strategy_miss(channel: &ChannelName, strategy: &str, err: &FetchError) {
	match err {
		FetchError::NotFound => debug!(channel = %channel, strategy, "lookup returned not-found"),
		FetchError::Blocked(status) => {
			debug!(channel = %channel, strategy, %status, "lookup blocked; falling through")
		}
		FetchError::Transient(detail) => {
			debug!(channel = %channel, strategy, detail = %detail, "lookup failed; falling through")
		}
	}
}

#[cfg(test)]
mod tests {
	use async_trait::async_trait;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::*;
	use crate::http::HttpClient;

	fn channel(name: &str) -> ChannelName {
		ChannelName::new(name).unwrap()
	}

	#[test]
	fn cache_publishes_partial_results() {
		let cache = IdentifierCache::new();
		let ch = channel("foobar");

		cache.store_resolved(&ch, &ChannelIds::new(Some("123".into()), None));
		assert_eq!(cache.get(&ch), ChannelIds::new(Some("123".into()), None));

		cache.store_resolved(&ch, &ChannelIds::new(None, Some("456".into())));
		assert!(cache.get(&ch).is_complete());
	}

	#[test]
	fn hints_overwrite_resolved_values_but_not_vice_versa() {
		let cache = IdentifierCache::new();
		let ch = channel("foobar");

		cache.store_resolved(&ch, &ChannelIds::new(Some("111".into()), None));
		cache.store_hint(&ch, &ChannelIds::new(Some("123".into()), None));
		assert_eq!(cache.get(&ch).chatroom_id.as_deref(), Some("123"));

		cache.store_resolved(&ch, &ChannelIds::new(Some("999".into()), None));
		assert_eq!(cache.get(&ch).chatroom_id.as_deref(), Some("123"));
	}

	#[test]
	fn cache_is_keyed_case_insensitively() {
		let cache = IdentifierCache::new();
		cache.store_hint(&channel("FooBar"), &ChannelIds::new(Some("123".into()), None));
		assert_eq!(cache.get(&channel("foobar")).chatroom_id.as_deref(), Some("123"));
	}

	struct FixedProbe(Option<String>);

	#[async_trait]
	impl BrowserProbe for FixedProbe {
		async fn initialize(&self) -> anyhow::Result<()> {
			Ok(())
		}
		async fn extract_chatroom_id(&self, _channel: &ChannelName) -> anyhow::Result<Option<String>> {
			Ok(self.0.clone())
		}
		async fn close(&self) {}
	}

	fn unreachable_kick() -> KickMetadataClient {
		// Nothing listens on the discard port; every fetch is transient.
		KickMetadataClient::with_base_urls(HttpClient::with_defaults(), "http://127.0.0.1:9", "http://127.0.0.1:9")
	}

	#[tokio::test]
	async fn cache_hit_short_circuits_everything() {
		let cache = Arc::new(IdentifierCache::new());
		let ch = channel("foobar");
		cache.store_hint(&ch, &ChannelIds::new(Some("123".into()), Some("456".into())));

		let discovery = IdentifierDiscovery::new(cache, unreachable_kick(), Arc::new(BrowserSession::disabled()));
		let ids = discovery.resolve(&ch).await;
		assert_eq!(ids, ChannelIds::new(Some("123".into()), Some("456".into())));
	}

	#[tokio::test]
	async fn browser_is_last_resort_when_api_and_scrape_fail() {
		let cache = Arc::new(IdentifierCache::new());
		let ch = channel("foobar");
		let browser = Arc::new(BrowserSession::new(std::sync::Arc::new(FixedProbe(Some("4110233".into())))));

		let discovery = IdentifierDiscovery::new(cache.clone(), unreachable_kick(), browser);
		let ids = discovery.resolve(&ch).await;
		assert_eq!(ids.chatroom_id.as_deref(), Some("4110233"));
		assert_eq!(ids.channel_id, None);
		// Partial result was published into the cache.
		assert_eq!(cache.get(&ch).chatroom_id.as_deref(), Some("4110233"));
	}

	#[tokio::test]
	async fn exhaustion_returns_explicit_incomplete_result() {
		let cache = Arc::new(IdentifierCache::new());
		let discovery = IdentifierDiscovery::new(cache, unreachable_kick(), Arc::new(BrowserSession::disabled()));
		let ids = discovery.resolve(&channel("foobar")).await;
		assert!(ids.is_empty());
	}

	/// One-shot HTTP responder for fetch-path tests.
	async fn serve_once(body: String, content_type: &'static str) -> std::net::SocketAddr {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let (mut stream, _) = listener.accept().await.unwrap();
			let mut buf = [0u8; 4096];
			let _ = stream.read(&mut buf).await;
			let response = format!(
				"HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
				content_type,
				body.len(),
				body
			);
			let _ = stream.write_all(response.as_bytes()).await;
		});
		addr
	}

	#[tokio::test]
	async fn scrape_strategy_extracts_ids_from_the_channel_page() {
		let page = r#"<html><script>window.__STATE__={"chatroom":{"id":4110233,"channel_id":4121749}};</script></html>"#;
		let site = serve_once(page.to_string(), "text/html").await;

		let kick = KickMetadataClient::with_base_urls(
			HttpClient::with_defaults(),
			// API base is dead, forcing the page-scrape strategy.
			"http://127.0.0.1:9".to_string(),
			format!("http://{site}"),
		);
		let cache = Arc::new(IdentifierCache::new());
		let discovery = IdentifierDiscovery::new(cache, kick, Arc::new(BrowserSession::disabled()));

		let ids = discovery.resolve(&channel("foobar")).await;
		assert_eq!(ids.chatroom_id.as_deref(), Some("4110233"));
		assert_eq!(ids.channel_id.as_deref(), Some("4121749"));
	}
}

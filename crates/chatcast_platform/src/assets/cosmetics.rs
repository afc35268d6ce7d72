#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chatcast_domain::ChannelName;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::http::{FetchError, HttpClient};
use crate::kick::KickMetadataClient;
use crate::{SevenTvCosmetics, SevenTvPaint, SevenTvStyle};

const SEVENTV_API_BASE: &str = "https://7tv.io/v3";

const PAINTS_QUERY: &str = "\
query GetPaints {
  cosmetics {
    paints {
      id
      name
      color
      function
      stops {
        at
        color
      }
    }
  }
}";

/// Per-user 7TV paint/role metadata with negative-result caching.
///
/// The cache has no TTL: an entry is "loaded or not" until explicitly
/// cleared, and a user confirmed absent from 7TV is cached as absent so
/// repeat messages never re-query.
pub struct CosmeticResolver {
	http: HttpClient,
	kick: KickMetadataClient,
	seventv_base: String,
	gql_url: String,
	enabled: AtomicBool,
	cache: Mutex<HashMap<String, Option<SevenTvCosmetics>>>,
}

impl CosmeticResolver {
	pub fn new(http: HttpClient, kick: KickMetadataClient) -> Self {
		Self::with_base_url(http, kick, SEVENTV_API_BASE)
	}

	/// Override the 7TV endpoint, for tests against a local server.
	pub fn with_base_url(http: HttpClient, kick: KickMetadataClient, seventv_base: impl Into<String>) -> Self {
		let seventv_base = seventv_base.into();
		Self {
			http,
			kick,
			gql_url: format!("{seventv_base}/gql"),
			seventv_base,
			enabled: AtomicBool::new(true),
			cache: Mutex::new(HashMap::new()),
		}
	}

	/// Feature flag: when disabled, every lookup short-circuits to `None`.
	pub fn set_enabled(&self, enabled: bool) {
		self.enabled.store(enabled, Ordering::Relaxed);
	}

	pub fn is_enabled(&self) -> bool {
		self.enabled.load(Ordering::Relaxed)
	}

	/// Best-effort cosmetics for a sender. Any failure yields `None`; only a
	/// confirmed 404 is cached as a negative outcome.
	pub async fn user_cosmetics(&self, username: &str) -> Option<SevenTvCosmetics> {
		if !self.is_enabled() {
			return None;
		}

		let key = username.to_lowercase();
		{
			let cache = self.cache.lock();
			if let Some(cached) = cache.get(&key) {
				return cached.clone();
			}
		}

		let channel = ChannelName::new(username).ok()?;
		let user_id = match self.kick.channel_info(&channel).await {
			Ok(info) => info.resolved_user_id()?.to_string(),
			Err(FetchError::Blocked(status)) => {
				debug!(username, %status, "kick user id lookup blocked; skipping 7tv lookup");
				return None;
			}
			Err(err) => {
				debug!(username, error = %err, "kick user id lookup failed");
				return None;
			}
		};

		let url = format!("{}/users/kick/{}", self.seventv_base, user_id);
		let mut cosmetics = match self.http.get_json::<SevenTvUserCosmeticsBody>(&url).await {
			Ok(body) => SevenTvCosmetics {
				id: body.id.unwrap_or_default(),
				username: body
					.username
					.or_else(|| body.user.as_ref().map(|u| u.username.clone()))
					.unwrap_or_else(|| username.to_string()),
				style: body.user.map(|u| u.style).unwrap_or_default(),
				roles: body.roles,
				paint: None,
			},
			Err(FetchError::NotFound) => {
				debug!(username, "no 7tv account; caching negative result");
				metrics::counter!("chatcast_cosmetics_negative_total").increment(1);
				self.cache.lock().insert(key, None);
				return None;
			}
			Err(err) => {
				debug!(username, error = %err, "7tv cosmetics lookup failed");
				return None;
			}
		};

		if let Some(paint_id) = cosmetics.style.paint_id.clone() {
			cosmetics.paint = self.fetch_paint(&paint_id).await;
		}

		metrics::counter!("chatcast_cosmetics_loaded_total").increment(1);
		self.cache.lock().insert(key, Some(cosmetics.clone()));
		Some(cosmetics)
	}

	/// Look up one paint definition from the GraphQL cosmetics listing.
	async fn fetch_paint(&self, paint_id: &str) -> Option<SevenTvPaint> {
		let request = GraphqlRequest { query: PAINTS_QUERY };
		let body: GraphqlPaintsBody = match self.http.post_json(&self.gql_url, &request).await {
			Ok(body) => body,
			Err(err) => {
				debug!(paint_id, error = %err, "paint gql lookup failed");
				return None;
			}
		};

		let paint = body
			.data
			.and_then(|d| d.cosmetics)
			.map(|c| c.paints)
			.unwrap_or_default()
			.into_iter()
			.find(|p| p.id == paint_id);

		if paint.is_none() {
			debug!(paint_id, "paint not present in gql response");
		}
		paint
	}

	/// Drop all cached cosmetics (the only refresh mechanism).
	pub fn clear(&self) {
		self.cache.lock().clear();
	}
}

/// Convert a 7TV 32-bit color to a `#rrggbb` hex string (alpha dropped).
pub fn color_number_to_hex(color: i64) -> String {
	let unsigned = color as u32;
	format!("#{:06x}", unsigned >> 8)
}

#[derive(Debug, Serialize)]
struct GraphqlRequest {
	query: &'static str,
}

#[derive(Debug, Deserialize)]
struct SevenTvUserCosmeticsBody {
	#[serde(default)]
	id: Option<String>,
	#[serde(default)]
	username: Option<String>,
	#[serde(default)]
	user: Option<SevenTvUserBody>,
	#[serde(default)]
	roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SevenTvUserBody {
	#[serde(default)]
	username: String,
	#[serde(default)]
	style: SevenTvStyle,
}

#[derive(Debug, Deserialize)]
struct GraphqlPaintsBody {
	#[serde(default)]
	data: Option<GraphqlPaintsData>,
}

#[derive(Debug, Deserialize)]
struct GraphqlPaintsData {
	#[serde(default)]
	cosmetics: Option<GraphqlPaintsCosmetics>,
}

#[derive(Debug, Deserialize)]
struct GraphqlPaintsCosmetics {
	#[serde(default)]
	paints: Vec<SevenTvPaint>,
}

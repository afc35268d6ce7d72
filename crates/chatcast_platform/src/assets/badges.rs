#![forbid(unsafe_code)]

use std::collections::HashMap;

use chatcast_domain::ChannelName;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::http::FetchError;
use crate::kick::KickMetadataClient;
use crate::{Badge, SubscriberBadgeInfo};

/// One custom subscriber badge threshold for a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberBadge {
	pub id: String,
	pub months: u32,
	pub url: String,
}

#[derive(Debug, Default)]
struct BadgeCaches {
	/// Channel badge sets; an empty vec is a confirmed "channel has no
	/// custom badges", distinct from an absent entry ("not yet tried").
	channel_badges: HashMap<ChannelName, Vec<SubscriberBadge>>,

	/// Month-count resolutions, negative outcomes included.
	month_lookups: HashMap<(ChannelName, u32), Option<SubscriberBadge>>,
}

/// Maps subscriber month counts to channel-specific custom badge images.
///
/// The badge set for a channel loads once (from the channel endpoint or from
/// client-supplied `badgeData`) and both positive and negative month
/// resolutions are cached so repeat messages never re-resolve.
pub struct BadgeResolver {
	kick: KickMetadataClient,
	caches: Mutex<BadgeCaches>,
}

impl BadgeResolver {
	pub fn new(kick: KickMetadataClient) -> Self {
		Self {
			kick,
			caches: Mutex::new(BadgeCaches::default()),
		}
	}

	/// Seed the channel's badge set from client-relayed `badgeData`.
	pub fn cache_badges_from_client(&self, channel: &ChannelName, badges: &[SubscriberBadgeInfo]) {
		let set = normalize_badge_set(badges);
		info!(channel = %channel, count = set.len(), "cached subscriber badges from client data");
		let mut caches = self.caches.lock();
		caches.month_lookups.retain(|(ch, _), _| ch != channel);
		caches.channel_badges.insert(channel.clone(), set);
	}

	/// Whether the channel's badge set has been loaded (possibly empty).
	pub fn has_channel_badges(&self, channel: &ChannelName) -> bool {
		self.caches.lock().channel_badges.contains_key(channel)
	}

	/// Resolve the custom badge for `(channel, months)`, loading the channel
	/// badge set on first demand. Transient load failures cache nothing and
	/// retry naturally on the next message.
	pub async fn resolve_subscriber_badge(&self, channel: &ChannelName, months: u32) -> Option<SubscriberBadge> {
		{
			let caches = self.caches.lock();
			if let Some(cached) = caches.month_lookups.get(&(channel.clone(), months)) {
				return cached.clone();
			}
		}

		if !self.has_channel_badges(channel) {
			self.load_channel_badges(channel).await;
		}

		let mut caches = self.caches.lock();
		let set = caches.channel_badges.get(channel)?;
		let resolved = best_badge_for(set, months);
		debug!(channel = %channel, months, custom = resolved.is_some(), "subscriber badge resolved");
		caches.month_lookups.insert((channel.clone(), months), resolved.clone());
		resolved
	}

	/// Upgrade a decoded subscriber badge with the channel's custom image
	/// when one exists; all other badges pass through unchanged.
	pub async fn enrich_badge(&self, channel: &ChannelName, badge: Badge) -> Badge {
		if badge.kind != "subscriber" {
			return badge;
		}
		let Some(months) = badge.count else {
			return badge;
		};

		match self.resolve_subscriber_badge(channel, months).await {
			Some(custom) => Badge {
				image: custom.url,
				is_custom: true,
				..badge
			},
			None => badge,
		}
	}

	async fn load_channel_badges(&self, channel: &ChannelName) {
		match self.kick.channel_info(channel).await {
			Ok(info) => {
				let set = normalize_badge_set(&info.subscriber_badges);
				info!(channel = %channel, count = set.len(), "loaded channel subscriber badges");
				metrics::counter!("chatcast_badge_set_loads_total").increment(1);
				self.caches.lock().channel_badges.insert(channel.clone(), set);
			}
			Err(FetchError::NotFound) => {
				// Confirmed negative: the channel has no badge set to offer.
				debug!(channel = %channel, "channel badge lookup returned not-found");
				self.caches.lock().channel_badges.insert(channel.clone(), Vec::new());
			}
			Err(err) => {
				debug!(channel = %channel, error = %err, "channel badge load failed; will retry on demand");
				metrics::counter!("chatcast_badge_set_load_failures_total").increment(1);
			}
		}
	}
}

fn normalize_badge_set(badges: &[SubscriberBadgeInfo]) -> Vec<SubscriberBadge> {
	let mut set: Vec<SubscriberBadge> = badges
		.iter()
		.map(|b| SubscriberBadge {
			id: b.id.to_string(),
			months: b.months,
			url: b.badge_image.src.clone(),
		})
		.collect();
	set.sort_by_key(|b| b.months);
	set
}

/// Highest threshold not exceeding the subscriber's month count.
fn best_badge_for(set: &[SubscriberBadge], months: u32) -> Option<SubscriberBadge> {
	set.iter().filter(|b| b.months <= months).next_back().cloned()
}

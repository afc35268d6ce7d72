#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chatcast_domain::ChannelName;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::server::messages::ServerMessage;

/// Per-channel hub that fans enriched events out to gateway sessions.
#[derive(Debug, Clone)]
pub struct RoomHub {
	inner: Arc<Mutex<Inner>>,
	cfg: RoomHubConfig,
}

/// Configuration for `RoomHub`.
#[derive(Debug, Clone)]
pub struct RoomHubConfig {
	/// Maximum number of queued items per subscriber.
	pub subscriber_queue_capacity: usize,
}

impl Default for RoomHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
		}
	}
}

/// Items emitted on a subscriber stream.
#[derive(Debug, Clone)]
pub enum RoomItem {
	Event(ServerMessage),

	/// The subscriber lagged and items were dropped.
	Lagged { dropped: u64 },
}

impl RoomHub {
	pub fn new(cfg: RoomHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Subscribe to a channel's room.
	pub async fn subscribe(&self, channel: ChannelName) -> mpsc::Receiver<RoomItem> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);

		let mut inner = self.inner.lock().await;
		let entry = inner.rooms.entry(channel.clone()).or_default();
		prune_closed_subscribers(entry);
		entry.subscribers.push(tx);
		entry.pending_lag.push(0);

		debug!(channel = %channel, subs = entry.subscribers.len(), "room hub: subscribed");
		rx
	}

	/// Publish one event to every live subscriber of a channel, in order.
	/// Delivery is fire-and-forget: a full queue drops for that subscriber
	/// only and is flagged with a lag marker later.
	pub async fn publish(&self, channel: &ChannelName, event: ServerMessage) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.rooms.get_mut(channel) else {
			return;
		};

		prune_closed_subscribers(entry);
		if entry.subscribers.is_empty() {
			inner.rooms.remove(channel);
			return;
		}

		let item = RoomItem::Event(event);
		let mut dropped_total: u64 = 0;

		for (idx, sub) in entry.subscribers.iter_mut().enumerate() {
			match sub.try_send(item.clone()) {
				Ok(()) => {
					if let Some(pending) = entry.pending_lag.get_mut(idx)
						&& *pending > 0 && sub.try_send(RoomItem::Lagged { dropped: *pending }).is_ok()
					{
						*pending = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;
					if let Some(pending) = entry.pending_lag.get_mut(idx) {
						*pending = pending.saturating_add(1);
					}
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		prune_closed_subscribers(entry);
		if entry.subscribers.is_empty() {
			inner.rooms.remove(channel);
		}

		if dropped_total > 0 {
			debug!(channel = %channel, dropped = dropped_total, "room hub: dropped on full subscriber queues");
			metrics::counter!("chatcast_room_hub_dropped_total").increment(dropped_total);
		}
	}

	/// Remove closed subscribers and empty rooms.
	pub async fn prune(&self, channel: &ChannelName) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.rooms.get_mut(channel) {
			prune_closed_subscribers(entry);
			if entry.subscribers.is_empty() {
				inner.rooms.remove(channel);
			}
		}
	}

	/// Live subscriber counts per channel.
	#[allow(dead_code)]
	pub async fn subscriber_counts(&self) -> HashMap<ChannelName, usize> {
		let inner = self.inner.lock().await;
		inner
			.rooms
			.iter()
			.map(|(k, v)| (k.clone(), v.subscribers.iter().filter(|s| !s.is_closed()).count()))
			.collect()
	}
}

#[derive(Debug, Default)]
struct Inner {
	rooms: HashMap<ChannelName, RoomEntry>,
}

#[derive(Debug, Default)]
struct RoomEntry {
	subscribers: Vec<mpsc::Sender<RoomItem>>,

	/// Pending lag markers per subscriber.
	pending_lag: Vec<u64>,
}

fn prune_closed_subscribers(entry: &mut RoomEntry) {
	if entry.subscribers.len() != entry.pending_lag.len() {
		entry.pending_lag.resize(entry.subscribers.len(), 0);
	}

	let mut new_subs = Vec::with_capacity(entry.subscribers.len());
	let mut new_lag = Vec::with_capacity(entry.subscribers.len());

	for (idx, s) in entry.subscribers.drain(..).enumerate() {
		if !s.is_closed() {
			new_subs.push(s);
			new_lag.push(*entry.pending_lag.get(idx).unwrap_or(&0));
		}
	}

	entry.subscribers = new_subs;
	entry.pending_lag = new_lag;
}

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chatcast_domain::{ChannelName, IdentifierSource};
use chatcast_platform::connection_event_channel;
use chatcast_platform::kick::{PusherConfig, SubscribeRequest, UpstreamConnection};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::room_hub::RoomHub;
use crate::server::router::{EndReason, EnrichmentConfig, run_channel_router};
use crate::server::services::Services;

/// Connection manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
	pub pusher: PusherConfig,
	pub connect_timeout: Duration,
	pub event_channel_capacity: usize,
	pub enrichment: EnrichmentConfig,
}

impl Default for ManagerConfig {
	fn default() -> Self {
		Self {
			pusher: PusherConfig::default(),
			connect_timeout: Duration::from_secs(10),
			event_channel_capacity: 1024,
			enrichment: EnrichmentConfig::default(),
		}
	}
}

/// Result of an acquire: whether this call constructed the connection.
#[derive(Debug, Clone, Copy)]
pub struct AcquireOutcome {
	pub created: bool,
}

pub(crate) enum ManagerCommand {
	Acquire {
		channel: ChannelName,
		resp: oneshot::Sender<anyhow::Result<AcquireOutcome>>,
	},
	Release {
		channel: ChannelName,
	},
	SubscribeUpstream {
		channel: ChannelName,
		/// When set, the request came from an internal task bound to a
		/// specific connection generation; stale generations are dropped.
		epoch: Option<u64>,
		request: SubscribeRequest,
	},
	ConnectionEnded {
		channel: ChannelName,
		epoch: u64,
		reason: EndReason,
	},
	ActiveChannels {
		resp: oneshot::Sender<Vec<(ChannelName, u64)>>,
	},
	ShutdownAll {
		resp: oneshot::Sender<()>,
	},
}

/// Handle to the channel→connection map.
///
/// One upstream connection exists per channel system-wide, shared by every
/// downstream subscriber and reference-counted: first join constructs it,
/// last leave tears it down. All mutations run on a single actor task, so
/// concurrent acquires can never construct two connections for one channel.
#[derive(Clone)]
pub struct ConnectionManager {
	cmd_tx: mpsc::Sender<ManagerCommand>,
}

impl ConnectionManager {
	pub fn start(cfg: ManagerConfig, services: Arc<Services>, hub: RoomHub) -> Self {
		let (cmd_tx, cmd_rx) = mpsc::channel(64);
		let actor = ManagerActor {
			cfg,
			services,
			hub,
			entries: HashMap::new(),
			next_epoch: 1,
			cmd_tx: cmd_tx.clone(),
		};
		tokio::spawn(run_manager(actor, cmd_rx));
		Self { cmd_tx }
	}

	/// Increment the channel's refcount, constructing the upstream
	/// connection on first join.
	pub async fn acquire(&self, channel: ChannelName) -> anyhow::Result<AcquireOutcome> {
		let (tx, rx) = oneshot::channel();
		self.cmd_tx
			.send(ManagerCommand::Acquire { channel, resp: tx })
			.await
			.context("connection manager unavailable")?;
		rx.await.context("connection manager dropped acquire")?
	}

	/// Decrement the channel's refcount; tears down at zero. Never errors.
	pub async fn release(&self, channel: ChannelName) {
		let _ = self.cmd_tx.send(ManagerCommand::Release { channel }).await;
	}

	/// Trigger the upstream subscribe for a channel (identifier pair now
	/// known, e.g. via client-supplied badge data).
	pub async fn subscribe_upstream(&self, channel: ChannelName, request: SubscribeRequest) {
		let _ = self
			.cmd_tx
			.send(ManagerCommand::SubscribeUpstream {
				channel,
				epoch: None,
				request,
			})
			.await;
	}

	/// Snapshot of `(channel, refcount)` pairs.
	#[allow(dead_code)]
	pub async fn active_channels(&self) -> Vec<(ChannelName, u64)> {
		let (tx, rx) = oneshot::channel();
		if self.cmd_tx.send(ManagerCommand::ActiveChannels { resp: tx }).await.is_err() {
			return Vec::new();
		}
		rx.await.unwrap_or_default()
	}

	/// Tear down every live connection and release the browser session.
	pub async fn shutdown_all(&self) {
		let (tx, rx) = oneshot::channel();
		if self.cmd_tx.send(ManagerCommand::ShutdownAll { resp: tx }).await.is_ok() {
			let _ = rx.await;
		}
	}
}

struct ChannelEntry {
	refcount: u64,
	epoch: u64,
	connection: UpstreamConnection,
	router_task: JoinHandle<()>,
	discovery_task: JoinHandle<()>,
}

struct ManagerActor {
	cfg: ManagerConfig,
	services: Arc<Services>,
	hub: RoomHub,
	entries: HashMap<ChannelName, ChannelEntry>,
	next_epoch: u64,
	cmd_tx: mpsc::Sender<ManagerCommand>,
}

async fn run_manager(mut actor: ManagerActor, mut cmd_rx: mpsc::Receiver<ManagerCommand>) {
	info!("connection manager started");
	while let Some(cmd) = cmd_rx.recv().await {
		match cmd {
			ManagerCommand::Acquire { channel, resp } => {
				let result = actor.handle_acquire(channel).await;
				let _ = resp.send(result);
			}
			ManagerCommand::Release { channel } => {
				actor.handle_release(channel);
			}
			ManagerCommand::SubscribeUpstream { channel, epoch, request } => {
				actor.handle_subscribe(channel, epoch, request).await;
			}
			ManagerCommand::ConnectionEnded { channel, epoch, reason } => {
				actor.handle_connection_ended(channel, epoch, reason);
			}
			ManagerCommand::ActiveChannels { resp } => {
				let snapshot = actor
					.entries
					.iter()
					.map(|(channel, entry)| (channel.clone(), entry.refcount))
					.collect();
				let _ = resp.send(snapshot);
			}
			ManagerCommand::ShutdownAll { resp } => {
				actor.handle_shutdown_all().await;
				let _ = resp.send(());
				break;
			}
		}
	}
	info!("connection manager stopped");
}

impl ManagerActor {
	async fn handle_acquire(&mut self, channel: ChannelName) -> anyhow::Result<AcquireOutcome> {
		if let Some(entry) = self.entries.get_mut(&channel) {
			entry.refcount += 1;
			debug!(channel = %channel, refcount = entry.refcount, "reusing upstream connection");
			return Ok(AcquireOutcome { created: false });
		}

		info!(channel = %channel, "constructing upstream connection");
		metrics::counter!("chatcast_manager_connects_total").increment(1);

		let (events_tx, events_rx) = connection_event_channel(self.cfg.event_channel_capacity);
		let connection = tokio::time::timeout(
			self.cfg.connect_timeout,
			UpstreamConnection::connect(channel.clone(), self.cfg.pusher.clone(), events_tx),
		)
		.await
		.map_err(|_| anyhow::anyhow!("upstream connect timed out for {channel}"))?
		.with_context(|| format!("upstream connect failed for {channel}"))?;

		let epoch = self.next_epoch;
		self.next_epoch += 1;

		let router_task = tokio::spawn(run_channel_router(
			channel.clone(),
			epoch,
			events_rx,
			self.hub.clone(),
			self.services.clone(),
			self.cfg.enrichment.clone(),
			self.cmd_tx.clone(),
		));

		let discovery_task = spawn_internal_discovery(channel.clone(), epoch, self.services.clone(), self.cmd_tx.clone());

		self.entries.insert(
			channel,
			ChannelEntry {
				refcount: 1,
				epoch,
				connection,
				router_task,
				discovery_task,
			},
		);

		Ok(AcquireOutcome { created: true })
	}

	fn handle_release(&mut self, channel: ChannelName) {
		let Some(entry) = self.entries.get_mut(&channel) else {
			debug!(channel = %channel, "release for unknown channel; ignoring");
			return;
		};

		entry.refcount = entry.refcount.saturating_sub(1);
		if entry.refcount > 0 {
			debug!(channel = %channel, refcount = entry.refcount, "subscriber released");
			return;
		}

		info!(channel = %channel, "last subscriber released; tearing down upstream connection");
		metrics::counter!("chatcast_manager_teardowns_total").increment(1);
		if let Some(entry) = self.entries.remove(&channel) {
			teardown_entry(entry);
		}
	}

	async fn handle_subscribe(&mut self, channel: ChannelName, epoch: Option<u64>, request: SubscribeRequest) {
		let Some(entry) = self.entries.get(&channel) else {
			debug!(channel = %channel, "subscribe request for unknown channel; dropping");
			return;
		};

		// Liveness guard: results produced for a torn-down generation must
		// not touch its replacement.
		if let Some(epoch) = epoch
			&& epoch != entry.epoch
		{
			debug!(channel = %channel, epoch, current = entry.epoch, "stale subscribe request; dropping");
			return;
		}

		info!(
			channel = %channel,
			confirmed = request.source.is_confirmed(),
			"forwarding subscribe to upstream connection"
		);
		entry.connection.subscribe(request).await;
	}

	fn handle_connection_ended(&mut self, channel: ChannelName, epoch: u64, reason: EndReason) {
		let Some(entry) = self.entries.get(&channel) else {
			return;
		};
		if entry.epoch != epoch {
			return;
		}

		warn!(channel = %channel, ?reason, "reclaiming ended upstream connection");
		metrics::counter!("chatcast_manager_reclaims_total").increment(1);
		if let Some(entry) = self.entries.remove(&channel) {
			teardown_entry(entry);
		}
	}

	async fn handle_shutdown_all(&mut self) {
		info!(count = self.entries.len(), "shutting down all upstream connections");
		for (_, entry) in self.entries.drain() {
			teardown_entry(entry);
		}
		self.services.browser.shutdown().await;
	}
}

fn teardown_entry(entry: ChannelEntry) {
	entry.connection.shutdown();
	entry.discovery_task.abort();
	entry.router_task.abort();
}

/// Resolve identifiers through the discovery chain and, on a complete pair,
/// ask the manager to subscribe. Tagged with the connection's generation so
/// a result that outlives its connection is dropped.
fn spawn_internal_discovery(
	channel: ChannelName,
	epoch: u64,
	services: Arc<Services>,
	cmd_tx: mpsc::Sender<ManagerCommand>,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		let ids = services.discovery.resolve(&channel).await;
		if !ids.is_complete() {
			debug!(channel = %channel, "internal discovery incomplete; waiting for client hints");
			return;
		}

		let _ = cmd_tx
			.send(ManagerCommand::SubscribeUpstream {
				channel,
				epoch: Some(epoch),
				request: SubscribeRequest {
					ids,
					source: IdentifierSource::Confirmed,
				},
			})
			.await;
	})
}

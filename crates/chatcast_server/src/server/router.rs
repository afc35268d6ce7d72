#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chatcast_domain::ChannelName;
use chatcast_platform::{ConnectionEvent, ConnectionEventRx, NormalizedChatMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::manager::ManagerCommand;
use crate::server::messages::ServerMessage;
use crate::server::room_hub::RoomHub;
use crate::server::services::Services;

/// Settings for the per-channel enrichment router.
#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
	/// Hard bound on the cosmetic lookup per message; on expiry the message
	/// ships without cosmetics.
	pub cosmetic_timeout: Duration,
}

impl Default for EnrichmentConfig {
	fn default() -> Self {
		Self {
			cosmetic_timeout: Duration::from_millis(1500),
		}
	}
}

/// Why a channel router stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
	Error,
	Inactive,
	Closed,
}

/// Per-channel routing loop: consumes the upstream connection's event
/// stream, enriches chat messages, and publishes gateway frames to the room.
///
/// Runs until the event stream closes or a terminal lifecycle event arrives;
/// either way the manager is told so it can reclaim the entry. Processing is
/// strictly in arrival order.
pub(crate) async fn run_channel_router(
	channel: ChannelName,
	epoch: u64,
	mut events_rx: ConnectionEventRx,
	hub: RoomHub,
	services: Arc<Services>,
	cfg: EnrichmentConfig,
	manager_tx: mpsc::Sender<ManagerCommand>,
) {
	debug!(channel = %channel, epoch, "channel router started");
	let mut end_reason = EndReason::Closed;

	while let Some(event) = events_rx.recv().await {
		match event {
			ConnectionEvent::Message(message) => {
				let enriched = enrich_message(&services, &cfg, &channel, *message).await;
				metrics::counter!("chatcast_router_messages_total").increment(1);
				hub.publish(&channel, ServerMessage::ChatMessage(enriched)).await;
			}
			ConnectionEvent::ChannelConnected(info) => {
				info!(channel = %channel, source = ?info.identifier_source(), "announcing channel connected");
				hub.publish(&channel, ServerMessage::ChannelConnected(info)).await;
			}
			ConnectionEvent::Error(reason) => {
				warn!(channel = %channel, reason = %reason, "upstream connection error");
				metrics::counter!("chatcast_router_connection_errors_total").increment(1);
				hub.publish(&channel, ServerMessage::ConnectionError(reason)).await;
				end_reason = EndReason::Error;
				break;
			}
			ConnectionEvent::Inactive => {
				// Lifecycle signal for the manager only; subscribers observe
				// teardown as the absence of further events.
				end_reason = EndReason::Inactive;
				break;
			}
		}
	}

	debug!(channel = %channel, epoch, reason = ?end_reason, "channel router exiting");
	let _ = manager_tx
		.send(ManagerCommand::ConnectionEnded {
			channel,
			epoch,
			reason: end_reason,
		})
		.await;
}

/// Message pipeline: custom badge resolution, bounded cosmetic lookup,
/// then the two emote substitution passes. Partial enrichment failure never
/// blocks emission.
pub async fn enrich_message(
	services: &Services,
	cfg: &EnrichmentConfig,
	channel: &ChannelName,
	mut message: NormalizedChatMessage,
) -> NormalizedChatMessage {
	let mut badges = Vec::with_capacity(message.badges.len());
	for badge in message.badges {
		badges.push(services.badges.enrich_badge(channel, badge).await);
	}
	message.badges = badges;

	match tokio::time::timeout(cfg.cosmetic_timeout, services.cosmetics.user_cosmetics(&message.username)).await {
		Ok(cosmetics) => message.user.cosmetics = cosmetics,
		Err(_) => {
			debug!(channel = %channel, username = %message.username, "cosmetic lookup timed out; emitting without");
			metrics::counter!("chatcast_cosmetic_timeouts_total").increment(1);
		}
	}

	message.content = services.emotes.rewrite_content(channel, &message.content);
	message
}

#[cfg(test)]
mod tests {
	use std::time::Instant;

	use chatcast_platform::discovery::BrowserSession;
	use chatcast_platform::http::HttpClient;
	use chatcast_platform::kick::KickMetadataClient;
	use chatcast_platform::{BadgeImage, ChatUser, SubscriberBadgeInfo, UserIdentity, new_message_id};

	use super::*;

	fn message_with(content: &str, badge_count: Option<u32>) -> NormalizedChatMessage {
		let badges = badge_count
			.map(|count| {
				vec![chatcast_platform::Badge {
					kind: "subscriber".to_string(),
					image: "⭐".to_string(),
					alt: "Subscriber".to_string(),
					is_custom: false,
					count: Some(count),
				}]
			})
			.unwrap_or_default();

		NormalizedChatMessage {
			id: new_message_id(),
			username: "viewer1".to_string(),
			content: content.to_string(),
			timestamp: chrono::Utc::now(),
			badges,
			emotes: Vec::new(),
			user: ChatUser {
				id: "991740".to_string(),
				username: "viewer1".to_string(),
				identity: UserIdentity::default(),
				cosmetics: None,
			},
		}
	}

	fn offline_services() -> Arc<Services> {
		let http = HttpClient::with_defaults();
		let kick = KickMetadataClient::with_base_urls(http.clone(), "http://127.0.0.1:9", "http://127.0.0.1:9");
		Arc::new(Services::with_overrides(
			http,
			kick,
			Arc::new(BrowserSession::disabled()),
			Some("http://127.0.0.1:9".to_string()),
		))
	}

	#[tokio::test]
	async fn inline_emotes_and_custom_badges_are_applied() {
		let services = offline_services();
		let channel = ChannelName::new("foobar").unwrap();
		services.badges.cache_badges_from_client(
			&channel,
			&[SubscriberBadgeInfo {
				id: serde_json::json!(1),
				months: 6,
				channel_id: None,
				badge_image: BadgeImage {
					src: "https://files.kick.com/b/6".to_string(),
					srcset: None,
				},
			}],
		);

		let enriched = enrich_message(
			&services,
			&EnrichmentConfig::default(),
			&channel,
			message_with("hello [emote:1:Kappa]", Some(6)),
		)
		.await;

		assert!(enriched.content.contains("https://files.kick.com/emotes/1/fullsize"));
		assert!(enriched.badges[0].is_custom);
		assert_eq!(enriched.badges[0].image, "https://files.kick.com/b/6");
	}

	#[tokio::test]
	async fn hung_cosmetic_lookup_does_not_delay_delivery_past_the_bound() {
		// A socket that accepts and then never answers.
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let mut held = Vec::new();
			loop {
				let Ok((stream, _)) = listener.accept().await else {
					break;
				};
				held.push(stream);
			}
		});

		let http = HttpClient::with_defaults();
		let kick = KickMetadataClient::with_base_urls(http.clone(), format!("http://{addr}"), format!("http://{addr}"));
		let services = Arc::new(Services::with_overrides(
			http,
			kick,
			Arc::new(BrowserSession::disabled()),
			Some(format!("http://{addr}")),
		));

		let cfg = EnrichmentConfig {
			cosmetic_timeout: Duration::from_millis(200),
		};
		let channel = ChannelName::new("foobar").unwrap();

		let started = Instant::now();
		let enriched = enrich_message(&services, &cfg, &channel, message_with("hi", None)).await;
		assert!(enriched.user.cosmetics.is_none());
		assert!(
			started.elapsed() < Duration::from_secs(2),
			"delivery must be bounded by the cosmetic timeout"
		);
	}
}

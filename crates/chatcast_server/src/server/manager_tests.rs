#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chatcast_domain::ChannelName;
use chatcast_platform::discovery::BrowserSession;
use chatcast_platform::http::HttpClient;
use chatcast_platform::kick::{KickMetadataClient, PusherConfig};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::server::manager::{ConnectionManager, ManagerConfig};
use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::server::services::Services;

/// Minimal in-process Pusher stand-in: acknowledges the connection and any
/// subscribe frames, counts accepted sockets.
async fn spawn_fake_broker() -> (SocketAddr, Arc<AtomicUsize>) {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let accepted = Arc::new(AtomicUsize::new(0));
	let accepted_clone = accepted.clone();

	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				break;
			};
			accepted_clone.fetch_add(1, Ordering::SeqCst);
			tokio::spawn(async move {
				let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
					return;
				};
				let established =
					r#"{"event":"pusher:connection_established","data":"{\"socket_id\":\"1.1\"}"}"#;
				if ws.send(Message::Text(established.into())).await.is_err() {
					return;
				}

				while let Some(Ok(frame)) = ws.next().await {
					if let Message::Text(text) = frame
						&& let Ok(value) = serde_json::from_str::<serde_json::Value>(&text)
						&& value["event"] == "pusher:subscribe"
					{
						let topic = value["data"]["channel"].as_str().unwrap_or("").to_string();
						let ack = format!(
							r#"{{"event":"pusher_internal:subscription_succeeded","channel":"{topic}","data":"{{}}"}}"#
						);
						let _ = ws.send(Message::Text(ack.into())).await;
					}
				}
			});
		}
	});

	(addr, accepted)
}

fn offline_services() -> Arc<Services> {
	let http = HttpClient::with_defaults();
	// Dead endpoints: internal discovery and enrichment fall through fast.
	let kick = KickMetadataClient::with_base_urls(http.clone(), "http://127.0.0.1:9", "http://127.0.0.1:9");
	Arc::new(Services::with_overrides(
		http,
		kick,
		Arc::new(BrowserSession::disabled()),
		Some("http://127.0.0.1:9".to_string()),
	))
}

fn manager_for(broker: SocketAddr) -> ConnectionManager {
	let cfg = ManagerConfig {
		pusher: PusherConfig {
			ws_url: format!("ws://{broker}"),
			inactivity_window: Duration::from_secs(60),
		},
		connect_timeout: Duration::from_secs(5),
		..ManagerConfig::default()
	};
	ConnectionManager::start(cfg, offline_services(), RoomHub::new(RoomHubConfig::default()))
}

fn channel(name: &str) -> ChannelName {
	ChannelName::new(name).expect("valid channel name")
}

#[tokio::test]
async fn names_differing_only_by_case_share_one_connection() {
	let (broker, accepted) = spawn_fake_broker().await;
	let manager = manager_for(broker);

	let first = manager.acquire(channel("FooBar")).await.expect("first acquire");
	let second = manager.acquire(channel("foobar")).await.expect("second acquire");
	let third = manager.acquire(channel("FOOBAR")).await.expect("third acquire");

	assert!(first.created);
	assert!(!second.created);
	assert!(!third.created);
	assert_eq!(accepted.load(Ordering::SeqCst), 1);

	let snapshot = manager.active_channels().await;
	assert_eq!(snapshot.len(), 1);
	assert_eq!(snapshot[0].0.as_str(), "foobar");
	assert_eq!(snapshot[0].1, 3);
}

#[tokio::test]
async fn concurrent_acquires_construct_exactly_one_connection() {
	let (broker, accepted) = spawn_fake_broker().await;
	let manager = manager_for(broker);

	let mut handles = Vec::new();
	for _ in 0..8 {
		let manager = manager.clone();
		handles.push(tokio::spawn(async move { manager.acquire(channel("foobar")).await }));
	}

	let mut created = 0usize;
	for handle in handles {
		let outcome = handle.await.unwrap().expect("acquire");
		if outcome.created {
			created += 1;
		}
	}

	assert_eq!(created, 1, "exactly one acquire must construct the connection");
	assert_eq!(accepted.load(Ordering::SeqCst), 1);

	let snapshot = manager.active_channels().await;
	assert_eq!(snapshot[0].1, 8);
}

#[tokio::test]
async fn release_to_zero_tears_down_and_next_acquire_is_fresh() {
	let (broker, accepted) = spawn_fake_broker().await;
	let manager = manager_for(broker);

	manager.acquire(channel("foobar")).await.expect("acquire");
	manager.acquire(channel("foobar")).await.expect("acquire");

	manager.release(channel("foobar")).await;
	let snapshot = manager.active_channels().await;
	assert_eq!(snapshot[0].1, 1, "one subscriber remains");

	manager.release(channel("foobar")).await;
	let snapshot = manager.active_channels().await;
	assert!(snapshot.is_empty(), "zero refcount must remove the entry");

	let again = manager.acquire(channel("foobar")).await.expect("fresh acquire");
	assert!(again.created, "torn-down state must not be reused");
	assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn release_of_unknown_channel_is_harmless() {
	let (broker, _accepted) = spawn_fake_broker().await;
	let manager = manager_for(broker);

	manager.release(channel("nobody")).await;
	assert!(manager.active_channels().await.is_empty());
}

#[tokio::test]
async fn connect_failure_surfaces_and_retains_no_entry() {
	// Nothing listens here.
	let cfg = ManagerConfig {
		pusher: PusherConfig {
			ws_url: "ws://127.0.0.1:9".to_string(),
			inactivity_window: Duration::from_secs(60),
		},
		connect_timeout: Duration::from_secs(2),
		..ManagerConfig::default()
	};
	let manager = ConnectionManager::start(cfg, offline_services(), RoomHub::new(RoomHubConfig::default()));

	assert!(manager.acquire(channel("foobar")).await.is_err());
	assert!(manager.active_channels().await.is_empty(), "no half-built entry may remain");

	// A later acquire retries from scratch and fails the same way.
	assert!(manager.acquire(channel("foobar")).await.is_err());
}

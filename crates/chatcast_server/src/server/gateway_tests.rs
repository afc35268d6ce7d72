#![forbid(unsafe_code)]

//! End-to-end gateway flow against an in-process fake Pusher broker:
//! join → optimistic connect → client badge data → upstream subscribe →
//! enriched chat delivery → leave.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chatcast_platform::discovery::BrowserSession;
use chatcast_platform::http::HttpClient;
use chatcast_platform::kick::{KickMetadataClient, PusherConfig};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::server::gateway::{AppState, build_router};
use crate::server::health::HealthState;
use crate::server::manager::{ConnectionManager, ManagerConfig};
use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::server::services::Services;

const CUSTOM_BADGE_URL: &str = "https://files.kick.com/channel_subscriber_badges/456/6.png";

/// Scripted broker: one connection, established ack, six subscribes, one
/// subscription ack, one chat event, then wait for close.
async fn spawn_scripted_broker() -> (SocketAddr, tokio::task::JoinHandle<Vec<String>>) {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();

	let handle = tokio::task::spawn(async move {
		let (stream, _) = listener.accept().await.unwrap();
		let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

		let established = r#"{"event":"pusher:connection_established","data":"{\"socket_id\":\"1.1\"}"}"#;
		ws.send(Message::Text(established.into())).await.unwrap();

		let mut topics = Vec::new();
		while topics.len() < 6 {
			let frame = ws.next().await.expect("broker socket open").expect("broker frame");
			if let Message::Text(text) = frame {
				let value: serde_json::Value = serde_json::from_str(&text).unwrap();
				assert_eq!(value["event"], "pusher:subscribe");
				topics.push(value["data"]["channel"].as_str().unwrap().to_string());
			}
		}

		let ack = format!(
			r#"{{"event":"pusher_internal:subscription_succeeded","channel":"{}","data":"{{}}"}}"#,
			topics[0]
		);
		ws.send(Message::Text(ack.into())).await.unwrap();

		let chat_data = serde_json::json!({
			"sender": {
				"id": 991740,
				"username": "viewer1",
				"identity": {
					"color": "#75FD7C",
					"badges": [{"type": "subscriber", "text": "Subscriber", "count": 6}]
				}
			},
			"content": "hello [emote:1:Kappa]",
			"created_at": "2024-03-01T18:22:05+00:00",
			"emotes": []
		})
		.to_string();
		let chat = serde_json::json!({
			"event": "App\\Events\\ChatMessageEvent",
			"channel": topics[0],
			"data": chat_data,
		});
		ws.send(Message::Text(chat.to_string().into())).await.unwrap();

		// The last leave tears the upstream connection down.
		while let Some(Ok(frame)) = ws.next().await {
			if matches!(frame, Message::Close(_)) {
				break;
			}
		}
		topics
	});

	(addr, handle)
}

async fn spawn_gateway(broker: SocketAddr) -> SocketAddr {
	let http = HttpClient::with_defaults();
	// Dead REST endpoints: enrichment relies on client-supplied data only.
	let kick = KickMetadataClient::with_base_urls(http.clone(), "http://127.0.0.1:9", "http://127.0.0.1:9");
	let services = Arc::new(Services::with_overrides(
		http,
		kick,
		Arc::new(BrowserSession::disabled()),
		Some("http://127.0.0.1:9".to_string()),
	));

	let manager_cfg = ManagerConfig {
		pusher: PusherConfig {
			ws_url: format!("ws://{broker}"),
			inactivity_window: Duration::from_secs(60),
		},
		connect_timeout: Duration::from_secs(2),
		..ManagerConfig::default()
	};

	let hub = RoomHub::new(RoomHubConfig::default());
	let manager = ConnectionManager::start(manager_cfg, services.clone(), hub.clone());
	let health = HealthState::new();
	health.mark_ready();

	let app = build_router(AppState {
		manager,
		hub,
		services,
		health,
	});

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		axum::serve(listener, app).await.unwrap();
	});
	addr
}

type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn next_server_frame(ws: &mut ClientWs) -> serde_json::Value {
	loop {
		let frame = timeout(Duration::from_secs(5), ws.next())
			.await
			.expect("frame within timeout")
			.expect("socket open")
			.expect("frame ok");
		if let Message::Text(text) = frame {
			return serde_json::from_str(&text).unwrap();
		}
	}
}

async fn next_frame_of_type(ws: &mut ClientWs, frame_type: &str) -> serde_json::Value {
	loop {
		let frame = next_server_frame(ws).await;
		if frame["type"] == frame_type {
			return frame;
		}
	}
}

#[tokio::test]
async fn join_badge_data_subscribe_and_enriched_delivery() {
	let (broker_addr, broker) = spawn_scripted_broker().await;
	let gateway_addr = spawn_gateway(broker_addr).await;

	let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{gateway_addr}/ws"))
		.await
		.expect("gateway connect");

	// Join with a mixed-case name; the server folds it.
	client
		.send(Message::Text(r#"{"type":"joinChannel","data":"fooBar"}"#.into()))
		.await
		.unwrap();

	let connected = next_frame_of_type(&mut client, "channelConnected").await;
	assert_eq!(connected["data"]["slug"], "foobar");
	assert_eq!(
		connected["data"]["chatroom"]["id"], "unknown",
		"optimistic announcement carries placeholder identifiers"
	);

	// Client-side badge data supplies the real identifier pair.
	let badge_data = serde_json::json!({
		"type": "badgeData",
		"data": {
			"channelName": "fooBar",
			"subscriber_badges": [
				{"id": 1, "channel_id": 456, "months": 6, "badge_image": {"src": CUSTOM_BADGE_URL}}
			],
			"channelInfo": {
				"id": "456",
				"slug": "foobar",
				"username": "fooBar",
				"chatroom": {"id": "123", "channel_id": "456"},
				"subscriber_badges": []
			}
		}
	});
	client.send(Message::Text(badge_data.to_string().into())).await.unwrap();

	let chat = next_frame_of_type(&mut client, "chatMessage").await;
	let message = &chat["data"];
	assert_eq!(message["username"], "viewer1");
	assert!(
		message["content"]
			.as_str()
			.unwrap()
			.contains("<img src=\"https://files.kick.com/emotes/1/fullsize\""),
		"inline kick emote must be rewritten to an image tag"
	);
	assert_eq!(message["badges"][0]["type"], "subscriber");
	assert_eq!(message["badges"][0]["image"], CUSTOM_BADGE_URL);
	assert_eq!(message["badges"][0]["isCustom"], true);
	assert_eq!(message["badges"][0]["count"], 6);

	// Leaving releases the last subscriber; the broker sees the close.
	client
		.send(Message::Text(r#"{"type":"leaveChannel"}"#.into()))
		.await
		.unwrap();

	let topics = timeout(Duration::from_secs(5), broker)
		.await
		.expect("broker script finished")
		.unwrap();
	assert_eq!(
		topics,
		vec![
			"chatroom_123".to_string(),
			"chatrooms.123.v2".to_string(),
			"chatrooms.123".to_string(),
			"channel_456".to_string(),
			"channel.456".to_string(),
			"predictions-channel-456".to_string(),
		]
	);
}

#[tokio::test]
async fn rejoining_another_channel_leaves_the_previous_one() {
	let (broker_addr, _broker) = spawn_scripted_broker().await;
	let gateway_addr = spawn_gateway(broker_addr).await;

	let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{gateway_addr}/ws"))
		.await
		.expect("gateway connect");

	client
		.send(Message::Text(r#"{"type":"joinChannel","data":"alpha"}"#.into()))
		.await
		.unwrap();
	let _ = next_frame_of_type(&mut client, "channelConnected").await;

	// The second join binds the session to "beta"; the broker for "alpha"
	// only accepts one socket, so the second channel gets its own.
	client
		.send(Message::Text(r#"{"type":"joinChannel","data":"beta"}"#.into()))
		.await
		.unwrap();

	// "alpha" now has zero subscribers and its upstream is torn down. The
	// scripted broker accepts a single socket, so the "beta" construction
	// fails and surfaces as a connection error instead of hanging.
	let error = next_frame_of_type(&mut client, "connectionError").await;
	assert!(
		error["data"].as_str().unwrap().contains("beta"),
		"error should name the channel that failed: {error}"
	);
}

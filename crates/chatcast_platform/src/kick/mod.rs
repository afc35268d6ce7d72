#![forbid(unsafe_code)]

pub mod client;
pub mod pusher;

pub use client::{KickChannelResponse, KickChatroomResponse, KickMetadataClient};
pub use pusher::{
	PusherConfig, SubscribeRequest, UpstreamConnection, chat_event_names, derive_topics, pusher_ws_url,
};

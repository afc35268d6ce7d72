#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Case-insensitive Kick channel name.
///
/// Stored lower-cased so that names differing only by case compare and hash
/// equal; every map keyed by a channel uses this type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
	/// Create a non-empty, case-folded `ChannelName`.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		let trimmed = name.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(trimmed.to_lowercase()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ChannelName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelName::new(s)
	}
}

/// Whether an identifier was confirmed by an upstream source or substituted
/// as a last-resort placeholder.
///
/// Subscribing with fallback identifiers is a distinct degraded path; the two
/// must never be conflated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierSource {
	Confirmed,
	Fallback,
}

impl IdentifierSource {
	pub fn is_confirmed(self) -> bool {
		matches!(self, IdentifierSource::Confirmed)
	}
}

/// The two internal numeric identifiers a channel needs for upstream
/// subscription, each resolved independently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelIds {
	pub chatroom_id: Option<String>,
	pub channel_id: Option<String>,
}

impl ChannelIds {
	pub fn new(chatroom_id: Option<String>, channel_id: Option<String>) -> Self {
		Self { chatroom_id, channel_id }
	}

	/// Both identifiers are known.
	pub fn is_complete(&self) -> bool {
		self.chatroom_id.is_some() && self.channel_id.is_some()
	}

	pub fn is_empty(&self) -> bool {
		self.chatroom_id.is_none() && self.channel_id.is_none()
	}

	/// Fill in fields that are still unknown from `other`, leaving already
	/// known fields untouched.
	pub fn merge_missing(&mut self, other: &ChannelIds) {
		if self.chatroom_id.is_none() {
			self.chatroom_id = other.chatroom_id.clone();
		}
		if self.channel_id.is_none() {
			self.channel_id = other.channel_id.clone();
		}
	}

	/// Placeholder pair used when discovery exhausts without a result.
	pub fn fallback_for(channel: &ChannelName) -> Self {
		let placeholder = format!("fallback_{}", channel.as_str());
		Self {
			chatroom_id: Some(placeholder.clone()),
			channel_id: Some(placeholder),
		}
	}
}

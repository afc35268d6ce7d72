#![forbid(unsafe_code)]

//! Badge, emote and cosmetic resolvers.
//!
//! All caches here are owned by the resolver instances, not process-wide
//! statics, so each test (and each server) constructs isolated state.

pub mod badges;
pub mod cosmetics;
pub mod emotes;

pub use badges::BadgeResolver;
pub use cosmetics::CosmeticResolver;
pub use emotes::{EmoteCatalog, rewrite_inline_kick_emotes, substitute_catalog_emotes};

const MODERATOR_SVG: &str = include_str!("svg/moderator.svg");
const BROADCASTER_SVG: &str = include_str!("svg/broadcaster.svg");
const VIP_SVG: &str = include_str!("svg/vip.svg");
const OG_SVG: &str = include_str!("svg/og.svg");
const VERIFIED_SVG: &str = include_str!("svg/verified.svg");
const FOUNDER_SVG: &str = include_str!("svg/founder.svg");
const SUBSCRIBER_SVG: &str = include_str!("svg/subscriber.svg");
const SUB_GIFTER_SVG: &str = include_str!("svg/sub_gifter.svg");

/// Fixed built-in badge image for a Kick badge kind: bundled SVG markup
/// where available, emoji otherwise. Never a network call.
pub fn builtin_badge_image(kind: &str) -> String {
	if let Some(svg) = builtin_badge_svg(kind) {
		return svg.trim_end().to_string();
	}

	let emoji = match kind {
		"moderator" => "🛡️",
		"vip" => "💎",
		"subscriber" => "⭐",
		"verified" => "✅",
		"founder" => "🏆",
		"og" => "🔥",
		"broadcaster" => "👑",
		"staff" => "⚡",
		"admin" => "🔧",
		"sub_gifter" => "🎁",
		_ => "🎖️",
	};
	emoji.to_string()
}

fn builtin_badge_svg(kind: &str) -> Option<&'static str> {
	match kind {
		"moderator" => Some(MODERATOR_SVG),
		"broadcaster" => Some(BROADCASTER_SVG),
		"vip" => Some(VIP_SVG),
		"og" => Some(OG_SVG),
		"verified" => Some(VERIFIED_SVG),
		"founder" => Some(FOUNDER_SVG),
		"subscriber" => Some(SUBSCRIBER_SVG),
		"sub_gifter" => Some(SUB_GIFTER_SVG),
		_ => None,
	}
}

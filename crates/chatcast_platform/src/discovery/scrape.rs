#![forbid(unsafe_code)]

//! Page-content matchers for internal identifiers.
//!
//! Each matcher is a pure function `(page) -> Option<String>` so it can be
//! tested against fixed fixtures; the chain composes them first-success-wins,
//! structured patterns before broad numeric heuristics.

/// Minimum digits for a structured match to be plausible.
const MIN_STRUCTURED_DIGITS: usize = 6;
/// Minimum digits for the broad numeric heuristic; anything shorter is noise.
const MIN_HEURISTIC_DIGITS: usize = 8;
/// Broad numeric matches must also clear this value floor.
const MIN_HEURISTIC_VALUE: u64 = 10_000_000;

pub type Matcher = fn(&str) -> Option<String>;

/// Ordered chatroom-id matchers.
pub const CHATROOM_MATCHERS: &[(&str, Matcher)] = &[
	("chatroom-object-id", chatroom_object_id),
	("chatroom-id-field", chatroom_id_field),
	("chatrooms-dot-v2", chatrooms_dot_v2),
	("chatroom-underscore", chatroom_underscore),
	("chatroom-id-attr", chatroom_id_attr),
	("broad-numeric-id", broad_numeric_id),
];

/// Ordered channel-id matchers.
pub const CHANNEL_MATCHERS: &[(&str, Matcher)] = &[("channel-id-field", channel_id_field)];

/// First chatroom id any matcher yields.
pub fn extract_chatroom_id(page: &str) -> Option<String> {
	run_matchers(CHATROOM_MATCHERS, page)
}

/// First channel id any matcher yields.
pub fn extract_channel_id(page: &str) -> Option<String> {
	run_matchers(CHANNEL_MATCHERS, page)
}

fn run_matchers(matchers: &[(&str, Matcher)], page: &str) -> Option<String> {
	for (name, matcher) in matchers {
		if let Some(id) = matcher(page) {
			tracing::debug!(matcher = name, id = %id, "page matcher hit");
			return Some(id);
		}
	}
	None
}

/// `"chatroom": { ... "id": <digits> }` with no nested object before the id.
fn chatroom_object_id(page: &str) -> Option<String> {
	for start in occurrences(page, "\"chatroom\"") {
		let rest = &page[start + "\"chatroom\"".len()..];
		let rest = skip_ws(rest);
		let Some(rest) = rest.strip_prefix(':') else { continue };
		let rest = skip_ws(rest);
		let Some(rest) = rest.strip_prefix('{') else { continue };

		let window_end = rest.find('}').unwrap_or(rest.len());
		let window = &rest[..window_end];
		for id_start in occurrences(window, "\"id\"") {
			let tail = skip_ws(&window[id_start + "\"id\"".len()..]);
			let Some(tail) = tail.strip_prefix(':') else { continue };
			let tail = skip_ws(tail);
			if let Some(digits) = leading_digits(tail, MIN_STRUCTURED_DIGITS) {
				return Some(digits);
			}
		}
	}
	None
}

/// `"chatroom_id": <digits>`.
fn chatroom_id_field(page: &str) -> Option<String> {
	digits_after_key(page, "\"chatroom_id\"", MIN_STRUCTURED_DIGITS)
}

/// `chatrooms.<digits>.v2` topic references embedded in scripts.
fn chatrooms_dot_v2(page: &str) -> Option<String> {
	for start in occurrences(page, "chatrooms.") {
		let tail = &page[start + "chatrooms.".len()..];
		if let Some(digits) = leading_digits(tail, MIN_STRUCTURED_DIGITS)
			&& tail[digits.len()..].starts_with(".v2")
		{
			return Some(digits);
		}
	}
	None
}

/// `chatroom_<digits>` topic references.
fn chatroom_underscore(page: &str) -> Option<String> {
	for start in occurrences(page, "chatroom_") {
		let tail = &page[start + "chatroom_".len()..];
		if let Some(digits) = leading_digits(tail, MIN_STRUCTURED_DIGITS) {
			return Some(digits);
		}
	}
	None
}

/// `chatroomId: <digits>`, `chatroomId="<digits>"` and the
/// `data-chatroom-id="<digits>"` attribute form.
fn chatroom_id_attr(page: &str) -> Option<String> {
	for key in ["data-chatroom-id", "chatroomId"] {
		for start in occurrences(page, key) {
			let mut tail = &page[start + key.len()..];
			tail = skip_ws(tail);
			tail = tail.strip_prefix('"').unwrap_or(tail);
			tail = skip_ws(tail);
			let Some(stripped) = tail.strip_prefix([':', '=']) else { continue };
			let mut tail = skip_ws(stripped);
			tail = tail.strip_prefix('"').unwrap_or(tail);
			if let Some(digits) = leading_digits(tail, MIN_STRUCTURED_DIGITS) {
				return Some(digits);
			}
		}
	}
	None
}

/// Broad `"id": <8+ digits>` heuristic, last resort only.
fn broad_numeric_id(page: &str) -> Option<String> {
	for start in occurrences(page, "\"id\"") {
		let tail = skip_ws(&page[start + "\"id\"".len()..]);
		let Some(tail) = tail.strip_prefix(':') else { continue };
		let tail = skip_ws(tail);
		if let Some(digits) = leading_digits(tail, MIN_HEURISTIC_DIGITS)
			&& digits.parse::<u64>().map(|v| v > MIN_HEURISTIC_VALUE).unwrap_or(false)
		{
			return Some(digits);
		}
	}
	None
}

/// `"channel_id": <digits>`, quoted or bare.
fn channel_id_field(page: &str) -> Option<String> {
	digits_after_key(page, "\"channel_id\"", MIN_STRUCTURED_DIGITS)
}

fn digits_after_key(page: &str, key: &str, min_digits: usize) -> Option<String> {
	for start in occurrences(page, key) {
		let tail = skip_ws(&page[start + key.len()..]);
		let Some(tail) = tail.strip_prefix(':') else { continue };
		let mut tail = skip_ws(tail);
		tail = tail.strip_prefix('"').unwrap_or(tail);
		if let Some(digits) = leading_digits(tail, min_digits) {
			return Some(digits);
		}
	}
	None
}

fn occurrences<'a>(hay: &'a str, needle: &'a str) -> impl Iterator<Item = usize> + 'a {
	let mut from = 0usize;
	std::iter::from_fn(move || {
		let found = hay[from..].find(needle)?;
		let at = from + found;
		from = at + needle.len();
		Some(at)
	})
}

fn skip_ws(s: &str) -> &str {
	s.trim_start_matches([' ', '\t', '\r', '\n'])
}

fn leading_digits(s: &str, min: usize) -> Option<String> {
	let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
	if end >= min { Some(s[..end].to_string()) } else { None }
}

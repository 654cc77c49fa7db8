#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ParseError, attrs, lenient_bool, lenient_string, lenient_u64};

/// Normalised code for a server-side inline alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InlineAlert {
	#[serde(rename = "otherbrowser")]
	ConnectedFromAnotherBrowser,
	#[serde(rename = "cantkickmods")]
	CantKickModerator,
	#[serde(rename = "needpermission")]
	NeedPermission,
	Unknown,
}

impl InlineAlert {
	/// Map a server message key to its alert code.
	pub fn from_message_key(key: &str) -> Self {
		match key {
			"chat-err-connected-from-another-browser" => Self::ConnectedFromAnotherBrowser,
			"chat-kick-cant-kick-moderator" => Self::CantKickModerator,
			"chat-kick-you-need-permission" => Self::NeedPermission,
			_ => Self::Unknown,
		}
	}

	pub fn code(self) -> &'static str {
		match self {
			Self::ConnectedFromAnotherBrowser => "otherbrowser",
			Self::CantKickModerator => "cantkickmods",
			Self::NeedPermission => "needpermission",
			Self::Unknown => "unknown",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
	pub id: Option<String>,
	pub room_id: Option<u64>,
	pub user: String,
	pub text: String,
	pub time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatMessage {
	Text(TextMessage),
	Alert(InlineAlert),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatMessageAttrs {
	#[serde(default, deserialize_with = "lenient_bool")]
	is_inline_alert: bool,
	#[serde(default)]
	wf_msg: Option<String>,
	#[serde(default, deserialize_with = "lenient_string")]
	id: Option<String>,
	#[serde(default, deserialize_with = "lenient_u64")]
	room_id: Option<u64>,
	#[serde(default, deserialize_with = "lenient_string")]
	name: Option<String>,
	#[serde(default, deserialize_with = "lenient_string")]
	text: Option<String>,
	#[serde(default, deserialize_with = "lenient_u64")]
	time_stamp: Option<u64>,
}

impl ChatMessage {
	/// Build from a `chat:add` payload or a history entry of the initial snapshot.
	pub fn from_chat(data: &Value) -> Result<Self, ParseError> {
		let raw: ChatMessageAttrs = serde_json::from_value(attrs(data).clone())?;
		if raw.is_inline_alert {
			let alert = raw
				.wf_msg
				.as_deref()
				.map(InlineAlert::from_message_key)
				.unwrap_or(InlineAlert::Unknown);
			return Ok(Self::Alert(alert));
		}

		// Timestamps are unix milliseconds.
		let time = raw
			.time_stamp
			.and_then(|ms| i64::try_from(ms).ok())
			.and_then(DateTime::from_timestamp_millis);

		Ok(Self::Text(TextMessage {
			id: raw.id,
			room_id: raw.room_id,
			user: raw.name.unwrap_or_default(),
			text: raw.text.unwrap_or_default(),
			time,
		}))
	}

	pub fn text(&self) -> Option<&TextMessage> {
		match self {
			Self::Text(m) => Some(m),
			Self::Alert(_) => None,
		}
	}

	pub fn alert(&self) -> Option<InlineAlert> {
		match self {
			Self::Alert(a) => Some(*a),
			Self::Text(_) => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn text_message_fields() {
		let msg = ChatMessage::from_chat(&json!({
			"attrs": {
				"id": 12,
				"roomId": "3",
				"name": "Alice",
				"text": "hello",
				"timeStamp": 1_500_000_000_123u64
			}
		}))
		.expect("message");

		let text = msg.text().expect("text message");
		assert_eq!(text.user, "Alice");
		assert_eq!(text.text, "hello");
		assert_eq!(text.id.as_deref(), Some("12"));
		assert_eq!(text.room_id, Some(3));
		assert_eq!(text.time.map(|t| t.timestamp_millis()), Some(1_500_000_000_123));
	}

	#[test]
	fn inline_alert_codes() {
		let known = ChatMessage::from_chat(&json!({
			"attrs": {"isInlineAlert": true, "wfMsg": "chat-kick-cant-kick-moderator"}
		}))
		.expect("alert");
		assert_eq!(known.alert(), Some(InlineAlert::CantKickModerator));
		assert_eq!(known.alert().map(InlineAlert::code), Some("cantkickmods"));

		let unknown = ChatMessage::from_chat(&json!({
			"attrs": {"isInlineAlert": true, "wfMsg": "chat-something-else"}
		}))
		.expect("alert");
		assert_eq!(unknown.alert(), Some(InlineAlert::Unknown));
	}
}

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ParseError, SecretString, attrs, lenient_bool, lenient_string, lenient_u64, value_as_u64};

const MODERATOR_GROUPS: &[&str] = &["chatmoderator", "sysop", "threadmoderator"];
const STAFF_GROUPS: &[&str] = &["staff", "helper", "vstf"];

/// Chat status: state plus free text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
	pub state: Option<String>,
	pub message: Option<String>,
}

/// A chat participant, built either from a live roster event or from the site user-info query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Participant {
	/// Unique key within a roster.
	pub name: String,
	pub id: Option<u64>,
	pub avatar: Option<String>,
	pub moderator: bool,
	pub staff: bool,
	pub status: Status,
	pub edits: Option<u64>,
	pub groups: Vec<String>,
	pub rights: Vec<String>,
	pub since: Option<DateTime<Utc>>,
	pub private: bool,
	pub private_room_id: Option<u64>,
	pub active: bool,
	pub options: Option<Value>,
	pub block_info: Option<Value>,

	/// Edit token; only present for the authenticated participant.
	#[serde(skip)]
	pub token: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatUserAttrs {
	#[serde(default, deserialize_with = "lenient_string")]
	name: Option<String>,
	#[serde(default)]
	avatar_src: Option<String>,
	#[serde(default, deserialize_with = "lenient_bool")]
	is_moderator: bool,
	#[serde(default, deserialize_with = "lenient_bool")]
	is_staff: bool,
	#[serde(default, deserialize_with = "lenient_string")]
	status_state: Option<String>,
	#[serde(default, deserialize_with = "lenient_string")]
	status_message: Option<String>,
	#[serde(default, deserialize_with = "lenient_u64")]
	edit_count: Option<u64>,
	#[serde(default)]
	groups: Option<Vec<String>>,
	#[serde(default)]
	since: Option<Value>,
	#[serde(default, deserialize_with = "lenient_bool")]
	is_private: bool,
	#[serde(default, deserialize_with = "lenient_u64")]
	private_room_id: Option<u64>,
	#[serde(default, deserialize_with = "lenient_bool")]
	active: bool,
}

#[derive(Debug, Deserialize)]
struct SiteUserInfo {
	#[serde(default)]
	name: Option<String>,
	#[serde(default, deserialize_with = "lenient_u64")]
	id: Option<u64>,
	#[serde(default)]
	groups: Option<Vec<String>>,
	#[serde(default)]
	rights: Option<Vec<String>>,
	#[serde(default)]
	options: Option<Value>,
	#[serde(default)]
	blockinfo: Option<Value>,
}

impl Participant {
	/// Build from a chat roster payload (`{attrs: {name, isModerator, ...}}`).
	pub fn from_chat(data: &Value) -> Result<Self, ParseError> {
		let raw: ChatUserAttrs = serde_json::from_value(attrs(data).clone())?;
		let name = raw.name.filter(|n| !n.trim().is_empty()).ok_or(ParseError::MissingName)?;

		// `since` is `[seconds, ...]`.
		let since = raw
			.since
			.as_ref()
			.and_then(|v| match v {
				Value::Array(items) => items.first().and_then(value_as_u64),
				other => value_as_u64(other),
			})
			.and_then(|secs| DateTime::from_timestamp(secs as i64, 0));

		Ok(Self {
			name,
			id: None,
			avatar: raw.avatar_src,
			moderator: raw.is_moderator,
			staff: raw.is_staff,
			status: Status {
				state: raw.status_state,
				message: raw.status_message,
			},
			edits: raw.edit_count,
			groups: raw.groups.unwrap_or_default(),
			rights: Vec::new(),
			since,
			private: raw.is_private,
			private_room_id: raw.private_room_id,
			active: raw.active,
			options: None,
			block_info: None,
			token: None,
		})
	}

	/// Build from the site `query` result (`{userinfo: {...}, pages: {"-1": {edittoken}}}`).
	pub fn from_user_info(query: &Value) -> Result<Self, ParseError> {
		let info = query.get("userinfo").ok_or(ParseError::Shape("missing userinfo"))?;
		let raw: SiteUserInfo = serde_json::from_value(info.clone())?;
		let name = raw.name.filter(|n| !n.trim().is_empty()).ok_or(ParseError::MissingName)?;

		let token = query
			.get("pages")
			.and_then(|pages| match pages {
				Value::Object(map) => map.get("-1").or_else(|| map.values().next()),
				Value::Array(items) => items.first(),
				_ => None,
			})
			.and_then(|page| page.get("edittoken"))
			.and_then(Value::as_str)
			.map(SecretString::new);

		let groups = raw.groups.unwrap_or_default();
		let moderator = groups.iter().any(|g| MODERATOR_GROUPS.contains(&g.as_str()));
		let staff = groups.iter().any(|g| STAFF_GROUPS.contains(&g.as_str()));

		Ok(Self {
			name,
			id: raw.id,
			moderator,
			staff,
			groups,
			rights: raw.rights.unwrap_or_default(),
			options: raw.options,
			block_info: raw.blockinfo,
			token,
			..Self::default()
		})
	}

	/// Moderators and staff may kick and ban.
	pub fn can_kick_ban(&self) -> bool {
		self.moderator || self.staff
	}

	pub fn has_right(&self, right: &str) -> bool {
		self.rights.iter().any(|r| r == right)
	}
}

/// Anything that names a chat user: a plain name or a participant.
pub trait AsUserName {
	fn user_name(&self) -> Option<&str>;
}

impl AsUserName for str {
	fn user_name(&self) -> Option<&str> {
		let name = self.trim();
		if name.is_empty() { None } else { Some(name) }
	}
}

impl AsUserName for String {
	fn user_name(&self) -> Option<&str> {
		self.as_str().user_name()
	}
}

impl AsUserName for Participant {
	fn user_name(&self) -> Option<&str> {
		self.name.user_name()
	}
}

impl<T: AsUserName + ?Sized> AsUserName for &T {
	fn user_name(&self) -> Option<&str> {
		(**self).user_name()
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn chat_payload_populates_fields() {
		let p = Participant::from_chat(&json!({
			"attrs": {
				"name": "Alice",
				"avatarSrc": "https://img/alice.png",
				"isModerator": true,
				"isStaff": false,
				"statusState": "away",
				"statusMessage": "brb",
				"editCount": 1200,
				"groups": ["chatmoderator", "user"],
				"since": [1_500_000_000, "Jul 2017"],
				"isPrivate": false,
				"active": true
			}
		}))
		.expect("participant");

		assert_eq!(p.name, "Alice");
		assert!(p.can_kick_ban());
		assert_eq!(p.status.state.as_deref(), Some("away"));
		assert_eq!(p.status.message.as_deref(), Some("brb"));
		assert_eq!(p.edits, Some(1200));
		assert_eq!(p.groups, vec!["chatmoderator", "user"]);
		assert_eq!(p.since.map(|t| t.timestamp()), Some(1_500_000_000));
		assert!(p.active);
	}

	#[test]
	fn user_info_populates_fields() {
		let p = Participant::from_user_info(&json!({
			"userinfo": {
				"id": 77,
				"name": "Bot",
				"groups": ["*", "user", "staff"],
				"rights": ["read", "chat"],
				"options": {"gender": "unknown"}
			},
			"pages": {"-1": {"edittoken": "abc+\\"}}
		}))
		.expect("participant");

		assert_eq!(p.name, "Bot");
		assert_eq!(p.id, Some(77));
		assert!(p.staff);
		assert!(p.can_kick_ban());
		assert!(p.has_right("chat"));
		assert_eq!(p.token.as_ref().map(|t| t.expose()), Some("abc+\\"));
	}

	#[test]
	fn plain_user_cannot_kick() {
		let p = Participant::from_chat(&json!({"attrs": {"name": "Bob"}})).expect("participant");
		assert!(!p.can_kick_ban());
	}

	#[test]
	fn missing_name_is_rejected() {
		assert!(matches!(
			Participant::from_chat(&json!({"attrs": {"name": "  "}})),
			Err(ParseError::MissingName)
		));
		assert!(Participant::from_user_info(&json!({})).is_err());
	}

	#[test]
	fn user_name_normalisation() {
		assert_eq!("  Carol ".user_name(), Some("Carol"));
		assert_eq!("".user_name(), None);
		let p = Participant {
			name: "Dave".to_string(),
			..Participant::default()
		};
		assert_eq!((&p).user_name(), Some("Dave"));
	}
}

#![forbid(unsafe_code)]

mod message;
mod participant;

use core::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use message::{ChatMessage, InlineAlert, TextMessage};
pub use participant::{AsUserName, Participant, Status};

/// Errors for mapping chat/site payloads into domain models.
#[derive(Debug, Error)]
pub enum ParseError {
	#[error("payload is missing a user name")]
	MissingName,
	#[error("payload has unexpected shape: {0}")]
	Shape(&'static str),
	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_blank(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Where a room's long-poll endpoint lives. Private rooms share their parent's host, port, key and service id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
	pub room_id: u64,
	pub key: String,
	pub host: String,
	pub port: u16,
	pub service_id: u64,
}

impl Routing {
	/// Same endpoint, different room.
	pub fn for_room(&self, room_id: u64) -> Self {
		Self {
			room_id,
			..self.clone()
		}
	}

	pub fn poll_url(&self) -> String {
		format!("http://{}:{}/socket.io/", self.host, self.port)
	}
}

/// Chat server information announced by the `meta` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMeta {
	pub hostname: Option<String>,
	pub version: Option<String>,
}

impl ServerMeta {
	pub fn from_chat(data: &Value) -> Self {
		Self {
			hostname: data.get("serverHostname").and_then(value_as_string),
			version: data.get("serverVersion").and_then(value_as_string),
		}
	}
}

/// Numbers arrive either as JSON numbers or as numeric strings.
pub fn value_as_u64(v: &Value) -> Option<u64> {
	match v {
		Value::Number(n) => n
			.as_u64()
			.or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64)),
		Value::String(s) => s.trim().parse().ok(),
		_ => None,
	}
}

/// Strings and numbers are both accepted as textual ids.
pub fn value_as_string(v: &Value) -> Option<String> {
	match v {
		Value::String(s) => Some(s.clone()),
		Value::Number(n) => Some(n.to_string()),
		_ => None,
	}
}

/// Truthy in the loose sense the chat server uses (`true`, `1`, `"1"`, `"true"`).
pub fn value_as_bool(v: &Value) -> bool {
	match v {
		Value::Bool(b) => *b,
		Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
		Value::String(s) => matches!(s.trim(), "1" | "true"),
		_ => false,
	}
}

pub(crate) fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
	D: Deserializer<'de>,
{
	let v = Option::<Value>::deserialize(deserializer)?;
	Ok(v.as_ref().and_then(value_as_u64))
}

pub(crate) fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
	D: Deserializer<'de>,
{
	let v = Option::<Value>::deserialize(deserializer)?;
	Ok(v.as_ref().is_some_and(value_as_bool))
}

pub(crate) fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
	D: Deserializer<'de>,
{
	let v = Option::<Value>::deserialize(deserializer)?;
	Ok(v.as_ref().and_then(value_as_string))
}

/// Chat payloads wrap their fields in `attrs`; a few server events send them flat.
pub(crate) fn attrs(data: &Value) -> &Value {
	match data.get("attrs") {
		Some(inner) if inner.is_object() => inner,
		_ => data,
	}
}

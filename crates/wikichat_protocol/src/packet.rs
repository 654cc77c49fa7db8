#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::framing::{Frames, FramingError, encode_frame};

/// Event name every chat command and chat event travels under.
pub const MESSAGE_EVENT: &str = "message";

/// Keep-alive interval used when a handshake omits one.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 25_000;

/// Payload of the outer `connect` packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
	pub sid: String,
	#[serde(default = "default_ping_interval")]
	pub ping_interval: u64,
	#[serde(default)]
	pub ping_timeout: Option<u64>,
	#[serde(default)]
	pub upgrades: Vec<String>,
}

fn default_ping_interval() -> u64 {
	DEFAULT_PING_INTERVAL_MS
}

/// Decoded chat event: an object with an `event` name and a `data` field.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPayload(pub Value);

impl EventPayload {
	pub fn new(event: &str, data: Value) -> Self {
		Self(json!({ "event": event, "data": data }))
	}

	pub fn name(&self) -> Option<&str> {
		self.0.get("event").and_then(Value::as_str)
	}

	/// Event data. A string `data` is JSON text and parsed again; structured `data` is used as is; without `data`
	/// the whole payload is the data.
	pub fn data(&self) -> Result<Value, serde_json::Error> {
		match self.0.get("data") {
			Some(Value::String(text)) => serde_json::from_str(text),
			Some(v @ (Value::Object(_) | Value::Array(_))) => Ok(v.clone()),
			_ => Ok(self.0.clone()),
		}
	}

	/// The `attrs` object of the data, if present.
	pub fn attrs(&self) -> Option<Value> {
		self.data().ok().and_then(|mut d| d.get_mut("attrs").map(Value::take))
	}

	pub fn into_inner(self) -> Value {
		self.0
	}
}

/// Inner packet carried by an outer `data` packet.
#[derive(Debug, Clone, PartialEq)]
pub enum DataPacket {
	Connect,
	Disconnect,
	Event(EventPayload),
	Ack,
	Error,
	BinaryEvent,
	BinaryAck,
	Unknown(Option<char>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
	Connect(Handshake),
	Disconnect,
	Ping,
	Pong,
	Data(DataPacket),
	Upgrade,
	Noop,
	Unknown(char),
}

impl Packet {
	/// Parse one frame payload. The first character selects the outer type; for data packets the second selects the
	/// inner type.
	pub fn parse(payload: &str) -> Result<Self, FramingError> {
		let mut chars = payload.chars();
		let kind = chars.next().ok_or(FramingError::EmptyPayload)?;
		let body = chars.as_str();

		Ok(match kind {
			'0' => Self::Connect(serde_json::from_str(body).map_err(FramingError::Handshake)?),
			'1' => Self::Disconnect,
			'2' => Self::Ping,
			'3' => Self::Pong,
			'4' => Self::Data(DataPacket::parse(body)?),
			'5' => Self::Upgrade,
			'6' => Self::Noop,
			other => Self::Unknown(other),
		})
	}

	pub fn name(&self) -> &'static str {
		match self {
			Self::Connect(_) => "connect",
			Self::Disconnect => "disconnect",
			Self::Ping => "ping",
			Self::Pong => "pong",
			Self::Data(_) => "data",
			Self::Upgrade => "upgrade",
			Self::Noop => "noop",
			Self::Unknown(_) => "unknown",
		}
	}
}

impl DataPacket {
	fn parse(body: &str) -> Result<Self, FramingError> {
		let mut chars = body.chars();
		let Some(kind) = chars.next() else {
			return Ok(Self::Unknown(None));
		};

		Ok(match kind {
			'0' => Self::Connect,
			'1' => Self::Disconnect,
			'2' => Self::Event(parse_event(chars.as_str())?),
			'3' => Self::Ack,
			'4' => Self::Error,
			'5' => Self::BinaryEvent,
			'6' => Self::BinaryAck,
			other => Self::Unknown(Some(other)),
		})
	}
}

fn parse_event(text: &str) -> Result<EventPayload, FramingError> {
	let value: Value = serde_json::from_str(text).map_err(|e| FramingError::Event(e.to_string()))?;
	let payload = match value {
		Value::Array(mut items) if items.len() >= 2 => items.swap_remove(1),
		_ => return Err(FramingError::Event("expected a two-element array".to_string())),
	};

	match payload {
		Value::String(inner) => serde_json::from_str(&inner)
			.map(EventPayload)
			.map_err(|e| FramingError::Event(e.to_string())),
		other => Ok(EventPayload(other)),
	}
}

/// Decode a poll response body into packets, in wire order.
pub fn decode(raw: &str) -> impl Iterator<Item = Result<Packet, FramingError>> + '_ {
	Frames::new(raw).map(|frame| frame.and_then(Packet::parse))
}

/// Keep-alive frame.
pub fn encode_ping() -> String {
	encode_frame("2")
}

#[derive(Serialize)]
struct Attrs<'a, T: ?Sized> {
	attrs: &'a T,
}

/// Wrap a command as `42["message","{\"attrs\":<command>}"]` and frame it.
pub fn encode_command<T: Serialize + ?Sized>(command: &T) -> Result<String, FramingError> {
	let attrs = serde_json::to_string(&Attrs { attrs: command })?;
	let body = serde_json::to_string(&(MESSAGE_EVENT, attrs))?;
	Ok(encode_frame(&format!("42{body}")))
}

/// `None` encodes the keep-alive frame; `Some` encodes a command event.
pub fn encode<T: Serialize + ?Sized>(command: Option<&T>) -> Result<String, FramingError> {
	match command {
		Some(command) => encode_command(command),
		None => Ok(encode_ping()),
	}
}

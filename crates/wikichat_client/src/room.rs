#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};

use serde_json::{Map, Value, json};
use tracing::{debug, warn};
use wikichat_domain::{AsUserName, ChatMessage, Participant, Routing, ServerMeta, value_as_string, value_as_u64};
use wikichat_protocol::{EventPayload, encode_command};

use crate::connection::{
	CloseReason, ConnectSource, ConnectionHandle, ConnectionId, ConnectionSignal, RawKind, UnknownKind,
};
use crate::error::ErrorKind;
use crate::hierarchy::RoomKey;

/// Longest message accepted by `send`, in characters.
pub const MESSAGE_LIMIT: usize = 1000;

/// Domain events raised by a room.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
	Connect(ConnectSource),
	Disconnect(CloseReason),
	Error { kind: ErrorKind, detail: String },
	Unknown(UnknownKind),
	Ping,
	Pong,
	Noop,
	Raw(RawKind, String),
	Message(ChatMessage),
	Initial,
	UpdateUser(Participant),
	Join { user: Participant, rejoin: bool },
	Part { user: Participant, ghost: bool },
	Logout { user: Participant, ghost: bool },
	Leave { user: Participant, ghost: bool },
	Kick { user: String, moderator: String },
	Ban { user: String, moderator: String, seconds: u64, reason: Option<String> },
	Unban { user: String, moderator: String },
	OpenPrivate { id: u64, users: Vec<String>, opened: bool },
	ForceReconnect,
	DisableReconnect,
	LongMessage(Option<String>),
	Meta(ServerMeta),
}

impl RoomEvent {
	fn error(kind: ErrorKind, detail: impl Into<String>) -> Self {
		Self::Error {
			kind,
			detail: detail.into(),
		}
	}
}

/// Side effects a room cannot perform on its own; the owner runs them and raises the matching event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomAction {
	/// Server asked for a reconnect (`forceReconnect`).
	Reconnect,
	/// Server announced a private room (`openPrivateRoom`).
	OpenPrivate { id: u64, users: Vec<String> },
}

#[derive(Debug, Default)]
pub struct RoomOutput {
	pub events: Vec<RoomEvent>,
	pub actions: Vec<RoomAction>,
}

/// Chat event names the room understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChatEventKind {
	Initial,
	Message,
	UpdateUser,
	Join,
	Part,
	Logout,
	Kick,
	Ban,
	OpenPrivateRoom,
	ForceReconnect,
	DisableReconnect,
	LongMessage,
	Meta,
}

impl ChatEventKind {
	fn from_name(name: &str) -> Option<Self> {
		Some(match name {
			"initial" => Self::Initial,
			"chat:add" | "message" => Self::Message,
			"updateUser" => Self::UpdateUser,
			"join" => Self::Join,
			"part" => Self::Part,
			"logout" => Self::Logout,
			"kick" => Self::Kick,
			"ban" => Self::Ban,
			"openPrivateRoom" => Self::OpenPrivateRoom,
			"forceReconnect" => Self::ForceReconnect,
			"disableReconnect" => Self::DisableReconnect,
			"longMessage" => Self::LongMessage,
			"meta" => Self::Meta,
			_ => return None,
		})
	}
}

/// Ban length: seconds, or text such as `"2 days"` or `"a year"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
	Seconds(u64),
	Text(String),
}

impl From<u64> for Expiry {
	fn from(v: u64) -> Self {
		Self::Seconds(v)
	}
}

impl From<&str> for Expiry {
	fn from(v: &str) -> Self {
		Self::Text(v.to_string())
	}
}

impl From<String> for Expiry {
	fn from(v: String) -> Self {
		Self::Text(v)
	}
}

fn unit_seconds(unit: &str) -> Option<u64> {
	Some(match unit {
		"second" => 1,
		"minute" => 60,
		"hour" => 60 * 60,
		"day" => 60 * 60 * 24,
		"month" => 60 * 60 * 24 * 30,
		"year" => 60 * 60 * 24 * 365,
		_ => return None,
	})
}

/// Normalise a ban length to seconds. Text is `<n|a|an> <unit>[s]`, case-insensitive.
pub fn parse_expiry(expiry: &Expiry) -> Option<u64> {
	let text = match expiry {
		Expiry::Seconds(secs) => return Some(*secs),
		Expiry::Text(text) => text.trim().to_ascii_lowercase(),
	};
	if let Ok(secs) = text.parse::<u64>() {
		return Some(secs);
	}

	let digits = text.bytes().take_while(u8::is_ascii_digit).count();
	let (count, rest) = if digits > 0 {
		(text[..digits].parse::<u64>().ok()?, &text[digits..])
	} else if let Some(rest) = text.strip_prefix("an").filter(|r| r.starts_with(char::is_whitespace)) {
		(1, rest)
	} else if let Some(rest) = text.strip_prefix('a').filter(|r| r.starts_with(char::is_whitespace)) {
		(1, rest)
	} else {
		return None;
	};

	let unit = rest.trim_start().trim_end_matches('s');
	count.checked_mul(unit_seconds(unit)?)
}

/// One chat session: a wiki's main room or a private room under it.
#[derive(Debug)]
pub struct Room {
	key: RoomKey,
	routing: Option<Routing>,
	user: Option<Participant>,
	users: HashMap<String, Participant>,
	user_count: usize,
	connected: bool,
	initialized: bool,
	close_reason: Option<CloseReason>,
	server: Option<ServerMeta>,
	private_users: Vec<String>,
	private_rooms: BTreeSet<u64>,
	connection: Option<ConnectionHandle>,
}

impl Room {
	/// A main room; routing and identity arrive later through `resolve`.
	pub fn new_main(domain: impl Into<String>) -> Self {
		Self::with_key(RoomKey::Main(domain.into()))
	}

	/// A private room inheriting the parent's endpoint and identity.
	pub(crate) fn new_private(parent: &Room, id: u64, users: Vec<String>) -> Option<Self> {
		let routing = parent.routing.as_ref()?.for_room(id);
		let user = parent.user.clone()?;
		let mut room = Self::with_key(RoomKey::Private {
			domain: parent.domain().to_string(),
			id,
		});
		room.routing = Some(routing);
		room.user = Some(user);
		room.private_users = users;
		Some(room)
	}

	fn with_key(key: RoomKey) -> Self {
		Self {
			key,
			routing: None,
			user: None,
			users: HashMap::new(),
			user_count: 0,
			connected: false,
			initialized: false,
			close_reason: None,
			server: None,
			private_users: Vec::new(),
			private_rooms: BTreeSet::new(),
			connection: None,
		}
	}

	pub fn key(&self) -> &RoomKey {
		&self.key
	}

	pub fn domain(&self) -> &str {
		self.key.domain()
	}

	/// Numeric chat room id, once resolved.
	pub fn id(&self) -> Option<u64> {
		self.routing.as_ref().map(|r| r.room_id)
	}

	pub fn routing(&self) -> Option<&Routing> {
		self.routing.as_ref()
	}

	/// The authenticated participant.
	pub fn user(&self) -> Option<&Participant> {
		self.user.as_ref()
	}

	pub fn users(&self) -> &HashMap<String, Participant> {
		&self.users
	}

	pub fn participant(&self, name: &str) -> Option<&Participant> {
		self.users.get(name)
	}

	/// Participant count; tracked apart from the roster size.
	pub fn user_count(&self) -> usize {
		self.user_count
	}

	pub fn private_users(&self) -> &[String] {
		&self.private_users
	}

	pub fn connected(&self) -> bool {
		self.connected
	}

	pub fn initialized(&self) -> bool {
		self.initialized
	}

	pub fn close_reason(&self) -> Option<CloseReason> {
		self.close_reason
	}

	pub fn server(&self) -> Option<&ServerMeta> {
		self.server.as_ref()
	}

	pub fn parent(&self) -> Option<RoomKey> {
		self.key.parent()
	}

	/// Ids of the private rooms registered under this room.
	pub fn private_rooms(&self) -> &BTreeSet<u64> {
		&self.private_rooms
	}

	pub fn connection_id(&self) -> Option<ConnectionId> {
		self.connection.as_ref().map(ConnectionHandle::id)
	}

	pub(crate) fn private_rooms_mut(&mut self) -> &mut BTreeSet<u64> {
		&mut self.private_rooms
	}

	pub(crate) fn resolve(&mut self, routing: Routing, user: Participant) {
		self.routing = Some(routing);
		self.user = Some(user);
	}

	pub(crate) fn attach(&mut self, handle: ConnectionHandle) {
		self.connection = Some(handle);
	}

	/// Close the owned connection now. The room is disconnected before this returns.
	pub(crate) fn close_connection(&mut self, reason: CloseReason) -> Option<RoomEvent> {
		let handle = self.connection.take()?;
		handle.close(reason);
		Some(self.mark_closed(reason))
	}

	fn mark_closed(&mut self, reason: CloseReason) -> RoomEvent {
		self.connected = false;
		self.initialized = false;
		self.close_reason = Some(reason);
		RoomEvent::Disconnect(reason)
	}

	/// Apply one connection signal.
	pub fn handle_signal(&mut self, signal: ConnectionSignal) -> RoomOutput {
		let mut out = RoomOutput::default();
		match signal {
			ConnectionSignal::Connect(source) => {
				self.connected = true;
				self.close_reason = None;
				if source == ConnectSource::Data {
					self.command("initquery", Map::new());
				}
				out.events.push(RoomEvent::Connect(source));
			}
			ConnectionSignal::Close(reason) => {
				self.connection = None;
				out.events.push(self.mark_closed(reason));
			}
			ConnectionSignal::Error { kind, detail } => out.events.push(RoomEvent::Error { kind, detail }),
			ConnectionSignal::Unknown(kind) => out.events.push(RoomEvent::Unknown(kind)),
			ConnectionSignal::Ping => out.events.push(RoomEvent::Ping),
			ConnectionSignal::Pong => out.events.push(RoomEvent::Pong),
			ConnectionSignal::Noop => out.events.push(RoomEvent::Noop),
			ConnectionSignal::Raw(kind, text) => out.events.push(RoomEvent::Raw(kind, text)),
			ConnectionSignal::Event(payload) => self.handle_event(&payload, &mut out),
		}
		out
	}

	fn handle_event(&mut self, payload: &EventPayload, out: &mut RoomOutput) {
		let name = payload.name().unwrap_or_default();
		let Some(kind) = ChatEventKind::from_name(name) else {
			out.events.push(RoomEvent::Unknown(UnknownKind::ChatEvent(name.to_string())));
			return;
		};
		let data = match payload.data() {
			Ok(data) => data,
			Err(e) => {
				out.events.push(RoomEvent::error(ErrorKind::DataFormat, format!("{name}: {e}")));
				return;
			}
		};
		debug!(room = %self.key, event = name, "chat event");

		match kind {
			ChatEventKind::Initial => self.on_initial(&data, out),
			ChatEventKind::Message => Self::on_message(&data, out),
			ChatEventKind::UpdateUser => {
				if let Some((user, _)) = self.upsert(&data, out) {
					out.events.push(RoomEvent::UpdateUser(user));
				}
			}
			ChatEventKind::Join => {
				if let Some((user, rejoin)) = self.upsert(&data, out) {
					out.events.push(RoomEvent::Join { user, rejoin });
				}
			}
			ChatEventKind::Part => {
				if let Some((user, ghost)) = self.remove(&data, out) {
					out.events.push(RoomEvent::Part {
						user: user.clone(),
						ghost,
					});
					out.events.push(RoomEvent::Leave { user, ghost });
				}
			}
			ChatEventKind::Logout => {
				if let Some((user, ghost)) = self.remove(&data, out) {
					out.events.push(RoomEvent::Logout {
						user: user.clone(),
						ghost,
					});
					out.events.push(RoomEvent::Leave { user, ghost });
				}
			}
			ChatEventKind::Kick => {
				let attrs = attrs_of(&data);
				out.events.push(RoomEvent::Kick {
					user: string_field(attrs, "kickedUserName"),
					moderator: string_field(attrs, "moderatorName"),
				});
			}
			ChatEventKind::Ban => {
				let attrs = attrs_of(&data);
				let user = string_field(attrs, "kickedUserName");
				let moderator = string_field(attrs, "moderatorName");
				let seconds = attrs.get("time").and_then(value_as_u64).unwrap_or(0);
				if seconds == 0 {
					out.events.push(RoomEvent::Unban { user, moderator });
				} else {
					out.events.push(RoomEvent::Ban {
						user,
						moderator,
						seconds,
						reason: attrs.get("reason").and_then(value_as_string),
					});
				}
			}
			ChatEventKind::OpenPrivateRoom => {
				let attrs = attrs_of(&data);
				let Some(id) = attrs.get("roomId").and_then(value_as_u64) else {
					out.events.push(RoomEvent::error(ErrorKind::DataFormat, "openPrivateRoom without roomId"));
					return;
				};
				let users = attrs
					.get("users")
					.and_then(Value::as_array)
					.map(|list| list.iter().filter_map(value_as_string).collect())
					.unwrap_or_default();
				out.actions.push(RoomAction::OpenPrivate { id, users });
			}
			ChatEventKind::ForceReconnect => out.actions.push(RoomAction::Reconnect),
			ChatEventKind::DisableReconnect => out.events.push(RoomEvent::DisableReconnect),
			ChatEventKind::LongMessage => {
				out.events
					.push(RoomEvent::LongMessage(data.get("user").and_then(value_as_string)));
			}
			ChatEventKind::Meta => {
				let meta = ServerMeta::from_chat(&data);
				self.server = Some(meta.clone());
				out.events.push(RoomEvent::Meta(meta));
			}
		}
	}

	fn on_initial(&mut self, data: &Value, out: &mut RoomOutput) {
		let collections = data.get("collections");
		let models = |name: &str| {
			collections
				.and_then(|c| c.get(name))
				.and_then(|c| c.get("models"))
				.and_then(Value::as_array)
				.cloned()
				.unwrap_or_default()
		};

		self.users.clear();
		for model in models("users") {
			match Participant::from_chat(&model) {
				Ok(user) => {
					self.users.insert(user.name.clone(), user);
				}
				Err(e) => warn!(room = %self.key, error = %e, "skipping malformed roster entry"),
			}
		}
		self.user_count = self.users.len();

		for chat in models("chats") {
			Self::on_message(&chat, out);
		}
		out.events.push(RoomEvent::Initial);
		self.initialized = true;
	}

	fn on_message(data: &Value, out: &mut RoomOutput) {
		match ChatMessage::from_chat(data) {
			Ok(message) => out.events.push(RoomEvent::Message(message)),
			Err(e) => out.events.push(RoomEvent::error(ErrorKind::DataFormat, format!("message: {e}"))),
		}
	}

	/// Insert or replace a participant. Returns it with whether the name was already present.
	fn upsert(&mut self, data: &Value, out: &mut RoomOutput) -> Option<(Participant, bool)> {
		let user = match Participant::from_chat(data) {
			Ok(user) => user,
			Err(e) => {
				out.events.push(RoomEvent::error(ErrorKind::DataFormat, format!("user: {e}")));
				return None;
			}
		};
		let existed = self.users.insert(user.name.clone(), user.clone()).is_some();
		if !existed {
			self.user_count += 1;
		}
		Some((user, existed))
	}

	/// Remove by the payload's name. Returns the participant and whether this was a ghost leave.
	fn remove(&mut self, data: &Value, out: &mut RoomOutput) -> Option<(Participant, bool)> {
		let name = attrs_of(data)
			.get("name")
			.or_else(|| data.get("name"))
			.and_then(value_as_string);

		if let Some(user) = name.as_deref().and_then(|n| self.users.remove(n)) {
			self.user_count = self.user_count.saturating_sub(1);
			return Some((user, false));
		}

		match Participant::from_chat(data) {
			Ok(user) => Some((user, true)),
			Err(e) => {
				out.events.push(RoomEvent::error(ErrorKind::DataFormat, format!("user: {e}")));
				None
			}
		}
	}

	fn post(&self, attrs: &Value) -> bool {
		if !self.connected {
			return false;
		}
		let Some(connection) = &self.connection else {
			return false;
		};
		match encode_command(attrs) {
			Ok(frame) => connection.post(frame),
			Err(e) => {
				warn!(room = %self.key, error = %e, "failed to encode command");
				false
			}
		}
	}

	/// Post `{msgType: "command", command, ...args}`. False when not connected.
	pub fn command(&self, command: &str, args: Map<String, Value>) -> bool {
		let mut attrs = Map::new();
		attrs.insert("msgType".to_string(), Value::from("command"));
		attrs.insert("command".to_string(), Value::from(command));
		attrs.extend(args);
		self.post(&Value::Object(attrs))
	}

	/// Trimmed message text if it may be sent now.
	pub(crate) fn sendable_text(&self, text: &str) -> Option<String> {
		if !self.connected {
			return None;
		}
		let text = text.trim();
		let len = text.chars().count();
		(len > 0 && len <= MESSAGE_LIMIT).then(|| text.to_string())
	}

	pub(crate) fn post_chat(&self, text: &str) -> bool {
		let Some(user) = &self.user else {
			return false;
		};
		self.post(&json!({
			"msgType": "chat",
			"text": text,
			"name": user.name,
		}))
	}

	fn can_moderate(&self) -> bool {
		self.user.as_ref().is_some_and(Participant::can_kick_ban)
	}

	pub fn kick(&self, user: impl AsUserName) -> bool {
		let Some(name) = user.user_name() else {
			return false;
		};
		if !self.can_moderate() {
			return false;
		}
		self.command("kick", args([("userToKick", Value::from(name))]))
	}

	/// Ban for `length`; zero or unparseable lengths are rejected.
	pub fn ban(&self, user: impl AsUserName, length: impl Into<Expiry>, reason: Option<&str>) -> bool {
		match parse_expiry(&length.into()) {
			Some(seconds) if seconds > 0 => self.send_ban(user, seconds, reason),
			_ => false,
		}
	}

	/// A ban of length zero.
	pub fn unban(&self, user: impl AsUserName, reason: Option<&str>) -> bool {
		self.send_ban(user, 0, reason)
	}

	fn send_ban(&self, user: impl AsUserName, seconds: u64, reason: Option<&str>) -> bool {
		let Some(name) = user.user_name() else {
			return false;
		};
		if !self.can_moderate() {
			return false;
		}
		self.command(
			"ban",
			args([
				("userToBan", Value::from(name)),
				("reason", Value::from(reason.unwrap_or_default())),
				("time", Value::from(seconds)),
			]),
		)
	}

	pub fn set_status(&self, state: &str, message: &str) -> bool {
		self.command(
			"setstatus",
			args([("statusState", Value::from(state)), ("statusMessage", Value::from(message))]),
		)
	}

	pub(crate) fn logout(&self) -> bool {
		self.command("logout", Map::new())
	}
}

pub(crate) fn args<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
	pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn attrs_of(data: &Value) -> &Value {
	match data.get("attrs") {
		Some(attrs) if attrs.is_object() => attrs,
		_ => data,
	}
}

fn string_field(data: &Value, key: &str) -> String {
	data.get(key).and_then(value_as_string).unwrap_or_default()
}

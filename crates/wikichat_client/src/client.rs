#![forbid(unsafe_code)]

//! Client orchestrator.
//!
//! The [`Client`] owns every room, maps connection ids back to rooms, and applies connection signals and lookup
//! completions one at a time from [`Client::next_event`]. Only the site lookups and the connection tasks run
//! concurrently; all room state is mutated from this single owner.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wikichat_domain::{AsUserName, Routing, SecretString};

use crate::config::ClientConfig;
use crate::connection::{
	CloseReason, ConnectionEnvelope, ConnectionId, ConnectionSignal, SignalRx, SignalTx, spawn_connection,
};
use crate::error::{ClientError, ErrorKind};
use crate::hierarchy::{OpenPrivatePlan, RoomKey, RoomTable};
use crate::room::{Room, RoomAction, RoomEvent, args};
use crate::site::{BlockList, ChatEndpoint, SiteApi, UserInfo, WikiaSite};
use crate::transport::{HttpTransport, Transport};

/// Everything a client reports, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
	/// Login and block lists are done; auto-join rooms were requested.
	Init,
	Joined(RoomKey),
	Left(RoomKey),
	Block(String),
	Unblock(String),
	Error {
		room: Option<RoomKey>,
		kind: ErrorKind,
		detail: String,
	},
	Room {
		room: RoomKey,
		event: RoomEvent,
	},
}

/// Results of background lookups, applied in arrival order.
enum Completion {
	Resolved {
		domain: String,
		endpoint: anyhow::Result<ChatEndpoint>,
		info: anyhow::Result<UserInfo>,
	},
	PrivateRoomId {
		parent: RoomKey,
		users: Vec<String>,
		id: anyhow::Result<u64>,
	},
	Block {
		user: String,
		unblock: bool,
		result: anyhow::Result<()>,
	},
}

pub struct Client {
	site: Arc<dyn SiteApi>,
	transport: Arc<dyn Transport>,
	username: String,
	rooms: RoomTable,
	connections: HashMap<ConnectionId, RoomKey>,
	next_connection: u64,
	blocks: BlockList,
	signal_tx: SignalTx,
	signal_rx: SignalRx,
	completion_tx: mpsc::UnboundedSender<Completion>,
	completion_rx: mpsc::UnboundedReceiver<Completion>,
	events: VecDeque<ClientEvent>,
}

impl Client {
	/// Build a client over existing collaborators. Nothing is requested until rooms are joined.
	pub fn new(site: Arc<dyn SiteApi>, transport: Arc<dyn Transport>, username: impl Into<String>) -> Self {
		let (signal_tx, signal_rx) = mpsc::unbounded_channel();
		let (completion_tx, completion_rx) = mpsc::unbounded_channel();
		Self {
			site,
			transport,
			username: username.into(),
			rooms: RoomTable::new(),
			connections: HashMap::new(),
			next_connection: 1,
			blocks: BlockList::default(),
			signal_tx,
			signal_rx,
			completion_tx,
			completion_rx,
			events: VecDeque::new(),
		}
	}

	/// Log in, load block lists, and join the configured rooms.
	pub async fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
		config.validate()?;
		let settings = config.site.clone();

		let anonymous = HttpTransport::new(&settings.user_agent, &settings.base_domain, None)?;
		let token = WikiaSite::new(Arc::new(anonymous), settings.clone())
			.login(&config.username, &config.password)
			.await
			.map_err(|e| ClientError::Login(format!("{e:#}")))?;
		info!(user = %config.username, "logged in");

		let transport: Arc<dyn Transport> =
			Arc::new(HttpTransport::new(&settings.user_agent, &settings.base_domain, Some(&token))?);
		let site = Arc::new(WikiaSite::new(Arc::clone(&transport), settings));
		let mut client = Self::new(site, transport, config.username.clone());

		client.refresh_blocks().await;
		for domain in &config.auto_join {
			if let Err(e) = client.join(domain) {
				warn!(domain = %domain, error = %e, "skipping auto-join");
			}
		}
		client.events.push_back(ClientEvent::Init);
		Ok(client)
	}

	pub fn username(&self) -> &str {
		&self.username
	}

	pub fn blocks(&self) -> &BlockList {
		&self.blocks
	}

	pub fn room(&self, key: &RoomKey) -> Option<&Room> {
		self.rooms.get(key)
	}

	/// Main rooms, sorted by domain.
	pub fn rooms(&self) -> impl Iterator<Item = &Room> + '_ {
		self.rooms.main_keys().into_iter().filter_map(move |key| self.rooms.get(&key))
	}

	/// Reload the block lists; a failure is reported as an event and keeps the old lists.
	pub async fn refresh_blocks(&mut self) {
		match self.site.private_blocks().await {
			Ok(blocks) => {
				debug!(blocked = blocks.blocked.len(), blocked_by = blocks.blocked_by.len(), "block lists loaded");
				self.blocks = blocks;
			}
			Err(e) => self.error(None, ErrorKind::Blocks, format!("{e:#}")),
		}
	}

	/// Start joining `domain`'s chat. The connection opens once routing and user info have both resolved.
	pub fn join(&mut self, domain: &str) -> Result<RoomKey, ClientError> {
		let domain = domain.trim();
		if domain.is_empty() {
			return Err(ClientError::Config("empty domain".to_string()));
		}
		let key = RoomKey::main(domain);
		if self.rooms.contains(&key) {
			return Err(ClientError::AlreadyJoined(domain.to_string()));
		}
		self.rooms.insert(Room::new_main(domain));

		let site = Arc::clone(&self.site);
		let tx = self.completion_tx.clone();
		let domain = domain.to_string();
		tokio::spawn(async move {
			let (endpoint, info) = tokio::join!(site.chat_endpoint(&domain), site.user_info(&domain));
			let _ = tx.send(Completion::Resolved { domain, endpoint, info });
		});

		info!(room = %key, "joining");
		self.events.push_back(ClientEvent::Joined(key.clone()));
		Ok(key)
	}

	/// Kill and forget `domain`'s room and its private rooms.
	pub fn leave(&mut self, domain: &str) -> Result<(), ClientError> {
		let key = RoomKey::main(domain.trim());
		if !self.rooms.contains(&key) {
			return Err(ClientError::NotJoined(domain.trim().to_string()));
		}
		self.kill_and_remove(&key);
		Ok(())
	}

	/// Leave every joined room.
	pub fn kill_all(&mut self) {
		for key in self.rooms.main_keys() {
			self.kill_and_remove(&key);
		}
	}

	fn kill_and_remove(&mut self, key: &RoomKey) {
		let mut out = Vec::new();
		self.rooms.kill(key, &mut out);
		self.push_room_events(out);
		self.rooms.remove(key);
		self.connections.retain(|_, k| k.domain() != key.domain());
		info!(room = %key, "left");
		self.events.push_back(ClientEvent::Left(key.clone()));
	}

	/// Kill a single private room.
	pub fn leave_private(&mut self, key: &RoomKey) -> bool {
		if !key.is_private() || !self.rooms.contains(key) {
			return false;
		}
		let mut out = Vec::new();
		self.rooms.kill(key, &mut out);
		self.push_room_events(out);
		true
	}

	/// Send a chat message. A private room also tells its parent the conversation is live.
	pub fn send(&self, key: &RoomKey, text: &str) -> bool {
		let Some(room) = self.rooms.get(key) else {
			return false;
		};
		let Some(text) = room.sendable_text(text) else {
			return false;
		};

		if let (Some(parent_key), Some(id)) = (key.parent(), key.private_id())
			&& let Some(parent) = self.rooms.get(&parent_key)
		{
			let users = Value::from(room.private_users().to_vec());
			parent.command("openprivate", args([("roomId", Value::from(id)), ("users", users)]));
		}
		room.post_chat(&text)
	}

	/// Open a private room with `users` from any room of a wiki. Without an `id`, one is looked up first.
	pub fn open_private<U: AsUserName>(&mut self, from: &RoomKey, users: &[U], id: Option<u64>) -> bool {
		match self.rooms.plan_open_private(from, users, id, &self.blocks) {
			Ok(OpenPrivatePlan::Create { parent, id, users }) => self.create_private(&parent, id, users),
			Ok(OpenPrivatePlan::Lookup { parent, users }) => {
				let token = self.token_for(&parent);
				let site = Arc::clone(&self.site);
				let tx = self.completion_tx.clone();
				tokio::spawn(async move {
					let id = site.private_room_id(parent.domain(), &users, token.as_ref()).await;
					let _ = tx.send(Completion::PrivateRoomId { parent, users, id });
				});
				true
			}
			Err(e) => {
				debug!(room = %from, error = %e, "private room not opened");
				false
			}
		}
	}

	fn create_private(&mut self, parent: &RoomKey, id: u64, users: Vec<String>) -> bool {
		match self.rooms.create_private(parent, id, users) {
			Ok(key) => self.open_connection(&key),
			Err(e) => {
				debug!(room = %parent, error = %e, "private room not created");
				false
			}
		}
	}

	/// Close the room's connection with reason `reconnect` and open a fresh one on the same routing.
	pub fn reconnect(&mut self, key: &RoomKey) -> bool {
		let Some(room) = self.rooms.get_mut(key) else {
			return false;
		};
		if room.routing().is_none() {
			return false;
		}
		if let Some(event) = room.close_connection(CloseReason::Reconnect) {
			self.push_room_event(key, event);
		}
		self.open_connection(key)
	}

	/// Block `user` from private messaging. The block list changes once the site confirms.
	pub fn block(&mut self, user: impl AsUserName, room: &RoomKey) -> bool {
		self.set_block(user, room, false)
	}

	pub fn unblock(&mut self, user: impl AsUserName, room: &RoomKey) -> bool {
		self.set_block(user, room, true)
	}

	fn set_block(&mut self, user: impl AsUserName, room: &RoomKey, unblock: bool) -> bool {
		let Some(name) = user.user_name().map(str::to_string) else {
			return false;
		};
		if !self.rooms.contains(room) || self.blocks.is_blocked(&name) == !unblock {
			return false;
		}

		let token = self.token_for(room);
		let site = Arc::clone(&self.site);
		let tx = self.completion_tx.clone();
		tokio::spawn(async move {
			let result = site.set_block(&name, unblock, token.as_ref()).await;
			let _ = tx.send(Completion::Block {
				user: name,
				unblock,
				result,
			});
		});
		true
	}

	fn token_for(&self, key: &RoomKey) -> Option<SecretString> {
		self.rooms
			.get(key)
			.and_then(Room::user)
			.and_then(|user| user.token.clone())
	}

	/// Next client event, applying connection signals and lookup results as they arrive.
	pub async fn next_event(&mut self) -> Option<ClientEvent> {
		loop {
			if let Some(event) = self.events.pop_front() {
				return Some(event);
			}
			tokio::select! {
				Some(envelope) = self.signal_rx.recv() => self.handle_envelope(envelope),
				Some(completion) = self.completion_rx.recv() => self.handle_completion(completion),
				else => return None,
			}
		}
	}

	fn open_connection(&mut self, key: &RoomKey) -> bool {
		let id = ConnectionId(self.next_connection);
		let Some(room) = self.rooms.get_mut(key) else {
			return false;
		};
		let (Some(routing), Some(user)) = (room.routing(), room.user()) else {
			return false;
		};
		self.next_connection += 1;

		let handle = spawn_connection(
			id,
			routing,
			&user.name,
			Arc::clone(&self.transport),
			self.signal_tx.clone(),
		);
		debug!(room = %key, connection = %id, "connection opened");
		room.attach(handle);
		self.connections.insert(id, key.clone());
		true
	}

	fn handle_envelope(&mut self, envelope: ConnectionEnvelope) {
		let ConnectionEnvelope { connection, signal } = envelope;
		let Some(key) = self.connections.get(&connection).cloned() else {
			return;
		};
		let Some(room) = self.rooms.get_mut(&key) else {
			self.connections.remove(&connection);
			return;
		};
		if room.connection_id() != Some(connection) {
			// Replaced or closed by the owner; anything still in flight is stale.
			self.connections.remove(&connection);
			return;
		}

		let closed = matches!(signal, ConnectionSignal::Close(_));
		let output = room.handle_signal(signal);
		if closed {
			self.connections.remove(&connection);
		}
		for event in output.events {
			self.push_room_event(&key, event);
		}
		for action in output.actions {
			match action {
				RoomAction::Reconnect => {
					self.reconnect(&key);
					self.push_room_event(&key, RoomEvent::ForceReconnect);
				}
				RoomAction::OpenPrivate { id, users } => {
					let opened = self.open_private(&key, &users, Some(id));
					self.push_room_event(&key, RoomEvent::OpenPrivate { id, users, opened });
				}
			}
		}
	}

	fn handle_completion(&mut self, completion: Completion) {
		match completion {
			Completion::Resolved { domain, endpoint, info } => self.on_resolved(&domain, endpoint, info),
			Completion::PrivateRoomId { parent, users, id } => match id {
				Ok(id) => {
					if !self.open_private(&parent, &users, Some(id)) {
						debug!(room = %parent, id, "looked-up private room not opened");
					}
				}
				Err(e) => self.error(Some(parent), ErrorKind::PrivateRoomId, format!("{e:#}")),
			},
			Completion::Block { user, unblock, result } => match result {
				Ok(()) if unblock => {
					self.blocks.blocked.retain(|b| *b != user);
					self.events.push_back(ClientEvent::Unblock(user));
				}
				Ok(()) => {
					self.blocks.blocked.push(user.clone());
					self.events.push_back(ClientEvent::Block(user));
				}
				Err(e) => self.error(None, ErrorKind::Block, format!("{user}: {e:#}")),
			},
		}
	}

	fn on_resolved(&mut self, domain: &str, endpoint: anyhow::Result<ChatEndpoint>, info: anyhow::Result<UserInfo>) {
		let key = RoomKey::main(domain);
		match self.rooms.get(&key) {
			Some(room) if room.routing().is_none() => {}
			_ => {
				debug!(room = %key, "lookup result no longer needed");
				return;
			}
		}
		let endpoint = match endpoint {
			Ok(endpoint) => endpoint,
			Err(e) => return self.error(Some(key), ErrorKind::Domain, format!("{e:#}")),
		};
		let info = match info {
			Ok(info) => info,
			Err(e) => return self.error(Some(key), ErrorKind::Id, format!("{e:#}")),
		};
		if !info.user.has_right("chat") {
			return self.error(Some(key), ErrorKind::Permission, format!("{} lacks the chat right", info.user.name));
		}

		let routing = Routing {
			room_id: endpoint.room_id,
			key: endpoint.key,
			host: endpoint.host,
			port: endpoint.port,
			service_id: info.service_id,
		};
		if let Some(room) = self.rooms.get_mut(&key) {
			room.resolve(routing, info.user);
		}
		self.open_connection(&key);
	}

	fn error(&mut self, room: Option<RoomKey>, kind: ErrorKind, detail: String) {
		warn!(room = ?room.as_ref().map(ToString::to_string), %kind, detail = %detail, "client error");
		self.events.push_back(ClientEvent::Error { room, kind, detail });
	}

	fn push_room_event(&mut self, key: &RoomKey, event: RoomEvent) {
		self.events.push_back(ClientEvent::Room {
			room: key.clone(),
			event,
		});
	}

	fn push_room_events(&mut self, events: Vec<(RoomKey, RoomEvent)>) {
		for (room, event) in events {
			self.events.push_back(ClientEvent::Room { room, event });
		}
	}
}

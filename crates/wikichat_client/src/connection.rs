#![forbid(unsafe_code)]

//! Long-poll session to a chat server.
//!
//! [`Connection`] is the pure state machine: it turns one poll response into signals, frames to post and keep-alive
//! changes. [`spawn_connection`] drives it over a [`Transport`] with at most one outstanding poll.

use core::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use wikichat_domain::Routing;
use wikichat_protocol::{DataPacket, EventPayload, Frames, FramingError, Packet, encode_ping, version};

use crate::error::ErrorKind;
use crate::transport::{Query, Transport};

/// Consecutive handshake failures tolerated before the connection drops.
pub const MAX_RETRIES: u32 = 8;

/// Process-unique id of one connection instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Idle,
	Connecting,
	Connected,
	/// Closed while a poll was still in flight; its response will be discarded.
	Closing,
	Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
	Reconnect,
	Kill,
	Disconnect,
	Error,
	Upgrade,
	Drop,
}

impl CloseReason {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Reconnect => "reconnect",
			Self::Kill => "kill",
			Self::Disconnect => "disconnect",
			Self::Error => "error",
			Self::Upgrade => "upgrade",
			Self::Drop => "drop",
		}
	}
}

impl fmt::Display for CloseReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Which layer announced the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectSource {
	/// Outer handshake packet.
	Packet,
	/// Inner `connect` data packet.
	Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
	Packet,
	Data,
}

/// Things the connection saw but does not act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnknownKind {
	Ack,
	BinaryEvent,
	BinaryAck,
	PacketType(char),
	DataType(Option<char>),
	/// A posted frame was answered with something other than `ok`.
	Post(String),
	/// A chat event name with no handler.
	ChatEvent(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionSignal {
	Connect(ConnectSource),
	Close(CloseReason),
	Error { kind: ErrorKind, detail: String },
	Unknown(UnknownKind),
	Ping,
	Pong,
	Noop,
	Raw(RawKind, String),
	Event(EventPayload),
}

impl ConnectionSignal {
	fn error(kind: ErrorKind, detail: impl Into<String>) -> Self {
		Self::Error {
			kind,
			detail: detail.into(),
		}
	}
}

/// A signal tagged with the connection that produced it.
#[derive(Debug, Clone)]
pub struct ConnectionEnvelope {
	pub connection: ConnectionId,
	pub signal: ConnectionSignal,
}

pub type SignalTx = mpsc::UnboundedSender<ConnectionEnvelope>;
pub type SignalRx = mpsc::UnboundedReceiver<ConnectionEnvelope>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlive {
	Arm(Duration),
	Disarm,
}

/// Result of processing one poll response.
#[derive(Debug, Default)]
pub struct Batch {
	pub signals: Vec<ConnectionSignal>,
	/// Frames to post, in order.
	pub outgoing: Vec<String>,
	pub keepalive: Option<KeepAlive>,
	/// Whether the next poll should be issued.
	pub poll_again: bool,
}

/// Query parameters identifying a session on the long-poll endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
	pub name: String,
	pub key: String,
	pub room_id: u64,
	pub service_id: u64,
}

impl SessionParams {
	pub fn new(routing: &Routing, name: &str) -> Self {
		Self {
			name: name.to_string(),
			key: routing.key.clone(),
			room_id: routing.room_id,
			service_id: routing.service_id,
		}
	}
}

/// Per-connection session state machine.
#[derive(Debug)]
pub struct Connection {
	state: ConnectionState,
	sid: Option<String>,
	retries: u32,
	ping_interval: Option<Duration>,
	poll_in_flight: bool,
}

impl Default for Connection {
	fn default() -> Self {
		Self::new()
	}
}

impl Connection {
	pub fn new() -> Self {
		Self {
			state: ConnectionState::Idle,
			sid: None,
			retries: 0,
			ping_interval: None,
			poll_in_flight: false,
		}
	}

	pub fn state(&self) -> ConnectionState {
		self.state
	}

	pub fn sid(&self) -> Option<&str> {
		self.sid.as_deref()
	}

	pub fn retries(&self) -> u32 {
		self.retries
	}

	pub fn ping_interval(&self) -> Option<Duration> {
		self.ping_interval
	}

	pub fn is_closed(&self) -> bool {
		matches!(self.state, ConnectionState::Closing | ConnectionState::Closed)
	}

	/// Query for the next request; carries `sid` once handshaken.
	pub fn query(&self, params: &SessionParams) -> Query {
		let mut query = vec![
			("EIO".to_string(), version::ENGINE_IO.to_string()),
			("transport".to_string(), version::TRANSPORT.to_string()),
			("name".to_string(), params.name.clone()),
			("key".to_string(), params.key.clone()),
			("roomId".to_string(), params.room_id.to_string()),
			("serverId".to_string(), params.service_id.to_string()),
		];
		if let Some(sid) = &self.sid {
			query.push(("sid".to_string(), sid.clone()));
		}
		query
	}

	/// Marks a poll request as issued. Returns false once closed.
	pub fn begin_poll(&mut self) -> bool {
		if self.is_closed() {
			return false;
		}
		if self.state == ConnectionState::Idle {
			self.state = ConnectionState::Connecting;
		}
		self.poll_in_flight = true;
		true
	}

	/// Explicit close. Returns the close signal, or `None` if already closed.
	pub fn close(&mut self, reason: CloseReason) -> Option<ConnectionSignal> {
		if self.is_closed() {
			return None;
		}
		self.sid = None;
		self.ping_interval = None;
		self.state = if self.poll_in_flight {
			ConnectionState::Closing
		} else {
			ConnectionState::Closed
		};
		Some(ConnectionSignal::Close(reason))
	}

	/// The in-flight poll was abandoned after a close.
	pub fn abandon_poll(&mut self) {
		self.poll_in_flight = false;
		if self.state == ConnectionState::Closing {
			self.state = ConnectionState::Closed;
		}
	}

	/// A poll request failed at the transport level.
	pub fn handle_poll_error(&mut self, detail: &str) -> Batch {
		self.poll_in_flight = false;
		let mut batch = Batch::default();
		if self.state == ConnectionState::Closing {
			self.state = ConnectionState::Closed;
			return batch;
		}
		if self.is_closed() {
			return batch;
		}
		batch.signals.push(ConnectionSignal::error(ErrorKind::Poll, detail));
		self.close_into(&mut batch, CloseReason::Drop);
		batch
	}

	/// Process one poll response body, frame by frame in wire order.
	pub fn handle_response(&mut self, body: &str) -> Batch {
		self.poll_in_flight = false;
		let mut batch = Batch::default();
		if self.state == ConnectionState::Closing {
			// Response to a poll issued before the close.
			self.state = ConnectionState::Closed;
			return batch;
		}
		if self.is_closed() {
			return batch;
		}

		for frame in Frames::new(body) {
			let payload = match frame {
				Ok(payload) => payload,
				Err(e) => {
					batch.signals.push(ConnectionSignal::error(ErrorKind::Framing, e.to_string()));
					break;
				}
			};
			batch.signals.push(ConnectionSignal::Raw(RawKind::Packet, payload.to_string()));

			if self.handle_payload(payload, &mut batch).is_break() {
				return batch;
			}
		}

		batch.poll_again = true;
		batch
	}

	fn handle_payload(&mut self, payload: &str, batch: &mut Batch) -> std::ops::ControlFlow<()> {
		use std::ops::ControlFlow::{Break, Continue};

		let packet = Packet::parse(payload);
		if payload.starts_with('4') {
			batch.signals.push(ConnectionSignal::Raw(RawKind::Data, payload[1..].to_string()));
		}

		match packet {
			Ok(Packet::Connect(_)) | Err(FramingError::Handshake(_)) if self.sid.is_some() => {
				batch
					.signals
					.push(ConnectionSignal::error(ErrorKind::MultipleConnect, "second handshake on a live session"));
			}
			Ok(Packet::Connect(handshake)) => {
				let interval = Duration::from_millis(handshake.ping_interval.max(1));
				info!(sid = %handshake.sid, ping_interval_ms = handshake.ping_interval, "handshake complete");
				self.sid = Some(handshake.sid);
				self.retries = 0;
				self.ping_interval = Some(interval);
				self.state = ConnectionState::Connected;
				batch.keepalive = Some(KeepAlive::Arm(interval));
				batch.signals.push(ConnectionSignal::Connect(ConnectSource::Packet));
			}
			Err(FramingError::Handshake(e)) => {
				batch.signals.push(ConnectionSignal::error(ErrorKind::Json, format!("connect: {e}")));
				self.retry(batch);
				return Break(());
			}
			Ok(Packet::Disconnect) => {
				self.close_into(batch, CloseReason::Disconnect);
				return Break(());
			}
			Ok(Packet::Ping) => {
				batch.signals.push(ConnectionSignal::Ping);
				batch.outgoing.push(encode_ping());
			}
			Ok(Packet::Pong) => batch.signals.push(ConnectionSignal::Pong),
			Ok(Packet::Data(inner)) => return self.handle_data(inner, batch),
			Ok(Packet::Upgrade) => {
				self.close_into(batch, CloseReason::Upgrade);
				return Break(());
			}
			Ok(Packet::Noop) => batch.signals.push(ConnectionSignal::Noop),
			Ok(Packet::Unknown(kind)) => batch
				.signals
				.push(ConnectionSignal::Unknown(UnknownKind::PacketType(kind))),
			Err(FramingError::Event(detail)) => {
				batch.signals.push(ConnectionSignal::error(ErrorKind::Json, format!("event: {detail}")));
			}
			Err(e) => batch.signals.push(ConnectionSignal::error(ErrorKind::Framing, e.to_string())),
		}
		Continue(())
	}

	fn handle_data(&mut self, inner: DataPacket, batch: &mut Batch) -> std::ops::ControlFlow<()> {
		use std::ops::ControlFlow::{Break, Continue};

		let signal = match inner {
			DataPacket::Connect => ConnectionSignal::Connect(ConnectSource::Data),
			DataPacket::Disconnect => {
				self.close_into(batch, CloseReason::Disconnect);
				return Break(());
			}
			DataPacket::Event(event) => ConnectionSignal::Event(event),
			DataPacket::Ack => ConnectionSignal::Unknown(UnknownKind::Ack),
			DataPacket::Error => {
				self.close_into(batch, CloseReason::Error);
				return Break(());
			}
			DataPacket::BinaryEvent => ConnectionSignal::Unknown(UnknownKind::BinaryEvent),
			DataPacket::BinaryAck => ConnectionSignal::Unknown(UnknownKind::BinaryAck),
			DataPacket::Unknown(kind) => ConnectionSignal::Unknown(UnknownKind::DataType(kind)),
		};
		batch.signals.push(signal);
		Continue(())
	}

	fn retry(&mut self, batch: &mut Batch) {
		self.retries += 1;
		if self.retries >= MAX_RETRIES {
			warn!(retries = self.retries, "handshake retries exhausted");
			self.close_into(batch, CloseReason::Drop);
			return;
		}
		debug!(retries = self.retries, "retrying handshake");
		self.sid = None;
		self.ping_interval = None;
		self.state = ConnectionState::Connecting;
		batch.keepalive = Some(KeepAlive::Disarm);
		batch.poll_again = true;
	}

	fn close_into(&mut self, batch: &mut Batch, reason: CloseReason) {
		if let Some(signal) = self.close(reason) {
			batch.keepalive = Some(KeepAlive::Disarm);
			batch.signals.push(signal);
		}
		batch.poll_again = false;
	}
}

/// Commands accepted by a running connection task.
#[derive(Debug)]
pub enum ConnectionControl {
	/// Post an encoded frame.
	Post(String),
	Close(CloseReason),
}

/// Owner's handle to a running connection task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	id: ConnectionId,
	control_tx: mpsc::UnboundedSender<ConnectionControl>,
}

impl ConnectionHandle {
	pub fn new(id: ConnectionId, control_tx: mpsc::UnboundedSender<ConnectionControl>) -> Self {
		Self { id, control_tx }
	}

	pub fn id(&self) -> ConnectionId {
		self.id
	}

	/// Queue a frame for posting. False if the task has exited.
	pub fn post(&self, frame: String) -> bool {
		self.control_tx.send(ConnectionControl::Post(frame)).is_ok()
	}

	pub fn close(&self, reason: CloseReason) -> bool {
		self.control_tx.send(ConnectionControl::Close(reason)).is_ok()
	}
}

/// Start a connection task. Signals are delivered on `signals` tagged with `id`.
pub fn spawn_connection(
	id: ConnectionId,
	routing: &Routing,
	user_name: &str,
	transport: Arc<dyn Transport>,
	signals: SignalTx,
) -> ConnectionHandle {
	let (control_tx, control_rx) = mpsc::unbounded_channel();
	let driver = Driver {
		id,
		url: routing.poll_url(),
		params: SessionParams::new(routing, user_name),
		transport,
		signals,
		conn: Connection::new(),
		keepalive: None,
	};
	tokio::spawn(driver.run(control_rx));
	ConnectionHandle::new(id, control_tx)
}

struct Driver {
	id: ConnectionId,
	url: String,
	params: SessionParams,
	transport: Arc<dyn Transport>,
	signals: SignalTx,
	conn: Connection,
	keepalive: Option<Interval>,
}

impl Driver {
	async fn run(mut self, mut control_rx: mpsc::UnboundedReceiver<ConnectionControl>) {
		debug!(connection = %self.id, url = %self.url, "connection started");

		while self.conn.begin_poll() {
			let query = self.conn.query(&self.params);
			let transport = Arc::clone(&self.transport);
			let url = self.url.clone();
			let poll = async move { transport.poll(&url, &query, None).await };
			tokio::pin!(poll);

			let response = loop {
				tokio::select! {
					res = &mut poll => break res,
					ctrl = control_rx.recv() => match ctrl {
						Some(ConnectionControl::Post(frame)) => self.post(frame),
						Some(ConnectionControl::Close(reason)) => {
							if let Some(signal) = self.conn.close(reason) {
								self.emit(signal);
							}
							self.conn.abandon_poll();
							debug!(connection = %self.id, %reason, "connection closed by owner");
							return;
						}
						None => {
							debug!(connection = %self.id, "connection owner dropped");
							return;
						}
					},
					_ = next_tick(&mut self.keepalive) => self.post(encode_ping()),
				}
			};

			let batch = match response {
				Ok(body) => self.conn.handle_response(&body),
				Err(e) => {
					warn!(connection = %self.id, error = %format!("{e:#}"), "poll failed");
					self.conn.handle_poll_error(&format!("{e:#}"))
				}
			};

			for frame in batch.outgoing {
				self.post(frame);
			}
			match batch.keepalive {
				Some(KeepAlive::Arm(period)) => {
					let mut interval = tokio::time::interval_at(Instant::now() + period, period);
					interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
					self.keepalive = Some(interval);
				}
				Some(KeepAlive::Disarm) => self.keepalive = None,
				None => {}
			}
			for signal in batch.signals {
				if let ConnectionSignal::Close(reason) = &signal {
					info!(connection = %self.id, %reason, "connection closed");
				}
				self.emit(signal);
			}
			if !batch.poll_again {
				break;
			}
		}
		debug!(connection = %self.id, "connection task exiting");
	}

	fn emit(&self, signal: ConnectionSignal) {
		let _ = self.signals.send(ConnectionEnvelope {
			connection: self.id,
			signal,
		});
	}

	/// Posts run beside the poll loop; their outcome comes back as signals.
	fn post(&self, frame: String) {
		let id = self.id;
		let transport = Arc::clone(&self.transport);
		let url = self.url.clone();
		let query = self.conn.query(&self.params);
		let signals = self.signals.clone();
		tokio::spawn(async move {
			let signal = match transport.poll(&url, &query, Some(frame)).await {
				Ok(body) if body.trim().eq_ignore_ascii_case("ok") => None,
				Ok(body) => {
					debug!(connection = %id, body = %body, "unexpected post response");
					Some(ConnectionSignal::Unknown(UnknownKind::Post(body)))
				}
				Err(e) => {
					warn!(connection = %id, error = %format!("{e:#}"), "post failed");
					Some(ConnectionSignal::error(ErrorKind::Post, format!("{e:#}")))
				}
			};
			if let Some(signal) = signal {
				let _ = signals.send(ConnectionEnvelope { connection: id, signal });
			}
		});
	}
}

async fn next_tick(interval: &mut Option<Interval>) {
	match interval {
		Some(interval) => {
			interval.tick().await;
		}
		None => std::future::pending().await,
	}
}

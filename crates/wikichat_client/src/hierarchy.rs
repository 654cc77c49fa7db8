#![forbid(unsafe_code)]

use core::fmt;
use std::collections::HashMap;

use tracing::debug;
use wikichat_domain::AsUserName;

use crate::connection::CloseReason;
use crate::room::{Room, RoomEvent};
use crate::site::BlockList;

/// Identifies a room: a wiki's main room, or a private room under it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoomKey {
	Main(String),
	Private { domain: String, id: u64 },
}

impl RoomKey {
	pub fn main(domain: impl Into<String>) -> Self {
		Self::Main(domain.into())
	}

	pub fn domain(&self) -> &str {
		match self {
			Self::Main(domain) | Self::Private { domain, .. } => domain,
		}
	}

	pub fn is_private(&self) -> bool {
		matches!(self, Self::Private { .. })
	}

	pub fn private_id(&self) -> Option<u64> {
		match self {
			Self::Main(_) => None,
			Self::Private { id, .. } => Some(*id),
		}
	}

	/// Main room of the same wiki; `None` for a main room.
	pub fn parent(&self) -> Option<RoomKey> {
		match self {
			Self::Main(_) => None,
			Self::Private { domain, .. } => Some(Self::Main(domain.clone())),
		}
	}

	/// This key if it names a main room, else its parent.
	pub fn to_main(&self) -> RoomKey {
		Self::Main(self.domain().to_string())
	}
}

impl fmt::Display for RoomKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Main(domain) => f.write_str(domain),
			Self::Private { domain, id } => write!(f, "{domain}#{id}"),
		}
	}
}

/// What opening a private room needs next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenPrivatePlan {
	/// Id known: create and connect the child now.
	Create { parent: RoomKey, id: u64, users: Vec<String> },
	/// Id unknown: look it up, then plan again with the result.
	Lookup { parent: RoomKey, users: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpenPrivateError {
	#[error("no main room for {0}")]
	NoParent(String),
	#[error("main room for {0} has not resolved its endpoint yet")]
	ParentNotReady(String),
	#[error("a participant has no usable name")]
	UnresolvedUser,
	#[error("a participant is blocked")]
	Blocked,
	#[error("private room {0} is already open")]
	Duplicate(u64),
}

/// All rooms of a client, main and private, keyed by [`RoomKey`].
#[derive(Debug, Default)]
pub struct RoomTable {
	rooms: HashMap<RoomKey, Room>,
}

impl RoomTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.rooms.len()
	}

	pub fn is_empty(&self) -> bool {
		self.rooms.is_empty()
	}

	pub fn contains(&self, key: &RoomKey) -> bool {
		self.rooms.contains_key(key)
	}

	pub fn get(&self, key: &RoomKey) -> Option<&Room> {
		self.rooms.get(key)
	}

	pub fn get_mut(&mut self, key: &RoomKey) -> Option<&mut Room> {
		self.rooms.get_mut(key)
	}

	pub fn insert(&mut self, room: Room) {
		self.rooms.insert(room.key().clone(), room);
	}

	pub fn remove(&mut self, key: &RoomKey) -> Option<Room> {
		self.rooms.remove(key)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&RoomKey, &Room)> {
		self.rooms.iter()
	}

	/// Keys of the main rooms, sorted.
	pub fn main_keys(&self) -> Vec<RoomKey> {
		let mut keys: Vec<_> = self.rooms.keys().filter(|k| !k.is_private()).cloned().collect();
		keys.sort();
		keys
	}

	/// Keys of the private rooms registered under `domain`'s main room.
	pub fn children(&self, domain: &str) -> Vec<RoomKey> {
		let Some(parent) = self.rooms.get(&RoomKey::main(domain)) else {
			return Vec::new();
		};
		parent
			.private_rooms()
			.iter()
			.map(|id| RoomKey::Private {
				domain: domain.to_string(),
				id: *id,
			})
			.collect()
	}

	/// Decide how to open a private room with `users` from `from`. Requests made on a private room are handled by its
	/// main room.
	pub fn plan_open_private<U: AsUserName>(
		&self,
		from: &RoomKey,
		users: &[U],
		id: Option<u64>,
		blocks: &BlockList,
	) -> Result<OpenPrivatePlan, OpenPrivateError> {
		let parent_key = from.to_main();
		let parent = self
			.rooms
			.get(&parent_key)
			.ok_or_else(|| OpenPrivateError::NoParent(parent_key.to_string()))?;
		if parent.routing().is_none() || parent.user().is_none() {
			return Err(OpenPrivateError::ParentNotReady(parent_key.to_string()));
		}

		let mut names = Vec::with_capacity(users.len());
		for user in users {
			let name = user.user_name().ok_or(OpenPrivateError::UnresolvedUser)?;
			names.push(name.to_string());
		}
		if blocks.blocks_any(&names) {
			return Err(OpenPrivateError::Blocked);
		}

		match id {
			Some(id) if parent.private_rooms().contains(&id) => Err(OpenPrivateError::Duplicate(id)),
			Some(id) => Ok(OpenPrivatePlan::Create {
				parent: parent_key,
				id,
				users: names,
			}),
			None => Ok(OpenPrivatePlan::Lookup {
				parent: parent_key,
				users: names,
			}),
		}
	}

	/// Create a private room under `parent` and register it there. The caller connects it.
	pub fn create_private(&mut self, parent: &RoomKey, id: u64, users: Vec<String>) -> Result<RoomKey, OpenPrivateError> {
		let parent_room = self
			.rooms
			.get_mut(parent)
			.ok_or_else(|| OpenPrivateError::NoParent(parent.to_string()))?;
		if parent_room.private_rooms().contains(&id) {
			return Err(OpenPrivateError::Duplicate(id));
		}
		let room = Room::new_private(parent_room, id, users)
			.ok_or_else(|| OpenPrivateError::ParentNotReady(parent.to_string()))?;
		parent_room.private_rooms_mut().insert(id);

		let key = room.key().clone();
		debug!(room = %key, "private room created");
		self.insert(room);
		Ok(key)
	}

	/// Log out, close, and tear down a room. A main room stays in the table; its private rooms are killed too. A
	/// private room is removed and deregistered from its parent. Events are appended to `out` as they happen.
	pub fn kill(&mut self, key: &RoomKey, out: &mut Vec<(RoomKey, RoomEvent)>) {
		let Some(room) = self.rooms.get_mut(key) else {
			return;
		};
		room.logout();
		if let Some(event) = room.close_connection(CloseReason::Kill) {
			out.push((key.clone(), event));
		}

		match key {
			RoomKey::Main(domain) => {
				for child in self.children(domain) {
					self.kill(&child, out);
				}
			}
			RoomKey::Private { .. } => self.kill_private(key, out),
		}
	}

	/// Remove a private room once it is disconnected; a connected one is killed first.
	pub fn kill_private(&mut self, key: &RoomKey, out: &mut Vec<(RoomKey, RoomEvent)>) {
		let RoomKey::Private { domain, id } = key else {
			return;
		};
		let Some(room) = self.rooms.get(key) else {
			return;
		};
		if room.connected() {
			self.kill(key, out);
			return;
		}

		if let Some(parent) = self.rooms.get_mut(&RoomKey::main(domain.as_str())) {
			parent.private_rooms_mut().remove(id);
		}
		self.rooms.remove(key);
		debug!(room = %key, "private room removed");
	}
}

#[cfg(test)]
mod tests {
	use wikichat_domain::{Participant, Routing};

	use super::*;

	fn routing() -> Routing {
		Routing {
			room_id: 7,
			key: "chatkey".to_string(),
			host: "chat.example".to_string(),
			port: 80,
			service_id: 831,
		}
	}

	fn table_with_main(domain: &str) -> RoomTable {
		let mut room = Room::new_main(domain);
		room.resolve(
			routing(),
			Participant {
				name: "Bot".to_string(),
				..Participant::default()
			},
		);
		let mut table = RoomTable::new();
		table.insert(room);
		table
	}

	#[test]
	fn key_display_and_parent() {
		let main = RoomKey::main("dev");
		let private = RoomKey::Private {
			domain: "dev".to_string(),
			id: 42,
		};
		assert_eq!(main.to_string(), "dev");
		assert_eq!(private.to_string(), "dev#42");
		assert_eq!(private.parent(), Some(main.clone()));
		assert_eq!(main.parent(), None);
		assert_eq!(private.to_main(), main);
	}

	#[test]
	fn private_room_inherits_parent() {
		let mut table = table_with_main("dev");
		let key = table
			.create_private(&RoomKey::main("dev"), 42, vec!["Alice".to_string()])
			.expect("created");

		let child = table.get(&key).expect("child");
		let routing = child.routing().expect("routing");
		assert_eq!(routing.room_id, 42);
		assert_eq!(routing.host, "chat.example");
		assert_eq!(routing.service_id, 831);
		assert_eq!(child.user().map(|u| u.name.as_str()), Some("Bot"));
		assert_eq!(child.private_users(), ["Alice".to_string()]);
		assert_eq!(child.parent(), Some(RoomKey::main("dev")));
		assert!(table.get(&RoomKey::main("dev")).expect("parent").private_rooms().contains(&42));
	}

	#[test]
	fn duplicate_private_id_is_rejected_without_lookup() {
		let mut table = table_with_main("dev");
		table
			.create_private(&RoomKey::main("dev"), 42, vec!["Alice".to_string()])
			.expect("created");

		let err = table
			.plan_open_private(&RoomKey::main("dev"), &["Alice"], Some(42), &BlockList::default())
			.unwrap_err();
		assert_eq!(err, OpenPrivateError::Duplicate(42));
	}

	#[test]
	fn requests_on_a_private_room_go_to_its_parent() {
		let mut table = table_with_main("dev");
		let child = table
			.create_private(&RoomKey::main("dev"), 42, vec!["Alice".to_string()])
			.expect("created");

		let plan = table
			.plan_open_private(&child, &["Carol"], None, &BlockList::default())
			.expect("plan");
		assert_eq!(
			plan,
			OpenPrivatePlan::Lookup {
				parent: RoomKey::main("dev"),
				users: vec!["Carol".to_string()],
			}
		);
	}

	#[test]
	fn blocked_or_nameless_users_are_rejected() {
		let table = table_with_main("dev");
		let blocks = BlockList {
			blocked: Vec::new(),
			blocked_by: vec!["Grumpy".to_string()],
		};
		let err = table
			.plan_open_private(&RoomKey::main("dev"), &["Grumpy"], Some(9), &blocks)
			.unwrap_err();
		assert_eq!(err, OpenPrivateError::Blocked);

		let err = table
			.plan_open_private(&RoomKey::main("dev"), &["  "], Some(9), &BlockList::default())
			.unwrap_err();
		assert_eq!(err, OpenPrivateError::UnresolvedUser);
	}

	#[test]
	fn unresolved_parent_cannot_open_private_rooms() {
		let mut table = RoomTable::new();
		table.insert(Room::new_main("dev"));
		let err = table
			.plan_open_private(&RoomKey::main("dev"), &["Alice"], Some(1), &BlockList::default())
			.unwrap_err();
		assert_eq!(err, OpenPrivateError::ParentNotReady("dev".to_string()));
	}

	#[test]
	fn killing_main_room_removes_children() {
		let mut table = table_with_main("dev");
		let a = table
			.create_private(&RoomKey::main("dev"), 1, vec!["Alice".to_string()])
			.expect("a");
		let b = table
			.create_private(&RoomKey::main("dev"), 2, vec!["Carol".to_string()])
			.expect("b");

		let mut events = Vec::new();
		table.kill(&RoomKey::main("dev"), &mut events);

		assert!(table.contains(&RoomKey::main("dev")));
		assert!(!table.contains(&a));
		assert!(!table.contains(&b));
		assert!(table.get(&RoomKey::main("dev")).expect("main").private_rooms().is_empty());
	}
}

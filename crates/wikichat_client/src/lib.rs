#![forbid(unsafe_code)]

//! Long-poll chat client for wiki chat rooms.
//!
//! [`Client`] joins rooms by domain and reports everything through [`ClientEvent`]s. Each room talks to its chat
//! server over a [`connection`] task; private rooms hang off their wiki's main room in a [`RoomTable`].

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod hierarchy;
pub mod room;
pub mod site;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use client::{Client, ClientEvent};
pub use config::{ClientConfig, SiteSettings, default_config_path, load_client_config, load_client_config_from_path};
pub use connection::{CloseReason, ConnectSource, ConnectionId, ConnectionSignal, RawKind, UnknownKind};
pub use error::{ClientError, ErrorKind};
pub use hierarchy::{OpenPrivateError, RoomKey, RoomTable};
pub use room::{Expiry, MESSAGE_LIMIT, Room, RoomEvent, parse_expiry};
pub use site::{BlockList, ChatEndpoint, SiteApi, UserInfo, WikiaSite};
pub use transport::{HttpTransport, Transport};

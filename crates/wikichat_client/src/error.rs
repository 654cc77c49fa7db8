#![forbid(unsafe_code)]

use core::fmt;

/// Fatal errors surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	/// Missing or invalid configuration (credentials, config file).
	#[error("invalid configuration: {0}")]
	Config(String),

	#[error("already joined the chat room on {0}")]
	AlreadyJoined(String),

	#[error("chat room on {0} was not joined")]
	NotJoined(String),

	#[error("login failed: {0}")]
	Login(String),

	#[error("error: {0}")]
	Other(String),
}

impl From<anyhow::Error> for ClientError {
	fn from(e: anyhow::Error) -> Self {
		ClientError::Other(format!("{e:#}"))
	}
}

/// Operation an `error` signal is tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	/// Chat routing lookup for a domain.
	Domain,
	/// Site user-info lookup.
	Id,
	/// The user lacks the `chat` right.
	Permission,
	PrivateRoomId,
	Block,
	Blocks,
	Poll,
	Post,
	Json,
	MultipleConnect,
	DataFormat,
	Framing,
}

impl ErrorKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Domain => "domain",
			Self::Id => "id",
			Self::Permission => "permission",
			Self::PrivateRoomId => "privateRoomId",
			Self::Block => "block",
			Self::Blocks => "blocks",
			Self::Poll => "poll",
			Self::Post => "post",
			Self::Json => "json",
			Self::MultipleConnect => "multipleConnect",
			Self::DataFormat => "dataFormat",
			Self::Framing => "framing",
		}
	}
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

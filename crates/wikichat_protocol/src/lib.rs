#![forbid(unsafe_code)]

pub mod framing;
pub mod packet;

pub use framing::{DEFAULT_MAX_FRAME_SIZE, Frames, FramingError, encode_frame};
pub use packet::{
	DEFAULT_PING_INTERVAL_MS, DataPacket, EventPayload, Handshake, MESSAGE_EVENT, Packet, decode, encode, encode_command,
	encode_ping,
};

/// Long-poll endpoint constants.
pub mod version {
	/// Engine protocol revision sent as the `EIO` query parameter.
	pub const ENGINE_IO: u32 = 2;
	/// Value of the `transport` query parameter.
	pub const TRANSPORT: &str = "polling";
	/// Path of the long-poll endpoint on the chat host.
	pub const ENDPOINT_PATH: &str = "/socket.io/";
}

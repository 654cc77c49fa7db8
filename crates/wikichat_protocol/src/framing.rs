#![forbid(unsafe_code)]

use thiserror::Error;

/// Largest payload a single length prefix may announce.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024; // 2 MiB

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame has no length prefix")]
	MissingLength,

	#[error("invalid length prefix: {0:?}")]
	InvalidLength(String),

	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("frame length {0} splits a character")]
	CharBoundary(usize),

	#[error("empty packet payload")]
	EmptyPayload,

	#[error("malformed handshake: {0}")]
	Handshake(#[source] serde_json::Error),

	#[error("malformed event: {0}")]
	Event(String),

	#[error("json encode error: {0}")]
	Encode(#[from] serde_json::Error),
}

impl FramingError {
	/// Errors in the length prefix leave no way to find the next frame.
	pub fn is_fatal_to_batch(&self) -> bool {
		matches!(
			self,
			Self::MissingLength
				| Self::InvalidLength(_)
				| Self::FrameTooLarge { .. }
				| Self::InsufficientData { .. }
				| Self::CharBoundary(_)
		)
	}
}

/// Wrap a payload as `<len>:<payload>`; the length counts UTF-8 bytes.
pub fn encode_frame(payload: &str) -> String {
	let mut out = String::with_capacity(payload.len() + 8);
	out.push_str(&payload.len().to_string());
	out.push(':');
	out.push_str(payload);
	out
}

/// Iterator over the payloads of a concatenated frame batch.
///
/// Yields payloads in wire order. After a length-prefix error the iterator is exhausted, since the rest of the batch
/// cannot be located.
#[derive(Debug, Clone)]
pub struct Frames<'a> {
	rest: &'a str,
	max_frame_size: usize,
	done: bool,
}

impl<'a> Frames<'a> {
	pub fn new(raw: &'a str) -> Self {
		Self::with_max_frame_size(raw, DEFAULT_MAX_FRAME_SIZE)
	}

	pub fn with_max_frame_size(raw: &'a str, max_frame_size: usize) -> Self {
		Self {
			rest: raw,
			max_frame_size,
			done: false,
		}
	}

	/// Unconsumed input.
	pub fn remaining(&self) -> &'a str {
		self.rest
	}

	fn next_frame(&mut self) -> Result<&'a str, FramingError> {
		let colon = self.rest.find(':').ok_or(FramingError::MissingLength)?;
		let prefix = &self.rest[..colon];
		if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
			return Err(FramingError::InvalidLength(prefix.to_string()));
		}
		let len: usize = prefix
			.parse()
			.map_err(|_| FramingError::InvalidLength(prefix.to_string()))?;
		if len > self.max_frame_size {
			return Err(FramingError::FrameTooLarge {
				len,
				max: self.max_frame_size,
			});
		}

		let start = colon + 1;
		let end = start + len;
		if end > self.rest.len() {
			return Err(FramingError::InsufficientData {
				need: len,
				have: self.rest.len() - start,
			});
		}
		if !self.rest.is_char_boundary(end) {
			return Err(FramingError::CharBoundary(len));
		}

		let payload = &self.rest[start..end];
		self.rest = &self.rest[end..];
		Ok(payload)
	}
}

impl<'a> Iterator for Frames<'a> {
	type Item = Result<&'a str, FramingError>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.done || self.rest.is_empty() {
			return None;
		}
		let item = self.next_frame();
		if item.is_err() {
			self.done = true;
		}
		Some(item)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn splits_concatenated_frames() {
		let frames: Vec<_> = Frames::new("1:23:abc0:").collect::<Result<_, _>>().expect("frames");
		assert_eq!(frames, vec!["2", "abc", ""]);
	}

	#[test]
	fn length_counts_bytes() {
		let framed = encode_frame("héllo");
		assert_eq!(framed, "6:héllo");
		let frames: Vec<_> = Frames::new(&framed).collect::<Result<_, _>>().expect("frames");
		assert_eq!(frames, vec!["héllo"]);
	}

	#[test]
	fn missing_prefix_stops_batch() {
		let mut frames = Frames::new("1:2garbage");
		assert_eq!(frames.next().expect("first").expect("ok"), "2");
		match frames.next().expect("second") {
			Err(FramingError::MissingLength) => {}
			other => panic!("unexpected item: {other:?}"),
		}
		assert!(frames.next().is_none());
	}

	#[test]
	fn non_numeric_prefix() {
		let err = Frames::new("x1:2").next().expect("item").unwrap_err();
		match err {
			FramingError::InvalidLength(prefix) => assert_eq!(prefix, "x1"),
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn truncated_payload() {
		let err = Frames::new("10:abc").next().expect("item").unwrap_err();
		match err {
			FramingError::InsufficientData { need, have } => {
				assert_eq!(need, 10);
				assert_eq!(have, 3);
			}
			other => panic!("unexpected error: {other:?}"),
		}
		assert!(err.is_fatal_to_batch());
	}

	#[test]
	fn rejects_too_large_prefix() {
		let err = Frames::with_max_frame_size("33:abc", 32).next().expect("item").unwrap_err();
		match err {
			FramingError::FrameTooLarge { len, max } => assert!(len > max),
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn split_character_is_rejected() {
		// "é" is two bytes; a length of 1 cuts it in half.
		let err = Frames::new("1:é").next().expect("item").unwrap_err();
		match err {
			FramingError::CharBoundary(1) => {}
			other => panic!("unexpected error: {other:?}"),
		}
	}
}

//! Framing for the streaming decoder.

use crate::{packets::DecodeError, wire};
use bytes::Bytes;
use std::io;

/// A complete packet frame: the fixed-header byte and the packet payload,
/// with the remaining-length field already consumed.
#[derive(Debug)]
pub struct Frame {
	pub header: u8,
	pub payload: Bytes,
}

impl Frame {
	/// Checks whether `src` starts with a complete frame.
	///
	/// Returns the total encoded length of the frame on success so the
	/// caller can split it off its read buffer. Returns
	/// [`DecodeError::Incomplete`] if more bytes are needed.
	pub fn check(src: &mut io::Cursor<&[u8]>) -> Result<usize, DecodeError> {
		let header = wire::read_u8(src)?;
		if header == 0 || header & 0xf0 == 0xf0 {
			return Err(DecodeError::InvalidHeader);
		}

		let length = wire::read_remaining_length(src)?;
		wire::read_slice(src, length)?;

		Ok(src.position() as usize)
	}

	/// Splits a frame off a buffer previously validated with [`check`].
	///
	/// `buffer` must hold exactly one complete frame.
	///
	/// [`check`]: Self::check
	pub fn parse(mut buffer: Bytes) -> Result<Self, DecodeError> {
		let mut cursor = io::Cursor::new(&buffer[..]);
		let header = wire::read_u8(&mut cursor)?;
		let length = wire::read_remaining_length(&mut cursor)?;

		let header_len = cursor.position() as usize;
		if buffer.len() - header_len != length {
			return Err(DecodeError::MalformedLength);
		}

		let payload = buffer.split_off(header_len);
		Ok(Self { header, payload })
	}
}

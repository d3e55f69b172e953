use crate::Error;
use bytes::{Buf, BytesMut};
use std::io;
use tether_protocol::{frame::Frame, packets::DecodeError, Packet};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// The byte streams a channel can run over.
pub(crate) trait AsyncReadWrite: AsyncRead + AsyncWrite + Send {}
impl<T: AsyncRead + AsyncWrite + Send> AsyncReadWrite for T {}

/// A packet-oriented view of the transport stream: buffered streaming
/// decode on the way in, eager writes on the way out.
pub(crate) struct MqttStream {
	stream: Box<dyn AsyncReadWrite + Unpin>,
	read_buffer: BytesMut,
}

impl MqttStream {
	pub fn new(stream: Box<dyn AsyncReadWrite + Unpin>, capacity: usize) -> Self {
		Self {
			stream,
			read_buffer: BytesMut::with_capacity(capacity),
		}
	}

	/// Reads the next packet. `Ok(None)` is a clean end-of-stream.
	pub async fn read_packet(&mut self) -> Result<Option<Packet>, Error> {
		loop {
			if let Some(frame) = self.next_frame()? {
				let packet = Packet::decode(&frame)
					.map_err(|error| Error::ProtocolViolation(error.to_string()))?;
				return Ok(Some(packet));
			}

			if 0 == self.stream.read_buf(&mut self.read_buffer).await? {
				if self.read_buffer.is_empty() {
					return Ok(None);
				}
				return Err(Error::from(io::Error::new(
					io::ErrorKind::ConnectionReset,
					"stream closed mid-packet",
				)));
			}
		}
	}

	fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
		let mut cursor = io::Cursor::new(&self.read_buffer[..]);
		match Frame::check(&mut cursor) {
			Ok(length) => {
				let bytes = self.read_buffer.split_to(length).freeze();
				let frame = Frame::parse(bytes)
					.map_err(|error| Error::ProtocolViolation(error.to_string()))?;
				Ok(Some(frame))
			}
			Err(DecodeError::Incomplete) => Ok(None),
			Err(error) => Err(Error::ProtocolViolation(error.to_string())),
		}
	}

	pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), Error> {
		trace!(packet = ?packet, "writing to stream");
		let mut buf = BytesMut::new();
		packet.encode(&mut buf)?;
		self.write(&mut buf).await
	}

	pub async fn write(&mut self, buffer: &mut impl Buf) -> Result<(), Error> {
		trace!(bytes = buffer.remaining(), "writing to stream");
		self.stream.write_all_buf(buffer).await?;
		// Message-oriented transports buffer until flushed.
		self.stream.flush().await?;
		Ok(())
	}
}

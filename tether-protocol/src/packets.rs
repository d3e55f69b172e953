//! The fourteen MQTT 3.1.1 control packets.
//!
//! Every packet type decodes from a [`Frame`] payload and encodes itself,
//! fixed header included, into any [`BufMut`].

use crate::{
	frame::Frame, wire, FilterBuf, InvalidFilter, InvalidQoS, InvalidTopic, Packet, PacketId, QoS,
	Topic, TopicBuf,
};
use bytes::{Buf, BufMut, Bytes};
use std::{fmt, io, str::Utf8Error};

/// The only protocol name accepted in a [`Connect`] packet.
pub const PROTOCOL_NAME: &str = "MQTT";

/// The only protocol level accepted in a [`Connect`] packet.
pub const PROTOCOL_LEVEL: u8 = 4;

/// The broker refused a subscription; carried in [`SubAck`] return codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionRefused;

/// A per-filter [`SubAck`] return code.
pub type SubscribeReturn = Result<QoS, SubscriptionRefused>;

/// Login credentials carried in a [`Connect`] packet.
///
/// A password cannot be set without a username.
#[derive(Clone, Debug)]
pub struct Credentials {
	pub username: String,
	pub password: Option<String>,
}

/// The message the broker publishes on the client's behalf if the client
/// goes away without sending Disconnect.
#[derive(Clone, Debug)]
pub struct Will {
	pub topic: TopicBuf,
	pub payload: Bytes,
	pub qos: QoS,
	pub retain: bool,
}

//
// Packet types
//

/// Opens a session with the broker. Always the first packet on the wire.
#[derive(Clone, Debug)]
pub struct Connect {
	pub client_id: String,
	pub keep_alive: u16,
	pub clean_session: bool,
	pub will: Option<Will>,
	pub credentials: Option<Credentials>,
}

/// The broker's reply to [`Connect`].
#[derive(Clone, Copy, Debug)]
pub struct ConnAck {
	/// The broker holds state from a previous session for this client id.
	pub session_present: bool,
	/// Zero on success; MQTT 3.1.1 defines codes 1-5 for refusals.
	pub return_code: u8,
}

impl ConnAck {
	pub const ACCEPTED: u8 = 0;
}

/// An application message, in either direction.
///
/// The variant fixes the delivery tier, so a packet id only exists where the
/// protocol calls for one.
#[derive(Clone)]
pub enum Publish {
	AtMostOnce {
		retain: bool,
		topic: TopicBuf,
		payload: Bytes,
	},
	AtLeastOnce {
		id: PacketId,
		retain: bool,
		duplicate: bool,
		topic: TopicBuf,
		payload: Bytes,
	},
	ExactlyOnce {
		id: PacketId,
		retain: bool,
		duplicate: bool,
		topic: TopicBuf,
		payload: Bytes,
	},
}

id_packet!(PubAck, Packet::PubAck, 0x40, "PubAck");
id_packet!(PubRec, Packet::PubRec, 0x50, "PubRec");
id_packet!(PubRel, Packet::PubRel, 0x62, "PubRel");
id_packet!(PubComp, Packet::PubComp, 0x70, "PubComp");

/// Requests one or more subscriptions.
#[derive(Clone, Debug)]
pub struct Subscribe {
	pub id: PacketId,
	pub filters: Vec<(FilterBuf, QoS)>,
}

/// The broker's reply to [`Subscribe`], one return code per filter.
#[derive(Clone, Debug)]
pub struct SubAck {
	pub id: PacketId,
	pub returns: Vec<SubscribeReturn>,
}

/// Removes one or more subscriptions.
#[derive(Clone, Debug)]
pub struct Unsubscribe {
	pub id: PacketId,
	pub filters: Vec<FilterBuf>,
}

id_packet!(UnsubAck, Packet::UnsubAck, 0xb0, "UnsubAck");
nul_packet!(PingReq, Packet::PingReq, 0xc0);
nul_packet!(PingResp, Packet::PingResp, 0xd0);
nul_packet!(Disconnect, Packet::Disconnect, 0xe0);

const CONNECT_FLAG_CLEAN_SESSION: u8 = 0x02;
const CONNECT_FLAG_WILL: u8 = 0x04;
const CONNECT_FLAG_WILL_RETAIN: u8 = 0x20;
const CONNECT_FLAG_PASSWORD: u8 = 0x40;
const CONNECT_FLAG_USERNAME: u8 = 0x80;

impl Connect {
	pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
		let mut cursor = io::Cursor::new(payload);

		if wire::read_str(&mut cursor)? != PROTOCOL_NAME {
			return Err(DecodeError::MalformedPacket("invalid protocol name"));
		}
		if wire::read_u8(&mut cursor)? != PROTOCOL_LEVEL {
			return Err(DecodeError::MalformedPacket("unsupported protocol level"));
		}

		let flags = wire::read_u8(&mut cursor)?;
		let keep_alive = wire::read_u16(&mut cursor)?;
		let client_id = String::from(wire::read_str(&mut cursor)?);

		let clean_session = flags & CONNECT_FLAG_CLEAN_SESSION != 0;

		let will = if flags & CONNECT_FLAG_WILL != 0 {
			let topic = TopicBuf::new(wire::read_str(&mut cursor)?)?;
			let len = wire::read_u16(&mut cursor)? as usize;
			let payload = Bytes::copy_from_slice(wire::read_slice(&mut cursor, len)?);

			Some(Will {
				topic,
				payload,
				qos: ((flags & 0x18) >> 3).try_into()?,
				retain: flags & CONNECT_FLAG_WILL_RETAIN != 0,
			})
		} else {
			None
		};

		let credentials = if flags & CONNECT_FLAG_USERNAME != 0 {
			let username = String::from(wire::read_str(&mut cursor)?);
			let password = if flags & CONNECT_FLAG_PASSWORD != 0 {
				Some(String::from(wire::read_str(&mut cursor)?))
			} else {
				None
			};
			Some(Credentials { username, password })
		} else {
			None
		};

		Ok(Self {
			client_id,
			keep_alive,
			clean_session,
			will,
			credentials,
		})
	}

	pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), wire::EncodeError> {
		wire::write_u8(dst, 0x10)?;
		wire::write_remaining_length(dst, self.encoded_len())?;

		wire::write_str(dst, PROTOCOL_NAME)?;
		wire::write_u8(dst, PROTOCOL_LEVEL)?;
		wire::write_u8(dst, self.flags())?;
		wire::write_u16(dst, self.keep_alive)?;
		wire::write_str(dst, &self.client_id)?;

		if let Some(will) = &self.will {
			wire::write_str(dst, will.topic.as_str())?;
			if will.payload.len() > u16::MAX as usize {
				return Err(wire::EncodeError);
			}
			wire::write_u16(dst, will.payload.len() as u16)?;
			wire::write_slice(dst, &will.payload)?;
		}

		if let Some(credentials) = &self.credentials {
			wire::write_str(dst, &credentials.username)?;
			if let Some(password) = &credentials.password {
				wire::write_str(dst, password)?;
			}
		}

		Ok(())
	}

	fn encoded_len(&self) -> usize {
		// Protocol name, level, flags, keep alive, client id.
		let mut len = (2 + PROTOCOL_NAME.len()) + 1 + 1 + 2 + (2 + self.client_id.len());

		if let Some(will) = &self.will {
			len += (2 + will.topic.len()) + (2 + will.payload.len());
		}

		if let Some(credentials) = &self.credentials {
			len += 2 + credentials.username.len();
			if let Some(password) = &credentials.password {
				len += 2 + password.len();
			}
		}

		len
	}

	fn flags(&self) -> u8 {
		let mut flags = 0;

		if self.clean_session {
			flags |= CONNECT_FLAG_CLEAN_SESSION;
		}

		if let Some(will) = &self.will {
			flags |= CONNECT_FLAG_WILL | (will.qos as u8) << 3;
			if will.retain {
				flags |= CONNECT_FLAG_WILL_RETAIN;
			}
		}

		if let Some(credentials) = &self.credentials {
			flags |= CONNECT_FLAG_USERNAME;
			if credentials.password.is_some() {
				flags |= CONNECT_FLAG_PASSWORD;
			}
		}

		flags
	}
}

impl Default for Connect {
	fn default() -> Self {
		Self {
			client_id: String::new(),
			keep_alive: 0,
			clean_session: true,
			will: None,
			credentials: None,
		}
	}
}

impl ConnAck {
	pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
		if payload.len() != 2 {
			return Err(DecodeError::MalformedPacket(
				"ConnAck packet must have length 2",
			));
		}

		let mut cursor = io::Cursor::new(payload);
		let flags = wire::read_u8(&mut cursor)?;
		let return_code = wire::read_u8(&mut cursor)?;

		if flags & 0xfe != 0 {
			return Err(DecodeError::MalformedPacket(
				"upper 7 bits of ConnAck flags must be zero",
			));
		}

		Ok(Self {
			session_present: flags & 0x01 != 0,
			return_code,
		})
	}

	pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), wire::EncodeError> {
		wire::write_u8(dst, 0x20)?;
		wire::write_remaining_length(dst, 2)?;
		wire::write_u8(dst, self.session_present as u8)?;
		wire::write_u8(dst, self.return_code)
	}
}

const PUBLISH_CONTROL: u8 = 0x30;
const PUBLISH_FLAG_RETAIN: u8 = 0x01;
const PUBLISH_FLAG_DUPLICATE: u8 = 0x08;
const PUBLISH_QOS_MASK: u8 = 0x06;

impl Publish {
	/// Decodes a Publish packet; `flags` is the low nibble of the fixed
	/// header, which carries the QoS, retain and duplicate bits.
	pub fn decode(payload: &Bytes, flags: u8) -> Result<Self, DecodeError> {
		let retain = flags & PUBLISH_FLAG_RETAIN != 0;
		let duplicate = flags & PUBLISH_FLAG_DUPLICATE != 0;
		let qos: QoS = ((flags & PUBLISH_QOS_MASK) >> 1).try_into()?;

		let mut cursor = io::Cursor::new(&payload[..]);
		let topic = TopicBuf::new(wire::read_str(&mut cursor)?)?;

		match qos {
			QoS::AtMostOnce => {
				if duplicate {
					return Err(DecodeError::MalformedPacket(
						"duplicate flag must be 0 at QoS 0",
					));
				}

				// Slice the application payload out of the shared buffer.
				let payload = payload.slice(cursor.position() as usize..);
				Ok(Self::AtMostOnce {
					retain,
					topic,
					payload,
				})
			}
			QoS::AtLeastOnce => {
				let id = wire::read_id(&mut cursor)?;
				let payload = payload.slice(cursor.position() as usize..);
				Ok(Self::AtLeastOnce {
					id,
					retain,
					duplicate,
					topic,
					payload,
				})
			}
			QoS::ExactlyOnce => {
				let id = wire::read_id(&mut cursor)?;
				let payload = payload.slice(cursor.position() as usize..);
				Ok(Self::ExactlyOnce {
					id,
					retain,
					duplicate,
					topic,
					payload,
				})
			}
		}
	}

	pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), wire::EncodeError> {
		let mut flags = (self.qos() as u8) << 1;
		if self.retain() {
			flags |= PUBLISH_FLAG_RETAIN;
		}
		if self.duplicate() {
			flags |= PUBLISH_FLAG_DUPLICATE;
		}

		let id_len = if self.id().is_some() { 2 } else { 0 };
		let topic = self.topic();
		let payload = self.payload();

		wire::write_u8(dst, PUBLISH_CONTROL | flags)?;
		wire::write_remaining_length(dst, 2 + topic.len() + id_len + payload.len())?;
		wire::write_str(dst, topic.as_str())?;
		if let Some(id) = self.id() {
			wire::write_u16(dst, id.get())?;
		}
		wire::write_slice(dst, payload)
	}

	#[inline]
	pub fn topic(&self) -> &Topic {
		match self {
			Self::AtMostOnce { topic, .. }
			| Self::AtLeastOnce { topic, .. }
			| Self::ExactlyOnce { topic, .. } => topic,
		}
	}

	#[inline]
	pub fn payload(&self) -> &Bytes {
		match self {
			Self::AtMostOnce { payload, .. }
			| Self::AtLeastOnce { payload, .. }
			| Self::ExactlyOnce { payload, .. } => payload,
		}
	}

	#[inline]
	pub fn qos(&self) -> QoS {
		match self {
			Self::AtMostOnce { .. } => QoS::AtMostOnce,
			Self::AtLeastOnce { .. } => QoS::AtLeastOnce,
			Self::ExactlyOnce { .. } => QoS::ExactlyOnce,
		}
	}

	#[inline]
	pub fn retain(&self) -> bool {
		match self {
			Self::AtMostOnce { retain, .. }
			| Self::AtLeastOnce { retain, .. }
			| Self::ExactlyOnce { retain, .. } => *retain,
		}
	}

	/// The packet id, absent at QoS 0.
	#[inline]
	pub fn id(&self) -> Option<PacketId> {
		match self {
			Self::AtMostOnce { .. } => None,
			Self::AtLeastOnce { id, .. } | Self::ExactlyOnce { id, .. } => Some(*id),
		}
	}

	/// The duplicate-delivery flag, always `false` at QoS 0.
	#[inline]
	pub fn duplicate(&self) -> bool {
		match self {
			Self::AtMostOnce { .. } => false,
			Self::AtLeastOnce { duplicate, .. } | Self::ExactlyOnce { duplicate, .. } => *duplicate,
		}
	}
}

impl fmt::Debug for Publish {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Publish")
			.field("id", &self.id())
			.field("qos", &self.qos())
			.field("retain", &self.retain())
			.field("duplicate", &self.duplicate())
			.field("topic", &self.topic().as_str())
			.field("payload_len", &self.payload().len())
			.finish()
	}
}

impl Subscribe {
	pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
		let mut cursor = io::Cursor::new(payload);
		let id = wire::read_id(&mut cursor)?;

		let mut filters = Vec::new();
		while cursor.has_remaining() {
			let filter = FilterBuf::new(wire::read_str(&mut cursor)?)?;
			let qos = wire::read_u8(&mut cursor)?.try_into()?;
			filters.push((filter, qos));
		}

		Ok(Self { id, filters })
	}

	pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), wire::EncodeError> {
		let Self { id, filters } = self;

		let len = 2 + filters
			.iter()
			.map(|(filter, _)| 3 + filter.len())
			.sum::<usize>();

		wire::write_u8(dst, 0x82)?;
		wire::write_remaining_length(dst, len)?;
		wire::write_u16(dst, id.get())?;
		for (filter, qos) in filters {
			wire::write_str(dst, filter.as_str())?;
			wire::write_u8(dst, *qos as u8)?;
		}

		Ok(())
	}
}

impl SubAck {
	pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
		let mut cursor = io::Cursor::new(payload);
		let id = wire::read_id(&mut cursor)?;

		let mut returns = Vec::new();
		while cursor.has_remaining() {
			let code = wire::read_u8(&mut cursor)?;
			returns.push(match code {
				0x80 => Err(SubscriptionRefused),
				code => Ok(code
					.try_into()
					.map_err(|_| DecodeError::MalformedPacket("invalid SubAck return code"))?),
			});
		}

		Ok(Self { id, returns })
	}

	pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), wire::EncodeError> {
		let Self { id, returns } = self;

		wire::write_u8(dst, 0x90)?;
		wire::write_remaining_length(dst, 2 + returns.len())?;
		wire::write_u16(dst, id.get())?;
		for code in returns {
			wire::write_u8(dst, code.map(|qos| qos as u8).unwrap_or(0x80))?;
		}

		Ok(())
	}
}

impl Unsubscribe {
	pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
		let mut cursor = io::Cursor::new(payload);
		let id = wire::read_id(&mut cursor)?;

		let mut filters = Vec::new();
		while cursor.has_remaining() {
			filters.push(FilterBuf::new(wire::read_str(&mut cursor)?)?);
		}

		Ok(Self { id, filters })
	}

	pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), wire::EncodeError> {
		let Self { id, filters } = self;

		let len = 2 + filters.iter().map(|filter| 2 + filter.len()).sum::<usize>();

		wire::write_u8(dst, 0xa2)?;
		wire::write_remaining_length(dst, len)?;
		wire::write_u16(dst, id.get())?;
		for filter in filters {
			wire::write_str(dst, filter.as_str())?;
		}

		Ok(())
	}
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
	#[error("need more bytes to decode a complete packet")]
	Incomplete,
	#[error(transparent)]
	InvalidQoS(#[from] InvalidQoS),
	#[error(transparent)]
	InvalidFilter(#[from] InvalidFilter),
	#[error(transparent)]
	InvalidTopic(#[from] InvalidTopic),
	#[error("invalid fixed header")]
	InvalidHeader,
	#[error("packet id must be non-zero")]
	ZeroPacketId,
	#[error("malformed remaining-length field")]
	MalformedLength,
	#[error("malformed packet: {0}")]
	MalformedPacket(&'static str),
	#[error(transparent)]
	Utf8(#[from] Utf8Error),
}

macro_rules! id_packet {
	($name:tt, $variant:expr, $header:literal, $label:literal) => {
		#[doc = concat!("The ", $label, " acknowledgement packet.")]
		#[derive(Clone, Copy, Debug)]
		pub struct $name {
			pub id: PacketId,
		}

		impl $name {
			pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
				if payload.len() != 2 {
					return Err(DecodeError::MalformedPacket(concat!(
						$label,
						" packet must have length 2"
					)));
				}

				let mut cursor = io::Cursor::new(payload);
				let id = crate::wire::read_id(&mut cursor)?;
				Ok(Self { id })
			}

			pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), crate::wire::EncodeError> {
				let Self { id } = self;
				crate::wire::write_u8(dst, $header)?;
				crate::wire::write_remaining_length(dst, 2)?;
				crate::wire::write_u16(dst, id.get())
			}
		}

		impl From<$name> for Packet {
			#[inline]
			fn from(value: $name) -> Packet {
				$variant(value)
			}
		}
	};
}
use id_packet;

macro_rules! nul_packet {
	($name:tt, $variant:expr, $header:literal) => {
		#[derive(Clone, Copy, Debug)]
		pub struct $name;

		impl $name {
			pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
				if !payload.is_empty() {
					return Err(DecodeError::MalformedPacket("packet must have length 0"));
				}
				Ok(Self)
			}

			pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), crate::wire::EncodeError> {
				crate::wire::write_u8(dst, $header)?;
				crate::wire::write_remaining_length(dst, 0)
			}
		}

		impl From<$name> for Packet {
			#[inline]
			fn from(_: $name) -> Packet {
				$variant
			}
		}
	};
}
use nul_packet;

#[cfg(test)]
mod tests {
	use super::*;
	use crate::frame::Frame;
	use bytes::BytesMut;

	fn encode(packet: &Packet) -> Bytes {
		let mut buf = BytesMut::new();
		packet.encode(&mut buf).unwrap();
		buf.freeze()
	}

	fn decode(bytes: Bytes) -> Packet {
		let mut cursor = io::Cursor::new(&bytes[..]);
		let len = Frame::check(&mut cursor).unwrap();
		assert_eq!(len, bytes.len());
		Packet::decode(&Frame::parse(bytes).unwrap()).unwrap()
	}

	#[test]
	fn connect_carries_will_and_credentials() {
		let connect = Connect {
			client_id: "tether-test".into(),
			keep_alive: 30,
			clean_session: false,
			will: Some(Will {
				topic: TopicBuf::new("status/tether-test").unwrap(),
				payload: Bytes::from_static(b"gone"),
				qos: QoS::AtLeastOnce,
				retain: true,
			}),
			credentials: Some(Credentials {
				username: "user".into(),
				password: Some("secret".into()),
			}),
		};

		let bytes = encode(&connect.clone().into());
		// Flags: username | password | will retain | will QoS 1 | will.
		assert_eq!(bytes[9], 0x80 | 0x40 | 0x20 | 0x08 | 0x04);

		let Packet::Connect(decoded) = decode(bytes) else {
			panic!("expected Connect");
		};
		assert_eq!(decoded.client_id, connect.client_id);
		assert_eq!(decoded.keep_alive, 30);
		assert!(!decoded.clean_session);
		let will = decoded.will.unwrap();
		assert_eq!(will.topic.as_str(), "status/tether-test");
		assert_eq!(will.qos, QoS::AtLeastOnce);
		assert!(will.retain);
	}

	#[test]
	fn publish_round_trips_by_qos() {
		let id = PacketId::new(7).unwrap();
		let publish = Publish::AtLeastOnce {
			id,
			retain: false,
			duplicate: true,
			topic: TopicBuf::new("a/b").unwrap(),
			payload: Bytes::from_static(&[0x01, 0x02]),
		};

		let bytes = encode(&publish.into());
		// QoS 1 with the duplicate bit set.
		assert_eq!(bytes[0], 0x30 | 0x08 | 0x02);

		let Packet::Publish(decoded) = decode(bytes) else {
			panic!("expected Publish");
		};
		assert_eq!(decoded.id(), Some(id));
		assert!(decoded.duplicate());
		assert_eq!(decoded.payload().as_ref(), &[0x01, 0x02]);
	}

	#[test]
	fn suback_accepts_mixed_returns() {
		let suback = SubAck {
			id: PacketId::new(3).unwrap(),
			returns: vec![Ok(QoS::AtLeastOnce), Err(SubscriptionRefused)],
		};

		let bytes = encode(&suback.into());
		assert_eq!(&bytes[..], &[0x90, 0x04, 0x00, 0x03, 0x01, 0x80]);

		let Packet::SubAck(decoded) = decode(bytes) else {
			panic!("expected SubAck");
		};
		assert_eq!(decoded.returns, vec![Ok(QoS::AtLeastOnce), Err(SubscriptionRefused)]);
	}

	#[test]
	fn zero_packet_id_is_rejected() {
		let bytes = Bytes::from_static(&[0x40, 0x02, 0x00, 0x00]);
		let frame = Frame::parse(bytes).unwrap();
		assert!(matches!(
			PubAck::decode(&frame.payload),
			Err(DecodeError::ZeroPacketId)
		));
	}
}

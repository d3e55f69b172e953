use crate::{
	frame::Frame,
	packets::{
		ConnAck, Connect, DecodeError, Disconnect, PingReq, PingResp, PubAck, PubComp, PubRec,
		PubRel, Publish, SubAck, Subscribe, UnsubAck, Unsubscribe,
	},
	wire,
};
use bytes::BufMut;

/// Any MQTT 3.1.1 control packet.
#[derive(Clone, Debug)]
pub enum Packet {
	Connect(Box<Connect>),
	ConnAck(ConnAck),
	Publish(Box<Publish>),
	PubAck(PubAck),
	PubRec(PubRec),
	PubRel(PubRel),
	PubComp(PubComp),
	Subscribe(Box<Subscribe>),
	SubAck(Box<SubAck>),
	Unsubscribe(Box<Unsubscribe>),
	UnsubAck(UnsubAck),
	PingReq,
	PingResp,
	Disconnect,
}

/// The packet type carried in the high nibble of the fixed header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
	Connect,
	ConnAck,
	Publish,
	PubAck,
	PubRec,
	PubRel,
	PubComp,
	Subscribe,
	SubAck,
	Unsubscribe,
	UnsubAck,
	PingReq,
	PingResp,
	Disconnect,
}

const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PUBLISH: u8 = 0x30;
const PUBACK: u8 = 0x40;
const PUBREC: u8 = 0x50;
const PUBREL: u8 = 0x60;
const PUBCOMP: u8 = 0x70;
const SUBSCRIBE: u8 = 0x80;
const SUBACK: u8 = 0x90;
const UNSUBSCRIBE: u8 = 0xa0;
const UNSUBACK: u8 = 0xb0;
const PINGREQ: u8 = 0xc0;
const PINGRESP: u8 = 0xd0;
const DISCONNECT: u8 = 0xe0;

impl Packet {
	/// Decodes any packet from a framed payload.
	///
	/// Packets with reserved header flags other than those the protocol
	/// mandates are rejected.
	pub fn decode(frame: &Frame) -> Result<Self, DecodeError> {
		let payload = &frame.payload;

		match (frame.header & 0xf0, frame.header & 0x0f) {
			(CONNECT, 0x00) => Ok(Connect::decode(payload)?.into()),
			(CONNACK, 0x00) => Ok(ConnAck::decode(payload)?.into()),
			(PUBLISH, flags) => Ok(Publish::decode(payload, flags)?.into()),
			(PUBACK, 0x00) => Ok(PubAck::decode(payload)?.into()),
			(PUBREC, 0x00) => Ok(PubRec::decode(payload)?.into()),
			(PUBREL, 0x02) => Ok(PubRel::decode(payload)?.into()),
			(PUBCOMP, 0x00) => Ok(PubComp::decode(payload)?.into()),
			(SUBSCRIBE, 0x02) => Ok(Subscribe::decode(payload)?.into()),
			(SUBACK, 0x00) => Ok(SubAck::decode(payload)?.into()),
			(UNSUBSCRIBE, 0x02) => Ok(Unsubscribe::decode(payload)?.into()),
			(UNSUBACK, 0x00) => Ok(UnsubAck::decode(payload)?.into()),
			(PINGREQ, 0x00) => Ok(PingReq::decode(payload)?.into()),
			(PINGRESP, 0x00) => Ok(PingResp::decode(payload)?.into()),
			(DISCONNECT, 0x00) => Ok(Disconnect::decode(payload)?.into()),
			_ => Err(DecodeError::InvalidHeader),
		}
	}

	pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), wire::EncodeError> {
		match self {
			Self::Connect(connect) => connect.encode(dst),
			Self::ConnAck(connack) => connack.encode(dst),
			Self::Publish(publish) => publish.encode(dst),
			Self::PubAck(puback) => puback.encode(dst),
			Self::PubRec(pubrec) => pubrec.encode(dst),
			Self::PubRel(pubrel) => pubrel.encode(dst),
			Self::PubComp(pubcomp) => pubcomp.encode(dst),
			Self::Subscribe(subscribe) => subscribe.encode(dst),
			Self::SubAck(suback) => suback.encode(dst),
			Self::Unsubscribe(unsubscribe) => unsubscribe.encode(dst),
			Self::UnsubAck(unsuback) => unsuback.encode(dst),
			Self::PingReq => PingReq.encode(dst),
			Self::PingResp => PingResp.encode(dst),
			Self::Disconnect => Disconnect.encode(dst),
		}
	}

	#[inline]
	pub fn packet_type(&self) -> PacketType {
		match self {
			Self::Connect(_) => PacketType::Connect,
			Self::ConnAck(_) => PacketType::ConnAck,
			Self::Publish(_) => PacketType::Publish,
			Self::PubAck(_) => PacketType::PubAck,
			Self::PubRec(_) => PacketType::PubRec,
			Self::PubRel(_) => PacketType::PubRel,
			Self::PubComp(_) => PacketType::PubComp,
			Self::Subscribe(_) => PacketType::Subscribe,
			Self::SubAck(_) => PacketType::SubAck,
			Self::Unsubscribe(_) => PacketType::Unsubscribe,
			Self::UnsubAck(_) => PacketType::UnsubAck,
			Self::PingReq => PacketType::PingReq,
			Self::PingResp => PacketType::PingResp,
			Self::Disconnect => PacketType::Disconnect,
		}
	}
}

impl From<Connect> for Packet {
	#[inline]
	fn from(value: Connect) -> Self {
		Self::Connect(value.into())
	}
}

impl From<ConnAck> for Packet {
	#[inline]
	fn from(value: ConnAck) -> Self {
		Self::ConnAck(value)
	}
}

impl From<Publish> for Packet {
	#[inline]
	fn from(value: Publish) -> Self {
		Self::Publish(value.into())
	}
}

impl From<Subscribe> for Packet {
	#[inline]
	fn from(value: Subscribe) -> Self {
		Self::Subscribe(value.into())
	}
}

impl From<SubAck> for Packet {
	#[inline]
	fn from(value: SubAck) -> Self {
		Self::SubAck(value.into())
	}
}

impl From<Unsubscribe> for Packet {
	#[inline]
	fn from(value: Unsubscribe) -> Self {
		Self::Unsubscribe(value.into())
	}
}

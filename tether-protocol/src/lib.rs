//! # tether-protocol
//!
//! Bit-exact types and codec for the MQTT 3.1.1 wire protocol as specified
//! by OASIS. This crate knows nothing about sockets or sessions; it turns
//! packets into bytes and byte streams back into packets.
mod filter;
mod packet;
mod qos;
mod topic;

pub mod frame;
pub mod packets;
pub mod wire;

pub use filter::{Filter, FilterBuf, InvalidFilter};
pub use packet::{Packet, PacketType};
pub use qos::{InvalidQoS, QoS};
pub use topic::{InvalidTopic, Topic, TopicBuf};

/// Identifies an in-flight request on a connection.
///
/// Zero is not a legal packet id on the wire, so the niche is free.
pub type PacketId = core::num::NonZeroU16;

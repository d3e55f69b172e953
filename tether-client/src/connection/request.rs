//! In-flight protocol operations.
//!
//! A request is born into the pending queue, carried to the ongoing set by
//! the worker's send loop, and leaves every structure exactly once: on ack,
//! on timeout, on cancellation or on error. Its completion callback fires at
//! that moment, whatever the moment is.

use super::TopicSubscription;
use crate::Error;
use bytes::Bytes;
use tether_protocol::{
	packets::{self, SubscribeReturn},
	FilterBuf, PacketId, QoS,
};
use tokio_util::time::delay_queue;

pub(crate) type CompleteFn = Box<dyn FnOnce(PacketId, Result<(), Error>) + Send>;
pub(crate) type SubAckFn =
	Box<dyn FnOnce(PacketId, Result<Vec<(FilterBuf, SubscribeReturn)>, Error>) + Send>;

/// What the broker acknowledged a request with.
pub(crate) enum Ack {
	/// No payload beyond the packet id.
	Done,
	/// SubAck return codes, one per requested filter.
	SubAck(Vec<SubscribeReturn>),
}

pub(crate) enum RequestKind {
	Publish {
		message: packets::Publish,
		/// PubRec received; the request stays in flight until PubComp.
		released: bool,
		on_complete: Option<CompleteFn>,
	},
	Subscribe {
		topics: Vec<TopicSubscription>,
		/// The topic tree transaction has been applied; retries reuse the
		/// committed entries.
		committed: bool,
		on_suback: Option<SubAckFn>,
	},
	/// Inserted into the topic tree without ever touching the wire.
	SubscribeLocal {
		topic: TopicSubscription,
		on_complete: Option<CompleteFn>,
	},
	Unsubscribe {
		filters: Vec<FilterBuf>,
		/// `Some(false)` once the first attempt found only local
		/// subscriptions, in which case no packet is sent.
		wire_needed: Option<bool>,
		on_complete: Option<CompleteFn>,
	},
	/// Rebuilds a Subscribe for everything in the topic tree.
	Resubscribe {
		/// Filled from the tree on the first send attempt.
		filters: Vec<(FilterBuf, QoS)>,
		on_suback: Option<SubAckFn>,
	},
	Ping,
}

pub(crate) struct Request {
	pub id: PacketId,
	pub kind: RequestKind,
	/// Complete with [`Error::NotConnected`] instead of re-sending when the
	/// channel is lost before the ack arrives.
	pub abandon_on_reconnect: bool,
	/// Send attempts so far; a Publish re-sent after the first attempt
	/// carries the duplicate flag.
	pub attempts: u32,
	/// Key of the armed expiry in the worker's timer queue; set and cleared
	/// together with the queue entry.
	pub timeout_key: Option<delay_queue::Key>,
}

impl Request {
	pub fn new(id: PacketId, kind: RequestKind, abandon_on_reconnect: bool) -> Self {
		Self {
			id,
			kind,
			abandon_on_reconnect,
			attempts: 0,
			timeout_key: None,
		}
	}

	/// Consumes the request, delivering `result` to its completion callback.
	pub fn finish(self, result: Result<Ack, Error>) {
		let id = self.id;
		match self.kind {
			RequestKind::Publish { on_complete, .. }
			| RequestKind::SubscribeLocal { on_complete, .. }
			| RequestKind::Unsubscribe { on_complete, .. } => {
				if let Some(callback) = on_complete {
					callback(id, result.map(|_| ()));
				}
			}
			RequestKind::Subscribe {
				topics, on_suback, ..
			} => {
				if let Some(callback) = on_suback {
					let filters = topics.into_iter().map(|topic| topic.filter).collect();
					callback(id, result.and_then(|ack| zip_returns(filters, ack)));
				}
			}
			RequestKind::Resubscribe { filters, on_suback } => {
				if let Some(callback) = on_suback {
					let filters = filters.into_iter().map(|(filter, _)| filter).collect();
					callback(id, result.and_then(|ack| zip_returns(filters, ack)));
				}
			}
			RequestKind::Ping => {}
		}
	}
}

/// Pairs requested filters with SubAck return codes.
fn zip_returns(
	filters: Vec<FilterBuf>,
	ack: Ack,
) -> Result<Vec<(FilterBuf, SubscribeReturn)>, Error> {
	let returns = match ack {
		// Completed without reaching the broker: a resubscribe over an
		// empty tree. There is nothing to report.
		Ack::Done => return Ok(Vec::new()),
		Ack::SubAck(returns) => returns,
	};

	if returns.len() != filters.len() {
		return Err(Error::ProtocolViolation(format!(
			"SubAck carries {} return codes for {} filters",
			returns.len(),
			filters.len(),
		)));
	}

	Ok(filters.into_iter().zip(returns).collect())
}

/// Builds the wire message for an outbound publish.
///
/// The payload is owned by the request from here on; the caller's buffer is
/// free as soon as this returns.
pub(crate) fn publish_message(
	id: PacketId,
	topic: tether_protocol::TopicBuf,
	qos: QoS,
	retain: bool,
	payload: Bytes,
) -> packets::Publish {
	match qos {
		QoS::AtMostOnce => packets::Publish::AtMostOnce {
			retain,
			topic,
			payload,
		},
		QoS::AtLeastOnce => packets::Publish::AtLeastOnce {
			id,
			retain,
			duplicate: false,
			topic,
			payload,
		},
		QoS::ExactlyOnce => packets::Publish::ExactlyOnce {
			id,
			retain,
			duplicate: false,
			topic,
			payload,
		},
	}
}

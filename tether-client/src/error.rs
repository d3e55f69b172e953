use std::{convert::Infallible, io, sync::Arc};
use tether_protocol::{wire::EncodeError, InvalidFilter, InvalidTopic};
use thiserror::Error;

/// Everything that can go wrong on a connection.
///
/// Synchronous failures are returned from the call itself; asynchronous ones
/// arrive through the completion callback of the operation they belong to.
#[derive(Clone, Debug, Error)]
pub enum Error {
	/// The operation is not legal in the current connection state.
	#[error("operation is not legal in the current connection state")]
	InvalidState,

	/// `connect` was called on a connection that is already open or opening.
	#[error("connection is already open or opening")]
	AlreadyConnected,

	/// The operation requires an open connection.
	#[error("connection is not open")]
	NotConnected,

	#[error(transparent)]
	InvalidTopic(#[from] InvalidTopic),

	#[error(transparent)]
	InvalidFilter(#[from] InvalidFilter),

	/// The broker did not answer within the configured window.
	#[error("operation timed out")]
	Timeout,

	/// The broker dropped the connection without a Disconnect from us.
	#[error("connection closed unexpectedly by the broker")]
	UnexpectedHangup,

	/// The operation was discarded because the session is clean and the
	/// channel it was queued on went away.
	#[error("operation cancelled on connection loss of a clean session")]
	CancelledForCleanSession,

	/// The connection was dropped with the operation still queued.
	#[error("connection destroyed before the operation completed")]
	Destroyed,

	/// The broker answered Connect with a non-zero return code.
	#[error("broker refused the connection (return code {0})")]
	ConnectionRefused(u8),

	/// The peer sent something the protocol does not allow here.
	#[error("protocol violation: {0}")]
	ProtocolViolation(String),

	#[error("transport failure: {0}")]
	Transport(Arc<io::Error>),

	/// All 65,535 packet ids are taken by in-flight operations.
	#[error("no free packet id")]
	PacketIdsExhausted,

	/// Websocket support was not compiled in.
	#[error("built without websocket support")]
	WebsocketsDisabled,

	#[error("invalid configuration: {0}")]
	Config(&'static str),
}

impl From<io::Error> for Error {
	fn from(value: io::Error) -> Self {
		Self::Transport(Arc::new(value))
	}
}

impl From<EncodeError> for Error {
	fn from(value: EncodeError) -> Self {
		Self::ProtocolViolation(value.to_string())
	}
}

// Lets infallible conversions ride the same generic bounds as fallible ones.
impl From<Infallible> for Error {
	fn from(value: Infallible) -> Self {
		match value {}
	}
}

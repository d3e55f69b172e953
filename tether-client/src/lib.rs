//! # tether-client
//!
//! An MQTT 3.1.1 client that holds its session together: one worker task
//! per connection drives the protocol, re-establishes the channel with
//! exponential hold-off when it drops, and re-delivers unacknowledged
//! requests when the broker's session survived.
//!
//! ```no_run
//! # fn main() -> tether_client::Result<()> {
//! # let runtime = tokio::runtime::Runtime::new().unwrap();
//! use tether_client::{Client, QoS};
//!
//! let client = Client::new(runtime.handle().clone());
//! let connection = client.connection();
//!
//! connection.connect(("localhost", 1883), |result| {
//! 	println!("connected: {result:?}");
//! })?;
//!
//! connection.subscribe(
//! 	"sensors/#",
//! 	QoS::AtLeastOnce,
//! 	|publication| println!("{}: {:?}", publication.topic, publication.payload),
//! 	|_, granted| println!("subscribed at {granted:?}"),
//! )?;
//!
//! connection.publish("sensors/hall", QoS::AtLeastOnce, false, "21.5", |id, result| {
//! 	println!("publish {id} completed: {result:?}");
//! })?;
//! # Ok(())
//! # }
//! ```
mod client;
mod connection;
mod error;
mod options;
mod topic_tree;
mod transport;

pub use client::Client;
pub use connection::{Connection, TopicSubscription};
pub use error::Error;
pub use options::{ConnectOptions, ProxyOptions};
#[cfg(feature = "websocket")]
pub use transport::{HandshakeRequest, HandshakeTransform};

pub use tether_protocol::{
	packets::{ConnAck, Credentials, SubscribeReturn, SubscriptionRefused, Will},
	Filter, FilterBuf, InvalidFilter, InvalidTopic, PacketId, QoS, Topic, TopicBuf,
};

use bytes::Bytes;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

/// A message delivered by the broker to a subscription handler.
#[derive(Clone, Debug)]
pub struct Publication {
	pub topic: TopicBuf,
	pub payload: Bytes,
	pub qos: QoS,
	pub retain: bool,
	pub duplicate: bool,
}

/// Receives publications matched to a subscription. Runs on the
/// connection's worker task and must not block.
pub type PublishHandler = Arc<dyn Fn(&Publication) + Send + Sync>;

//! The client-facing connection handle.

mod backoff;
mod core;
mod request;
mod worker;

pub(crate) use self::core::SessionConfig;

use self::{
	core::{apply_connect_options, Command, ConnectionCore, ConnectionState},
	request::{publish_message, RequestKind},
};
use crate::{Error, Publication, PublishHandler, options::{ConnectOptions, ProxyOptions}};
use bytes::Bytes;
use std::sync::Arc;
use tether_protocol::{
	packets::{ConnAck, Credentials, SubscribeReturn, Will},
	FilterBuf, PacketId, QoS, TopicBuf,
};
use tokio::sync::mpsc;
use tracing::debug;

/// One requested subscription: the filter, the delivery tier to ask for and
/// the handler that receives matching publications.
#[derive(Clone)]
pub struct TopicSubscription {
	pub filter: FilterBuf,
	pub qos: QoS,
	pub on_publish: PublishHandler,
}

impl TopicSubscription {
	pub fn new(
		filter: FilterBuf,
		qos: QoS,
		on_publish: impl Fn(&Publication) + Send + Sync + 'static,
	) -> Self {
		Self {
			filter,
			qos,
			on_publish: Arc::new(on_publish),
		}
	}
}

/// An MQTT connection.
///
/// A connection is created disconnected. Configure it with the `set_*`
/// methods, then call [`connect`]; once connected it maintains the session
/// across network interruptions until [`disconnect`] is called or the handle
/// is dropped.
///
/// Every operation that talks to the broker completes through its callback,
/// on the connection's worker task. Callbacks must not block; hand heavy
/// work to a channel or a task of its own.
///
/// [`connect`]: Self::connect
/// [`disconnect`]: Self::disconnect
pub struct Connection {
	core: Arc<ConnectionCore>,
}

impl Connection {
	pub(crate) fn new(runtime: tokio::runtime::Handle) -> Self {
		Self {
			core: Arc::new(ConnectionCore::new(runtime)),
		}
	}

	/// Sets the will the broker publishes if this client goes away without
	/// a clean disconnect.
	pub fn set_will<T, E>(
		&self,
		topic: T,
		qos: QoS,
		retain: bool,
		payload: impl Into<Bytes>,
	) -> Result<(), Error>
	where
		T: TryInto<TopicBuf, Error = E>,
		Error: From<E>,
	{
		let topic = topic.try_into()?;
		let payload = payload.into();
		self.core.configure(move |config| {
			config.will = Some(Will {
				topic,
				payload,
				qos,
				retain,
			});
		})
	}

	/// Sets the username, and optionally the password, presented in
	/// Connect.
	pub fn set_login(&self, username: &str, password: Option<&str>) -> Result<(), Error> {
		let credentials = Credentials {
			username: username.into(),
			password: password.map(Into::into),
		};
		self.core.configure(move |config| {
			config.credentials = Some(credentials);
		})
	}

	/// Bounds the exponential hold-off between reconnect attempts.
	pub fn set_reconnect_backoff(
		&self,
		min: std::time::Duration,
		max: std::time::Duration,
	) -> Result<(), Error> {
		if min.is_zero() || max < min {
			return Err(Error::Config("reconnect bounds must satisfy 0 < min <= max"));
		}
		self.core.configure(move |config| {
			config.reconnect_min = min;
			config.reconnect_max = max;
		})
	}

	/// Registers the handlers fired when the connection is unexpectedly
	/// lost and when it is re-established.
	///
	/// For one interruption episode `on_interrupted` always fires before
	/// `on_resumed`.
	pub fn set_interruption_handlers(
		&self,
		on_interrupted: impl Fn(Error) + Send + Sync + 'static,
		on_resumed: impl Fn(ConnAck) + Send + Sync + 'static,
	) -> Result<(), Error> {
		self.core.configure(move |config| {
			config.on_interrupted = Some(Arc::new(on_interrupted));
			config.on_resumed = Some(Arc::new(on_resumed));
		})
	}

	/// Registers a handler that sees every inbound publication, matched by
	/// a subscription or not. Refused once the connection is open.
	pub fn set_on_any_publish(
		&self,
		handler: impl Fn(&Publication) + Send + Sync + 'static,
	) -> Result<(), Error> {
		// Stricter than the other setters: swapping the tap on a live
		// connection would tear publications between two handlers.
		if self.core.state() != ConnectionState::Disconnected {
			return Err(Error::InvalidState);
		}
		self.core.configure(move |config| {
			config.on_any_publish = Some(Arc::new(handler));
		})
	}

	/// Tunnels the connection through websockets instead of raw TCP.
	pub fn use_websockets(&self) -> Result<(), Error> {
		#[cfg(not(feature = "websocket"))]
		{
			Err(Error::WebsocketsDisabled)
		}

		#[cfg(feature = "websocket")]
		{
			self.core.configure(|config| {
				config.websockets = true;
			})
		}
	}

	/// Registers a hook that edits the websocket upgrade request before it
	/// is sent, e.g. to add signing headers.
	#[cfg(feature = "websocket")]
	pub fn set_websocket_handshake_transform(
		&self,
		transform: impl Fn(&mut crate::HandshakeRequest) + Send + Sync + 'static,
	) -> Result<(), Error> {
		self.core.configure(move |config| {
			config.ws_transform = Some(Arc::new(transform));
		})
	}

	/// Routes websocket connections through an HTTP proxy.
	pub fn set_http_proxy(&self, proxy: ProxyOptions) -> Result<(), Error> {
		self.core.configure(move |config| {
			config.http_proxy = Some(proxy);
		})
	}

	/// Opens the connection.
	///
	/// `on_complete` fires with the broker's ConnAck once the session is
	/// up, or with the error that ended the attempt. Later interruptions do
	/// not re-fire it; they go to the interruption handlers.
	pub fn connect(
		&self,
		options: impl Into<ConnectOptions>,
		on_complete: impl FnOnce(Result<ConnAck, Error>) + Send + 'static,
	) -> Result<(), Error> {
		let options = options.into();

		{
			let mut synced = self.core.lock_synced();
			if synced.state != ConnectionState::Disconnected {
				return Err(Error::AlreadyConnected);
			}
			synced.state = ConnectionState::Connecting;
		}

		let applied = apply_connect_options(
			&mut self.core.lock_config(),
			options,
			Box::new(on_complete),
		);
		if let Err(error) = applied {
			self.core.lock_synced().state = ConnectionState::Disconnected;
			return Err(error);
		}

		// A clean session discards whatever the previous session left
		// queued.
		let clean_session = self.core.lock_config().clean_session;
		if clean_session {
			let stale = {
				let mut synced = self.core.lock_synced();
				let ids: Vec<PacketId> = synced.pending.drain(..).collect();
				ids.into_iter()
					.filter_map(|id| synced.outstanding.remove(&id))
					.collect::<Vec<_>>()
			};
			for request in stale {
				debug!(id = request.id.get(), "discarding request from previous session");
				request.finish(Err(Error::CancelledForCleanSession));
			}
		}

		let (tx, rx) = mpsc::unbounded_channel();
		self.core.lock_synced().worker_tx = Some(tx);

		// The worker's clone is the pin that keeps the connection alive
		// until it reaches Disconnected again.
		let core = Arc::clone(&self.core);
		self.core.runtime.spawn(worker::run(core, rx));

		Ok(())
	}

	/// Closes the connection. Legal while Connected or Reconnecting.
	///
	/// In-flight operations complete according to the clean-session rule;
	/// `on_disconnect` fires once the channel has fully shut down.
	pub fn disconnect(&self, on_disconnect: impl FnOnce() + Send + 'static) -> Result<(), Error> {
		let mut synced = self.core.lock_synced();
		if !matches!(
			synced.state,
			ConnectionState::Connected | ConnectionState::Reconnecting
		) {
			return Err(Error::NotConnected);
		}

		// Stored before the state flips so the worker cannot observe
		// Disconnecting without the callback in place.
		self.core.lock_config().on_disconnect = Some(Box::new(on_disconnect));
		synced.state = ConnectionState::Disconnecting;

		let tx = synced.worker_tx.clone();
		drop(synced);

		if let Some(tx) = tx {
			let _ = tx.send(Command::Disconnect);
		}
		Ok(())
	}

	/// Publishes `payload` to `topic`.
	///
	/// The payload is copied now; the caller's buffer is free as soon as
	/// this returns. At QoS 0 the callback fires once the packet is
	/// written; at QoS 1 and 2 it fires when the broker's acknowledgement
	/// handshake completes.
	pub fn publish<T, E>(
		&self,
		topic: T,
		qos: QoS,
		retain: bool,
		payload: impl Into<Bytes>,
		on_complete: impl FnOnce(PacketId, Result<(), Error>) + Send + 'static,
	) -> Result<PacketId, Error>
	where
		T: TryInto<TopicBuf, Error = E>,
		Error: From<E>,
	{
		let topic = topic.try_into()?;
		let payload = payload.into();

		self.core.submit(qos == QoS::AtMostOnce, |id| RequestKind::Publish {
			message: publish_message(id, topic, qos, retain, payload),
			released: false,
			on_complete: Some(Box::new(on_complete)),
		})
	}

	/// Subscribes to a single topic filter.
	///
	/// `on_publish` runs for every matching publication for as long as the
	/// subscription lives; `on_suback` fires once with the granted QoS.
	pub fn subscribe<F, E>(
		&self,
		filter: F,
		qos: QoS,
		on_publish: impl Fn(&Publication) + Send + Sync + 'static,
		on_suback: impl FnOnce(PacketId, Result<SubscribeReturn, Error>) + Send + 'static,
	) -> Result<PacketId, Error>
	where
		F: TryInto<FilterBuf, Error = E>,
		Error: From<E>,
	{
		let topic = TopicSubscription::new(filter.try_into()?, qos, on_publish);

		self.core.submit(false, move |_| RequestKind::Subscribe {
			topics: vec![topic],
			committed: false,
			on_suback: Some(Box::new(move |id, result| {
				on_suback(
					id,
					result.map(|mut granted| {
						granted
							.pop()
							.map(|(_, code)| code)
							.unwrap_or(Err(tether_protocol::packets::SubscriptionRefused))
					}),
				);
			})),
		})
	}

	/// Subscribes to several topic filters with one packet. The broker
	/// applies all of them or none.
	pub fn subscribe_multiple(
		&self,
		topics: Vec<TopicSubscription>,
		on_suback: impl FnOnce(PacketId, Result<Vec<(FilterBuf, SubscribeReturn)>, Error>)
			+ Send
			+ 'static,
	) -> Result<PacketId, Error> {
		if topics.is_empty() {
			return Err(Error::Config("subscribe_multiple needs at least one filter"));
		}

		self.core.submit(false, move |_| RequestKind::Subscribe {
			topics,
			committed: false,
			on_suback: Some(Box::new(on_suback)),
		})
	}

	/// Registers a handler for matching publications without telling the
	/// broker anything.
	///
	/// Useful when the broker-side subscription is managed out of band.
	/// The operation completes locally without a network round trip.
	pub fn subscribe_local<F, E>(
		&self,
		filter: F,
		on_publish: impl Fn(&Publication) + Send + Sync + 'static,
		on_complete: impl FnOnce(PacketId, Result<(), Error>) + Send + 'static,
	) -> Result<PacketId, Error>
	where
		F: TryInto<FilterBuf, Error = E>,
		Error: From<E>,
	{
		let topic = TopicSubscription::new(filter.try_into()?, QoS::AtMostOnce, on_publish);

		self.core.submit(false, move |_| RequestKind::SubscribeLocal {
			topic,
			on_complete: Some(Box::new(on_complete)),
		})
	}

	/// Removes the subscription for `filter`.
	///
	/// Local subscriptions are removed without a network round trip; for
	/// anything else the broker's UnsubAck completes the operation.
	pub fn unsubscribe<F, E>(
		&self,
		filter: F,
		on_complete: impl FnOnce(PacketId, Result<(), Error>) + Send + 'static,
	) -> Result<PacketId, Error>
	where
		F: TryInto<FilterBuf, Error = E>,
		Error: From<E>,
	{
		let filter = filter.try_into()?;

		self.core.submit(false, move |_| RequestKind::Unsubscribe {
			filters: vec![filter],
			wire_needed: None,
			on_complete: Some(Box::new(on_complete)),
		})
	}

	/// Re-requests every live remote subscription in one Subscribe packet.
	///
	/// Intended for the resumption handler, when the broker reports
	/// `session_present = false` for a session that should have survived.
	pub fn resubscribe_existing(
		&self,
		on_suback: impl FnOnce(PacketId, Result<Vec<(FilterBuf, SubscribeReturn)>, Error>)
			+ Send
			+ 'static,
	) -> Result<PacketId, Error> {
		self.core.submit(false, move |_| RequestKind::Resubscribe {
			filters: Vec::new(),
			on_suback: Some(Box::new(on_suback)),
		})
	}

	/// Sends a PingReq outside the keep-alive schedule.
	pub fn ping(&self) -> Result<(), Error> {
		self.core.submit(true, |_| RequestKind::Ping).map(|_| ())
	}
}

impl Drop for Connection {
	fn drop(&mut self) {
		// An open connection is shut down as if disconnect were called;
		// queued requests complete when the core goes away.
		let _ = self.disconnect(|| {});
	}
}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Connection").finish_non_exhaustive()
	}
}

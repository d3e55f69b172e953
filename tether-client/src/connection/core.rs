//! Shared connection state and its mutation discipline.
//!
//! The connection is split into two lock domains plus the worker task:
//! configuration (mutable only while Disconnected or Connected), and the
//! synced region holding the state machine, the pending queue and the
//! outstanding-request table. Everything else lives on the worker and needs
//! no lock at all. When both locks are required, the synced lock is taken
//! first.

use super::request::{Request, RequestKind};
use crate::{
	options::{
		ConnectOptions, ProxyOptions, DEFAULT_KEEP_ALIVE_SECS, DEFAULT_PING_TIMEOUT,
		DEFAULT_RECONNECT_MAX, DEFAULT_RECONNECT_MIN,
	},
	Error, Publication, PublishHandler,
};
use std::{
	collections::{HashMap, VecDeque},
	num::NonZeroU16,
	sync::{Arc, Mutex, MutexGuard},
	time::Duration,
};
use tether_protocol::{
	packets::{ConnAck, Credentials, Will},
	PacketId,
};
use tokio::{runtime::Handle, sync::mpsc};
use tracing::debug;

/// Wakes the worker task from the user domain.
#[derive(Debug)]
pub(crate) enum Command {
	/// The pending queue gained work.
	Dispatch,
	/// The state is now Disconnecting; close the channel.
	Disconnect,
}

pub(crate) type CommandTx = mpsc::UnboundedSender<Command>;
pub(crate) type CommandRx = mpsc::UnboundedReceiver<Command>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
	Reconnecting,
	Disconnecting,
}

pub(crate) type InterruptionHandler = Arc<dyn Fn(Error) + Send + Sync>;
pub(crate) type ResumptionHandler = Arc<dyn Fn(ConnAck) + Send + Sync>;
pub(crate) type ConnectCallback = Box<dyn FnOnce(Result<ConnAck, Error>) + Send>;
pub(crate) type DisconnectCallback = Box<dyn FnOnce() + Send>;

/// The configuration region.
pub(crate) struct Config {
	pub host: String,
	pub port: u16,
	pub tls: bool,
	pub websockets: bool,
	#[cfg(feature = "websocket")]
	pub ws_transform: Option<crate::transport::HandshakeTransform>,
	pub http_proxy: Option<ProxyOptions>,

	pub client_id: String,
	pub clean_session: bool,
	pub keep_alive_secs: u16,
	pub operation_timeout: Option<Duration>,
	pub ping_timeout: Duration,

	pub will: Option<Will>,
	pub credentials: Option<Credentials>,

	pub reconnect_min: Duration,
	pub reconnect_max: Duration,

	pub on_interrupted: Option<InterruptionHandler>,
	pub on_resumed: Option<ResumptionHandler>,
	pub on_any_publish: Option<PublishHandler>,
	pub on_connection_complete: Option<ConnectCallback>,
	pub on_disconnect: Option<DisconnectCallback>,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			host: String::new(),
			port: 0,
			tls: false,
			websockets: false,
			#[cfg(feature = "websocket")]
			ws_transform: None,
			http_proxy: None,
			client_id: String::new(),
			clean_session: true,
			keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
			operation_timeout: None,
			ping_timeout: DEFAULT_PING_TIMEOUT,
			will: None,
			credentials: None,
			reconnect_min: DEFAULT_RECONNECT_MIN,
			reconnect_max: DEFAULT_RECONNECT_MAX,
			on_interrupted: None,
			on_resumed: None,
			on_any_publish: None,
			on_connection_complete: None,
			on_disconnect: None,
		}
	}
}

/// The per-attempt snapshot the worker connects with.
#[derive(Clone)]
pub(crate) struct SessionConfig {
	pub host: String,
	pub port: u16,
	pub tls: bool,
	pub websockets: bool,
	#[cfg(feature = "websocket")]
	pub ws_transform: Option<crate::transport::HandshakeTransform>,
	pub http_proxy: Option<ProxyOptions>,
	pub client_id: String,
	pub clean_session: bool,
	pub keep_alive_secs: u16,
	pub operation_timeout: Option<Duration>,
	pub ping_timeout: Duration,
	pub will: Option<Will>,
	pub credentials: Option<Credentials>,
	pub reconnect_min: Duration,
	pub reconnect_max: Duration,
}

/// The synced region.
pub(crate) struct Synced {
	pub state: ConnectionState,
	/// Requests with no live channel to be sent on, in submission order.
	pub pending: VecDeque<PacketId>,
	/// Every in-flight request, pending or ongoing, by packet id.
	pub outstanding: HashMap<PacketId, Request>,
	/// Previously issued id; allocation continues upward from here.
	last_id: PacketId,
	pub worker_tx: Option<CommandTx>,
}

impl Synced {
	/// Assigns the next free packet id, skipping ids still outstanding.
	/// Returns `None` once every id is taken.
	fn allocate_id(&mut self) -> Option<PacketId> {
		if self.outstanding.len() >= usize::from(u16::MAX) {
			return None;
		}

		loop {
			self.last_id = self
				.last_id
				.checked_add(1)
				.unwrap_or(NonZeroU16::MIN);
			if !self.outstanding.contains_key(&self.last_id) {
				return Some(self.last_id);
			}
		}
	}
}

pub(crate) struct ConnectionCore {
	pub runtime: Handle,
	config: Mutex<Config>,
	synced: Mutex<Synced>,
}

/// Locks a mutex, recovering the guard if a callback panicked while holding
/// it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionCore {
	pub fn new(runtime: Handle) -> Self {
		Self {
			runtime,
			config: Mutex::new(Config::default()),
			synced: Mutex::new(Synced {
				state: ConnectionState::Disconnected,
				pending: VecDeque::new(),
				outstanding: HashMap::new(),
				last_id: NonZeroU16::MAX,
				worker_tx: None,
			}),
		}
	}

	pub fn lock_synced(&self) -> MutexGuard<'_, Synced> {
		lock(&self.synced)
	}

	pub fn lock_config(&self) -> MutexGuard<'_, Config> {
		lock(&self.config)
	}

	pub fn state(&self) -> ConnectionState {
		self.lock_synced().state
	}

	/// Runs `mutate` against the configuration if the state machine
	/// currently permits configuration changes.
	pub fn configure(&self, mutate: impl FnOnce(&mut Config)) -> Result<(), Error> {
		{
			let synced = self.lock_synced();
			if !matches!(
				synced.state,
				ConnectionState::Disconnected | ConnectionState::Connected
			) {
				return Err(Error::InvalidState);
			}
		}

		mutate(&mut self.lock_config());
		Ok(())
	}

	/// Creates a request, queues it and wakes the worker.
	pub fn submit(
		&self,
		abandon_on_reconnect: bool,
		build: impl FnOnce(PacketId) -> RequestKind,
	) -> Result<PacketId, Error> {
		let mut synced = self.lock_synced();
		let id = synced.allocate_id().ok_or(Error::PacketIdsExhausted)?;

		let request = Request::new(id, build(id), abandon_on_reconnect);
		synced.outstanding.insert(id, request);
		synced.pending.push_back(id);

		if let Some(tx) = &synced.worker_tx {
			let _ = tx.send(Command::Dispatch);
		}

		Ok(id)
	}

	pub fn session_config(&self) -> SessionConfig {
		let config = self.lock_config();
		SessionConfig {
			host: config.host.clone(),
			port: config.port,
			tls: config.tls,
			websockets: config.websockets,
			#[cfg(feature = "websocket")]
			ws_transform: config.ws_transform.clone(),
			http_proxy: config.http_proxy.clone(),
			client_id: config.client_id.clone(),
			clean_session: config.clean_session,
			keep_alive_secs: config.keep_alive_secs,
			operation_timeout: config.operation_timeout,
			ping_timeout: config.ping_timeout,
			will: config.will.clone(),
			credentials: config.credentials.clone(),
			reconnect_min: config.reconnect_min,
			reconnect_max: config.reconnect_max,
		}
	}

	/// Moves Connecting or Reconnecting to Connected, leaving any other
	/// state alone. Returns the state observed under the lock.
	pub fn set_connected(&self) -> ConnectionState {
		let mut synced = self.lock_synced();
		let previous = synced.state;
		if matches!(
			previous,
			ConnectionState::Connecting | ConnectionState::Reconnecting
		) {
			synced.state = ConnectionState::Connected;
		}
		previous
	}

	pub fn interruption_handler(&self) -> Option<InterruptionHandler> {
		self.lock_config().on_interrupted.clone()
	}

	pub fn resumption_handler(&self) -> Option<ResumptionHandler> {
		self.lock_config().on_resumed.clone()
	}

	pub fn any_publish_handler(&self) -> Option<PublishHandler> {
		self.lock_config().on_any_publish.clone()
	}

	pub fn take_connect_callback(&self) -> Option<ConnectCallback> {
		self.lock_config().on_connection_complete.take()
	}

	/// Fires the user's disconnect callback, if one is registered.
	pub fn fire_disconnect(&self) {
		let callback = self.lock_config().on_disconnect.take();
		if let Some(callback) = callback {
			callback();
		}
	}

	/// Dispatches a publication to the any-publish handler, if registered.
	pub fn publish_to_any_handler(&self, publication: &Publication) {
		if let Some(handler) = self.any_publish_handler() {
			handler(publication);
		}
	}
}

impl Drop for ConnectionCore {
	fn drop(&mut self) {
		let synced = self
			.synced
			.get_mut()
			.unwrap_or_else(|poisoned| poisoned.into_inner());

		if !synced.outstanding.is_empty() {
			debug!(
				count = synced.outstanding.len(),
				"connection dropped with requests still queued"
			);
		}

		synced.pending.clear();
		for (_, request) in synced.outstanding.drain() {
			request.finish(Err(Error::Destroyed));
		}
	}
}

/// Validates and applies the per-connect options. Called with the state
/// already moved to Connecting; the caller undoes that on error.
pub(crate) fn apply_connect_options(
	config: &mut Config,
	options: ConnectOptions,
	on_complete: ConnectCallback,
) -> Result<(), Error> {
	let keep_alive_secs = match options.keep_alive_secs {
		0 => DEFAULT_KEEP_ALIVE_SECS,
		secs => secs,
	};
	let ping_timeout = options.ping_timeout.unwrap_or(DEFAULT_PING_TIMEOUT);

	// The keep-alive window must be able to contain a full ping exchange.
	if Duration::from_secs(keep_alive_secs.into()) <= ping_timeout {
		return Err(Error::Config(
			"keep-alive must be longer than the ping timeout",
		));
	}

	config.host = options.host;
	config.port = options.port;
	config.tls = options.tls;
	config.client_id = options.client_id;
	config.clean_session = options.clean_session;
	config.keep_alive_secs = keep_alive_secs;
	config.operation_timeout = options.operation_timeout;
	config.ping_timeout = ping_timeout;
	config.on_connection_complete = Some(on_complete);

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn synced() -> Synced {
		Synced {
			state: ConnectionState::Disconnected,
			pending: VecDeque::new(),
			outstanding: HashMap::new(),
			last_id: NonZeroU16::MAX,
			worker_tx: None,
		}
	}

	fn occupy(synced: &mut Synced, id: PacketId) {
		synced
			.outstanding
			.insert(id, Request::new(id, RequestKind::Ping, true));
	}

	#[test]
	fn ids_start_at_one_and_count_up() {
		let mut synced = synced();
		for expected in 1..=5u16 {
			let id = synced.allocate_id().unwrap();
			assert_eq!(id.get(), expected);
			occupy(&mut synced, id);
		}
	}

	#[test]
	fn allocation_wraps_and_skips_outstanding_ids() {
		let mut synced = synced();
		synced.last_id = NonZeroU16::new(u16::MAX - 1).unwrap();

		// Occupy the id right after the wrap point.
		occupy(&mut synced, NonZeroU16::MIN);

		assert_eq!(synced.allocate_id().unwrap().get(), u16::MAX);
		occupy(&mut synced, NonZeroU16::MAX);

		// Wraps past MAX, skips the occupied 1, lands on 2.
		assert_eq!(synced.allocate_id().unwrap().get(), 2);
	}

	#[test]
	fn allocation_fails_only_when_every_id_is_taken() {
		let mut synced = synced();
		for raw in 1..=u16::MAX {
			occupy(&mut synced, NonZeroU16::new(raw).unwrap());
		}
		assert!(synced.allocate_id().is_none());

		// Freeing a single id makes allocation succeed again, with the
		// freed id.
		let hole = NonZeroU16::new(700).unwrap();
		synced.outstanding.remove(&hole);
		assert_eq!(synced.allocate_id(), Some(hole));
	}
}

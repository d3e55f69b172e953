use std::time::Duration;

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Maximum keep-alive accepted by AWS IoT, used when the caller passes 0.
pub const DEFAULT_KEEP_ALIVE_SECS: u16 = 1200;

pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(3);

pub const DEFAULT_RECONNECT_MIN: Duration = Duration::from_secs(1);
pub const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(128);

/// Per-connect settings, applied when [`Connection::connect`] is called.
///
/// Everything else about a connection (will, login, handlers, reconnect
/// bounds) is configured through the `set_*` methods beforehand.
///
/// [`Connection::connect`]: crate::Connection::connect
#[derive(Clone, Debug)]
pub struct ConnectOptions {
	pub host: String,
	pub port: u16,

	/// Client identifier presented to the broker. Brokers may accept an
	/// empty id for clean sessions.
	pub client_id: String,

	/// Ask the broker to discard any previous session state and to not
	/// persist this one.
	pub clean_session: bool,

	/// Keep-alive interval in seconds; 0 selects
	/// [`DEFAULT_KEEP_ALIVE_SECS`].
	pub keep_alive_secs: u16,

	/// How long to wait for the acknowledgement of a single operation.
	/// `None` waits forever.
	pub operation_timeout: Option<Duration>,

	/// How long to wait for ConnAck and PingResp before tearing the
	/// channel down. `None` selects [`DEFAULT_PING_TIMEOUT`].
	pub ping_timeout: Option<Duration>,

	/// Wrap the TCP stream in TLS.
	pub tls: bool,
}

impl Default for ConnectOptions {
	fn default() -> Self {
		Self {
			host: Default::default(),
			port: DEFAULT_PORT,
			client_id: Default::default(),
			clean_session: true,
			keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
			operation_timeout: None,
			ping_timeout: None,
			tls: false,
		}
	}
}

impl<H: AsRef<str>> From<(H, u16)> for ConnectOptions {
	#[inline]
	fn from((host, port): (H, u16)) -> Self {
		Self {
			host: host.as_ref().into(),
			port,
			..Default::default()
		}
	}
}

/// An HTTP proxy to tunnel websocket connections through.
#[derive(Clone, Debug)]
pub struct ProxyOptions {
	pub host: String,
	pub port: u16,
	pub username: Option<String>,
	pub password: Option<String>,
}

use crate::Connection;
use tokio::runtime::Handle;

/// Factory for [`Connection`]s, bound to the runtime whose I/O driver the
/// connections will run on.
///
/// Cloning is cheap; all clones share the runtime handle.
#[derive(Clone, Debug)]
pub struct Client {
	runtime: Handle,
}

impl Client {
	pub fn new(runtime: Handle) -> Self {
		Self { runtime }
	}

	/// Binds to the runtime of the calling context.
	///
	/// # Panics
	///
	/// Panics outside a tokio runtime, like [`Handle::current`].
	pub fn from_current() -> Self {
		Self::new(Handle::current())
	}

	/// Creates a new, disconnected connection.
	pub fn connection(&self) -> Connection {
		Connection::new(self.runtime.clone())
	}
}

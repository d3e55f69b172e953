use std::time::Duration;

/// Hold-off schedule between reconnect attempts.
///
/// Each attempt consumes the current delay and doubles it, saturating at
/// `max`. The delay only returns to `min` once a connection has proven
/// stable; see [`stability_window`].
///
/// [`stability_window`]: Self::stability_window
#[derive(Debug)]
pub(crate) struct Backoff {
	min: Duration,
	max: Duration,
	current: Duration,
}

/// How long a connection has to stay up, beyond the next scheduled attempt,
/// before the hold-off resets. Guards against resetting while flapping.
const STABILITY_GUARD: Duration = Duration::from_secs(10);

impl Backoff {
	pub fn new(min: Duration, max: Duration) -> Self {
		Self {
			min,
			max,
			current: min,
		}
	}

	/// Applies (possibly reconfigured) bounds, clamping the current delay
	/// into them.
	pub fn configure(&mut self, min: Duration, max: Duration) {
		self.min = min;
		self.max = max;
		self.current = self.current.clamp(min, max);
	}

	/// Returns the delay to wait before the next attempt and advances the
	/// schedule.
	pub fn next_delay(&mut self) -> Duration {
		let delay = self.current;
		self.current = if self.current > self.max / 2 {
			self.max
		} else {
			self.current * 2
		};
		delay
	}

	/// How long after a successful connect the session must survive before
	/// [`reset`] is warranted.
	///
	/// [`reset`]: Self::reset
	pub fn stability_window(&self) -> Duration {
		STABILITY_GUARD + self.current
	}

	pub fn reset(&mut self) {
		self.current = self.min;
	}

	#[cfg(test)]
	pub fn current(&self) -> Duration {
		self.current
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn doubles_and_saturates() {
		let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(128));

		let mut delays = Vec::new();
		for _ in 0..10 {
			delays.push(backoff.next_delay().as_secs());
		}

		assert_eq!(delays, [1, 2, 4, 8, 16, 32, 64, 128, 128, 128]);
	}

	#[test]
	fn reset_returns_to_min() {
		let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(128));
		for _ in 0..5 {
			backoff.next_delay();
		}
		assert!(backoff.current() > Duration::from_secs(1));

		backoff.reset();
		assert_eq!(backoff.next_delay(), Duration::from_secs(1));
	}

	#[test]
	fn stability_window_tracks_the_next_attempt() {
		let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(128));
		backoff.next_delay();
		backoff.next_delay();

		// The next attempt would wait 4s; stability needs 10s beyond that.
		assert_eq!(backoff.stability_window(), Duration::from_secs(14));
	}

	#[test]
	fn configure_clamps_current() {
		let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(128));
		for _ in 0..8 {
			backoff.next_delay();
		}

		backoff.configure(Duration::from_secs(2), Duration::from_secs(30));
		assert_eq!(backoff.next_delay(), Duration::from_secs(30));
	}
}

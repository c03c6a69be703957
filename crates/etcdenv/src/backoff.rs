//! Exponential backoff with randomisation and an elapsed-time stop.
//!
//! Each call to [`ExponentialBackoff::next_backoff`] returns the current
//! interval spread by `± randomization_factor`, then grows the interval by
//! `multiplier` up to `max_interval`. The elapsed-time window opens at the
//! first call after construction or [`reset`](ExponentialBackoff::reset);
//! once `max_elapsed` has passed since then it returns `None`, the stop
//! sentinel that ends a watcher.

use rand::Rng;
use std::time::{Duration, Instant};

use etcdenv_core::RetryConfig;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
	pub initial_interval: Duration,
	pub multiplier: f64,
	pub randomization_factor: f64,
	pub max_interval: Duration,
	/// `None` never stops.
	pub max_elapsed: Option<Duration>,
}

impl Default for BackoffPolicy {
	fn default() -> Self {
		Self::from(&RetryConfig::default())
	}
}

impl From<&RetryConfig> for BackoffPolicy {
	fn from(retry: &RetryConfig) -> Self {
		Self {
			initial_interval: retry.initial_interval(),
			multiplier: retry.multiplier,
			randomization_factor: retry.randomization_factor,
			max_interval: retry.max_interval(),
			max_elapsed: retry.max_elapsed(),
		}
	}
}

/// Retry state for one fetch or one namespace watcher. Never shared.
#[derive(Debug)]
pub struct ExponentialBackoff {
	policy: BackoffPolicy,
	current: Duration,
	/// Set by the first `next_backoff` of a failure run.
	started: Option<Instant>,
}

impl ExponentialBackoff {
	pub fn new(policy: BackoffPolicy) -> Self {
		Self {
			policy,
			current: policy.initial_interval,
			started: None,
		}
	}

	pub fn reset(&mut self) {
		self.current = self.policy.initial_interval;
		self.started = None;
	}

	/// Time since the first backoff of the current failure run.
	pub fn elapsed(&self) -> Duration {
		self.started.map(|started| started.elapsed()).unwrap_or_default()
	}

	pub fn next_backoff(&mut self) -> Option<Duration> {
		let started = *self.started.get_or_insert_with(Instant::now);
		if let Some(max) = self.policy.max_elapsed {
			if started.elapsed() > max {
				return None;
			}
		}

		let delay = randomize(self.current, self.policy.randomization_factor);
		let grown = self.current.as_secs_f64() * self.policy.multiplier;
		self.current = if !grown.is_finite() || grown >= self.policy.max_interval.as_secs_f64() {
			self.policy.max_interval
		} else {
			Duration::from_secs_f64(grown.max(0.0))
		};
		Some(delay)
	}
}

fn randomize(interval: Duration, factor: f64) -> Duration {
	if factor <= 0.0 || interval.is_zero() {
		return interval;
	}
	let delta = interval.as_secs_f64() * factor.min(1.0);
	let low = interval.as_secs_f64() - delta;
	let high = interval.as_secs_f64() + delta;
	Duration::from_secs_f64(rand::thread_rng().gen_range(low..=high))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fixed(initial_ms: u64, multiplier: f64, max_ms: u64) -> BackoffPolicy {
		BackoffPolicy {
			initial_interval: Duration::from_millis(initial_ms),
			multiplier,
			randomization_factor: 0.0,
			max_interval: Duration::from_millis(max_ms),
			max_elapsed: None,
		}
	}

	#[test]
	fn grows_by_multiplier() {
		let mut b = ExponentialBackoff::new(fixed(100, 2.0, 10_000));
		assert_eq!(b.next_backoff(), Some(Duration::from_millis(100)));
		assert_eq!(b.next_backoff(), Some(Duration::from_millis(200)));
		assert_eq!(b.next_backoff(), Some(Duration::from_millis(400)));
	}

	#[test]
	fn capped_at_max_interval() {
		let mut b = ExponentialBackoff::new(fixed(100, 10.0, 500));
		b.next_backoff();
		assert_eq!(b.next_backoff(), Some(Duration::from_millis(500)));
		assert_eq!(b.next_backoff(), Some(Duration::from_millis(500)));
	}

	#[test]
	fn reset_restarts_from_initial() {
		let mut b = ExponentialBackoff::new(fixed(100, 2.0, 10_000));
		b.next_backoff();
		b.next_backoff();
		b.reset();
		assert_eq!(b.next_backoff(), Some(Duration::from_millis(100)));
	}

	#[test]
	fn stops_after_max_elapsed() {
		let mut policy = fixed(1, 1.0, 1);
		policy.max_elapsed = Some(Duration::from_millis(50));
		let mut b = ExponentialBackoff::new(policy);
		assert!(b.next_backoff().is_some());
		std::thread::sleep(Duration::from_millis(80));
		assert_eq!(b.next_backoff(), None);
		b.reset();
		assert!(b.next_backoff().is_some());
	}

	#[test]
	fn window_opens_at_first_failure() {
		let mut policy = fixed(1, 1.0, 1);
		policy.max_elapsed = Some(Duration::from_millis(50));
		let mut b = ExponentialBackoff::new(policy);
		std::thread::sleep(Duration::from_millis(80));
		assert_eq!(b.elapsed(), Duration::ZERO);
		assert!(b.next_backoff().is_some());

		b.reset();
		std::thread::sleep(Duration::from_millis(80));
		assert!(b.next_backoff().is_some());
	}

	#[test]
	fn randomized_delay_stays_within_factor() {
		let policy = BackoffPolicy {
			initial_interval: Duration::from_millis(1000),
			multiplier: 1.0,
			randomization_factor: 0.5,
			max_interval: Duration::from_secs(60),
			max_elapsed: None,
		};
		let mut b = ExponentialBackoff::new(policy);
		for _ in 0..50 {
			let d = b.next_backoff().unwrap();
			assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1500), "{:?}", d);
		}
	}

	#[test]
	fn default_policy_matches_retry_defaults() {
		let p = BackoffPolicy::default();
		assert_eq!(p.initial_interval, Duration::from_millis(500));
		assert_eq!(p.max_interval, Duration::from_secs(60));
		assert_eq!(p.max_elapsed, Some(Duration::from_secs(900)));
	}
}

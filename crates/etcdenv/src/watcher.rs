use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use crate::backoff::ExponentialBackoff;
use crate::error::StoreError;
use crate::source::{exit_requested, KeyValueSource};
use crate::store::{KeyValueStore, Node};

/// What a namespace watcher reports to the engine's control loop.
#[derive(Debug, Clone)]
pub enum WatchEvent {
	Changed { namespace: String, node: Node },
	/// The watcher hit an error it cannot retry and has stopped.
	Failed { namespace: String, error: StoreError },
}

/// Long-polls one namespace and forwards every change.
///
/// Transient failures are retried with this watcher's own backoff. A failure
/// run ends with the next change, or with a failing poll that stayed open
/// longer than the longest backoff delay, since that poll had reached the
/// store. When the backoff gives up the watcher ends quietly; the other
/// namespaces keep being watched.
pub struct NamespaceWatcher<S> {
	source: Arc<KeyValueSource<S>>,
	namespace: String,
	wait_index: Option<u64>,
	backoff: ExponentialBackoff,
	connected_after: Duration,
}

impl<S: KeyValueStore> NamespaceWatcher<S> {
	pub fn new(source: Arc<KeyValueSource<S>>, namespace: String) -> Self {
		let policy = source.policy();
		Self {
			source,
			namespace,
			wait_index: None,
			backoff: ExponentialBackoff::new(policy),
			connected_after: policy.max_interval,
		}
	}

	pub async fn run(mut self, mut exit: watch::Receiver<bool>, events: mpsc::Sender<WatchEvent>) {
		let namespace = self.namespace.clone();
		tracing::debug!(namespace = %namespace, "watching");

		loop {
			let polled_at = Instant::now();
			let result = self
				.source
				.watch(&namespace, self.wait_index, &mut exit)
				.await;

			match result {
				Ok(None) => {
					tracing::debug!(namespace = %namespace, "watcher stopped");
					return;
				}
				Ok(Some(node)) => {
					self.backoff.reset();
					self.wait_index = match node.modified_index {
						0 => None,
						index => Some(index + 1),
					};
					tracing::debug!(namespace = %namespace, key = %node.key, "key changed");
					let event = WatchEvent::Changed {
						namespace: namespace.clone(),
						node,
					};
					if events.send(event).await.is_err() {
						return;
					}
				}
				Err(StoreError::IndexCleared { index }) => {
					tracing::warn!(namespace = %namespace, index, "watch history cleared, resuming from now");
					self.wait_index = None;
				}
				Err(e) if e.is_fatal() => {
					tracing::error!(namespace = %namespace, "watch failed: {}", e);
					let _ = events
						.send(WatchEvent::Failed {
							namespace: namespace.clone(),
							error: e,
						})
						.await;
					return;
				}
				Err(e) => {
					if polled_at.elapsed() >= self.connected_after {
						self.backoff.reset();
					}
					let Some(delay) = self.backoff.next_backoff() else {
						tracing::error!(
							namespace = %namespace,
							"giving up watching after {:?}: {}",
							self.backoff.elapsed(),
							e
						);
						return;
					};
					tracing::warn!(
						namespace = %namespace,
						delay_ms = delay.as_millis() as u64,
						"can't join the store ({}), waiting",
						e
					);
					tokio::select! {
						_ = tokio::time::sleep(delay) => {}
						_ = exit_requested(&mut exit) => return,
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backoff::BackoffPolicy;
	use crate::store::MemoryStore;

	fn source(store: &Arc<MemoryStore>, max_elapsed: Option<Duration>) -> Arc<KeyValueSource<MemoryStore>> {
		Arc::new(KeyValueSource::new(
			Arc::clone(store),
			vec!["/env".to_string()],
			3,
			BackoffPolicy {
				initial_interval: Duration::from_millis(5),
				multiplier: 1.0,
				randomization_factor: 0.0,
				max_interval: Duration::from_millis(5),
				max_elapsed,
			},
		))
	}

	async fn next(rx: &mut mpsc::Receiver<WatchEvent>) -> Option<WatchEvent> {
		tokio::time::timeout(Duration::from_secs(5), rx.recv())
			.await
			.ok()
			.flatten()
	}

	#[tokio::test]
	async fn forwards_changes_after_transient_failures() {
		let store = Arc::new(MemoryStore::new());
		store.fail_watches((0..3).map(|_| StoreError::unreachable("down")));
		let (exit_tx, exit_rx) = watch::channel(false);
		let (tx, mut rx) = mpsc::channel(8);

		let task = tokio::spawn(NamespaceWatcher::new(source(&store, None), "/env".into()).run(exit_rx, tx));
		tokio::time::sleep(Duration::from_millis(100)).await;
		store.set("/env/PORT", "1");
		store.set("/env/PORT", "2");

		let mut values = Vec::new();
		for _ in 0..2 {
			match next(&mut rx).await {
				Some(WatchEvent::Changed { node, .. }) => values.push(node.value.unwrap()),
				other => panic!("unexpected {:?}", other),
			}
		}
		assert_eq!(values, vec!["1", "2"]);

		exit_tx.send(true).unwrap();
		tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn protocol_error_is_reported_and_ends_watcher() {
		let store = Arc::new(MemoryStore::new());
		store.fail_watches([StoreError::protocol("bad frame")]);
		let (_exit_tx, exit_rx) = watch::channel(false);
		let (tx, mut rx) = mpsc::channel(8);

		let task = tokio::spawn(NamespaceWatcher::new(source(&store, None), "/env".into()).run(exit_rx, tx));
		match next(&mut rx).await {
			Some(WatchEvent::Failed { namespace, error }) => {
				assert_eq!(namespace, "/env");
				assert!(error.is_fatal());
			}
			other => panic!("unexpected {:?}", other),
		}
		tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn backoff_stop_ends_watcher_silently() {
		let store = Arc::new(MemoryStore::new());
		store.fail_watches((0..1000).map(|_| StoreError::unreachable("down")));
		let (_exit_tx, exit_rx) = watch::channel(false);
		let (tx, mut rx) = mpsc::channel(8);

		let task = tokio::spawn(
			NamespaceWatcher::new(source(&store, Some(Duration::from_millis(30))), "/env".into())
				.run(exit_rx, tx),
		);
		tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
		assert!(rx.recv().await.is_none());
	}

	#[tokio::test]
	async fn quiet_namespace_survives_a_single_failure() {
		let store = Arc::new(MemoryStore::new());
		let (exit_tx, exit_rx) = watch::channel(false);
		let (tx, mut rx) = mpsc::channel(8);

		let task = tokio::spawn(
			NamespaceWatcher::new(source(&store, Some(Duration::from_millis(100))), "/env".into())
				.run(exit_rx, tx),
		);
		tokio::time::sleep(Duration::from_millis(300)).await;
		store.fail_watches([StoreError::unreachable("blip")]);
		tokio::time::sleep(Duration::from_millis(50)).await;
		store.set("/env/PORT", "1");

		match next(&mut rx).await {
			Some(WatchEvent::Changed { node, .. }) => assert_eq!(node.value.as_deref(), Some("1")),
			other => panic!("unexpected {:?}", other),
		}
		assert!(!task.is_finished());

		exit_tx.send(true).unwrap();
		tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn long_open_poll_ends_the_failure_run() {
		let store = Arc::new(MemoryStore::new());
		store.fail_watches([StoreError::unreachable("down")]);
		let (exit_tx, exit_rx) = watch::channel(false);
		let (tx, mut rx) = mpsc::channel(8);

		let task = tokio::spawn(
			NamespaceWatcher::new(source(&store, Some(Duration::from_millis(100))), "/env".into())
				.run(exit_rx, tx),
		);
		// The first failure opened a window that no change has closed.
		tokio::time::sleep(Duration::from_millis(300)).await;
		store.fail_watches([StoreError::unreachable("blip")]);
		tokio::time::sleep(Duration::from_millis(50)).await;
		store.set("/env/PORT", "2");

		match next(&mut rx).await {
			Some(WatchEvent::Changed { node, .. }) => assert_eq!(node.value.as_deref(), Some("2")),
			other => panic!("unexpected {:?}", other),
		}

		exit_tx.send(true).unwrap();
		tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
	}
}

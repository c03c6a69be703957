use std::sync::Arc;
use tokio::sync::watch;

use etcdenv_core::snapshot::{merge_first_wins, variable_name};
use etcdenv_core::{Config, Snapshot};

use crate::backoff::{BackoffPolicy, ExponentialBackoff};
use crate::error::StoreError;
use crate::store::{KeyValueStore, Node};

/// Reads namespaces out of a [`KeyValueStore`] as environment snapshots.
///
/// Store outages never stop the caller: a namespace that cannot be read
/// after the configured attempts, or that does not exist, contributes
/// nothing. Only protocol errors are returned.
pub struct KeyValueSource<S> {
	store: Arc<S>,
	namespaces: Vec<String>,
	fetch_attempts: u32,
	policy: BackoffPolicy,
}

impl<S: KeyValueStore> KeyValueSource<S> {
	pub fn new(
		store: Arc<S>,
		namespaces: Vec<String>,
		fetch_attempts: u32,
		policy: BackoffPolicy,
	) -> Self {
		Self {
			store,
			namespaces,
			fetch_attempts: fetch_attempts.max(1),
			policy,
		}
	}

	pub fn from_config(store: Arc<S>, config: &Config) -> Self {
		Self::new(
			store,
			config.namespaces.clone(),
			config.retry.fetch_attempts,
			BackoffPolicy::from(&config.retry),
		)
	}

	pub fn namespaces(&self) -> &[String] {
		&self.namespaces
	}

	pub fn policy(&self) -> BackoffPolicy {
		self.policy
	}

	pub async fn fetch_snapshot(&self, namespace: &str) -> Result<Snapshot, StoreError> {
		let mut backoff = ExponentialBackoff::new(self.policy);
		let mut attempt: u32 = 1;

		loop {
			let err = match self.store.list(namespace).await {
				Ok(nodes) => return Ok(collect(namespace, nodes)),
				Err(e) => e,
			};

			match err {
				StoreError::NotFound { .. } => {
					tracing::warn!(namespace, "namespace does not exist, falling back to the inherited environment");
					return Ok(Snapshot::new());
				}
				e if e.is_transient() => {
					let delay = match backoff.next_backoff() {
						Some(d) if attempt < self.fetch_attempts => d,
						_ => {
							tracing::error!(
								namespace,
								attempt,
								"can't join the store ({}), falling back to the inherited environment",
								e
							);
							return Ok(Snapshot::new());
						}
					};
					tracing::warn!(
						namespace,
						attempt,
						delay_ms = delay.as_millis() as u64,
						"can't join the store ({}), retrying",
						e
					);
					tokio::time::sleep(delay).await;
					attempt += 1;
				}
				e => return Err(e),
			}
		}
	}

	/// Fetches every namespace and merges them; earlier namespaces win.
	pub async fn fetch_all(&self) -> Result<Snapshot, StoreError> {
		let mut result = Snapshot::new();
		for namespace in &self.namespaces {
			let vars = self.fetch_snapshot(namespace).await?;
			merge_first_wins(&mut result, vars);
		}
		Ok(result)
	}

	/// Waits for the next change under `namespace`, or returns `Ok(None)` as
	/// soon as `exit` turns true.
	pub async fn watch(
		&self,
		namespace: &str,
		wait_index: Option<u64>,
		exit: &mut watch::Receiver<bool>,
	) -> Result<Option<Node>, StoreError> {
		if *exit.borrow() {
			return Ok(None);
		}
		tokio::select! {
			result = self.store.watch(namespace, wait_index) => result.map(Some),
			_ = exit_requested(exit) => Ok(None),
		}
	}
}

/// Resolves once `exit` holds true, or once its sender is gone.
pub(crate) async fn exit_requested(exit: &mut watch::Receiver<bool>) {
	let _ = exit.wait_for(|stop| *stop).await;
}

fn collect(namespace: &str, nodes: Vec<Node>) -> Snapshot {
	let mut result = Snapshot::new();
	for node in nodes {
		let Some(value) = node.value else {
			continue;
		};
		result.entry(variable_name(namespace, &node.key)).or_insert(value);
	}
	result
}

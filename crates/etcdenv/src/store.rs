use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use etcdenv_core::snapshot::is_under;

use crate::error::StoreError;

/// One key as reported by the store. `value` is `None` for directories and
/// for deleted or expired keys in watch results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
	pub key: String,
	pub value: Option<String>,
	pub modified_index: u64,
}

/// The hierarchical key-value store the environment is sourced from.
///
/// Both calls are idempotent and safe to retry.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
	/// Direct children of `namespace`.
	async fn list(&self, namespace: &str) -> Result<Vec<Node>, StoreError>;

	/// Waits for the next change anywhere under `namespace`.
	///
	/// With `Some(index)` the first change at or after that index is returned,
	/// even if it happened before the call. With `None` only changes made
	/// after the call count.
	async fn watch(&self, namespace: &str, wait_index: Option<u64>) -> Result<Node, StoreError>;
}

/// A store kept in memory, with scripted failures.
#[derive(Default)]
pub struct MemoryStore {
	state: Mutex<MemoryState>,
	changed: Notify,
}

#[derive(Default)]
struct MemoryState {
	keys: BTreeMap<String, String>,
	index: u64,
	history: Vec<Node>,
	list_failures: VecDeque<StoreError>,
	watch_failures: VecDeque<StoreError>,
	list_calls: usize,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	fn state(&self) -> MutexGuard<'_, MemoryState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Sets `key` and returns the modification index of the change.
	pub fn set(&self, key: &str, value: &str) -> u64 {
		let index = {
			let mut state = self.state();
			state.keys.insert(key.to_string(), value.to_string());
			state.record(key, Some(value.to_string()))
		};
		self.changed.notify_waiters();
		index
	}

	/// Removes `key`; returns `None` when it did not exist.
	pub fn delete(&self, key: &str) -> Option<u64> {
		let index = {
			let mut state = self.state();
			state.keys.remove(key)?;
			state.record(key, None)
		};
		self.changed.notify_waiters();
		Some(index)
	}

	/// Removes `dir` and every key under it as one change, reported with the
	/// directory's own key. Returns `None` when nothing was removed.
	pub fn delete_dir(&self, dir: &str) -> Option<u64> {
		let index = {
			let mut state = self.state();
			let before = state.keys.len();
			state.keys.retain(|key, _| !is_under(dir, key));
			if state.keys.len() == before {
				return None;
			}
			state.record(dir, None)
		};
		self.changed.notify_waiters();
		Some(index)
	}

	/// Makes the next list calls fail with `errors`, in order.
	pub fn fail_lists<I: IntoIterator<Item = StoreError>>(&self, errors: I) {
		self.state().list_failures.extend(errors);
	}

	/// Makes the next watch calls fail with `errors`, in order.
	pub fn fail_watches<I: IntoIterator<Item = StoreError>>(&self, errors: I) {
		self.state().watch_failures.extend(errors);
		self.changed.notify_waiters();
	}

	pub fn list_calls(&self) -> usize {
		self.state().list_calls
	}
}

impl MemoryState {
	fn record(&mut self, key: &str, value: Option<String>) -> u64 {
		self.index += 1;
		self.history.push(Node {
			key: key.to_string(),
			value,
			modified_index: self.index,
		});
		self.index
	}
}

#[async_trait]
impl KeyValueStore for MemoryStore {
	async fn list(&self, namespace: &str) -> Result<Vec<Node>, StoreError> {
		let mut state = self.state();
		state.list_calls += 1;
		if let Some(err) = state.list_failures.pop_front() {
			return Err(err);
		}

		let prefix = namespace.trim_end_matches('/');
		let mut children: BTreeMap<String, Option<String>> = BTreeMap::new();
		for (key, value) in state.keys.iter() {
			if key == namespace || !is_under(namespace, key) {
				continue;
			}
			let rest = key[prefix.len()..].trim_start_matches('/');
			match rest.split_once('/') {
				Some((dir, _)) => {
					children.entry(format!("{}/{}", prefix, dir)).or_insert(None);
				}
				None => {
					children.insert(key.clone(), Some(value.clone()));
				}
			}
		}

		if children.is_empty() {
			return Err(StoreError::NotFound {
				namespace: namespace.to_string(),
			});
		}

		let index = state.index;
		Ok(children
			.into_iter()
			.map(|(key, value)| Node {
				key,
				value,
				modified_index: index,
			})
			.collect())
	}

	async fn watch(&self, namespace: &str, wait_index: Option<u64>) -> Result<Node, StoreError> {
		let from = match wait_index {
			Some(index) => index,
			None => self.state().index + 1,
		};

		loop {
			// Registered before inspecting the state so a concurrent `set`
			// cannot slip between the check and the wait.
			let notified = self.changed.notified();
			{
				let mut state = self.state();
				if let Some(err) = state.watch_failures.pop_front() {
					return Err(err);
				}
				if let Some(node) = state
					.history
					.iter()
					.find(|n| n.modified_index >= from && is_under(namespace, &n.key))
				{
					return Ok(node.clone());
				}
			}
			notified.await;
		}
	}
}

//! Environment snapshots built from namespace listings.
//!
//! A namespace contributes one variable per key directly under it. Keys are
//! named by their last path segment once the owning namespace has been
//! stripped, and when several namespaces define the same name the one listed
//! first wins.

use std::collections::HashMap;

/// Variable name to value, as handed to the child process.
pub type Snapshot = HashMap<String, String>;

/// Normalises a namespace path: a single leading `/`, no trailing `/`.
pub fn normalize_namespace(namespace: &str) -> String {
	let trimmed = namespace.trim().trim_matches('/');
	format!("/{}", trimmed)
}

/// Whether `key` lives in the subtree rooted at `namespace`.
pub fn is_under(namespace: &str, key: &str) -> bool {
	if namespace == "/" {
		return key.starts_with('/');
	}
	match key.strip_prefix(namespace) {
		Some(rest) => rest.is_empty() || rest.starts_with('/'),
		None => false,
	}
}

/// Derives the environment variable name for a store key.
///
/// `/env/app/PORT` and `/env/app/sub/PORT` under `/env/app` both become
/// `PORT`. Applying it to an already-derived name returns the name unchanged.
pub fn variable_name(namespace: &str, key: &str) -> String {
	let rest = key.strip_prefix(namespace).unwrap_or(key);
	let rest = rest.strip_prefix('/').unwrap_or(rest);
	rest.rsplit('/').next().unwrap_or(rest).to_string()
}

/// Adds every entry of `from` whose name is not already present in `into`.
pub fn merge_first_wins(into: &mut Snapshot, from: Snapshot) {
	for (name, value) in from {
		into.entry(name).or_insert(value);
	}
}

/// Merges per-namespace snapshots given in namespace order.
pub fn merge_ordered<I>(parts: I) -> Snapshot
where
	I: IntoIterator<Item = Snapshot>,
{
	let mut result = Snapshot::new();
	for part in parts {
		merge_first_wins(&mut result, part);
	}
	result
}

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::ConfigError;
use crate::snapshot::normalize_namespace;
use crate::types::{Credentials, ShutdownBehaviour, WatchedKeys};

pub const DEFAULT_NAMESPACE: &str = "/environments/production";
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:4001";

/// Contents of `config.toml`. Every field is optional.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FileConfig {
	#[serde(default)]
	pub namespaces: Vec<String>,
	pub shutdown_behaviour: Option<String>,
	#[serde(default)]
	pub watched_keys: Vec<String>,
	pub auto_restart: Option<bool>,
	#[serde(default)]
	pub store: StoreConfig,
	#[serde(default)]
	pub retry: RetryConfig,
	#[serde(default)]
	pub process: ProcessConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
	#[serde(default)]
	pub endpoints: Vec<String>,
	pub username: Option<String>,
	pub password: Option<String>,
	#[serde(default = "default_request_timeout")]
	pub request_timeout_ms: u64,
}

impl Default for StoreConfig {
	fn default() -> Self {
		Self {
			endpoints: Vec::new(),
			username: None,
			password: None,
			request_timeout_ms: default_request_timeout(),
		}
	}
}

fn default_request_timeout() -> u64 {
	5000
}

/// Retry tuning for store access.
///
/// `fetch_attempts` bounds a single namespace fetch. The remaining fields
/// shape the exponential backoff used by both fetches and watchers; a
/// `max_elapsed_secs` of zero means a watcher never gives up.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RetryConfig {
	#[serde(default = "default_fetch_attempts")]
	pub fetch_attempts: u32,
	#[serde(default = "default_initial_interval")]
	pub initial_interval_ms: u64,
	#[serde(default = "default_multiplier")]
	pub multiplier: f64,
	#[serde(default = "default_randomization")]
	pub randomization_factor: f64,
	#[serde(default = "default_max_interval")]
	pub max_interval_ms: u64,
	#[serde(default = "default_max_elapsed")]
	pub max_elapsed_secs: u64,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			fetch_attempts: default_fetch_attempts(),
			initial_interval_ms: default_initial_interval(),
			multiplier: default_multiplier(),
			randomization_factor: default_randomization(),
			max_interval_ms: default_max_interval(),
			max_elapsed_secs: default_max_elapsed(),
		}
	}
}

impl RetryConfig {
	pub fn initial_interval(&self) -> Duration {
		Duration::from_millis(self.initial_interval_ms)
	}

	pub fn max_interval(&self) -> Duration {
		Duration::from_millis(self.max_interval_ms)
	}

	pub fn max_elapsed(&self) -> Option<Duration> {
		match self.max_elapsed_secs {
			0 => None,
			secs => Some(Duration::from_secs(secs)),
		}
	}
}

fn default_fetch_attempts() -> u32 {
	3
}
fn default_initial_interval() -> u64 {
	500
}
fn default_multiplier() -> f64 {
	1.5
}
fn default_randomization() -> f64 {
	0.5
}
fn default_max_interval() -> u64 {
	60_000
}
fn default_max_elapsed() -> u64 {
	900
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
	#[serde(default = "default_stop_timeout")]
	pub stop_timeout_ms: u64,
}

impl Default for ProcessConfig {
	fn default() -> Self {
		Self {
			stop_timeout_ms: default_stop_timeout(),
		}
	}
}

fn default_stop_timeout() -> u64 {
	3000
}

/// Values given on the command line; they win over the config file.
///
/// List-valued fields accept comma-separated entries.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
	pub namespaces: Vec<String>,
	pub endpoints: Vec<String>,
	pub user: Option<String>,
	pub shutdown_behaviour: Option<String>,
	pub watched_keys: Option<String>,
	pub auto_restart: Option<bool>,
}

/// Validated settings for one engine.
#[derive(Debug, Clone)]
pub struct Config {
	/// Ordered; earlier namespaces win on name collisions.
	pub namespaces: Vec<String>,
	pub endpoints: Vec<Url>,
	pub credentials: Option<Credentials>,
	/// Program followed by its arguments.
	pub command: Vec<String>,
	pub shutdown_behaviour: ShutdownBehaviour,
	pub watched_keys: WatchedKeys,
	pub auto_restart: bool,
	pub retry: RetryConfig,
	pub request_timeout: Duration,
	pub stop_timeout: Duration,
}

impl Config {
	/// Builds a config from the construction parameters alone, with defaults
	/// for everything else.
	pub fn new(
		namespaces: Vec<String>,
		endpoints: Vec<String>,
		credentials: Option<Credentials>,
		command: Vec<String>,
		shutdown_behaviour: &str,
		watched_keys: Option<&str>,
	) -> Result<Self, ConfigError> {
		let overrides = Overrides {
			namespaces,
			endpoints,
			user: None,
			shutdown_behaviour: Some(shutdown_behaviour.to_string()),
			watched_keys: watched_keys.map(str::to_string),
			auto_restart: None,
		};
		let mut config = Self::resolve(FileConfig::default(), overrides, command)?;
		config.credentials = credentials;
		Ok(config)
	}

	/// Layers command-line overrides over a file config over the defaults.
	pub fn resolve(
		file: FileConfig,
		overrides: Overrides,
		command: Vec<String>,
	) -> Result<Self, ConfigError> {
		if command.first().map_or(true, |program| program.is_empty()) {
			return Err(ConfigError::EmptyCommand);
		}

		let shutdown_behaviour = overrides
			.shutdown_behaviour
			.as_deref()
			.or(file.shutdown_behaviour.as_deref())
			.unwrap_or("exit")
			.parse::<ShutdownBehaviour>()?;

		let namespaces = pick_list(&overrides.namespaces, &file.namespaces, DEFAULT_NAMESPACE);
		let mut normalized: Vec<String> = Vec::new();
		for ns in namespaces.iter().map(|ns| normalize_namespace(ns)) {
			if !normalized.contains(&ns) {
				normalized.push(ns);
			}
		}
		if normalized.is_empty() {
			return Err(ConfigError::NoNamespaces);
		}

		let endpoints = pick_list(&overrides.endpoints, &file.store.endpoints, DEFAULT_ENDPOINT)
			.into_iter()
			.map(|raw| {
				Url::parse(&raw).map_err(|source| ConfigError::InvalidEndpoint {
					endpoint: raw.clone(),
					source,
				})
			})
			.collect::<Result<Vec<_>, _>>()?;
		if endpoints.is_empty() {
			return Err(ConfigError::NoEndpoints);
		}

		let credentials = match overrides.user.as_deref() {
			Some(raw) => Some(Credentials::parse(raw)),
			None => file.store.username.as_ref().map(|user| {
				Credentials::new(user.clone(), file.store.password.clone().unwrap_or_default())
			}),
		};

		let watched_keys = match overrides.watched_keys.as_deref() {
			Some(list) => WatchedKeys::parse(list),
			None => WatchedKeys::from_keys(&file.watched_keys),
		};

		let mut retry = file.retry;
		retry.fetch_attempts = retry.fetch_attempts.max(1);

		Ok(Self {
			namespaces: normalized,
			endpoints,
			credentials,
			command,
			shutdown_behaviour,
			watched_keys,
			auto_restart: overrides.auto_restart.or(file.auto_restart).unwrap_or(true),
			retry,
			request_timeout: Duration::from_millis(file.store.request_timeout_ms),
			stop_timeout: Duration::from_millis(file.process.stop_timeout_ms),
		})
	}
}

/// First non-empty source wins; entries are split on commas and trimmed.
fn pick_list(primary: &[String], secondary: &[String], default: &str) -> Vec<String> {
	let source: Vec<&str> = if !primary.is_empty() {
		primary.iter().map(String::as_str).collect()
	} else if !secondary.is_empty() {
		secondary.iter().map(String::as_str).collect()
	} else {
		vec![default]
	};
	source
		.iter()
		.flat_map(|entry| entry.split(','))
		.map(str::trim)
		.filter(|entry| !entry.is_empty())
		.map(str::to_string)
		.collect()
}

pub fn config_dir() -> PathBuf {
	if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
		PathBuf::from(dir).join("etcdenv")
	} else if let Some(home) = home_dir() {
		home.join(".config").join("etcdenv")
	} else {
		PathBuf::from("/tmp/etcdenv/config")
	}
}

fn home_dir() -> Option<PathBuf> {
	std::env::var("HOME").ok().map(PathBuf::from)
}

pub fn default_config_path() -> PathBuf {
	config_dir().join("config.toml")
}

pub fn parse_file_config(path: &Path, content: &str) -> Result<FileConfig, ConfigError> {
	toml::from_str(content).map_err(|source| ConfigError::Parse {
		path: path.to_path_buf(),
		source,
	})
}

/// Loads the file config.
///
/// An explicit path must exist and parse. Without one, the default location
/// is tried and any problem with it falls back to an empty config.
pub fn load_file_config(explicit: Option<&Path>) -> Result<FileConfig, ConfigError> {
	if let Some(path) = explicit {
		let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.to_path_buf(),
			source,
		})?;
		return parse_file_config(path, &content);
	}

	let path = default_config_path();
	if !path.exists() {
		return Ok(FileConfig::default());
	}
	match std::fs::read_to_string(&path) {
		Ok(content) => match parse_file_config(&path, &content) {
			Ok(config) => Ok(config),
			Err(e) => {
				tracing::warn!("{}, using defaults", e);
				Ok(FileConfig::default())
			}
		},
		Err(e) => {
			tracing::warn!("failed to read {}: {}, using defaults", path.display(), e);
			Ok(FileConfig::default())
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cmd(args: &[&str]) -> Vec<String> {
		args.iter().map(|a| a.to_string()).collect()
	}

	#[test]
	fn defaults_apply_without_file_or_flags() {
		let config =
			Config::resolve(FileConfig::default(), Overrides::default(), cmd(&["env"])).unwrap();
		assert_eq!(config.namespaces, vec![DEFAULT_NAMESPACE.to_string()]);
		assert_eq!(config.endpoints[0].as_str(), "http://127.0.0.1:4001/");
		assert_eq!(config.shutdown_behaviour, ShutdownBehaviour::Exit);
		assert!(config.watched_keys.is_empty());
		assert!(config.auto_restart);
		assert!(config.credentials.is_none());
		assert_eq!(config.retry.fetch_attempts, 3);
		assert_eq!(config.stop_timeout, Duration::from_secs(3));
	}

	#[test]
	fn bad_shutdown_behaviour_is_rejected() {
		let err = Config::new(
			vec!["/env".into()],
			vec![],
			None,
			cmd(&["env"]),
			"sometimes",
			None,
		)
		.unwrap_err();
		assert!(matches!(err, ConfigError::ShutdownBehaviour { .. }));
	}

	#[test]
	fn empty_command_is_rejected() {
		let err = Config::new(vec![], vec![], None, vec![], "exit", None).unwrap_err();
		assert!(matches!(err, ConfigError::EmptyCommand));
	}

	#[test]
	fn invalid_endpoint_is_rejected() {
		let err = Config::new(
			vec![],
			vec!["not a url".into()],
			None,
			cmd(&["env"]),
			"exit",
			None,
		)
		.unwrap_err();
		assert!(matches!(err, ConfigError::InvalidEndpoint { .. }));
	}

	#[test]
	fn namespaces_keep_order_and_split_commas() {
		let config = Config::new(
			vec!["env/base,/env/app/".into(), "/env/base".into()],
			vec![],
			None,
			cmd(&["env"]),
			"restart",
			Some("PORT, LOG_LEVEL"),
		)
		.unwrap();
		assert_eq!(config.namespaces, vec!["/env/base", "/env/app"]);
		assert_eq!(config.shutdown_behaviour, ShutdownBehaviour::Restart);
		assert!(config.watched_keys.allows("PORT"));
		assert!(!config.watched_keys.allows("HOST"));
	}

	#[test]
	fn flags_override_file() {
		let file = parse_file_config(
			Path::new("config.toml"),
			r#"
namespaces = ["/from/file"]
shutdown_behaviour = "keepalive"
auto_restart = false

[store]
endpoints = ["http://10.0.0.1:2379"]
username = "svc"
password = "pw"
"#,
		)
		.unwrap();

		let overrides = Overrides {
			namespaces: vec!["/from/flags".into()],
			shutdown_behaviour: Some("restart".into()),
			..Default::default()
		};
		let config = Config::resolve(file, overrides, cmd(&["env"])).unwrap();
		assert_eq!(config.namespaces, vec!["/from/flags"]);
		assert_eq!(config.shutdown_behaviour, ShutdownBehaviour::Restart);
		assert!(!config.auto_restart);
		assert_eq!(config.endpoints[0].host_str(), Some("10.0.0.1"));
		assert_eq!(config.credentials, Some(Credentials::new("svc", "pw")));
	}

	#[test]
	fn retry_section_is_read() {
		let file = parse_file_config(
			Path::new("config.toml"),
			"[retry]\nfetch_attempts = 0\ninitial_interval_ms = 10\nmax_elapsed_secs = 0\n",
		)
		.unwrap();
		let config = Config::resolve(file, Overrides::default(), cmd(&["env"])).unwrap();
		assert_eq!(config.retry.fetch_attempts, 1);
		assert_eq!(config.retry.initial_interval(), Duration::from_millis(10));
		assert_eq!(config.retry.max_elapsed(), None);
		assert_eq!(config.retry.multiplier, 1.5);
	}

	#[test]
	fn malformed_file_reports_path() {
		let err = parse_file_config(Path::new("/etc/etcdenv.toml"), "namespaces = 3").unwrap_err();
		assert!(err.to_string().contains("/etc/etcdenv.toml"));
	}
}

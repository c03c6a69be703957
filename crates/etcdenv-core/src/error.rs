use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while building a [`Config`](crate::Config).
///
/// All of them are reported before any process is spawned or any
/// connection to the store is attempted.
#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("invalid shutdown behaviour {given:?}, choose one of: keepalive | exit | restart")]
	ShutdownBehaviour { given: String },

	#[error("no command given")]
	EmptyCommand,

	#[error("at least one namespace is required")]
	NoNamespaces,

	#[error("at least one store endpoint is required")]
	NoEndpoints,

	#[error("invalid store endpoint {endpoint:?}: {source}")]
	InvalidEndpoint {
		endpoint: String,
		#[source]
		source: url::ParseError,
	},

	#[error("failed to read {}: {source}", path.display())]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse {}: {source}", path.display())]
	Parse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},
}

//! Configuration and environment snapshot types shared by the etcdenv
//! runtime and its command-line shell.

pub mod config;
pub mod error;
pub mod snapshot;
pub mod types;

pub use config::{Config, FileConfig, Overrides, RetryConfig};
pub use error::ConfigError;
pub use snapshot::Snapshot;
pub use types::{Credentials, ShutdownBehaviour, WatchedKeys};

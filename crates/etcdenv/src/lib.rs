//! # etcdenv
//!
//! Run a command with its environment sourced from etcd, and restart it when
//! that environment changes.
//!
//! Namespaces are read in order and merged first-wins into a snapshot; the
//! child inherits the current environment with the snapshot layered on top.
//! With auto restart on, every namespace is watched and an accepted change
//! rebuilds the snapshot and restarts the child.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use etcdenv::{Engine, Outcome};
//! use etcdenv_core::Config;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::new(
//!     vec!["/environments/production".into()],
//!     vec!["http://127.0.0.1:4001".into()],
//!     None,
//!     vec!["my-server".into(), "--port".into(), "8080".into()],
//!     "restart",
//!     None,
//! )?;
//!
//! let engine = Engine::connect(config)?;
//! let handle = engine.handle();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     handle.shutdown();
//! });
//!
//! match engine.run().await? {
//!     Outcome::ChildExited(status) => std::process::exit(status),
//!     Outcome::Shutdown => Ok(()),
//! }
//! # }
//! ```

pub mod backoff;
pub mod engine;
pub mod error;
pub mod etcd;
pub mod source;
pub mod store;
pub mod supervisor;
pub mod watcher;

pub use backoff::{BackoffPolicy, ExponentialBackoff};
pub use engine::{Engine, EngineHandle, EngineState, EngineStatus, Outcome};
pub use error::{EngineError, StoreError, SupervisorError};
pub use etcd::EtcdClient;
pub use source::KeyValueSource;
pub use store::{KeyValueStore, MemoryStore, Node};
pub use supervisor::{ExitNotice, ProcessSupervisor};
pub use watcher::{NamespaceWatcher, WatchEvent};

use thiserror::Error;

/// Errors reported by a [`KeyValueStore`](crate::store::KeyValueStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
	/// No endpoint could be reached. Retried with backoff.
	#[error("store unreachable: {message}")]
	Unreachable { message: String },

	/// The namespace does not exist yet.
	#[error("namespace {namespace} does not exist")]
	NotFound { namespace: String },

	/// The watch cursor points at history the store no longer keeps.
	#[error("watch index {index} has been cleared")]
	IndexCleared { index: u64 },

	/// Anything the client does not know how to recover from.
	#[error("store protocol error: {message}")]
	Protocol { message: String },
}

impl StoreError {
	pub fn unreachable(message: impl Into<String>) -> Self {
		StoreError::Unreachable {
			message: message.into(),
		}
	}

	pub fn protocol(message: impl Into<String>) -> Self {
		StoreError::Protocol {
			message: message.into(),
		}
	}

	pub fn is_transient(&self) -> bool {
		matches!(self, StoreError::Unreachable { .. })
	}

	pub fn is_fatal(&self) -> bool {
		matches!(self, StoreError::Protocol { .. })
	}
}

#[derive(Debug, Error)]
pub enum SupervisorError {
	#[error("the process is already started")]
	AlreadyStarted,

	#[error("the process is not started yet")]
	NotStarted,

	#[error("failed to spawn {program}: {source}")]
	Spawn {
		program: String,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to signal pid {pid}: {source}")]
	Signal {
		pid: u32,
		#[source]
		source: nix::errno::Errno,
	},
}

#[derive(Debug, Error)]
pub enum EngineError {
	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Supervisor(#[from] SupervisorError),

	#[error("failed to build store client: {0}")]
	Client(#[source] reqwest::Error),
}

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use etcdenv_core::snapshot::{normalize_namespace, variable_name};
use etcdenv_core::{Config, ShutdownBehaviour, Snapshot, WatchedKeys};

use crate::error::{EngineError, SupervisorError};
use crate::etcd::EtcdClient;
use crate::source::{exit_requested, KeyValueSource};
use crate::store::KeyValueStore;
use crate::supervisor::{ExitNotice, ProcessSupervisor};
use crate::watcher::{NamespaceWatcher, WatchEvent};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
	Initializing,
	Running,
	ShuttingDown,
	Terminated,
}

/// Point-in-time view of a running engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
	pub state: EngineState,
	pub child_pid: Option<u32>,
	/// Restarts since the first start, whatever triggered them.
	pub restarts: u32,
	/// The variables the current child was started with.
	pub env: Snapshot,
}

/// How [`Engine::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
	/// The child exited under the `exit` shutdown behaviour.
	ChildExited(i32),
	/// Shutdown was requested through an [`EngineHandle`].
	Shutdown,
}

/// Cloneable remote control for a running [`Engine`].
#[derive(Clone)]
pub struct EngineHandle {
	shutdown: Arc<watch::Sender<bool>>,
	status: watch::Receiver<EngineStatus>,
}

impl EngineHandle {
	/// Asks the engine to stop its child and return. Calling it more than
	/// once is harmless.
	pub fn shutdown(&self) {
		self.shutdown.send_replace(true);
	}

	pub fn status(&self) -> EngineStatus {
		self.status.borrow().clone()
	}

	/// Resolves with the first status matching `predicate`. Returns the last
	/// known status if the engine is dropped first.
	pub async fn wait_for<F>(&self, predicate: F) -> EngineStatus
	where
		F: FnMut(&EngineStatus) -> bool,
	{
		let mut status = self.status.clone();
		let found = status.wait_for(predicate).await.map(|found| found.clone());
		match found {
			Ok(found) => found,
			Err(_) => status.borrow().clone(),
		}
	}
}

/// The reconciliation loop: keeps one child process running with the
/// environment found in the store, restarting it when that environment
/// changes and applying the shutdown behaviour when it exits.
///
/// Watch events, child exits and shutdown requests all land in one loop and
/// are handled one at a time, so the supervisor is never driven from two
/// places at once.
pub struct Engine<S> {
	source: Arc<KeyValueSource<S>>,
	supervisor: ProcessSupervisor,
	shutdown_behaviour: ShutdownBehaviour,
	watched_keys: WatchedKeys,
	auto_restart: bool,
	current_env: Snapshot,
	restarts: u32,
	shutdown: Arc<watch::Sender<bool>>,
	status: watch::Sender<EngineStatus>,
}

impl Engine<EtcdClient> {
	/// Builds an engine reading from the etcd cluster named in `config`.
	pub fn connect(config: Config) -> Result<Self, EngineError> {
		let client = EtcdClient::from_config(&config).map_err(EngineError::Client)?;
		Ok(Self::new(config, Arc::new(client)))
	}
}

impl<S: KeyValueStore> Engine<S> {
	pub fn new(config: Config, store: Arc<S>) -> Self {
		let source = Arc::new(KeyValueSource::from_config(store, &config));
		let supervisor = ProcessSupervisor::from_config(&config);
		let (shutdown, _) = watch::channel(false);
		let (status, _) = watch::channel(EngineStatus {
			state: EngineState::Initializing,
			child_pid: None,
			restarts: 0,
			env: Snapshot::new(),
		});

		Self {
			source,
			supervisor,
			shutdown_behaviour: config.shutdown_behaviour,
			watched_keys: config.watched_keys,
			auto_restart: config.auto_restart,
			current_env: Snapshot::new(),
			restarts: 0,
			shutdown: Arc::new(shutdown),
			status,
		}
	}

	pub fn handle(&self) -> EngineHandle {
		EngineHandle {
			shutdown: Arc::clone(&self.shutdown),
			status: self.status.subscribe(),
		}
	}

	/// Whether a change of `name` to `value` (`None` for a deletion) should
	/// restart the child.
	pub fn should_restart(&self, name: &str, value: Option<&str>) -> bool {
		if self.current_env.get(name).map(String::as_str) == value {
			return false;
		}
		self.watched_keys.allows(name)
	}

	/// Whether `env` differs from the current environment on any watched
	/// variable.
	pub fn environment_changed(&self, env: &Snapshot) -> bool {
		self.current_env
			.keys()
			.chain(env.keys())
			.any(|name| self.current_env.get(name) != env.get(name) && self.watched_keys.allows(name))
	}

	/// Fetches the environment, starts the child and reconciles until the
	/// child exits under the `exit` behaviour, shutdown is requested, or a
	/// store protocol error occurs. The child is stopped in every case.
	pub async fn run(mut self) -> Result<Outcome, EngineError> {
		let mut exit = self.shutdown.subscribe();
		let (event_tx, mut events) = mpsc::channel::<WatchEvent>(CHANNEL_CAPACITY);
		let (notice_tx, mut notices) = mpsc::channel::<ExitNotice>(CHANNEL_CAPACITY);
		let mut watchers = JoinSet::new();

		let result = match self.start(&notice_tx).await {
			Ok(()) => {
				if self.auto_restart {
					for namespace in self.source.namespaces() {
						let watcher = NamespaceWatcher::new(Arc::clone(&self.source), namespace.clone());
						watchers.spawn(watcher.run(exit.clone(), event_tx.clone()));
					}
				} else {
					tracing::info!("auto restart disabled, not watching the store");
				}
				self.reconcile(&mut exit, &mut events, &mut notices, &notice_tx)
					.await
			}
			Err(e) => Err(e),
		};

		if let Err(e) = &result {
			tracing::error!("stopping: {}", e);
		}
		self.set_state(EngineState::ShuttingDown);
		self.shutdown.send_replace(true);
		match self.supervisor.stop().await {
			Ok(()) | Err(SupervisorError::NotStarted) => {}
			Err(e) => tracing::warn!("failed to stop the process: {}", e),
		}
		watchers.shutdown().await;
		self.set_state(EngineState::Terminated);
		tracing::debug!("engine terminated");

		result
	}

	async fn start(&mut self, notices: &mpsc::Sender<ExitNotice>) -> Result<(), EngineError> {
		self.current_env = self.source.fetch_all().await?;
		self.supervisor.start(&self.current_env)?;
		self.supervisor.watch_process(notices.clone())?;
		self.set_state(EngineState::Running);
		Ok(())
	}

	async fn reconcile(
		&mut self,
		exit: &mut watch::Receiver<bool>,
		events: &mut mpsc::Receiver<WatchEvent>,
		notices: &mut mpsc::Receiver<ExitNotice>,
		notice_tx: &mpsc::Sender<ExitNotice>,
	) -> Result<Outcome, EngineError> {
		loop {
			tokio::select! {
				_ = exit_requested(exit) => {
					tracing::info!("shutdown requested");
					return Ok(Outcome::Shutdown);
				}
				Some(event) = events.recv() => self.on_watch_event(event, notice_tx).await?,
				Some(notice) = notices.recv() => {
					if let Some(outcome) = self.on_child_exit(notice, notice_tx).await? {
						return Ok(outcome);
					}
				}
			}
		}
	}

	async fn on_watch_event(
		&mut self,
		event: WatchEvent,
		notices: &mpsc::Sender<ExitNotice>,
	) -> Result<(), EngineError> {
		let (namespace, node) = match event {
			WatchEvent::Changed { namespace, node } => (namespace, node),
			WatchEvent::Failed { error, .. } => return Err(error.into()),
		};

		if node.value.is_none() && normalize_namespace(&node.key) == namespace {
			tracing::info!(namespace = %namespace, "namespace removed, rebuilding the environment");
			let env = self.source.fetch_all().await?;
			if !self.environment_changed(&env) {
				tracing::debug!(namespace = %namespace, "removal ignored");
				return Ok(());
			}
			return self.restart_with(env, notices).await;
		}

		let name = variable_name(&namespace, &node.key);
		if !self.should_restart(&name, node.value.as_deref()) {
			tracing::debug!(key = %node.key, "change ignored");
			return Ok(());
		}

		tracing::info!(key = %node.key, "{} changed, restarting the process", name);
		self.restart_child(notices).await
	}

	async fn on_child_exit(
		&mut self,
		notice: ExitNotice,
		notices: &mpsc::Sender<ExitNotice>,
	) -> Result<Option<Outcome>, EngineError> {
		if !self.supervisor.is_current(notice.generation) {
			tracing::debug!(generation = notice.generation, "exit of a replaced process ignored");
			return Ok(None);
		}

		tracing::info!(status = notice.status, behaviour = %self.shutdown_behaviour, "process exited");
		match self.shutdown_behaviour {
			ShutdownBehaviour::Exit => Ok(Some(Outcome::ChildExited(notice.status))),
			ShutdownBehaviour::Restart => {
				self.restart_child(notices).await?;
				Ok(None)
			}
			ShutdownBehaviour::KeepAlive => {
				self.supervisor.stop().await?;
				self.publish();
				tracing::info!("staying alive until the next change");
				Ok(None)
			}
		}
	}

	async fn restart_child(&mut self, notices: &mpsc::Sender<ExitNotice>) -> Result<(), EngineError> {
		let env = self.source.fetch_all().await?;
		self.restart_with(env, notices).await
	}

	/// Restarts the child with `env`. A child that cannot be spawned leaves
	/// the engine running without one until the next accepted change.
	async fn restart_with(&mut self, env: Snapshot, notices: &mpsc::Sender<ExitNotice>) -> Result<(), EngineError> {
		let result = self.supervisor.restart(&env).await;
		self.current_env = env;
		match result {
			Ok(_) => {
				self.restarts += 1;
				self.supervisor.watch_process(notices.clone())?;
			}
			Err(e @ SupervisorError::Spawn { .. }) => {
				tracing::error!("{}, waiting for the next change", e);
			}
			Err(e) => return Err(e.into()),
		}
		self.publish();
		Ok(())
	}

	fn set_state(&self, state: EngineState) {
		self.status.send_modify(|status| {
			status.state = state;
			self.fill(status);
		});
	}

	fn publish(&self) {
		self.status.send_modify(|status| self.fill(status));
	}

	fn fill(&self, status: &mut EngineStatus) {
		status.child_pid = self.supervisor.pid();
		status.restarts = self.restarts;
		status.env = self.current_env.clone();
	}
}

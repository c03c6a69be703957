use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use etcdenv_core::{Config, Snapshot};

use crate::error::SupervisorError;

/// Delay before an exit watcher starts waiting on a freshly spawned child.
pub const SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Published by [`ProcessSupervisor::watch_process`] when a child exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitNotice {
	/// Which start produced the child; see [`ProcessSupervisor::is_current`].
	pub generation: u64,
	pub status: i32,
}

/// Owns at most one child process.
///
/// The child inherits this process's standard streams and environment, with
/// the snapshot given to [`start`](Self::start) layered on top. A reaper task
/// waits on every child as soon as it is spawned, so exited children never
/// linger as zombies.
pub struct ProcessSupervisor {
	command: Vec<String>,
	stop_timeout: Duration,
	current: Option<ManagedChild>,
	generation: u64,
}

struct ManagedChild {
	pid: u32,
	generation: u64,
	started_at: Instant,
	exit: watch::Receiver<Option<i32>>,
}

impl ProcessSupervisor {
	pub fn new(command: Vec<String>, stop_timeout: Duration) -> Self {
		Self {
			command,
			stop_timeout,
			current: None,
			generation: 0,
		}
	}

	pub fn from_config(config: &Config) -> Self {
		Self::new(config.command.clone(), config.stop_timeout)
	}

	pub fn pid(&self) -> Option<u32> {
		self.current.as_ref().map(|c| c.pid)
	}

	/// True while a child is held and has not exited yet.
	pub fn is_running(&self) -> bool {
		self.current
			.as_ref()
			.is_some_and(|c| c.exit.borrow().is_none())
	}

	/// Whether `generation` names the child currently held.
	pub fn is_current(&self, generation: u64) -> bool {
		self.current
			.as_ref()
			.is_some_and(|c| c.generation == generation)
	}

	/// Spawns the command without waiting for it.
	pub fn start(&mut self, env: &Snapshot) -> Result<u32, SupervisorError> {
		if self.current.is_some() {
			return Err(SupervisorError::AlreadyStarted);
		}

		let (program, args) = match self.command.split_first() {
			Some(parts) => parts,
			None => {
				return Err(SupervisorError::Spawn {
					program: String::new(),
					source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
				})
			}
		};

		let mut child = Command::new(program)
			.args(args)
			.envs(env)
			.stdin(Stdio::inherit())
			.stdout(Stdio::inherit())
			.stderr(Stdio::inherit())
			.kill_on_drop(true)
			.spawn()
			.map_err(|source| SupervisorError::Spawn {
				program: program.clone(),
				source,
			})?;

		let pid = child.id().unwrap_or(0);
		let (exit_tx, exit_rx) = watch::channel(None);
		tokio::spawn(async move {
			let status = match child.wait().await {
				Ok(status) => status.code().unwrap_or(0),
				Err(e) => {
					tracing::warn!(pid, "failed to wait for child: {}", e);
					0
				}
			};
			let _ = exit_tx.send(Some(status));
		});

		self.generation += 1;
		self.current = Some(ManagedChild {
			pid,
			generation: self.generation,
			started_at: Instant::now(),
			exit: exit_rx,
		});
		tracing::info!(pid, program = %program, vars = env.len(), "process started");
		Ok(pid)
	}

	/// Sends SIGTERM, escalates to SIGKILL after the stop timeout, and
	/// returns once the child has been reaped.
	pub async fn stop(&mut self) -> Result<(), SupervisorError> {
		let child = self.current.take().ok_or(SupervisorError::NotStarted)?;
		let mut exit = child.exit.clone();

		if exit.borrow().is_none() {
			if let Err(e) = signal(child.pid, Signal::SIGTERM) {
				self.current = Some(child);
				return Err(e);
			}
			if tokio::time::timeout(self.stop_timeout, wait_exit(&mut exit))
				.await
				.is_err()
			{
				tracing::warn!(pid = child.pid, "process ignored SIGTERM for {:?}, killing", self.stop_timeout);
				if let Err(e) = signal(child.pid, Signal::SIGKILL) {
					self.current = Some(child);
					return Err(e);
				}
				wait_exit(&mut exit).await;
			}
		}

		tracing::info!(
			pid = child.pid,
			uptime_secs = child.started_at.elapsed().as_secs(),
			"process stopped"
		);
		Ok(())
	}

	/// Stops the current child if there is one, then starts a new one.
	pub async fn restart(&mut self, env: &Snapshot) -> Result<u32, SupervisorError> {
		match self.stop().await {
			Ok(()) | Err(SupervisorError::NotStarted) => {}
			Err(e) => return Err(e),
		}
		self.start(env)
	}

	/// Waits for the current child to exit and returns its status, 0 when
	/// it has none (killed by a signal).
	pub async fn wait(&self) -> Result<i32, SupervisorError> {
		let child = self.current.as_ref().ok_or(SupervisorError::NotStarted)?;
		let mut exit = child.exit.clone();
		Ok(wait_exit(&mut exit).await)
	}

	/// Publishes an [`ExitNotice`] on `notices` when the current child exits,
	/// whatever the reason.
	pub fn watch_process(&self, notices: mpsc::Sender<ExitNotice>) -> Result<(), SupervisorError> {
		let child = self.current.as_ref().ok_or(SupervisorError::NotStarted)?;
		let mut exit = child.exit.clone();
		let generation = child.generation;

		tokio::spawn(async move {
			tokio::time::sleep(SETTLE_DELAY).await;
			let status = wait_exit(&mut exit).await;
			let _ = notices.send(ExitNotice { generation, status }).await;
		});
		Ok(())
	}
}

async fn wait_exit(exit: &mut watch::Receiver<Option<i32>>) -> i32 {
	match exit.wait_for(Option::is_some).await {
		Ok(status) => status.unwrap_or(0),
		Err(_) => 0,
	}
}

fn signal(pid: u32, sig: Signal) -> Result<(), SupervisorError> {
	match kill(Pid::from_raw(pid as i32), sig) {
		Ok(()) | Err(Errno::ESRCH) => Ok(()),
		Err(source) => Err(SupervisorError::Signal { pid, source }),
	}
}

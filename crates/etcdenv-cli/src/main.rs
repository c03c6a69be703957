use std::io::IsTerminal;
use std::path::PathBuf;

use clap::Parser;
use etcdenv::{Engine, EngineHandle, Outcome};
use etcdenv_core::config::load_file_config;
use etcdenv_core::{Config, Overrides};
use owo_colors::OwoColorize;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

/// Use your etcd keys as environment variables.
///
/// Starts COMMAND with the keys of every namespace exported as environment
/// variables, and restarts it when they change.
#[derive(Debug, Parser)]
#[command(name = "etcdenv", version)]
struct Args {
	/// etcd directory to read variables from; repeatable, earlier ones win
	#[arg(short, long = "namespace", value_name = "NS")]
	namespaces: Vec<String>,

	/// etcd endpoint; repeatable
	#[arg(short, long = "server", value_name = "URL")]
	servers: Vec<String>,

	/// etcd credentials
	#[arg(short, long, value_name = "USER[:PASSWORD]")]
	user: Option<String>,

	/// What to do when the command exits: exit, keepalive or restart
	#[arg(short = 'b', long, value_name = "BEHAVIOUR")]
	shutdown_behaviour: Option<String>,

	/// Only restart when one of these keys changes (comma-separated)
	#[arg(short, long, value_name = "KEYS")]
	watched: Option<String>,

	/// Restart the command when the environment changes
	#[arg(short = 'r', long, value_name = "BOOL")]
	auto_restart: Option<bool>,

	/// Config file, instead of ~/.config/etcdenv/config.toml
	#[arg(short, long, value_name = "PATH")]
	config: Option<PathBuf>,

	/// Command to run, with its arguments
	#[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
	command: Vec<String>,
}

impl Args {
	fn overrides(&self) -> Overrides {
		Overrides {
			namespaces: self.namespaces.clone(),
			endpoints: self.servers.clone(),
			user: self.user.clone(),
			shutdown_behaviour: self.shutdown_behaviour.clone(),
			watched_keys: self.watched.clone(),
			auto_restart: self.auto_restart,
		}
	}
}

#[tokio::main]
async fn main() {
	let args = Args::parse();

	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_writer(std::io::stderr)
		.init();

	let config = match load_file_config(args.config.as_deref())
		.and_then(|file| Config::resolve(file, args.overrides(), args.command.clone()))
	{
		Ok(config) => config,
		Err(e) => fail(&e),
	};

	tracing::debug!(
		namespaces = ?config.namespaces,
		behaviour = %config.shutdown_behaviour,
		auto_restart = config.auto_restart,
		"configured"
	);

	let engine = match Engine::connect(config) {
		Ok(engine) => engine,
		Err(e) => fail(&e),
	};
	forward_signals(engine.handle());

	match engine.run().await {
		Ok(Outcome::ChildExited(status)) => std::process::exit(status),
		Ok(Outcome::Shutdown) => {}
		Err(e) => fail(&e),
	}
}

fn forward_signals(handle: EngineHandle) {
	for (kind, name) in [(SignalKind::interrupt(), "SIGINT"), (SignalKind::terminate(), "SIGTERM")] {
		let mut stream = match signal(kind) {
			Ok(stream) => stream,
			Err(e) => {
				tracing::warn!("can't listen for {}: {}", name, e);
				continue;
			}
		};
		let handle = handle.clone();
		tokio::spawn(async move {
			while stream.recv().await.is_some() {
				tracing::info!("received {}, shutting down", name);
				handle.shutdown();
			}
		});
	}
}

fn fail(err: &dyn std::error::Error) -> ! {
	if std::io::stderr().is_terminal() {
		eprintln!("{} {}", "error:".red().bold(), err);
	} else {
		eprintln!("error: {}", err);
	}
	std::process::exit(1);
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::CommandFactory;

	#[test]
	fn args_are_well_formed() {
		Args::command().debug_assert();
	}

	#[test]
	fn parses_options_and_command() {
		let args = Args::try_parse_from([
			"etcdenv", "-n", "/env/base", "-n", "/env/app", "-s", "http://127.0.0.1:2379", "-u", "alice:secret",
			"-b", "restart", "-w", "PORT,HOST", "-r", "false", "node", "server.js", "--port", "8080",
		])
		.unwrap();

		assert_eq!(args.namespaces, vec!["/env/base", "/env/app"]);
		assert_eq!(args.auto_restart, Some(false));
		assert_eq!(args.command, vec!["node", "server.js", "--port", "8080"]);

		let overrides = args.overrides();
		assert_eq!(overrides.endpoints, vec!["http://127.0.0.1:2379"]);
		assert_eq!(overrides.user.as_deref(), Some("alice:secret"));
		assert_eq!(overrides.shutdown_behaviour.as_deref(), Some("restart"));
		assert_eq!(overrides.watched_keys.as_deref(), Some("PORT,HOST"));
	}

	#[test]
	fn command_after_double_dash_keeps_its_flags() {
		let args = Args::try_parse_from(["etcdenv", "--", "ls", "-n", "/tmp"]).unwrap();
		assert!(args.namespaces.is_empty());
		assert_eq!(args.command, vec!["ls", "-n", "/tmp"]);
	}

	#[test]
	fn command_is_required() {
		assert!(Args::try_parse_from(["etcdenv", "-n", "/env"]).is_err());
	}
}

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// What the engine does when the child exits without being asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownBehaviour {
	/// Stop everything and exit with the child's status.
	#[default]
	Exit,
	/// Stay up with no child until the next restart-worthy change.
	KeepAlive,
	/// Rebuild the environment and start the child again.
	Restart,
}

impl ShutdownBehaviour {
	pub fn as_str(&self) -> &'static str {
		match self {
			ShutdownBehaviour::Exit => "exit",
			ShutdownBehaviour::KeepAlive => "keepalive",
			ShutdownBehaviour::Restart => "restart",
		}
	}
}

impl FromStr for ShutdownBehaviour {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"exit" => Ok(ShutdownBehaviour::Exit),
			"keepalive" => Ok(ShutdownBehaviour::KeepAlive),
			"restart" => Ok(ShutdownBehaviour::Restart),
			other => Err(ConfigError::ShutdownBehaviour {
				given: other.to_string(),
			}),
		}
	}
}

impl fmt::Display for ShutdownBehaviour {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Allow-list of variable names whose changes warrant a restart.
///
/// An empty list allows every name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchedKeys(Vec<String>);

impl WatchedKeys {
	/// Parses a comma-separated list, ignoring blanks around and between names.
	pub fn parse(list: &str) -> Self {
		Self::from_keys(list.split(','))
	}

	pub fn from_keys<I, S>(keys: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		let mut names: Vec<String> = Vec::new();
		for key in keys {
			let key = key.as_ref().trim();
			if !key.is_empty() && !names.iter().any(|n| n == key) {
				names.push(key.to_string());
			}
		}
		Self(names)
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn allows(&self, name: &str) -> bool {
		self.0.is_empty() || self.0.iter().any(|k| k == name)
	}

	pub fn iter(&self) -> impl Iterator<Item = &str> {
		self.0.iter().map(String::as_str)
	}
}

/// Basic-auth credentials for the store.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
	pub username: String,
	pub password: String,
}

impl Credentials {
	pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
		Self {
			username: username.into(),
			password: password.into(),
		}
	}

	/// Parses `user` or `user:password`.
	pub fn parse(raw: &str) -> Self {
		match raw.split_once(':') {
			Some((user, password)) => Self::new(user, password),
			None => Self::new(raw, ""),
		}
	}
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credentials")
			.field("username", &self.username)
			.field("password", &"<redacted>")
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn shutdown_behaviour_parses_known_values() {
		assert_eq!("exit".parse::<ShutdownBehaviour>().unwrap(), ShutdownBehaviour::Exit);
		assert_eq!(
			"keepalive".parse::<ShutdownBehaviour>().unwrap(),
			ShutdownBehaviour::KeepAlive
		);
		assert_eq!(
			"restart".parse::<ShutdownBehaviour>().unwrap(),
			ShutdownBehaviour::Restart
		);
	}

	#[test]
	fn shutdown_behaviour_rejects_unknown_value() {
		let err = "reboot".parse::<ShutdownBehaviour>().unwrap_err();
		let msg = err.to_string();
		assert!(msg.contains("reboot"), "{}", msg);
		assert!(msg.contains("keepalive | exit | restart"), "{}", msg);
	}

	#[test]
	fn shutdown_behaviour_display_round_trips() {
		for b in [
			ShutdownBehaviour::Exit,
			ShutdownBehaviour::KeepAlive,
			ShutdownBehaviour::Restart,
		] {
			assert_eq!(b.to_string().parse::<ShutdownBehaviour>().unwrap(), b);
		}
	}

	#[test]
	fn watched_keys_parse_trims_and_skips_blanks() {
		let keys = WatchedKeys::parse(" PORT, ,LOG_LEVEL,PORT,");
		assert_eq!(keys.iter().collect::<Vec<_>>(), vec!["PORT", "LOG_LEVEL"]);
	}

	#[test]
	fn empty_watched_keys_allow_everything() {
		let keys = WatchedKeys::parse("");
		assert!(keys.is_empty());
		assert!(keys.allows("ANYTHING"));
	}

	#[test]
	fn watched_keys_restrict_names() {
		let keys = WatchedKeys::parse("BAR");
		assert!(keys.allows("BAR"));
		assert!(!keys.allows("FOO"));
	}

	#[test]
	fn credentials_parse_user_and_password() {
		assert_eq!(Credentials::parse("alice:s3:cret"), Credentials::new("alice", "s3:cret"));
		assert_eq!(Credentials::parse("bob"), Credentials::new("bob", ""));
	}

	#[test]
	fn credentials_debug_hides_password() {
		let debug = format!("{:?}", Credentials::new("alice", "hunter2"));
		assert!(debug.contains("alice"));
		assert!(!debug.contains("hunter2"));
	}
}

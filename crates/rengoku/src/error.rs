use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
	#[error("scheduler failed to start: {0}")]
	SchedulerStart(#[source] io::Error),

	#[error("scheduler is stopped")]
	SchedulerStopped,

	#[error("invalid process spec `{name}`: {reason}")]
	InvalidSpec { name: String, reason: String },

	#[error("duplicate process name `{0}`")]
	DuplicateName(String),

	#[error("supervisor already started")]
	AlreadyStarted,

	#[error("no managed process named `{0}`")]
	UnknownProcess(String),

	#[error("failed to read {}: {source}", path.display())]
	ConfigRead {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("failed to parse {}: {source}", path.display())]
	ConfigParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("failed to spawn {}: {source}", executable.display())]
	Spawn {
		executable: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("unknown user `{0}`")]
	UnknownUser(String),

	#[error("failed to terminate pid {pid}: {reason}")]
	Terminate { pid: u32, reason: String },
}

impl Error {
	pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
		Error::InvalidSpec {
			name: name.to_string(),
			reason: reason.into(),
		}
	}
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Exit status the OS reports for a process that has not exited yet.
pub const STILL_ACTIVE: i64 = 259;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessSpec {
	pub name: String,
	pub executable: PathBuf,
	pub command: String,
	#[serde(default)]
	pub directory: PathBuf,
	#[serde(default)]
	pub env: HashMap<String, String>,
	#[serde(default = "default_true")]
	pub autostart: bool,
	#[serde(default)]
	pub autostart_delay_secs: u64,
	#[serde(default = "default_interval")]
	pub interval_secs: u64,
	#[serde(default)]
	pub stop_mode: StopMode,
	#[serde(default = "default_exit_codes")]
	pub exit_codes: Vec<i64>,
	#[serde(default = "default_numprocs")]
	pub numprocs: u32,
	#[serde(default)]
	pub numprocs_start: u32,
	#[serde(default = "default_user")]
	pub user: String,
}

fn default_true() -> bool {
	true
}
fn default_interval() -> u64 {
	5
}
fn default_exit_codes() -> Vec<i64> {
	vec![0]
}
fn default_numprocs() -> u32 {
	1
}
fn default_user() -> String {
	"system".to_string()
}

impl ProcessSpec {
	/// A spec with every optional field at its config-file default.
	pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>, command: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			executable: executable.into(),
			command: command.into(),
			directory: PathBuf::new(),
			env: HashMap::new(),
			autostart: true,
			autostart_delay_secs: 0,
			interval_secs: default_interval(),
			stop_mode: StopMode::default(),
			exit_codes: default_exit_codes(),
			numprocs: 1,
			numprocs_start: 0,
			user: default_user(),
		}
	}

	pub fn accepts_exit_code(&self, code: i64) -> bool {
		self.exit_codes.contains(&code)
	}

	/// Whether `user` names an account other than the supervisor's own.
	pub fn runs_as_other_user(&self) -> bool {
		!self.user.is_empty() && !self.user.eq_ignore_ascii_case("system")
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StopMode {
	Kill,
	#[default]
	KillTree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
	StillActive,
	Exited(i64),
}

impl ExitState {
	pub fn is_active(&self) -> bool {
		matches!(self, ExitState::StillActive)
	}

	/// Numeric form used on the wire; `StillActive` maps to [`STILL_ACTIVE`].
	pub fn code(&self) -> i64 {
		match self {
			ExitState::StillActive => STILL_ACTIVE,
			ExitState::Exited(code) => *code,
		}
	}
}

impl Default for ExitState {
	fn default() -> Self {
		ExitState::Exited(0)
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
	Running,
	Exited,
}

impl RunState {
	pub fn derive(pid: u32, exit: ExitState) -> Self {
		if pid != 0 && exit.is_active() {
			RunState::Running
		} else {
			RunState::Exited
		}
	}
}

/// Snapshot of one managed process, built from cached state only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessStatus {
	pub name: String,
	pub executable: PathBuf,
	pub command: String,
	pub directory: PathBuf,
	pub environment: HashMap<String, String>,
	pub pid: u32,
	pub exit_code: i64,
	pub status: RunState,
}

impl ProcessStatus {
	pub fn is_running(&self) -> bool {
		self.status == RunState::Running
	}
}

/// One row of a process table snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
	pub pid: u32,
	pub parent_pid: Option<u32>,
	pub name: String,
	pub image_path: Option<PathBuf>,
}

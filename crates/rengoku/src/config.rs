use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::ProcessSpec;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
	#[serde(default)]
	pub daemon: DaemonConfig,
	#[serde(default, rename = "process")]
	pub processes: Vec<ProcessSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
	pub http_port: Option<u16>,
	#[serde(default = "default_log_level")]
	pub log_level: String,
}

impl Default for DaemonConfig {
	fn default() -> Self {
		Self {
			http_port: None,
			log_level: default_log_level(),
		}
	}
}

fn default_log_level() -> String {
	"info".to_string()
}

pub fn load(path: &Path) -> Result<Config> {
	let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
		path: path.to_path_buf(),
		source,
	})?;
	parse_at(&content, path)
}

pub fn parse(content: &str) -> Result<Config> {
	parse_at(content, Path::new("<inline>"))
}

fn parse_at(content: &str, path: &Path) -> Result<Config> {
	let config: Config = toml::from_str(content).map_err(|source| Error::ConfigParse {
		path: path.to_path_buf(),
		source,
	})?;
	for spec in &config.processes {
		spec.validate()?;
	}
	Ok(config)
}

impl Config {
	/// Every process after replica expansion, in file order.
	pub fn expanded(&self) -> Vec<ProcessSpec> {
		self.processes.iter().flat_map(ProcessSpec::replicas).collect()
	}
}

const PROCESS_NUM: &str = "{process_num}";

impl ProcessSpec {
	pub fn validate(&self) -> Result<()> {
		if self.name.trim().is_empty() {
			return Err(Error::invalid(&self.name, "name is empty"));
		}
		if self.executable.as_os_str().is_empty() {
			return Err(Error::invalid(&self.name, "executable is empty"));
		}
		if self.command.trim().is_empty() {
			return Err(Error::invalid(&self.name, "command is empty"));
		}
		if self.interval_secs == 0 {
			return Err(Error::invalid(&self.name, "interval_secs must be at least 1"));
		}
		if self.numprocs == 0 {
			return Err(Error::invalid(&self.name, "numprocs must be at least 1"));
		}
		if self.numprocs_start.checked_add(self.numprocs).is_none() {
			return Err(Error::invalid(&self.name, "numprocs_start + numprocs is out of range"));
		}
		Ok(())
	}

	/// `numprocs` copies named `name:index`, with `{process_num}` replaced
	/// in the command, directory and env values.
	pub fn replicas(&self) -> Vec<ProcessSpec> {
		if self.numprocs <= 1 {
			return vec![self.clone()];
		}

		let end = self.numprocs_start.saturating_add(self.numprocs);
		(self.numprocs_start..end)
			.map(|index| {
				let num = index.to_string();
				let mut spec = self.clone();
				spec.name = format!("{}:{}", self.name, index);
				spec.command = self.command.replace(PROCESS_NUM, &num);
				spec.directory = PathBuf::from(self.directory.to_string_lossy().replace(PROCESS_NUM, &num));
				for value in spec.env.values_mut() {
					*value = value.replace(PROCESS_NUM, &num);
				}
				spec.numprocs = 1;
				spec.numprocs_start = 0;
				spec
			})
			.collect()
	}
}

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use crate::directory::ProcessDirectory;
use crate::error::{Error, Result};
use crate::managed::ManagedProcess;
use crate::scheduler::Scheduler;
use crate::types::{ProcessSpec, ProcessStatus};

pub struct Supervisor {
	scheduler: Scheduler,
	directory: Arc<ProcessDirectory>,
	processes: RwLock<Vec<ManagedProcess>>,
	started: AtomicBool,
}

impl Supervisor {
	pub fn new(scheduler: Scheduler) -> Self {
		Self {
			scheduler,
			directory: Arc::new(ProcessDirectory::new()),
			processes: RwLock::new(Vec::new()),
			started: AtomicBool::new(false),
		}
	}

	pub fn scheduler(&self) -> &Scheduler {
		&self.scheduler
	}

	/// Validates and expands `specs`, cleans up stale instances of every
	/// executable, then arms the autostart processes.
	///
	/// Nothing is armed if any spec is rejected.
	pub fn start(&self, specs: &[ProcessSpec]) -> Result<()> {
		let mut expanded = Vec::new();
		for spec in specs {
			spec.validate()?;
			expanded.extend(spec.replicas());
		}

		let mut seen = HashSet::new();
		for spec in &expanded {
			if !seen.insert(spec.name.as_str()) {
				return Err(Error::DuplicateName(spec.name.clone()));
			}
		}

		if self.started.swap(true, Ordering::SeqCst) {
			return Err(Error::AlreadyStarted);
		}

		let managed: Vec<ManagedProcess> = expanded
			.into_iter()
			.map(|spec| ManagedProcess::new(spec, self.scheduler.clone(), Arc::clone(&self.directory)))
			.collect();

		for mp in &managed {
			mp.init();
		}

		let mut armed = 0;
		for mp in &managed {
			if mp.spec().autostart && mp.start() {
				armed += 1;
			}
		}
		tracing::info!("supervising {} processes ({} autostarted)", managed.len(), armed);

		*self.processes.write().unwrap_or_else(PoisonError::into_inner) = managed;
		Ok(())
	}

	pub fn stop(&self) {
		let processes = self.read();
		for mp in processes.iter() {
			mp.stop();
		}
		tracing::info!("stopped {} processes", processes.len());
	}

	/// Cached status of every managed process.
	///
	/// `_pid` is accepted for API compatibility and currently ignored.
	pub fn status(&self, _pid: Option<u32>) -> Vec<ProcessStatus> {
		self.read().iter().map(ManagedProcess::status).collect()
	}

	pub fn names(&self) -> Vec<String> {
		self.read().iter().map(|mp| mp.name().to_string()).collect()
	}

	pub fn start_process(&self, name: &str) -> Result<()> {
		self.with_process(name, |mp| {
			if mp.start() {
				Ok(())
			} else {
				Err(Error::SchedulerStopped)
			}
		})
	}

	pub fn stop_process(&self, name: &str) -> Result<()> {
		self.with_process(name, |mp| {
			mp.stop();
			Ok(())
		})
	}

	pub fn restart_process(&self, name: &str) -> Result<()> {
		self.with_process(name, |mp| {
			mp.stop();
			if mp.start() {
				Ok(())
			} else {
				Err(Error::SchedulerStopped)
			}
		})
	}

	fn with_process<T>(&self, name: &str, f: impl FnOnce(&ManagedProcess) -> Result<T>) -> Result<T> {
		let processes = self.read();
		let mp = processes
			.iter()
			.find(|mp| mp.name() == name)
			.ok_or_else(|| Error::UnknownProcess(name.to_string()))?;
		f(mp)
	}

	fn read(&self) -> RwLockReadGuard<'_, Vec<ManagedProcess>> {
		self.processes.read().unwrap_or_else(PoisonError::into_inner)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::RunState;

	fn idle_spec(name: &str) -> ProcessSpec {
		let mut spec = ProcessSpec::new(name, "/nonexistent/rengoku-test-worker", "worker");
		spec.autostart = false;
		spec
	}

	#[test]
	fn rejects_invalid_spec_before_arming() {
		let sup = Supervisor::new(Scheduler::new().unwrap());
		let mut bad = idle_spec("bad");
		bad.command.clear();
		let err = sup.start(&[idle_spec("ok"), bad]).unwrap_err();
		assert!(matches!(err, Error::InvalidSpec { .. }));
		assert!(sup.status(None).is_empty());
		// rejected start does not consume the one allowed start
		sup.start(&[idle_spec("ok")]).unwrap();
	}

	#[test]
	fn rejects_duplicate_names() {
		let sup = Supervisor::new(Scheduler::new().unwrap());
		let err = sup.start(&[idle_spec("a"), idle_spec("a")]).unwrap_err();
		assert!(matches!(err, Error::DuplicateName(name) if name == "a"));
	}

	#[test]
	fn second_start_is_an_error() {
		let sup = Supervisor::new(Scheduler::new().unwrap());
		sup.start(&[idle_spec("a")]).unwrap();
		assert!(matches!(sup.start(&[idle_spec("b")]), Err(Error::AlreadyStarted)));
		assert_eq!(sup.names(), vec!["a".to_string()]);
	}

	#[test]
	fn replicas_are_expanded() {
		let sup = Supervisor::new(Scheduler::new().unwrap());
		let mut spec = idle_spec("w");
		spec.numprocs = 3;
		spec.numprocs_start = 1;
		sup.start(&[spec]).unwrap();
		assert_eq!(sup.names(), vec!["w:1", "w:2", "w:3"]);
	}

	#[test]
	fn status_ignores_pid_filter() {
		let sup = Supervisor::new(Scheduler::new().unwrap());
		sup.start(&[idle_spec("a"), idle_spec("b")]).unwrap();
		let all = sup.status(None);
		let filtered = sup.status(Some(12345));
		assert_eq!(all, filtered);
		assert_eq!(all.len(), 2);
		assert!(all.iter().all(|s| s.status == RunState::Exited && s.pid == 0));
	}

	#[test]
	fn control_operations_on_unknown_name() {
		let sup = Supervisor::new(Scheduler::new().unwrap());
		sup.start(&[idle_spec("a")]).unwrap();
		assert!(matches!(sup.start_process("nope"), Err(Error::UnknownProcess(_))));
		assert!(matches!(sup.stop_process("nope"), Err(Error::UnknownProcess(_))));
		assert!(matches!(sup.restart_process("nope"), Err(Error::UnknownProcess(_))));
		sup.stop_process("a").unwrap();
	}

	#[test]
	fn start_process_fails_when_scheduler_stopped() {
		let sched = Scheduler::new().unwrap();
		let sup = Supervisor::new(sched.clone());
		sup.start(&[idle_spec("a")]).unwrap();
		sched.stop();
		assert!(matches!(sup.start_process("a"), Err(Error::SchedulerStopped)));
	}
}

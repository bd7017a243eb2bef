use std::ops::{Deref, DerefMut};
use std::process::{Child, ExitStatus};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::directory::ProcessDirectory;
use crate::scheduler::{Scheduler, TimerId};
use crate::types::{ExitState, ProcessSpec, ProcessStatus, RunState, StopMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	/// Constructed, no timer armed.
	Idle,
	/// Waiting out `autostart_delay_secs`.
	DelayPending,
	/// Ticking every `interval_secs`, relaunching when the child is gone.
	Polling,
	Stopped,
}

struct State {
	child: Option<Child>,
	pid: u32,
	exit: ExitState,
	stopped: bool,
	timer: Option<TimerId>,
	phase: Phase,
	launches: u32,
	last_error: Option<String>,
}

/// Copy of the observable fields, refreshed whenever the state lock is
/// released. Readers never wait on a tick, even one blocked in a spawn.
#[derive(Clone)]
struct View {
	pid: u32,
	exit: ExitState,
	phase: Phase,
	launches: u32,
	last_error: Option<String>,
}

impl View {
	fn of(state: &State) -> Self {
		Self {
			pid: state.pid,
			exit: state.exit,
			phase: state.phase,
			launches: state.launches,
			last_error: state.last_error.clone(),
		}
	}
}

struct Shared {
	spec: ProcessSpec,
	scheduler: Scheduler,
	directory: Arc<ProcessDirectory>,
	state: Mutex<State>,
	view: Mutex<View>,
}

struct StateGuard<'a> {
	state: MutexGuard<'a, State>,
	view: &'a Mutex<View>,
}

impl Deref for StateGuard<'_> {
	type Target = State;

	fn deref(&self) -> &State {
		&self.state
	}
}

impl DerefMut for StateGuard<'_> {
	fn deref_mut(&mut self) -> &mut State {
		&mut self.state
	}
}

impl Drop for StateGuard<'_> {
	fn drop(&mut self) {
		*self.view.lock().unwrap_or_else(PoisonError::into_inner) = View::of(&self.state);
	}
}

/// Lifecycle of one configured process.
///
/// After [`ManagedProcess::start`] the state is driven by callbacks on the
/// scheduler's loop thread. `start` and `stop` take the same lock a tick
/// holds for its whole run, so they are ordered after any tick in flight.
/// The accessors read a copy published when that lock is released and
/// never block on a tick.
/// Timers only keep a weak reference; dropping the `ManagedProcess` stops it.
pub struct ManagedProcess {
	shared: Arc<Shared>,
}

impl ManagedProcess {
	pub fn new(spec: ProcessSpec, scheduler: Scheduler, directory: Arc<ProcessDirectory>) -> Self {
		let state = State {
			child: None,
			pid: 0,
			exit: ExitState::default(),
			stopped: false,
			timer: None,
			phase: Phase::Idle,
			launches: 0,
			last_error: None,
		};
		Self {
			shared: Arc::new(Shared {
				spec,
				scheduler,
				directory,
				view: Mutex::new(View::of(&state)),
				state: Mutex::new(state),
			}),
		}
	}

	/// Terminates leftovers of an earlier run: every live process whose
	/// image is this spec's executable. Returns how many were terminated.
	pub fn init(&self) -> usize {
		let spec = &self.shared.spec;
		let stale = self.shared.directory.find_by_executable_path(&spec.executable);
		let mut terminated = 0;
		for pid in stale {
			match self.shared.directory.terminate(pid, 0) {
				Ok(()) => {
					tracing::info!("{}: terminated stale pid {}", spec.name, pid);
					terminated += 1;
				}
				Err(e) => tracing::warn!("{}: {}", spec.name, e),
			}
		}
		terminated
	}

	/// Arms the autostart delay. Returns false if the scheduler refused.
	pub fn start(&self) -> bool {
		let shared = &self.shared;
		let mut state = shared.lock();
		if state.timer.is_some() {
			return true;
		}

		state.stopped = false;
		let weak = Arc::downgrade(shared);
		let delay = Duration::from_secs(shared.spec.autostart_delay_secs);
		let timer = shared.scheduler.set_timer(
			move || {
				if let Some(shared) = weak.upgrade() {
					shared.on_delay();
				}
			},
			delay,
			false,
		);

		match timer {
			Some(id) => {
				state.timer = Some(id);
				state.phase = Phase::DelayPending;
				tracing::info!("{}: starting in {}s", shared.spec.name, shared.spec.autostart_delay_secs);
				true
			}
			None => {
				tracing::warn!("{}: scheduler is stopped, not starting", shared.spec.name);
				false
			}
		}
	}

	pub fn stop(&self) {
		self.shared.stop();
	}

	pub fn name(&self) -> &str {
		&self.shared.spec.name
	}

	pub fn spec(&self) -> &ProcessSpec {
		&self.shared.spec
	}

	pub fn pid(&self) -> u32 {
		self.shared.view().pid
	}

	pub fn exit_state(&self) -> ExitState {
		self.shared.view().exit
	}

	pub fn phase(&self) -> Phase {
		self.shared.view().phase
	}

	/// Number of successful launches so far.
	pub fn launches(&self) -> u32 {
		self.shared.view().launches
	}

	pub fn last_error(&self) -> Option<String> {
		self.shared.view().last_error
	}

	pub fn status(&self) -> ProcessStatus {
		let spec = &self.shared.spec;
		let state = self.shared.view();
		ProcessStatus {
			name: spec.name.clone(),
			executable: spec.executable.clone(),
			command: spec.command.clone(),
			directory: spec.directory.clone(),
			environment: spec.env.clone(),
			pid: state.pid,
			exit_code: state.exit.code(),
			status: RunState::derive(state.pid, state.exit),
		}
	}
}

impl Drop for ManagedProcess {
	fn drop(&mut self) {
		self.shared.stop();
	}
}

impl Shared {
	fn lock(&self) -> StateGuard<'_> {
		StateGuard {
			state: self.state.lock().unwrap_or_else(PoisonError::into_inner),
			view: &self.view,
		}
	}

	fn view(&self) -> View {
		self.view.lock().unwrap_or_else(PoisonError::into_inner).clone()
	}

	fn on_delay(self: &Arc<Self>) {
		let mut state = self.lock();
		if state.stopped {
			return;
		}
		if let Some(id) = state.timer.take() {
			self.scheduler.kill_timer(id);
		}

		let weak = Arc::downgrade(self);
		let interval = Duration::from_secs(self.spec.interval_secs.max(1));
		state.timer = self.scheduler.set_interval_now(
			move || {
				if let Some(shared) = weak.upgrade() {
					shared.on_tick();
				}
			},
			interval,
		);
		state.phase = if state.timer.is_some() {
			Phase::Polling
		} else {
			Phase::Idle
		};
		tracing::debug!("{}: polling every {:?}", self.spec.name, interval);
	}

	fn on_tick(&self) {
		let mut state = self.lock();
		if state.stopped {
			return;
		}

		self.refresh_exit(&mut state);
		if state.exit.is_active() {
			return;
		}

		match self.directory.spawn(&self.spec) {
			Ok(spawned) => {
				tracing::info!("{}: launched pid {}", self.spec.name, spawned.pid);
				state.pid = spawned.pid;
				state.child = Some(spawned.child);
				state.exit = ExitState::StillActive;
				state.launches += 1;
				state.last_error = None;
				self.refresh_exit(&mut state);
			}
			Err(e) => {
				tracing::error!("{}: {}", self.spec.name, e);
				state.last_error = Some(e.to_string());
			}
		}
	}

	/// Re-reads the exit status from the owned handle, closing it once the
	/// process is observed to have exited.
	fn refresh_exit(&self, state: &mut State) {
		let Some(child) = state.child.as_mut() else {
			return;
		};

		match child.try_wait() {
			Ok(None) => state.exit = ExitState::StillActive,
			Ok(Some(status)) => {
				let code = exit_code(status);
				if self.spec.accepts_exit_code(code) {
					tracing::info!("{}: pid {} exited ({})", self.spec.name, state.pid, code);
				} else {
					tracing::warn!("{}: pid {} exited unexpectedly ({})", self.spec.name, state.pid, code);
				}
				state.exit = ExitState::Exited(code);
				state.child = None;
				state.pid = 0;
			}
			Err(e) => {
				tracing::warn!("{}: cannot query pid {}: {}", self.spec.name, state.pid, e);
			}
		}
	}

	fn stop(&self) {
		let mut state = self.lock();
		state.stopped = true;
		state.phase = Phase::Stopped;
		if let Some(id) = state.timer.take() {
			self.scheduler.kill_timer(id);
		}

		self.refresh_exit(&mut state);
		let Some(mut child) = state.child.take() else {
			return;
		};
		let pid = state.pid;

		let children = match self.spec.stop_mode {
			StopMode::KillTree => self.directory.find_children(pid),
			StopMode::Kill => Vec::new(),
		};

		if let Err(e) = child.kill() {
			tracing::debug!("{}: kill pid {}: {}", self.spec.name, pid, e);
		}
		match child.wait() {
			Ok(status) => state.exit = ExitState::Exited(exit_code(status)),
			Err(e) => tracing::warn!("{}: wait for pid {}: {}", self.spec.name, pid, e),
		}
		state.pid = 0;

		for child_pid in children {
			if let Err(e) = self.directory.terminate(child_pid, 0) {
				tracing::warn!("{}: {}", self.spec.name, e);
			}
		}
		tracing::info!("{}: stopped pid {} ({:?})", self.spec.name, pid, self.spec.stop_mode);
	}
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i64 {
	use std::os::unix::process::ExitStatusExt;
	status
		.code()
		.map(i64::from)
		.or_else(|| status.signal().map(|s| 128 + i64::from(s)))
		.unwrap_or(-1)
}

#[cfg(windows)]
fn exit_code(status: ExitStatus) -> i64 {
	status.code().map(|c| i64::from(c as u32)).unwrap_or(-1)
}

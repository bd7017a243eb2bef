//! Single-thread timer multiplexer.
//!
//! Every timer callback runs on one dedicated loop thread, one at a time. A
//! slow callback (spawning a process, walking the process table) therefore
//! delays every other timer's next tick. Managed processes rely on this to
//! keep their delay, poll and launch steps totally ordered, so callbacks
//! must not be moved onto a thread pool.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{Error, Result};

const MIN_PERIOD: Duration = Duration::from_millis(1);

type Callback = Box<dyn FnMut() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
	pub fn get(&self) -> u64 {
		self.0
	}
}

impl fmt::Display for TimerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
	Once,
	Repeat,
	RepeatNow,
}

struct TimerEntry {
	cancel: watch::Sender<bool>,
	interval: Duration,
	kind: TimerKind,
}

enum Reactor {
	Idle(Runtime),
	Running {
		shutdown: oneshot::Sender<()>,
		thread: JoinHandle<()>,
		thread_id: ThreadId,
	},
	Stopped,
}

struct Inner {
	stopped: AtomicBool,
	next_id: AtomicU64,
	timers: Mutex<HashMap<TimerId, TimerEntry>>,
	handle: Handle,
	reactor: Mutex<Reactor>,
}

/// Cheap to clone; all clones drive the same loop thread.
#[derive(Clone)]
pub struct Scheduler {
	inner: Arc<Inner>,
}

impl Scheduler {
	/// Builds the reactor without starting its thread. Timers registered
	/// before [`Scheduler::start`] begin counting once the loop runs.
	pub fn new() -> Result<Self> {
		let runtime = Builder::new_current_thread()
			.enable_time()
			.build()
			.map_err(Error::SchedulerStart)?;
		let handle = runtime.handle().clone();

		Ok(Self {
			inner: Arc::new(Inner {
				stopped: AtomicBool::new(false),
				next_id: AtomicU64::new(1),
				timers: Mutex::new(HashMap::new()),
				handle,
				reactor: Mutex::new(Reactor::Idle(runtime)),
			}),
		})
	}

	pub fn start(&self) -> Result<()> {
		let mut reactor = lock(&self.inner.reactor);
		match std::mem::replace(&mut *reactor, Reactor::Stopped) {
			Reactor::Idle(runtime) => {
				let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
				let spawned = thread::Builder::new()
					.name("rengoku-scheduler".to_string())
					.spawn(move || {
						runtime.block_on(async {
							let _ = shutdown_rx.await;
						});
					});
				match spawned {
					Ok(thread) => {
						let thread_id = thread.thread().id();
						*reactor = Reactor::Running {
							shutdown: shutdown_tx,
							thread,
							thread_id,
						};
						tracing::info!("scheduler started");
						Ok(())
					}
					Err(e) => {
						self.inner.stopped.store(true, Ordering::SeqCst);
						Err(Error::SchedulerStart(e))
					}
				}
			}
			running @ Reactor::Running { .. } => {
				*reactor = running;
				Ok(())
			}
			Reactor::Stopped => Err(Error::SchedulerStopped),
		}
	}

	/// Arms `callback` to fire after `delay`, then every `delay` when
	/// `repeat` is set. Returns `None` once the scheduler is stopped.
	///
	/// One-shot timers stay registered after firing; the owner cancels them
	/// with [`Scheduler::kill_timer`].
	pub fn set_timer<F>(&self, callback: F, delay: Duration, repeat: bool) -> Option<TimerId>
	where
		F: FnMut() + Send + 'static,
	{
		let kind = if repeat { TimerKind::Repeat } else { TimerKind::Once };
		self.inner.register(Box::new(callback), delay, kind)
	}

	/// Repeating timer whose first tick fires as soon as the loop gets to it.
	pub fn set_interval_now<F>(&self, callback: F, interval: Duration) -> Option<TimerId>
	where
		F: FnMut() + Send + 'static,
	{
		self.inner.register(Box::new(callback), interval, TimerKind::RepeatNow)
	}

	pub fn kill_timer(&self, id: TimerId) {
		if self.inner.stopped.load(Ordering::SeqCst) {
			return;
		}
		let entry = lock(&self.inner.timers).remove(&id);
		if let Some(entry) = entry {
			let _ = entry.cancel.send(true);
			tracing::trace!("timer {} cancelled ({:?}, {:?})", id, entry.kind, entry.interval);
		}
	}

	pub fn stop(&self) {
		self.inner.shutdown();
	}

	pub fn is_running(&self) -> bool {
		!self.inner.stopped.load(Ordering::SeqCst)
			&& matches!(*lock(&self.inner.reactor), Reactor::Running { .. })
	}

	pub fn is_stopped(&self) -> bool {
		self.inner.stopped.load(Ordering::SeqCst)
	}

	pub fn timer_count(&self) -> usize {
		lock(&self.inner.timers).len()
	}
}

impl fmt::Debug for Scheduler {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Scheduler")
			.field("stopped", &self.is_stopped())
			.field("timers", &self.timer_count())
			.finish()
	}
}

impl Inner {
	fn register(&self, callback: Callback, interval: Duration, kind: TimerKind) -> Option<TimerId> {
		let mut timers = lock(&self.timers);
		if self.stopped.load(Ordering::SeqCst) {
			return None;
		}

		let id = TimerId(self.next_id.fetch_add(1, Ordering::SeqCst));
		let (cancel, cancelled) = watch::channel(false);
		self.handle.spawn(run_timer(id, interval, kind, callback, cancelled));
		timers.insert(id, TimerEntry { cancel, interval, kind });
		tracing::trace!("timer {} armed ({:?}, {:?})", id, kind, interval);
		Some(id)
	}

	fn shutdown(&self) {
		if self
			.stopped
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			return;
		}

		for entry in lock(&self.timers).values() {
			let _ = entry.cancel.send(true);
		}

		let reactor = std::mem::replace(&mut *lock(&self.reactor), Reactor::Stopped);
		match reactor {
			Reactor::Running {
				shutdown,
				thread,
				thread_id,
			} => {
				let _ = shutdown.send(());
				if thread::current().id() == thread_id {
					tracing::warn!("scheduler stopped from its own loop thread, not joining");
				} else if thread.join().is_err() {
					tracing::error!("scheduler loop thread panicked");
				}
			}
			Reactor::Idle(runtime) => runtime.shutdown_background(),
			Reactor::Stopped => {}
		}

		lock(&self.timers).clear();
		tracing::info!("scheduler stopped");
	}
}

impl Drop for Inner {
	fn drop(&mut self) {
		self.shutdown();
	}
}

async fn run_timer(
	id: TimerId,
	period: Duration,
	kind: TimerKind,
	mut callback: Callback,
	mut cancelled: watch::Receiver<bool>,
) {
	let first = match kind {
		TimerKind::RepeatNow => Instant::now(),
		TimerKind::Once | TimerKind::Repeat => Instant::now() + period,
	};
	let mut ticker = tokio::time::interval_at(first, period.max(MIN_PERIOD));
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			biased;
			_ = cancelled.changed() => return,
			_ = ticker.tick() => {}
		}
		if *cancelled.borrow() {
			return;
		}

		tracing::trace!("timer {} fired", id);
		callback();

		if kind == TimerKind::Once {
			return;
		}
	}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;

	fn counter() -> (Arc<AtomicUsize>, impl FnMut() + Send + 'static) {
		let count = Arc::new(AtomicUsize::new(0));
		let c = Arc::clone(&count);
		(count, move || {
			c.fetch_add(1, Ordering::SeqCst);
		})
	}

	#[test]
	fn timer_ids_start_at_one_and_increase() {
		let sched = Scheduler::new().unwrap();
		let a = sched.set_timer(|| {}, Duration::from_secs(60), false).unwrap();
		let b = sched.set_timer(|| {}, Duration::from_secs(60), true).unwrap();
		assert_eq!(a.get(), 1);
		assert!(b > a);
		assert_eq!(sched.timer_count(), 2);
		sched.stop();
	}

	#[test]
	fn set_timer_after_stop_returns_none() {
		let sched = Scheduler::new().unwrap();
		sched.start().unwrap();
		sched.stop();
		assert!(sched.set_timer(|| {}, Duration::from_millis(10), false).is_none());
		assert!(sched.set_interval_now(|| {}, Duration::from_millis(10)).is_none());
		assert_eq!(sched.timer_count(), 0);
	}

	#[test]
	fn start_is_idempotent_and_stop_is_final() {
		let sched = Scheduler::new().unwrap();
		sched.start().unwrap();
		sched.start().unwrap();
		assert!(sched.is_running());
		sched.stop();
		sched.stop();
		assert!(!sched.is_running());
		assert!(matches!(sched.start(), Err(Error::SchedulerStopped)));
	}

	#[test]
	fn one_shot_fires_once_and_stays_registered() {
		let sched = Scheduler::new().unwrap();
		sched.start().unwrap();
		let (count, cb) = counter();
		let id = sched.set_timer(cb, Duration::from_millis(20), false).unwrap();
		std::thread::sleep(Duration::from_millis(200));
		assert_eq!(count.load(Ordering::SeqCst), 1);
		assert_eq!(sched.timer_count(), 1);
		sched.kill_timer(id);
		assert_eq!(sched.timer_count(), 0);
		sched.stop();
	}

	#[test]
	fn repeating_timer_fires_until_killed() {
		let sched = Scheduler::new().unwrap();
		sched.start().unwrap();
		let (count, cb) = counter();
		let id = sched.set_timer(cb, Duration::from_millis(20), true).unwrap();
		std::thread::sleep(Duration::from_millis(250));
		sched.kill_timer(id);
		let fired = count.load(Ordering::SeqCst);
		assert!(fired >= 3, "fired {} times", fired);

		std::thread::sleep(Duration::from_millis(100));
		assert_eq!(count.load(Ordering::SeqCst), fired);
		sched.stop();
	}

	#[test]
	fn interval_now_fires_before_first_period() {
		let sched = Scheduler::new().unwrap();
		sched.start().unwrap();
		let (count, cb) = counter();
		sched.set_interval_now(cb, Duration::from_secs(60)).unwrap();
		std::thread::sleep(Duration::from_millis(100));
		assert_eq!(count.load(Ordering::SeqCst), 1);
		sched.stop();
	}

	#[test]
	fn timers_registered_before_start_run_after_start() {
		let sched = Scheduler::new().unwrap();
		let (count, cb) = counter();
		sched.set_timer(cb, Duration::from_millis(10), false).unwrap();
		std::thread::sleep(Duration::from_millis(50));
		assert_eq!(count.load(Ordering::SeqCst), 0);
		sched.start().unwrap();
		std::thread::sleep(Duration::from_millis(150));
		assert_eq!(count.load(Ordering::SeqCst), 1);
		sched.stop();
	}

	#[test]
	fn callbacks_run_on_a_single_thread() {
		let sched = Scheduler::new().unwrap();
		sched.start().unwrap();
		let seen = Arc::new(Mutex::new(Vec::new()));
		for _ in 0..4 {
			let seen = Arc::clone(&seen);
			sched.set_timer(
				move || seen.lock().unwrap().push(thread::current().id()),
				Duration::from_millis(10),
				true,
			);
		}
		std::thread::sleep(Duration::from_millis(150));
		sched.stop();

		let seen = seen.lock().unwrap();
		assert!(!seen.is_empty());
		assert!(seen.iter().all(|id| *id == seen[0]));
		assert_ne!(seen[0], thread::current().id());
	}

	#[test]
	fn callback_can_cancel_itself_and_rearm() {
		let sched = Scheduler::new().unwrap();
		let (count, _) = counter();
		let slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

		let s = sched.clone();
		let slot_cb = Arc::clone(&slot);
		let count_cb = Arc::clone(&count);
		let id = sched
			.set_timer(
				move || {
					let mut slot = slot_cb.lock().unwrap();
					if let Some(id) = slot.take() {
						s.kill_timer(id);
					}
					let count = Arc::clone(&count_cb);
					*slot = s.set_interval_now(
						move || {
							count.fetch_add(1, Ordering::SeqCst);
						},
						Duration::from_secs(60),
					);
				},
				Duration::from_millis(10),
				false,
			)
			.unwrap();
		*slot.lock().unwrap() = Some(id);
		sched.start().unwrap();

		std::thread::sleep(Duration::from_millis(200));
		assert_eq!(count.load(Ordering::SeqCst), 1);
		// the delay timer was replaced by the repeating one
		assert_eq!(sched.timer_count(), 1);
		assert_ne!(*slot.lock().unwrap(), Some(id));
		sched.stop();
	}
}

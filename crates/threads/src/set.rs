use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use moult_primitives::{Addr, fatal, payload};
use moult_stackvars::StackId;
use parking_lot::{Condvar, Mutex};

use crate::descriptor::{Descriptor, WorkerEntry};
use crate::ThreadError;

/// Unwind payload a worker leaves an in-flight update with.
///
/// Thrown by [`ThreadSet::quiesce_current`], caught by the spawn wrapper; the
/// thread ends but its descriptor stays registered for relaunch.
pub struct QuiesceExit;

thread_local! {
	static CURRENT: Cell<Option<StackId>> = const { Cell::new(None) };
}

/// Stack identity of the calling thread.
///
/// Untracked threads (the main thread included) report [`StackId::MAIN`].
pub fn current_stack() -> StackId {
	CURRENT.with(|c| c.get()).unwrap_or(StackId::MAIN)
}

/// True when called from a tracked worker thread.
pub fn is_worker() -> bool {
	CURRENT.with(|c| c.get()).is_some()
}

/// Result of an interruptible sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
	/// The full duration passed.
	Elapsed,
	/// Quiescence was requested; the caller must reach an update point.
	Kicked,
}

#[derive(Debug, Default)]
struct Inner {
	threads: Vec<Descriptor>,
	/// Workers currently running (spawned, not yet finished or quiesced).
	live: usize,
	/// Workers that reported an update point since quiescence began.
	reached: usize,
	/// Relaunched workers that passed their first update point after release.
	arrived: usize,
	quiescing: bool,
	released: bool,
	/// Condition the untracked main thread is currently parked on, if any.
	main_waiting: Option<Arc<Condvar>>,
}

impl Inner {
	fn descriptor_mut(&mut self, id: StackId) -> Option<&mut Descriptor> {
		self.threads.iter_mut().find(|d| d.id == id)
	}
}

/// The live worker set and its quiescence barrier.
///
/// The live/reached counters and the descriptor list share one mutex; the
/// barrier predicate `reached == live` is only ever evaluated under it.
#[derive(Debug, Default)]
pub struct ThreadSet {
	inner: Mutex<Inner>,
	/// Workers signal this when they report in or finish.
	ready: Condvar,
	/// The main thread broadcasts this to release relaunched workers.
	proceed: Condvar,
}

impl ThreadSet {
	pub fn new() -> Self {
		payload::register_control_payload::<QuiesceExit>();
		Self::default()
	}

	/// Spawns a tracked worker and registers its descriptor.
	pub fn spawn(self: &Arc<Self>, entry: WorkerEntry, arg: Addr) -> Result<StackId, ThreadError> {
		let descriptor = Descriptor::new(entry, arg);
		let id = descriptor.id;
		{
			let mut inner = self.inner.lock();
			inner.threads.push(descriptor);
			inner.live += 1;
		}
		let set = Arc::clone(self);
		let entry_addr = Addr(entry as usize);
		let spawned = thread::Builder::new()
			.name(format!("moult-worker-{}", id.0))
			.spawn(move || run_worker(&set, id, entry_addr, arg, false));
		if let Err(err) = spawned {
			let mut inner = self.inner.lock();
			inner.threads.retain(|d| d.id != id);
			inner.live -= 1;
			return Err(err.into());
		}
		tracing::debug!(id = id.0, "threads.spawned");
		Ok(id)
	}

	/// Registers a descriptor without spawning it; the worker starts at the
	/// next relaunch. Used while editing the carried thread set during
	/// migration.
	pub fn add(&self, entry: WorkerEntry, arg: Addr) -> StackId {
		let descriptor = Descriptor::new(entry, arg);
		let id = descriptor.id;
		self.inner.lock().threads.push(descriptor);
		tracing::debug!(id = id.0, "threads.added");
		id
	}

	/// Marks a descriptor for removal at the next relaunch.
	pub fn mark_removed(&self, id: StackId) {
		if let Some(d) = self.inner.lock().descriptor_mut(id) {
			d.removed = true;
		}
	}

	/// Runs `f` over the descriptor list. Migration-time editing hook.
	pub fn edit<R>(&self, f: impl FnOnce(&mut Vec<Descriptor>) -> R) -> R {
		f(&mut self.inner.lock().threads)
	}

	/// Number of running workers.
	pub fn live(&self) -> usize {
		self.inner.lock().live
	}

	/// Number of workers that reported an update point.
	pub fn reached(&self) -> usize {
		self.inner.lock().reached
	}

	/// True between a quiescence request and the following relaunch.
	pub fn quiescing(&self) -> bool {
		self.inner.lock().quiescing
	}

	/// Reports the calling worker at update point `point` and ends the thread.
	///
	/// The descriptor is kept; the new version respawns it. Calling this from
	/// an untracked thread is an instrumentation bug.
	pub fn quiesce_current(&self, point: &str) -> ! {
		let Some(id) = CURRENT.with(|c| c.get()) else {
			fatal!(point, "threads.quiesce.untracked-thread");
		};
		{
			let mut inner = self.inner.lock();
			match inner.descriptor_mut(id) {
				Some(d) => d.reached_point = Some(point.to_owned()),
				None => fatal!(id = id.0, "threads.quiesce.unknown-descriptor"),
			}
			inner.reached += 1;
			tracing::debug!(id = id.0, point, reached = inner.reached, live = inner.live, "threads.quiesce.reached");
		}
		self.ready.notify_all();
		panic::panic_any(QuiesceExit)
	}

	/// Main thread: blocks until every live worker has reported an update
	/// point or finished.
	///
	/// Parked workers are kicked out of their instrumented waits; a worker
	/// doing neither starves this wait, which is logged periodically rather
	/// than timed out.
	pub fn await_quiescence(&self) {
		let mut inner = self.inner.lock();
		inner.quiescing = true;
		let started = Instant::now();
		let mut last_report = Instant::now();
		while inner.reached < inner.live {
			for d in &inner.threads {
				if let Some(cv) = &d.waiting {
					cv.notify_all();
				}
			}
			self.ready.wait_for(&mut inner, Duration::from_millis(25));
			if last_report.elapsed() >= Duration::from_secs(1) {
				last_report = Instant::now();
				tracing::warn!(
					live = inner.live,
					reached = inner.reached,
					waited_ms = started.elapsed().as_millis() as u64,
					"threads.quiesce.stalled"
				);
			}
		}
		tracing::info!(parked = inner.reached, "threads.quiesce.complete");
	}

	/// New version: respawns every carried descriptor, gated on
	/// [`finish_release`](Self::finish_release).
	///
	/// `remap` translates a start routine's old code address into the new
	/// image; it is applied only to descriptors that quiesced (ones added
	/// during migration already hold new-image addresses).
	pub fn relaunch<F>(self: &Arc<Self>, mut remap: F) -> Result<usize, ThreadError>
	where
		F: FnMut(Addr) -> Addr,
	{
		let specs: Vec<(StackId, Addr, Addr)> = {
			let mut inner = self.inner.lock();
			inner.threads.retain(|d| {
				if d.removed {
					tracing::debug!(id = d.id.0, "threads.relaunch.dropped");
				}
				!d.removed
			});
			for d in &mut inner.threads {
				if d.reached_point.take().is_some() {
					d.entry = remap(d.entry);
				}
				d.waiting = None;
			}
			inner.reached = 0;
			inner.arrived = 0;
			inner.quiescing = false;
			inner.released = false;
			inner.live = inner.threads.len();
			inner.threads.iter().map(|d| (d.id, d.entry, d.arg)).collect()
		};
		for (id, entry, arg) in &specs {
			let set = Arc::clone(self);
			let (id, entry, arg) = (*id, *entry, *arg);
			thread::Builder::new()
				.name(format!("moult-worker-{}", id.0))
				.spawn(move || run_worker(&set, id, entry, arg, true))?;
		}
		tracing::info!(count = specs.len(), "threads.relaunched");
		Ok(specs.len())
	}

	/// A relaunched worker reports that it has passed its first update point
	/// and no longer reads old-version state.
	pub fn worker_arrived(&self) {
		{
			let mut inner = self.inner.lock();
			inner.arrived += 1;
			tracing::debug!(arrived = inner.arrived, live = inner.live, "threads.arrived");
		}
		self.ready.notify_all();
	}

	/// Main thread: blocks until every relaunched worker has arrived or
	/// finished. Old-version state must stay readable until this returns.
	pub fn await_arrivals(&self) {
		let mut inner = self.inner.lock();
		let mut last_report = Instant::now();
		while inner.arrived < inner.live {
			self.ready.wait_for(&mut inner, Duration::from_millis(25));
			if last_report.elapsed() >= Duration::from_secs(1) {
				last_report = Instant::now();
				tracing::warn!(live = inner.live, arrived = inner.arrived, "threads.arrivals.stalled");
			}
		}
	}

	/// Main thread: lets relaunched workers proceed into their routines.
	pub fn finish_release(&self) {
		self.inner.lock().released = true;
		self.proceed.notify_all();
		tracing::debug!("threads.released");
	}

	/// Sleeps up to `ms` milliseconds, waking early when quiescence is
	/// requested (workers) or `wake` turns true (any caller).
	///
	/// The untracked main thread parks on a recorded condition instead of a
	/// plain sleep, so [`kick_main`](Self::kick_main) can interrupt it; its
	/// `wake` predicate is re-checked on every wakeup and at least every 25ms.
	pub fn ms_sleep(&self, ms: u64, wake: impl Fn() -> bool) -> SleepOutcome {
		let id = CURRENT.with(|c| c.get());
		let cv = Arc::new(Condvar::new());
		let deadline = Instant::now() + Duration::from_millis(ms);
		let mut inner = self.inner.lock();
		match id {
			Some(id) => {
				if let Some(d) = inner.descriptor_mut(id) {
					d.waiting = Some(Arc::clone(&cv));
				}
			}
			None => inner.main_waiting = Some(Arc::clone(&cv)),
		}
		let outcome = loop {
			if (id.is_some() && inner.quiescing) || wake() {
				break SleepOutcome::Kicked;
			}
			let now = Instant::now();
			if now >= deadline {
				break SleepOutcome::Elapsed;
			}
			let slice = (deadline - now).min(Duration::from_millis(25));
			cv.wait_for(&mut inner, slice);
		};
		match id {
			Some(id) => {
				if let Some(d) = inner.descriptor_mut(id) {
					d.waiting = None;
				}
			}
			None => inner.main_waiting = None,
		}
		outcome
	}

	/// Registers the condition the calling thread is about to block on, so a
	/// quiescence request (workers) or [`kick_main`](Self::kick_main) can
	/// interrupt the wait.
	pub fn register_wait(&self, cv: &Arc<Condvar>) {
		let mut inner = self.inner.lock();
		match CURRENT.with(|c| c.get()) {
			Some(id) => {
				if let Some(d) = inner.descriptor_mut(id) {
					d.waiting = Some(Arc::clone(cv));
				}
			}
			None => inner.main_waiting = Some(Arc::clone(cv)),
		}
	}

	/// Clears the calling thread's registered wait condition.
	pub fn clear_wait(&self) {
		let mut inner = self.inner.lock();
		match CURRENT.with(|c| c.get()) {
			Some(id) => {
				if let Some(d) = inner.descriptor_mut(id) {
					d.waiting = None;
				}
			}
			None => inner.main_waiting = None,
		}
	}

	/// Wakes the main thread out of its recorded wait, if it is in one. Called
	/// when an update request arrives while the main thread may be sleeping.
	pub fn kick_main(&self) {
		if let Some(cv) = &self.inner.lock().main_waiting {
			cv.notify_all();
		}
	}
}

fn run_worker(set: &Arc<ThreadSet>, id: StackId, entry: Addr, arg: Addr, gated: bool) {
	CURRENT.with(|c| c.set(Some(id)));
	if gated {
		let mut inner = set.inner.lock();
		while !inner.released {
			set.proceed.wait(&mut inner);
		}
	}
	let f: WorkerEntry = unsafe { std::mem::transmute::<usize, WorkerEntry>(entry.0) };
	match panic::catch_unwind(AssertUnwindSafe(|| f(arg))) {
		Ok(()) => worker_finished(set, id, "returned"),
		Err(p) if p.is::<QuiesceExit>() => {
			// Reported in quiesce_current; the descriptor stays for relaunch.
			tracing::trace!(id = id.0, "threads.worker.quiesced");
		}
		Err(_) => worker_finished(set, id, "panicked"),
	}
}

fn worker_finished(set: &Arc<ThreadSet>, id: StackId, how: &str) {
	{
		let mut inner = set.inner.lock();
		if let Some(d) = inner.descriptor_mut(id) {
			d.removed = true;
		}
		inner.live -= 1;
		tracing::debug!(id = id.0, how, live = inner.live, "threads.worker.finished");
	}
	set.ready.notify_all();
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	fn set_ref(arg: Addr) -> &'static ThreadSet {
		unsafe { &*arg.as_ptr::<ThreadSet>() }
	}

	static BARRIER_REPORTS: AtomicUsize = AtomicUsize::new(0);

	fn barrier_worker(arg: Addr) {
		let set = set_ref(arg);
		loop {
			if set.ms_sleep(5, || false) == SleepOutcome::Kicked {
				BARRIER_REPORTS.fetch_add(1, Ordering::SeqCst);
				set.quiesce_current("spin");
			}
		}
	}

	#[test]
	fn quiescence_waits_for_every_worker() {
		let set = Arc::new(ThreadSet::new());
		let arg = Addr::from_ptr(Arc::as_ptr(&set));
		for _ in 0..4 {
			set.spawn(barrier_worker, arg).unwrap();
		}
		assert_eq!(set.live(), 4);

		set.await_quiescence();
		assert_eq!(set.reached(), 4);
		assert_eq!(BARRIER_REPORTS.load(Ordering::SeqCst), 4);
	}

	static RELEASE_RUNS: AtomicUsize = AtomicUsize::new(0);

	fn release_worker(arg: Addr) {
		let set = set_ref(arg);
		RELEASE_RUNS.fetch_add(1, Ordering::SeqCst);
		loop {
			if set.ms_sleep(5, || false) == SleepOutcome::Kicked {
				set.quiesce_current("loop");
			}
		}
	}

	#[test]
	fn relaunched_workers_wait_for_release() {
		let set = Arc::new(ThreadSet::new());
		let arg = Addr::from_ptr(Arc::as_ptr(&set));
		for _ in 0..2 {
			set.spawn(release_worker, arg).unwrap();
		}
		set.await_quiescence();
		assert_eq!(RELEASE_RUNS.load(Ordering::SeqCst), 2);

		assert_eq!(set.relaunch(|a| a).unwrap(), 2);
		thread::sleep(Duration::from_millis(30));
		assert_eq!(RELEASE_RUNS.load(Ordering::SeqCst), 2, "gated until release");

		set.finish_release();
		while RELEASE_RUNS.load(Ordering::SeqCst) < 4 {
			thread::sleep(Duration::from_millis(5));
		}
		// Park them again so the set winds down deterministically.
		set.await_quiescence();
		assert_eq!(set.reached(), 2);
	}

	static WAIT_KICKS: AtomicUsize = AtomicUsize::new(0);

	fn waiting_worker(arg: Addr) {
		let set = set_ref(arg);
		let lock = Mutex::new(());
		let cv = Arc::new(Condvar::new());
		set.register_wait(&cv);
		{
			let mut guard = lock.lock();
			while !set.quiescing() {
				cv.wait_for(&mut guard, Duration::from_millis(50));
			}
		}
		set.clear_wait();
		WAIT_KICKS.fetch_add(1, Ordering::SeqCst);
		set.quiesce_current("wait");
	}

	#[test]
	fn instrumented_waits_are_kicked() {
		let set = Arc::new(ThreadSet::new());
		let arg = Addr::from_ptr(Arc::as_ptr(&set));
		let id = set.spawn(waiting_worker, arg).unwrap();
		thread::sleep(Duration::from_millis(20));
		set.edit(|threads| {
			let d = threads.iter().find(|d| d.id == id).unwrap();
			assert!(d.is_parked());
		});

		set.await_quiescence();
		assert_eq!(WAIT_KICKS.load(Ordering::SeqCst), 1);
	}

	fn never_spawned(_: Addr) {}

	#[test]
	fn removed_descriptors_are_dropped_at_relaunch() {
		let set = Arc::new(ThreadSet::new());
		let id = set.add(never_spawned, Addr::NULL);
		set.mark_removed(id);
		let kept = set.add(never_spawned, Addr::NULL);
		set.edit(|threads| {
			assert_eq!(threads.len(), 2);
		});
		// Keep the surviving descriptor from actually running.
		set.mark_removed(kept);
		assert_eq!(set.relaunch(|a| a).unwrap(), 0);
	}

	#[test]
	fn untracked_sleeps_elapse_without_a_wake() {
		let set = ThreadSet::new();
		assert_eq!(set.ms_sleep(1, || false), SleepOutcome::Elapsed);
		assert!(!is_worker());
		assert_eq!(current_stack(), StackId::MAIN);
	}

	#[test]
	fn kick_main_cuts_an_untracked_sleep_short() {
		let set = Arc::new(ThreadSet::new());
		let requested = Arc::new(std::sync::atomic::AtomicBool::new(false));

		let kicker = {
			let set = Arc::clone(&set);
			let requested = Arc::clone(&requested);
			thread::spawn(move || {
				thread::sleep(Duration::from_millis(20));
				requested.store(true, Ordering::SeqCst);
				set.kick_main();
			})
		};

		let started = Instant::now();
		let outcome = set.ms_sleep(60_000, || requested.load(Ordering::SeqCst));
		assert_eq!(outcome, SleepOutcome::Kicked);
		assert!(started.elapsed() < Duration::from_secs(5), "woke well before the deadline");
		kicker.join().unwrap();
	}
}

use std::cell::Cell;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use moult_primitives::{Addr, Qualifiers, fatal};
use moult_ranges::{AllocTable, VmAreas};
use moult_registry::{Registry, RenameTable, Scope};
use moult_stackvars::{FrameStore, StackId, VarClass};
use moult_threads::{SleepOutcome, ThreadError, ThreadSet, WorkerEntry, current_stack, is_worker};
use moult_transform::{Env, Session, SymbolMap};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::bench::{Bench, BenchMarks};
use crate::handoff::{CarriedState, Continuation, Handoff};
use crate::image::CodeImage;

/// A per-variable migration routine registered by the new version, keyed by
/// the variable's symbol key. Replaces the default byte copy for variables
/// whose layout changed.
pub type VarTransform = fn(&mut Session, &Env<'_>, Addr, Addr);

/// A program callback run by the coordinator at a fixed protocol step.
pub type Hook = fn(&Runtime);

/// Construction-time knobs shared by cold start and resume.
pub struct Options {
	/// Set asynchronously (signal handler) to request an update; polled at
	/// update points.
	pub update_flag: Arc<AtomicBool>,
	/// Update-timing results file; timing is disabled when absent.
	pub bench_path: Option<PathBuf>,
	/// The image this version was loaded from, for resolving exported names
	/// not present in the registry.
	pub current_image: Option<Box<dyn CodeImage>>,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			update_flag: Arc::new(AtomicBool::new(false)),
			bench_path: None,
			current_image: None,
		}
	}
}

/// What the driver passes when re-entering after a swap.
pub struct ResumeArgs {
	/// The update point the previous version took.
	pub point: String,
	pub state: CarriedState,
	/// Handle of the previous image, released once migration completes.
	pub previous: Option<Box<dyn CodeImage>>,
}

thread_local! {
	/// Whether this relaunched worker has already reported post-update
	/// arrival. Fresh per OS thread, so respawned workers start false.
	static ARRIVED: Cell<bool> = const { Cell::new(false) };
}

/// The per-version coordinator context.
///
/// One instance per loaded version; the carried structures inside (thread
/// set, allocation table, the previous version's symbols and stacks) are
/// shared across the version boundary by `Arc`.
pub struct Runtime {
	registry: Registry,
	renames: RenameTable,
	transformers: Mutex<FxHashMap<String, VarTransform>>,
	stacks: Arc<FrameStore>,
	old_stacks: Mutex<Option<Arc<FrameStore>>>,
	threads: Arc<ThreadSet>,
	allocs: Arc<AllocTable>,
	areas: Mutex<Option<VmAreas>>,
	session: Mutex<Session>,
	update_requested: Arc<AtomicBool>,
	updating: AtomicBool,
	resume_point: Mutex<Option<String>>,
	carried_bench: Mutex<Option<BenchMarks>>,
	previous_image: Mutex<Option<Box<dyn CodeImage>>>,
	current_image: Option<Box<dyn CodeImage>>,
	next_path: Mutex<Option<PathBuf>>,
	main_update_hook: Mutex<Option<Hook>>,
	bench: Bench,
	has_updated: bool,
}

impl Runtime {
	/// First launch of the program: nothing to migrate.
	pub fn cold_start(options: Options) -> Arc<Self> {
		tracing::info!("runtime.cold-start");
		Arc::new(Self {
			registry: Registry::new(),
			renames: RenameTable::new(),
			transformers: Mutex::new(FxHashMap::default()),
			stacks: Arc::new(FrameStore::new()),
			old_stacks: Mutex::new(None),
			threads: Arc::new(ThreadSet::new()),
			allocs: Arc::new(AllocTable::new()),
			areas: Mutex::new(None),
			session: Mutex::new(Session::new()),
			update_requested: options.update_flag,
			updating: AtomicBool::new(false),
			resume_point: Mutex::new(None),
			carried_bench: Mutex::new(None),
			previous_image: Mutex::new(None),
			current_image: options.current_image,
			next_path: Mutex::new(None),
			main_update_hook: Mutex::new(None),
			bench: Bench::new(options.bench_path),
			has_updated: false,
		})
	}

	/// Re-entry after a swap: adopt the previous version's state and run in
	/// resuming mode until the matching update point is reached.
	pub fn resume(args: ResumeArgs, options: Options) -> Arc<Self> {
		tracing::info!(point = %args.point, "runtime.resume");
		let registry = Registry::new();
		registry.adopt_old(args.state.symbols);
		let areas = match VmAreas::capture() {
			Ok(areas) => Some(areas),
			Err(err) => {
				tracing::warn!(%err, "runtime.vmareas.unavailable");
				None
			}
		};
		Arc::new(Self {
			registry,
			renames: RenameTable::new(),
			transformers: Mutex::new(FxHashMap::default()),
			stacks: Arc::new(FrameStore::new()),
			old_stacks: Mutex::new(Some(args.state.stacks)),
			threads: args.state.threads,
			allocs: args.state.allocs,
			areas: Mutex::new(areas),
			session: Mutex::new(Session::new()),
			update_requested: options.update_flag,
			updating: AtomicBool::new(true),
			resume_point: Mutex::new(Some(args.point)),
			carried_bench: Mutex::new(args.state.bench),
			previous_image: Mutex::new(args.previous),
			current_image: options.current_image,
			next_path: Mutex::new(None),
			main_update_hook: Mutex::new(None),
			bench: Bench::new(options.bench_path),
			has_updated: true,
		})
	}

	/// True when this version was resumed from a previous one.
	pub fn has_updated(&self) -> bool {
		self.has_updated
	}

	/// True while resume-mode migration is still in flight.
	pub fn is_updating(&self) -> bool {
		self.updating.load(Ordering::Acquire)
	}

	/// True while resuming toward the update point named `point`.
	pub fn is_updating_from(&self, point: &str) -> bool {
		self.is_updating() && self.resume_point.lock().as_deref() == Some(point)
	}

	/// Requests an update, as the external signal handler does. Wakes the main
	/// thread if it is parked in an instrumented sleep.
	pub fn request_update(&self) {
		self.update_requested.store(true, Ordering::Release);
		self.threads.kick_main();
	}

	/// Overrides next-image discovery with an explicit path.
	pub fn set_next_version(&self, path: impl Into<PathBuf>) {
		*self.next_path.lock() = Some(path.into());
	}

	/// Installs the hook run on the main thread at the matching update point.
	pub fn set_main_update_hook(&self, hook: Hook) {
		*self.main_update_hook.lock() = Some(hook);
	}

	// --- registration -----------------------------------------------------

	/// Registers a variable in the current version's registry.
	///
	/// While resuming, an `auto_migrate` variable immediately pulls its
	/// old-version value (through its registered transformer, if any).
	pub fn register_var(&self, quals: Qualifiers, addr: Addr, size: usize, auto_migrate: bool) {
		if quals.is_stack_local() {
			fatal!(quals = %quals, "runtime.register.stack-local");
		}
		self.registry.register(quals.clone(), addr, size, auto_migrate);
		if auto_migrate && self.is_updating() {
			self.migrate(&quals, addr, size);
		}
	}

	/// Registers a worker start routine under a symbol key, so function
	/// pointers and carried thread descriptors can be re-resolved into this
	/// version.
	pub fn register_function(&self, quals: Qualifiers, entry: WorkerEntry) {
		self.registry.register(quals, Addr(entry as usize), 0, false);
	}

	/// Registers the migration routine for the variable keyed `key`.
	pub fn register_transformer(&self, key: impl Into<String>, f: VarTransform) {
		self.transformers.lock().insert(key.into(), f);
	}

	/// Records that the variable keyed `old_key` is now keyed `new_key`.
	pub fn register_rename(&self, old_key: impl Into<String>, new_key: impl Into<String>) {
		self.renames.register(old_key, new_key);
	}

	// --- stack instrumentation --------------------------------------------

	/// Tracked-function entry.
	pub fn enter(&self, function: &str) {
		self.stacks.enter(current_stack(), function);
	}

	/// Tracked-function exit; the name must match the innermost entry.
	pub fn exit(&self, function: &str) {
		self.stacks.exit(current_stack(), function);
	}

	/// Notes a local variable's location in the current frame.
	pub fn local(&self, name: &str, addr: Addr, size: usize) {
		self.stacks.note(current_stack(), VarClass::Local, name, addr, size);
	}

	/// Notes a formal parameter's location in the current frame.
	pub fn formal(&self, name: &str, addr: Addr, size: usize) {
		self.stacks.note(current_stack(), VarClass::Formal, name, addr, size);
	}

	// --- tracked allocation ----------------------------------------------

	/// Allocates a zeroed heap block the transformation engine may later
	/// deep-copy and release.
	pub fn tracked_alloc(&self, size: usize) -> Addr {
		self.allocs.allocate(size)
	}

	/// Releases a tracked block. Untracked addresses are logged and leaked.
	pub fn tracked_free(&self, addr: Addr) {
		if !self.allocs.release(addr) {
			tracing::warn!(addr = %addr, "runtime.free.untracked");
		}
	}

	/// Grows or shrinks a tracked block, keeping the common prefix.
	///
	/// An untracked address gets a fresh zeroed block with nothing copied.
	pub fn tracked_realloc(&self, addr: Addr, new_size: usize) -> Addr {
		let fresh = self.allocs.allocate(new_size);
		match self.allocs.size_of(addr) {
			Some(old_size) => {
				unsafe { addr.copy_bytes_to(fresh, old_size.min(new_size)) };
				self.allocs.release(addr);
			}
			None => tracing::warn!(addr = %addr, "runtime.realloc.untracked"),
		}
		fresh
	}

	/// Lists every live tracked block as `(start, size)` pairs, for migration
	/// code that converts heap objects no registered variable reaches.
	pub fn tracked_blocks(&self) -> Vec<(Addr, usize)> {
		self.allocs.blocks()
	}

	// --- workers ----------------------------------------------------------

	/// Spawns a tracked worker thread.
	pub fn spawn_worker(&self, entry: WorkerEntry, arg: Addr) -> Result<StackId, ThreadError> {
		self.threads.spawn(entry, arg)
	}

	/// The worker set, for migration-time descriptor editing.
	pub fn threads(&self) -> &Arc<ThreadSet> {
		&self.threads
	}

	/// Sleeps up to `ms` milliseconds; an update request cuts the sleep short
	/// and diverts through the update point named `point`. Works from the
	/// main thread and from workers alike.
	pub fn sleep_ms(&self, point: &str, ms: u64) {
		let wake = || self.update_requested.load(Ordering::Acquire);
		if self.threads.ms_sleep(ms, wake) == SleepOutcome::Kicked {
			self.update_point(point);
		}
	}

	// --- migration --------------------------------------------------------

	/// Finds a variable's old-version location: the old registry for
	/// globals/statics (renames applied), the old captured stack for locals
	/// of the calling thread.
	pub fn old_lookup(&self, quals: &Qualifiers) -> Option<(Addr, usize)> {
		let key = quals.key();
		let old_key = self.renames.previous(&key).unwrap_or(key);
		if quals.is_stack_local() {
			let function = quals.function.as_deref().unwrap_or_default();
			let name = old_key.rsplit('#').next().unwrap_or(&quals.name);
			let stacks = self.old_stacks.lock().clone()?;
			let id = current_stack();
			stacks
				.find(id, function, name, VarClass::Local)
				.or_else(|| stacks.find(id, function, name, VarClass::Formal))
		} else {
			self.registry.entry_in(Scope::Old, &old_key)
		}
	}

	/// Copies one variable's old-version value into `new`.
	///
	/// Reads only the old snapshot, never already-migrated new state, so
	/// multiple calls in one function commute (swapping two variables works).
	/// Returns false outside an update or when the old value cannot be found.
	pub fn migrate(&self, quals: &Qualifiers, new: Addr, new_size: usize) -> bool {
		if !self.is_updating() {
			return false;
		}
		let Some((old_addr, old_size)) = self.old_lookup(quals) else {
			tracing::debug!(quals = %quals, "migrate.miss");
			return false;
		};
		let key = quals.key();
		let transformer = self.transformers.lock().get(&key).copied();
		let mut session = self.session.lock();
		// Interior pointers to this variable must resolve to its new home.
		session.note_mapping(old_addr, new);
		let symbols = RegistrySymbols { runtime: self };
		let areas = self.areas.lock();
		let env = Env {
			symbols: &symbols,
			allocs: &self.allocs,
			areas: areas.as_ref(),
		};
		match transformer {
			Some(f) => f(&mut session, &env, old_addr, new),
			None => unsafe { old_addr.copy_bytes_to(new, old_size.min(new_size)) },
		}
		tracing::trace!(quals = %quals, old = %old_addr, new = %new, "migrate.done");
		true
	}

	/// The per-update transformation session, for transformers that need to
	/// pre-register composite closures.
	pub fn with_session<R>(&self, f: impl FnOnce(&mut Session, &Env<'_>) -> R) -> R {
		let mut session = self.session.lock();
		let symbols = RegistrySymbols { runtime: self };
		let areas = self.areas.lock();
		let env = Env {
			symbols: &symbols,
			allocs: &self.allocs,
			areas: areas.as_ref(),
		};
		f(&mut session, &env)
	}

	// --- the update point -------------------------------------------------

	/// The protocol's sole suspension point; call at chosen safe locations.
	///
	/// In steady state this is a cheap flag check. While resuming it
	/// completes the update at the matching point (and is a no-op at every
	/// other point). When an update has been requested it quiesces the
	/// calling thread: workers report in and end; the main thread waits for
	/// the barrier and transfers control back to the driver (this call does
	/// not return in either case).
	pub fn update_point(&self, point: &str) {
		if self.is_updating() {
			self.resume_step(point);
			return;
		}
		if self.update_requested.load(Ordering::Acquire) {
			self.take_update(point);
		}
	}

	fn take_update(&self, point: &str) -> ! {
		let mut marks = BenchMarks::begin();
		tracing::info!(point, worker = is_worker(), "update.point.taken");
		self.stacks.relocate(current_stack());
		if is_worker() {
			self.threads.quiesce_current(point);
		}
		self.threads.await_quiescence();
		marks.mark_quiesced();
		self.update_requested.store(false, Ordering::Release);
		Continuation::transfer(Handoff {
			point: point.to_owned(),
			next_path: self.next_path.lock().take(),
			state: CarriedState {
				symbols: self.registry.share_current(),
				stacks: Arc::clone(&self.stacks),
				threads: Arc::clone(&self.threads),
				allocs: Arc::clone(&self.allocs),
				bench: Some(marks),
			},
		})
	}

	fn resume_step(&self, point: &str) {
		if is_worker() {
			// A relaunched worker's first point: its old captured stack has
			// been fully consumed by its own migration code.
			if !ARRIVED.with(|c| c.get()) {
				ARRIVED.with(|c| c.set(true));
				if let Some(old) = self.old_stacks.lock().as_ref() {
					old.retire(current_stack());
				}
				self.threads.worker_arrived();
			}
			return;
		}
		if self.resume_point.lock().as_deref() != Some(point) {
			tracing::trace!(point, "update.point.passthrough");
			return;
		}
		self.finish_resume(point);
	}

	/// Main thread, at the matching point: release the new version's workers
	/// and drop every piece of old-version state.
	fn finish_resume(&self, point: &str) {
		let hook = *self.main_update_hook.lock();
		if let Some(hook) = hook {
			hook(self);
		}
		let relaunched = self.threads.relaunch(|addr| self.remap_entry(addr));
		match relaunched {
			Ok(count) => tracing::debug!(count, "update.workers.relaunched"),
			Err(err) => fatal!(%err, "update.relaunch.failed"),
		}
		self.threads.finish_release();
		self.threads.await_arrivals();

		if let Some(old) = self.old_stacks.lock().take() {
			old.summary();
			old.retire_all();
		}
		self.registry.clear_old();
		self.renames.clear();
		*self.session.lock() = Session::new();
		*self.areas.lock() = None;
		if self.previous_image.lock().take().is_some() {
			tracing::debug!("update.previous-image.released");
		}
		if let Some(marks) = self.carried_bench.lock().take() {
			self.bench.record(point, &marks);
		}
		*self.resume_point.lock() = None;
		self.updating.store(false, Ordering::Release);
		tracing::info!(point, auto_migrated = self.registry.auto_entries().len(), "update.complete");
	}

	/// Translates a quiesced worker's start-routine address into this image.
	fn remap_entry(&self, addr: Addr) -> Addr {
		let Some(key) = self.registry.lookup_addr(Scope::Old, addr) else {
			fatal!(addr = %addr, "update.relaunch.unregistered-entry");
		};
		let symbols = RegistrySymbols { runtime: self };
		let Some(new) = symbols.resolve(&key) else {
			fatal!(key = %key, "update.relaunch.unresolved-entry");
		};
		new
	}
}

/// Symbol resolution over the registry pair, with the rename table applied
/// and the loaded image as a fallback for plain exported names.
struct RegistrySymbols<'a> {
	runtime: &'a Runtime,
}

impl SymbolMap for RegistrySymbols<'_> {
	fn key_of(&self, addr: Addr) -> Option<String> {
		self.runtime.registry.lookup_addr(Scope::Old, addr)
	}

	fn resolve(&self, key: &str) -> Option<Addr> {
		let new_key = self.runtime.renames.resolve(key);
		if let Some(addr) = self.runtime.registry.lookup_key(Scope::Current, &new_key) {
			return Some(addr);
		}
		// Only plain global names can be linker-exported.
		if new_key.contains(['@', '/', '#']) {
			return None;
		}
		self.runtime.current_image.as_ref().and_then(|image| image.resolve(&new_key))
	}
}

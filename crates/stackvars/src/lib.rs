//! Captured stack-frame records, one stack per tracked thread.
//!
//! Instrumented functions report entry/exit and the locations of their locals
//! and formals. Right before an update the calling thread's records are
//! relocated: each variable's bytes are copied off the execution stack into
//! heap storage so they stay readable after the frames unwind. The previous
//! version's relocated stacks are kept as the "old" store until migration
//! finishes, then retired in one sweep.

use std::alloc::{self, Layout};
use std::sync::atomic::{AtomicU64, Ordering};

use moult_primitives::{Addr, fatal};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Identity of one tracked frame stack.
///
/// Stack identities survive the update: a worker respawned in the new version
/// keeps its id, so lookups against the old store find the stack the same
/// logical thread captured before the swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackId(pub u64);

impl StackId {
	/// The main thread's stack.
	pub const MAIN: StackId = StackId(0);

	/// Allocates a fresh stack identity.
	pub fn next() -> StackId {
		static NEXT: AtomicU64 = AtomicU64::new(1);
		StackId(NEXT.fetch_add(1, Ordering::Relaxed))
	}
}

/// Whether a variable was recorded as a local or a formal parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarClass {
	Local,
	Formal,
}

/// Heap storage backing one relocated variable.
#[derive(Debug)]
struct HeapBlock {
	addr: Addr,
	size: usize,
}

impl HeapBlock {
	const ALIGN: usize = 16;

	fn layout(size: usize) -> Layout {
		Layout::from_size_align(size.max(1), Self::ALIGN).unwrap_or_else(|_| Layout::new::<u8>())
	}

	fn capture(src: Addr, size: usize) -> Self {
		let layout = Self::layout(size);
		let ptr = unsafe { alloc::alloc_zeroed(layout) };
		if ptr.is_null() {
			alloc::handle_alloc_error(layout);
		}
		let addr = Addr::from_ptr(ptr);
		// The source address was noted by instrumentation and is still live:
		// relocation runs before the noting frame unwinds.
		unsafe { src.copy_bytes_to(addr, size) };
		Self { addr, size }
	}
}

impl Drop for HeapBlock {
	fn drop(&mut self) {
		unsafe { alloc::dealloc(self.addr.as_mut_ptr(), Self::layout(self.size)) };
	}
}

/// One noted variable location.
#[derive(Debug)]
pub struct VarRecord {
	pub name: String,
	pub addr: Addr,
	pub size: usize,
	relocated: Option<HeapBlock>,
}

impl VarRecord {
	fn new(name: String, addr: Addr, size: usize) -> Self {
		Self {
			name,
			addr,
			size,
			relocated: None,
		}
	}

	fn relocate(&mut self) {
		if self.relocated.is_some() {
			return;
		}
		let block = HeapBlock::capture(self.addr, self.size);
		self.addr = block.addr;
		self.relocated = Some(block);
	}
}

/// One captured function frame.
#[derive(Debug)]
pub struct Frame {
	pub function: String,
	pub locals: Vec<VarRecord>,
	pub formals: Vec<VarRecord>,
}

impl Frame {
	fn vars(&self, class: VarClass) -> &[VarRecord] {
		match class {
			VarClass::Local => &self.locals,
			VarClass::Formal => &self.formals,
		}
	}
}

/// The frame stack of one thread, innermost frame last.
#[derive(Debug, Default)]
pub struct FrameStack {
	frames: Vec<Frame>,
}

impl FrameStack {
	/// Finds `name` in the innermost frame for `function`.
	///
	/// Frames are scanned innermost-out by function name; the variable is
	/// then matched within that frame only. Both misses are plain `None`.
	pub fn find(&self, function: &str, name: &str, class: VarClass) -> Option<(Addr, usize)> {
		let frame = self.frames.iter().rev().find(|f| f.function == function)?;
		let var = frame.vars(class).iter().find(|v| v.name == name)?;
		Some((var.addr, var.size))
	}

	/// Number of live frames.
	pub fn depth(&self) -> usize {
		self.frames.len()
	}
}

/// All tracked frame stacks of one version, keyed by [`StackId`].
#[derive(Debug, Default)]
pub struct FrameStore {
	stacks: Mutex<FxHashMap<StackId, FrameStack>>,
}

impl FrameStore {
	/// Creates an empty store.
	pub fn new() -> Self {
		Self::default()
	}

	/// Pushes a frame for an entered function.
	pub fn enter(&self, id: StackId, function: impl Into<String>) {
		let function = function.into();
		self.stacks.lock().entry(id).or_default().frames.push(Frame {
			function,
			locals: Vec::new(),
			formals: Vec::new(),
		});
	}

	/// Pops the top frame, which must belong to `function`.
	///
	/// A name mismatch means entry/exit instrumentation is unbalanced;
	/// tracking data would be permanently skewed, so this aborts.
	pub fn exit(&self, id: StackId, function: &str) {
		let mut stacks = self.stacks.lock();
		let stack = stacks.entry(id).or_default();
		match stack.frames.last() {
			Some(top) if top.function == function => {
				stack.frames.pop();
			}
			Some(top) => fatal!(expected = %top.function, got = %function, "stackvars.exit.mismatch"),
			None => fatal!(got = %function, "stackvars.exit.empty"),
		}
	}

	/// Notes a variable location in the current frame.
	///
	/// The address must stay valid until the frame exits or the stack is
	/// relocated, whichever comes first.
	pub fn note(&self, id: StackId, class: VarClass, name: impl Into<String>, addr: Addr, size: usize) {
		let mut stacks = self.stacks.lock();
		let stack = stacks.entry(id).or_default();
		let Some(frame) = stack.frames.last_mut() else {
			fatal!(id = id.0, "stackvars.note.no-frame");
		};
		let record = VarRecord::new(name.into(), addr, size);
		match class {
			VarClass::Local => frame.locals.push(record),
			VarClass::Formal => frame.formals.push(record),
		}
	}

	/// Copies every variable of stack `id` off the execution stack.
	///
	/// Called exactly once per thread, at the update point it takes; after
	/// this the records stay valid past the frames' destruction.
	pub fn relocate(&self, id: StackId) {
		let mut stacks = self.stacks.lock();
		let Some(stack) = stacks.get_mut(&id) else {
			return;
		};
		let mut moved = 0usize;
		for frame in &mut stack.frames {
			for var in frame.formals.iter_mut().chain(frame.locals.iter_mut()) {
				var.relocate();
				moved += 1;
			}
		}
		tracing::debug!(id = id.0, frames = stack.frames.len(), vars = moved, "stackvars.relocated");
	}

	/// Looks a variable up in stack `id`. See [`FrameStack::find`].
	pub fn find(&self, id: StackId, function: &str, name: &str, class: VarClass) -> Option<(Addr, usize)> {
		self.stacks.lock().get(&id).and_then(|s| s.find(function, name, class))
	}

	/// Drops one stack and its relocated storage. Returns false when no stack
	/// was tracked under `id`.
	pub fn retire(&self, id: StackId) -> bool {
		let removed = self.stacks.lock().remove(&id).is_some();
		if removed {
			tracing::debug!(id = id.0, "stackvars.retired");
		}
		removed
	}

	/// Drops every stack and all relocated storage.
	pub fn retire_all(&self) {
		let mut stacks = self.stacks.lock();
		let count = stacks.len();
		stacks.clear();
		if count > 0 {
			tracing::debug!(count, "stackvars.retired-all");
		}
	}

	/// Current frame depth of stack `id`.
	pub fn depth(&self, id: StackId) -> usize {
		self.stacks.lock().get(&id).map_or(0, FrameStack::depth)
	}

	/// True when no stacks are tracked.
	pub fn is_empty(&self) -> bool {
		self.stacks.lock().values().all(|s| s.frames.is_empty())
	}

	/// Logs every tracked frame and variable, for debugging migrations.
	pub fn summary(&self) {
		let stacks = self.stacks.lock();
		for (id, stack) in stacks.iter() {
			for frame in stack.frames.iter().rev() {
				tracing::debug!(
					id = id.0,
					function = %frame.function,
					formals = frame.formals.len(),
					locals = frame.locals.len(),
					"stackvars.frame"
				);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn enter_note_find_exit() {
		let store = FrameStore::new();
		let id = StackId::next();
		let q = 400i32;

		store.enter(id, "main");
		store.note(id, VarClass::Local, "q", Addr::of_ref(&q), size_of::<i32>());
		assert_eq!(store.depth(id), 1);

		let (addr, size) = store.find(id, "main", "q", VarClass::Local).unwrap();
		assert_eq!(size, size_of::<i32>());
		assert_eq!(unsafe { *addr.as_ptr::<i32>() }, 400);

		assert!(store.find(id, "main", "q", VarClass::Formal).is_none());
		assert!(store.find(id, "main", "missing", VarClass::Local).is_none());
		assert!(store.find(id, "other_fn", "q", VarClass::Local).is_none());

		store.exit(id, "main");
		assert_eq!(store.depth(id), 0);
	}

	#[test]
	fn innermost_frame_shadows_outer() {
		let store = FrameStore::new();
		let id = StackId::next();
		let outer = 1i32;
		let inner = 2i32;

		store.enter(id, "handle");
		store.note(id, VarClass::Local, "n", Addr::of_ref(&outer), 4);
		store.enter(id, "helper");
		store.enter(id, "handle");
		store.note(id, VarClass::Local, "n", Addr::of_ref(&inner), 4);

		let (addr, _) = store.find(id, "handle", "n", VarClass::Local).unwrap();
		assert_eq!(unsafe { *addr.as_ptr::<i32>() }, 2);
	}

	#[test]
	fn relocation_survives_source_mutation() {
		let store = FrameStore::new();
		let id = StackId::next();
		let mut value = 0x5544_3322i32;

		store.enter(id, "worker");
		store.note(id, VarClass::Local, "v", Addr::of_mut(&mut value), 4);
		store.relocate(id);

		// The original storage may now be reused; records read the copy.
		value = -1;
		let (addr, _) = store.find(id, "worker", "v", VarClass::Local).unwrap();
		assert_ne!(addr, Addr::of_mut(&mut value));
		assert_eq!(unsafe { *addr.as_ptr::<i32>() }, 0x5544_3322);

		store.retire(id);
		assert!(store.find(id, "worker", "v", VarClass::Local).is_none());
	}
}

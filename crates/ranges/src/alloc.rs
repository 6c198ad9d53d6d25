use std::alloc::{self, Layout};

use moult_primitives::{Addr, fatal};
use parking_lot::Mutex;

/// Allocation alignment for runtime-owned blocks.
///
/// Blocks handed out here stand in for arbitrary program structures whose
/// real layout the runtime never sees, so they get the strongest common
/// alignment (what `malloc` guarantees).
const BLOCK_ALIGN: usize = 16;

/// The set of heap blocks owned by the runtime.
///
/// Deep copies made by the transformation engine, relocated stack storage and
/// program requests for tracked memory all allocate through this table. When
/// the engine later deep-copies out of a block found here, it can release the
/// block with its recorded size; a pointer to anything *not* in the table is
/// never freed, only logged, since its provenance is unknown.
#[derive(Debug, Default)]
pub struct AllocTable {
	spans: Mutex<crate::RangeIndex<usize>>,
}

impl AllocTable {
	/// Creates an empty table.
	pub fn new() -> Self {
		Self::default()
	}

	/// Allocates a zeroed tracked block of `size` bytes.
	pub fn allocate(&self, size: usize) -> Addr {
		let Ok(layout) = Layout::from_size_align(size.max(1), BLOCK_ALIGN) else {
			fatal!(size, "alloc.layout.invalid");
		};
		let ptr = unsafe { alloc::alloc_zeroed(layout) };
		if ptr.is_null() {
			alloc::handle_alloc_error(layout);
		}
		let start = Addr::from_ptr(ptr);
		self.spans.lock().insert(start, start.byte_add(size.max(1)), size);
		tracing::trace!(addr = %start, size, "alloc.tracked");
		start
	}

	/// True if `addr` points into a tracked block.
	pub fn contains(&self, addr: Addr) -> bool {
		self.spans.lock().lookup(addr).is_some()
	}

	/// Returns the requested size of the tracked block containing `addr`.
	pub fn size_of(&self, addr: Addr) -> Option<usize> {
		self.spans.lock().lookup(addr).map(|span| span.data)
	}

	/// Releases the tracked block containing `addr`.
	///
	/// Returns false (without freeing anything) when no tracked block
	/// contains the address.
	pub fn release(&self, addr: Addr) -> bool {
		let Some(span) = self.spans.lock().remove_containing(addr) else {
			return false;
		};
		let layout = layout_for(span.data);
		unsafe { alloc::dealloc(span.start.as_mut_ptr(), layout) };
		tracing::trace!(addr = %span.start, size = span.data, "alloc.released");
		true
	}

	/// Number of live tracked blocks.
	pub fn len(&self) -> usize {
		self.spans.lock().len()
	}

	/// True when no blocks are tracked.
	pub fn is_empty(&self) -> bool {
		self.spans.lock().is_empty()
	}

	/// Snapshot of every live tracked block, as `(start, size)` pairs in
	/// address order. Migration code walks this to convert heap objects that
	/// no registered variable points at.
	pub fn blocks(&self) -> Vec<(Addr, usize)> {
		self.spans.lock().iter().map(|span| (span.start, span.data)).collect()
	}
}

impl Drop for AllocTable {
	fn drop(&mut self) {
		let spans = self.spans.get_mut();
		for span in spans.iter() {
			unsafe { alloc::dealloc(span.start.as_mut_ptr(), layout_for(span.data)) };
		}
		spans.clear();
	}
}

fn layout_for(size: usize) -> Layout {
	// Sizes in the table came from successful allocations.
	Layout::from_size_align(size.max(1), BLOCK_ALIGN).unwrap_or_else(|_| Layout::new::<u8>())
}

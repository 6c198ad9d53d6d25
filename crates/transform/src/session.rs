use moult_primitives::{Addr, fatal};
use moult_ranges::{AllocTable, AreaKind, VmAreas};
use rustc_hash::FxHashMap;

use crate::closure::{Closure, ClosureId, Converter, CopyMode, CustomFn};

/// Symbol resolution as seen by function-pointer conversion.
///
/// `key_of` maps a code address in the running version back to its symbol
/// key; `resolve` maps a key to its address in the incoming version.
pub trait SymbolMap {
	fn key_of(&self, addr: Addr) -> Option<String>;
	fn resolve(&self, key: &str) -> Option<Addr>;
}

/// Everything a running migration borrows from its surroundings.
///
/// `areas` is the memory-map snapshot taken at the start of the pass; when
/// absent, pointers that resolve to nothing are deep-copied unconditionally.
pub struct Env<'a> {
	pub symbols: &'a dyn SymbolMap,
	pub allocs: &'a AllocTable,
	pub areas: Option<&'a VmAreas>,
}

/// One migration run: the registered closures plus the memo table.
///
/// The memo table maps every old-version address whose contents have been
/// (or are being) transferred to its new-version address. Pointer converters
/// consult it before allocating, which is what turns aliases in the old heap
/// into aliases in the new heap and lets cyclic structures terminate.
#[derive(Debug, Default)]
pub struct Session {
	closures: Vec<Closure>,
	memo: FxHashMap<Addr, Addr>,
}

impl Session {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a closure and returns its handle.
	pub fn add(&mut self, closure: Closure) -> ClosureId {
		self.closures.push(closure);
		ClosureId(self.closures.len() - 1)
	}

	/// Byte-identical value of `size` bytes.
	pub fn raw(&mut self, size: usize) -> ClosureId {
		self.add(Closure::new(Converter::Raw, size, size))
	}

	/// Deep pointer whose pointee converts through `elem`.
	pub fn ptr(&mut self, elem: ClosureId) -> ClosureId {
		let w = size_of::<usize>();
		self.add(Closure::new(
			Converter::Ptr {
				elem,
				mode: CopyMode::Deep,
			},
			w,
			w,
		))
	}

	/// Shallow pointer: both versions keep addressing the old storage, which
	/// is still converted in place.
	pub fn ptr_shallow(&mut self, elem: ClosureId) -> ClosureId {
		let w = size_of::<usize>();
		self.add(Closure::new(
			Converter::Ptr {
				elem,
				mode: CopyMode::Shallow,
			},
			w,
			w,
		))
	}

	/// Pointer whose copy mode follows the element closure, resolved here at
	/// construction: a shallow-pointer element keeps the built pointer
	/// shallow, anything else makes it deep.
	pub fn ptr_inherit(&mut self, elem: ClosureId) -> ClosureId {
		let mode = self.closure(elem).effective_mode();
		let w = size_of::<usize>();
		self.add(Closure::new(Converter::Ptr { elem, mode }, w, w))
	}

	/// Function pointer, re-resolved by symbol key.
	pub fn fptr(&mut self) -> ClosureId {
		let w = size_of::<usize>();
		self.add(Closure::new(Converter::FnPtr, w, w))
	}

	/// `count` contiguous elements, each converted through `elem`.
	pub fn array(&mut self, count: usize, elem: ClosureId) -> ClosureId {
		let ec = self.closure(elem);
		self.add(Closure::new(
			Converter::Array { count, elem },
			count * ec.size_old,
			count * ec.size_new,
		))
	}

	/// Pointer to a zero-terminated sequence of `elem` values.
	pub fn nt_seq(&mut self, elem: ClosureId, scan_limit: usize) -> ClosureId {
		let w = size_of::<usize>();
		self.add(Closure::new(Converter::NtSeq { elem, scan_limit }, w, w))
	}

	/// Hand-written conversion.
	pub fn custom(&mut self, size_old: usize, size_new: usize, f: CustomFn) -> ClosureId {
		self.add(Closure::new(Converter::Custom(f), size_old, size_new))
	}

	/// Returns the registered closure behind `id`.
	pub fn closure(&self, id: ClosureId) -> Closure {
		match self.closures.get(id.0) {
			Some(c) => *c,
			None => fatal!(id = id.0, "transform.closure.unknown"),
		}
	}

	/// Pre-seeds the memo table.
	///
	/// Used for values whose new storage already exists (data symbols present
	/// in both versions, heap-relocated stack variables): interior pointers
	/// to `old` then resolve to `new` instead of a fresh heap copy.
	pub fn note_mapping(&mut self, old: Addr, new: Addr) {
		self.memo.insert(old, new);
	}

	/// Looks up the new-version address recorded for `old`.
	pub fn mapped(&self, old: Addr) -> Option<Addr> {
		self.memo.get(&old).copied()
	}

	/// Runs closure `id`, reading the old layout at `old` and writing the new
	/// layout at `new`.
	pub fn invoke(&mut self, env: &Env<'_>, id: ClosureId, old: Addr, new: Addr) {
		let closure = self.closure(id);
		match closure.conv {
			Converter::Raw => unsafe {
				old.copy_bytes_to(new, closure.size_old.min(closure.size_new));
			},
			Converter::Ptr { elem, mode } => self.transfer_ptr(env, elem, mode, old, new),
			Converter::FnPtr => transfer_fptr(env, old, new),
			Converter::Array { count, elem } => {
				let ec = self.closure(elem);
				for i in 0..count {
					self.invoke(env, elem, old.byte_add(i * ec.size_old), new.byte_add(i * ec.size_new));
				}
			}
			Converter::NtSeq { elem, scan_limit } => self.transfer_nt_seq(env, elem, scan_limit, old, new),
			Converter::Custom(f) => f(self, env, old, new),
		}
	}

	fn transfer_ptr(&mut self, env: &Env<'_>, elem: ClosureId, mode: CopyMode, old_slot: Addr, new_slot: Addr) {
		let target = unsafe { old_slot.read_addr() };
		if target.is_null() {
			unsafe { new_slot.write_addr(Addr::NULL) };
			return;
		}
		if let Some(seen) = self.mapped(target) {
			unsafe { new_slot.write_addr(seen) };
			return;
		}
		// A pointer to a registered variable repoints to that variable's home
		// in the incoming version; named data is accessed by location, never
		// duplicated. A key the incoming version dropped falls through to the
		// heap copy below, which at least preserves the bytes.
		if let Some(key) = env.symbols.key_of(target) {
			if let Some(home) = env.symbols.resolve(&key) {
				tracing::trace!(key = %key, old = %target, new = %home, "transform.ptr.symbol");
				self.memo.insert(target, home);
				unsafe { new_slot.write_addr(home) };
				return;
			}
			tracing::debug!(key = %key, "transform.ptr.symbol-dropped");
		}
		// Pointers into mapped libraries address code or read-only data the
		// loader keeps alive; they are carried over rather than copied.
		let tracked = env.allocs.contains(target);
		if !tracked {
			if let Some(area) = env.areas.and_then(|a| a.classify(target)) {
				if area.kind == AreaKind::Library {
					tracing::trace!(addr = %target, area = %area, "transform.ptr.library-retained");
					self.memo.insert(target, target);
					unsafe { new_slot.write_addr(target) };
					return;
				}
			}
		}
		// Shallow mode reuses the old storage in place of a fresh block; the
		// pointee still converts, into itself.
		let dest = match mode {
			CopyMode::Deep => env.allocs.allocate(self.closure(elem).size_new),
			CopyMode::Shallow => target,
		};
		// Map before recursing, so aliases and cycles inside the pointee
		// resolve to this destination instead of converting it again.
		self.memo.insert(target, dest);
		self.invoke(env, elem, target, dest);
		unsafe { new_slot.write_addr(dest) };
		// A deep-copied tracked block has no remaining readers: aliases go
		// through the memo from here on. Untracked sources are left alone,
		// their provenance is unknown.
		if tracked && mode == CopyMode::Deep {
			env.allocs.release(target);
		}
	}

	fn transfer_nt_seq(&mut self, env: &Env<'_>, elem: ClosureId, scan_limit: usize, old_slot: Addr, new_slot: Addr) {
		let base = unsafe { old_slot.read_addr() };
		if base.is_null() {
			unsafe { new_slot.write_addr(Addr::NULL) };
			return;
		}
		if let Some(seen) = self.mapped(base) {
			unsafe { new_slot.write_addr(seen) };
			return;
		}
		let ec = self.closure(elem);
		let mut count = 0usize;
		while !unsafe { base.byte_add(count * ec.size_old).is_zeroed(ec.size_old) } {
			count += 1;
			if count >= scan_limit {
				fatal!(base = %base, scan_limit, "transform.ntseq.unterminated");
			}
		}
		// Zeroed allocation, so the terminator slot needs no write.
		let tracked = env.allocs.contains(base);
		let fresh = env.allocs.allocate((count + 1) * ec.size_new);
		self.memo.insert(base, fresh);
		for i in 0..count {
			self.invoke(env, elem, base.byte_add(i * ec.size_old), fresh.byte_add(i * ec.size_new));
		}
		unsafe { new_slot.write_addr(fresh) };
		if tracked {
			env.allocs.release(base);
		}
		tracing::trace!(base = %base, count, "transform.ntseq.copied");
	}
}

fn transfer_fptr(env: &Env<'_>, old_slot: Addr, new_slot: Addr) {
	let target = unsafe { old_slot.read_addr() };
	if target.is_null() {
		unsafe { new_slot.write_addr(Addr::NULL) };
		return;
	}
	let Some(key) = env.symbols.key_of(target) else {
		fatal!(addr = %target, "transform.fptr.unregistered");
	};
	let Some(fresh) = env.symbols.resolve(&key) else {
		fatal!(key = %key, "transform.fptr.unresolved");
	};
	unsafe { new_slot.write_addr(fresh) };
	tracing::trace!(key = %key, old = %target, new = %fresh, "transform.fptr.rebound");
}

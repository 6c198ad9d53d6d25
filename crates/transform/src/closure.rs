use moult_primitives::Addr;

use crate::session::{Env, Session};

/// Handle to a closure registered in a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosureId(pub(crate) usize);

/// Hand-written converter for layouts the built-in ones cannot express.
///
/// Receives the running session so it can invoke other closures on parts of
/// the value, the source address in the old layout and the destination in the
/// new one.
pub type CustomFn = fn(&mut Session, &Env<'_>, Addr, Addr);

/// Whether a pointer converter duplicates its pointee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
	/// The pointee is copied into fresh storage and converted through the
	/// element closure; a tracked old block is released afterwards.
	Deep,
	/// The pointer value is carried over unchanged; both versions keep
	/// addressing the same storage.
	Shallow,
}

/// How one value is carried across the version boundary.
#[derive(Debug, Clone, Copy)]
pub enum Converter {
	/// Byte-identical layout: plain copy of `size_old` bytes.
	Raw,
	/// A pointer. In deep mode the pointee is converted through `elem`, with
	/// aliasing preserved by the session memo table.
	Ptr { elem: ClosureId, mode: CopyMode },
	/// A function pointer, re-resolved by symbol key in the new code image.
	FnPtr,
	/// `count` elements laid out contiguously, each converted through `elem`.
	/// Strides are the element closure's old and new sizes.
	Array { count: usize, elem: ClosureId },
	/// A pointer to a zero-terminated element sequence. The old sequence is
	/// scanned for an all-zero element, never past `scan_limit` elements, and
	/// copied terminator included.
	NtSeq { elem: ClosureId, scan_limit: usize },
	/// User-supplied conversion.
	Custom(CustomFn),
}

/// A converter plus the value's footprint in each version.
#[derive(Debug, Clone, Copy)]
pub struct Closure {
	pub conv: Converter,
	pub size_old: usize,
	pub size_new: usize,
}

impl Closure {
	pub fn new(conv: Converter, size_old: usize, size_new: usize) -> Self {
		Self {
			conv,
			size_old,
			size_new,
		}
	}

	/// The copy mode this closure applies to storage it converts. Only
	/// shallow pointers differ from the default.
	pub fn effective_mode(&self) -> CopyMode {
		match self.conv {
			Converter::Ptr { mode, .. } => mode,
			_ => CopyMode::Deep,
		}
	}
}

use std::fmt;

/// An untyped address in the running process.
///
/// The transformation engine walks old-version state as raw memory: a value
/// location is just an address plus a size known to the caller. `Addr` keeps
/// those addresses out of the pointer type system so they can be stored in
/// tables, compared, and offset without inventing spurious lifetimes. All
/// dereferencing goes through the unsafe accessors below, which use unaligned
/// reads/writes because relocated stack storage is plain byte buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr(pub usize);

impl Addr {
	/// The null address.
	pub const NULL: Addr = Addr(0);

	/// Returns true for the null address.
	#[inline]
	pub fn is_null(self) -> bool {
		self.0 == 0
	}

	/// Captures the address of a shared reference.
	#[inline]
	pub fn of_ref<T>(r: &T) -> Self {
		Addr(r as *const T as usize)
	}

	/// Captures the address of an exclusive reference.
	#[inline]
	pub fn of_mut<T>(r: &mut T) -> Self {
		Addr(r as *mut T as usize)
	}

	/// Wraps a raw pointer.
	#[inline]
	pub fn from_ptr<T>(p: *const T) -> Self {
		Addr(p as usize)
	}

	/// Reinterprets the address as a const pointer.
	#[inline]
	pub fn as_ptr<T>(self) -> *const T {
		self.0 as *const T
	}

	/// Reinterprets the address as a mut pointer.
	#[inline]
	pub fn as_mut_ptr<T>(self) -> *mut T {
		self.0 as *mut T
	}

	/// Returns the address advanced by `bytes`.
	#[inline]
	pub fn byte_add(self, bytes: usize) -> Addr {
		Addr(self.0 + bytes)
	}

	/// Reads a pointer-sized value stored at this address.
	///
	/// # Safety
	/// The address must refer to at least `size_of::<usize>()` readable bytes.
	pub unsafe fn read_addr(self) -> Addr {
		Addr(unsafe { self.as_ptr::<usize>().read_unaligned() })
	}

	/// Stores a pointer-sized value at this address.
	///
	/// # Safety
	/// The address must refer to at least `size_of::<usize>()` writable bytes.
	pub unsafe fn write_addr(self, value: Addr) {
		unsafe { self.as_mut_ptr::<usize>().write_unaligned(value.0) }
	}

	/// Copies `len` bytes from this address to `dst`. The regions may
	/// overlap; in-place conversion passes the same address for both.
	///
	/// # Safety
	/// Both regions must be valid for `len` bytes.
	pub unsafe fn copy_bytes_to(self, dst: Addr, len: usize) {
		unsafe { std::ptr::copy(self.as_ptr::<u8>(), dst.as_mut_ptr::<u8>(), len) }
	}

	/// Returns true if all `len` bytes at this address are zero.
	///
	/// # Safety
	/// The address must refer to at least `len` readable bytes.
	pub unsafe fn is_zeroed(self, len: usize) -> bool {
		let base = self.as_ptr::<u8>();
		(0..len).all(|i| unsafe { base.add(i).read() } == 0)
	}
}

impl fmt::Display for Addr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:#x}", self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trip_through_refs() {
		let mut v = 7u64;
		let a = Addr::of_mut(&mut v);
		assert!(!a.is_null());
		assert_eq!(unsafe { *a.as_ptr::<u64>() }, 7);
	}

	#[test]
	fn byte_copy_and_zero_scan() {
		let src = [1u8, 2, 3, 0, 0];
		let mut dst = [0u8; 5];
		unsafe {
			Addr::of_ref(&src[0]).copy_bytes_to(Addr::of_mut(&mut dst[0]), 5);
		}
		assert_eq!(dst, src);
		assert!(unsafe { Addr::of_ref(&src[3]).is_zeroed(2) });
		assert!(!unsafe { Addr::of_ref(&src[0]).is_zeroed(3) });
	}

	#[test]
	fn unaligned_pointer_store() {
		let mut buf = [0u8; size_of::<usize>() + 1];
		let slot = Addr::of_mut(&mut buf[1]);
		unsafe { slot.write_addr(Addr(0xdead_beef)) };
		assert_eq!(unsafe { slot.read_addr() }, Addr(0xdead_beef));
	}
}

use std::collections::BTreeMap;

use moult_primitives::Addr;

/// One `[start, end)` interval with its payload.
#[derive(Debug, Clone)]
pub struct Span<T> {
	pub start: Addr,
	pub end: Addr,
	pub data: T,
}

impl<T> Span<T> {
	/// True if `addr` falls inside `[start, end)`.
	#[inline]
	pub fn contains(&self, addr: Addr) -> bool {
		self.start <= addr && addr < self.end
	}

	/// Interval length in bytes.
	#[inline]
	pub fn len(&self) -> usize {
		self.end.0 - self.start.0
	}

	/// True for a degenerate empty interval.
	#[inline]
	pub fn is_empty(&self) -> bool {
		self.start == self.end
	}
}

/// An ordered index over non-overlapping `[start, end)` address intervals.
///
/// Point lookups find the unique interval containing an address: take the
/// greatest start at or below the query and check the query against that
/// interval's end. Overlapping insertions are rejected so the containment
/// answer stays unique.
#[derive(Debug)]
pub struct RangeIndex<T> {
	by_start: BTreeMap<usize, Span<T>>,
}

// Derived Default would require T: Default, but an empty index needs no
// payload at all.
impl<T> Default for RangeIndex<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> RangeIndex<T> {
	/// Creates an empty index.
	pub fn new() -> Self {
		Self {
			by_start: BTreeMap::new(),
		}
	}

	/// Inserts `[start, end)` with its payload.
	///
	/// Returns false (and leaves the index unchanged) if the interval is
	/// empty, inverted, or overlaps an existing interval.
	pub fn insert(&mut self, start: Addr, end: Addr, data: T) -> bool {
		if start >= end {
			return false;
		}
		if let Some(hit) = self.lookup(start) {
			tracing::warn!(start = %start, existing = %hit.start, "ranges.insert.overlap");
			return false;
		}
		// A larger existing interval starting above `start` could still poke
		// into the new one.
		if let Some((_, next)) = self.by_start.range(start.0..end.0).next() {
			tracing::warn!(start = %start, existing = %next.start, "ranges.insert.overlap");
			return false;
		}
		self.by_start.insert(start.0, Span { start, end, data });
		true
	}

	/// Finds the interval containing `addr`, if any.
	pub fn lookup(&self, addr: Addr) -> Option<&Span<T>> {
		let (_, span) = self.by_start.range(..=addr.0).next_back()?;
		span.contains(addr).then_some(span)
	}

	/// Removes the interval starting exactly at `start`.
	pub fn remove(&mut self, start: Addr) -> Option<Span<T>> {
		self.by_start.remove(&start.0)
	}

	/// Removes the interval containing `addr`, wherever it starts.
	pub fn remove_containing(&mut self, addr: Addr) -> Option<Span<T>> {
		let start = self.lookup(addr)?.start;
		self.by_start.remove(&start.0)
	}

	/// Number of intervals held.
	pub fn len(&self) -> usize {
		self.by_start.len()
	}

	/// True when no intervals are held.
	pub fn is_empty(&self) -> bool {
		self.by_start.is_empty()
	}

	/// Drops every interval.
	pub fn clear(&mut self) {
		self.by_start.clear();
	}

	/// Iterates intervals in address order.
	pub fn iter(&self) -> impl Iterator<Item = &Span<T>> {
		self.by_start.values()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn point_lookup_hits_containing_interval() {
		let mut idx = RangeIndex::new();
		assert!(idx.insert(Addr(100), Addr(200), "a"));
		assert!(idx.insert(Addr(300), Addr(310), "b"));

		assert_eq!(idx.lookup(Addr(100)).map(|s| s.data), Some("a"));
		assert_eq!(idx.lookup(Addr(199)).map(|s| s.data), Some("a"));
		assert!(idx.lookup(Addr(200)).is_none());
		assert_eq!(idx.lookup(Addr(305)).map(|s| s.data), Some("b"));
		assert!(idx.lookup(Addr(99)).is_none());
		assert!(idx.lookup(Addr(250)).is_none());

		let removed = idx.remove(Addr(100)).unwrap();
		assert_eq!(removed.len(), 100);
		assert!(!removed.is_empty());
		assert_eq!(idx.iter().count(), 1);
	}

	#[test]
	fn overlapping_insert_rejected() {
		let mut idx = RangeIndex::new();
		assert!(idx.insert(Addr(100), Addr(200), ()));
		assert!(!idx.insert(Addr(150), Addr(250), ()));
		assert!(!idx.insert(Addr(50), Addr(101), ()));
		assert!(!idx.insert(Addr(50), Addr(300), ()));
		assert!(!idx.insert(Addr(120), Addr(120), ()));
		assert_eq!(idx.len(), 1);
	}

	#[test]
	fn remove_containing() {
		let mut idx = RangeIndex::new();
		idx.insert(Addr(100), Addr(200), ());
		assert!(idx.remove_containing(Addr(150)).is_some());
		assert!(idx.is_empty());
		assert!(idx.remove_containing(Addr(150)).is_none());
	}
}

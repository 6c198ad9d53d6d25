use std::fmt;
use std::fs;
use std::io;

use moult_primitives::Addr;

use crate::RangeIndex;

/// Broad classification of a mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaKind {
	Heap,
	Stack,
	Library,
	Other,
}

/// One region from the process memory map.
#[derive(Debug, Clone)]
pub struct VmArea {
	pub kind: AreaKind,
	pub readable: bool,
	pub writable: bool,
	pub executable: bool,
	pub label: String,
}

impl fmt::Display for VmArea {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let r = if self.readable { "r" } else { "" };
		let w = if self.writable { "w" } else { "" };
		let x = if self.executable { "x" } else { "" };
		write!(f, "{} [{r}{w}{x}]", self.label)
	}
}

/// A point-in-time snapshot of the process's mapped regions.
///
/// Captured once per update pass, right before migration begins, and used by
/// the transformation engine to label pointers that do not resolve to a
/// registered symbol or a tracked allocation. The snapshot goes stale as the
/// program runs; it is discarded with the rest of the per-update state.
#[derive(Debug, Default)]
pub struct VmAreas {
	index: RangeIndex<VmArea>,
}

impl VmAreas {
	/// Parses `/proc/self/maps` into a fresh snapshot.
	pub fn capture() -> io::Result<Self> {
		let maps = fs::read_to_string("/proc/self/maps")?;
		Ok(Self::from_maps(&maps))
	}

	fn from_maps(maps: &str) -> Self {
		let mut index = RangeIndex::new();
		for line in maps.lines() {
			match parse_line(line) {
				Some((start, end, area)) => {
					index.insert(start, end, area);
				}
				None => tracing::warn!(line, "vmareas.parse.skipped"),
			}
		}
		Self { index }
	}

	/// Classifies an address against the snapshot.
	pub fn classify(&self, addr: Addr) -> Option<&VmArea> {
		self.index.lookup(addr).map(|span| &span.data)
	}

	/// Number of regions captured.
	pub fn len(&self) -> usize {
		self.index.len()
	}

	/// True when the snapshot holds no regions.
	pub fn is_empty(&self) -> bool {
		self.index.is_empty()
	}
}

/// Parses one maps line: `start-end perms offset dev inode [label]`.
fn parse_line(line: &str) -> Option<(Addr, Addr, VmArea)> {
	let mut fields = line.split_whitespace();
	let range = fields.next()?;
	let perms = fields.next()?;
	let _offset = fields.next()?;
	let _dev = fields.next()?;
	let _inode = fields.next()?;
	let label = fields.next().unwrap_or("").to_string();

	let (start, end) = range.split_once('-')?;
	let start = Addr(usize::from_str_radix(start, 16).ok()?);
	let end = Addr(usize::from_str_radix(end, 16).ok()?);

	let mut perm_chars = perms.chars();
	let readable = perm_chars.next() == Some('r');
	let writable = perm_chars.next() == Some('w');
	let executable = perm_chars.next() == Some('x');

	let kind = if label == "[heap]" {
		AreaKind::Heap
	} else if label == "[stack]" {
		AreaKind::Stack
	} else if label.contains(".so") {
		AreaKind::Library
	} else {
		AreaKind::Other
	};

	Some((
		start,
		end,
		VmArea {
			kind,
			readable,
			writable,
			executable,
			label,
		},
	))
}

#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE: &str = "\
00400000-00452000 r-xp 00000000 08:02 173521 /usr/bin/dbus-daemon
035f4000-03615000 rw-p 00000000 00:00 0 [heap]
7f1bb2253000-7f1bb23e5000 r-xp 00000000 08:02 135522 /usr/lib/libc-2.15.so
7fff2c7b0000-7fff2c7d1000 rw-p 00000000 00:00 0 [stack]
7fff2c7fe000-7fff2c800000 r-xp 00000000 00:00 0";

	#[test]
	fn classifies_sample_regions() {
		let areas = VmAreas::from_maps(SAMPLE);
		assert_eq!(areas.len(), 5);

		let heap = areas.classify(Addr(0x035f_4100)).unwrap();
		assert_eq!(heap.kind, AreaKind::Heap);
		assert!(heap.writable && !heap.executable);

		let lib = areas.classify(Addr(0x7f1b_b225_3000)).unwrap();
		assert_eq!(lib.kind, AreaKind::Library);

		let stack = areas.classify(Addr(0x7fff_2c7c_0000)).unwrap();
		assert_eq!(stack.kind, AreaKind::Stack);

		let anon = areas.classify(Addr(0x7fff_2c7f_e000)).unwrap();
		assert_eq!(anon.kind, AreaKind::Other);
		assert_eq!(anon.label, "");

		assert!(areas.classify(Addr(0x10)).is_none());
	}

	#[test]
	fn default_map_is_empty() {
		let areas = VmAreas::default();
		assert!(areas.is_empty());
		assert!(areas.classify(Addr(0x400000)).is_none());
	}

	#[test]
	fn capture_sees_own_mappings() {
		let areas = VmAreas::capture().unwrap();
		assert!(!areas.is_empty());
		// The code we are executing must be mapped.
		let here = Addr(capture_sees_own_mappings as usize);
		assert!(areas.classify(here).is_some());
	}
}

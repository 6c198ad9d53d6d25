use moult_primitives::{Addr, Qualifiers, fatal};
use rustc_hash::FxHashMap;

/// One registered variable.
#[derive(Debug, Clone)]
pub struct SymbolEntry {
	pub key: String,
	pub addr: Addr,
	pub size: usize,
	pub auto_migrate: bool,
	pub quals: Qualifiers,
}

/// The bidirectional name/address directory for one code version.
///
/// Invariant: every entry reachable by key is reachable by address and vice
/// versa. Registration enforces it eagerly: a key/address pair where only
/// one direction is already mapped means two distinct variables collided,
/// which is an instrumentation bug, not something migration can recover from.
#[derive(Debug, Default)]
pub struct SymbolTable {
	by_key: FxHashMap<String, SymbolEntry>,
	by_addr: FxHashMap<Addr, String>,
}

impl SymbolTable {
	/// Creates an empty table.
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a variable.
	///
	/// Re-registering an identical key/address pair is a no-op. A key bound
	/// to a different address, or an address bound to a different key, aborts
	/// with a diagnostic.
	pub fn register(&mut self, quals: Qualifiers, addr: Addr, size: usize, auto_migrate: bool) {
		let key = quals.key();
		match (self.by_key.get(&key), self.by_addr.get(&addr)) {
			(Some(entry), Some(existing_key)) if entry.addr == addr && *existing_key == key => {}
			(None, None) => {
				tracing::trace!(key = %key, addr = %addr, size, auto_migrate, "registry.register");
				self.by_addr.insert(addr, key.clone());
				self.by_key.insert(
					key.clone(),
					SymbolEntry {
						key,
						addr,
						size,
						auto_migrate,
						quals,
					},
				);
			}
			(Some(entry), _) => {
				fatal!(key = %key, addr = %addr, existing = %entry.addr, "registry.register.key-collision");
			}
			(None, Some(existing_key)) => {
				fatal!(key = %key, addr = %addr, existing = %existing_key, "registry.register.addr-collision");
			}
		}
	}

	/// Resolves a key to its registered address.
	pub fn lookup_key(&self, key: &str) -> Option<Addr> {
		self.by_key.get(key).map(|entry| entry.addr)
	}

	/// Resolves an address to the key it was registered under.
	pub fn lookup_addr(&self, addr: Addr) -> Option<&str> {
		self.by_addr.get(&addr).map(String::as_str)
	}

	/// Full entry for a key.
	pub fn entry(&self, key: &str) -> Option<&SymbolEntry> {
		self.by_key.get(key)
	}

	/// Iterates all entries in unspecified order.
	pub fn entries(&self) -> impl Iterator<Item = &SymbolEntry> {
		self.by_key.values()
	}

	/// Number of registered variables.
	pub fn len(&self) -> usize {
		self.by_key.len()
	}

	/// True when nothing is registered.
	pub fn is_empty(&self) -> bool {
		self.by_key.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bidirectional_invariant() {
		let mut table = SymbolTable::new();
		table.register(Qualifiers::global("x"), Addr(0x1000), 4, false);
		table.register(Qualifiers::file_static("main.c", "y"), Addr(0x2000), 8, true);

		for key in ["x", "main.c/y"] {
			let addr = table.lookup_key(key).unwrap();
			assert_eq!(table.lookup_addr(addr), Some(key));
		}
		let key = table.lookup_addr(Addr(0x1000)).unwrap().to_owned();
		assert_eq!(table.lookup_key(&key), Some(Addr(0x1000)));
	}

	#[test]
	fn duplicate_registration_is_noop() {
		let mut table = SymbolTable::new();
		table.register(Qualifiers::global("x"), Addr(0x1000), 4, false);
		table.register(Qualifiers::global("x"), Addr(0x1000), 4, false);
		assert_eq!(table.len(), 1);
	}

	#[test]
	fn lookup_misses_are_absent_not_fatal() {
		let table = SymbolTable::new();
		assert!(table.lookup_key("missing").is_none());
		assert!(table.lookup_addr(Addr(0xdead)).is_none());
	}
}

//! The cross-version symbol registry.
//!
//! Each code version builds one [`SymbolTable`] mapping variable keys to
//! addresses bidirectionally. A [`Registry`] holds the running version's
//! table ("current") and, during an update, the table the previous version
//! built ("old"); the transformation engine resolves old addresses to keys
//! and keys to new addresses through it. [`RenameTable`] records explicit
//! key renames between versions.

mod rename;
mod table;

use std::sync::Arc;

use moult_primitives::{Addr, Qualifiers};
use parking_lot::Mutex;

pub use rename::RenameTable;
pub use table::{SymbolEntry, SymbolTable};

/// Which version's table a lookup targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
	/// The running version's registrations.
	Current,
	/// The registrations retained from the previous version.
	Old,
}

/// The process-wide registry: the current version's symbol table plus the
/// previous version's, retained until migration completes.
///
/// The current table is shared by `Arc` because old-version threads may still
/// be draining toward their update points (and registering late symbols)
/// after the table has been handed to the next version.
#[derive(Debug, Default)]
pub struct Registry {
	current: Arc<Mutex<SymbolTable>>,
	old: Mutex<Option<Arc<Mutex<SymbolTable>>>>,
}

impl Registry {
	/// Creates a registry with an empty current table and no old table.
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a variable in the current table. See [`SymbolTable::register`].
	pub fn register(&self, quals: Qualifiers, addr: Addr, size: usize, auto_migrate: bool) {
		self.current.lock().register(quals, addr, size, auto_migrate);
	}

	/// Looks up a key in the chosen scope.
	pub fn lookup_key(&self, scope: Scope, key: &str) -> Option<Addr> {
		match scope {
			Scope::Current => self.current.lock().lookup_key(key),
			Scope::Old => {
				let old = self.old.lock();
				old.as_ref().and_then(|table| table.lock().lookup_key(key))
			}
		}
	}

	/// Looks up an address in the chosen scope.
	pub fn lookup_addr(&self, scope: Scope, addr: Addr) -> Option<String> {
		match scope {
			Scope::Current => self.current.lock().lookup_addr(addr).map(str::to_owned),
			Scope::Old => {
				let old = self.old.lock();
				old.as_ref().and_then(|table| table.lock().lookup_addr(addr).map(str::to_owned))
			}
		}
	}

	/// Returns `(addr, size)` for a key in the chosen scope.
	pub fn entry_in(&self, scope: Scope, key: &str) -> Option<(Addr, usize)> {
		match scope {
			Scope::Current => self.current.lock().entry(key).map(|e| (e.addr, e.size)),
			Scope::Old => {
				let old = self.old.lock();
				old.as_ref().and_then(|table| table.lock().entry(key).map(|e| (e.addr, e.size)))
			}
		}
	}

	/// Returns the `(key, addr, size)` of every auto-migrating entry in the
	/// current table.
	pub fn auto_entries(&self) -> Vec<(String, Addr, usize)> {
		self.current
			.lock()
			.entries()
			.filter(|e| e.auto_migrate)
			.map(|e| (e.key.clone(), e.addr, e.size))
			.collect()
	}

	/// Hands out the current table for carrying into the next version.
	pub fn share_current(&self) -> Arc<Mutex<SymbolTable>> {
		Arc::clone(&self.current)
	}

	/// Re-points "old" at the table built by the previous version.
	pub fn adopt_old(&self, table: Arc<Mutex<SymbolTable>>) {
		*self.old.lock() = Some(table);
	}

	/// Releases every old-version entry after migration completes.
	pub fn clear_old(&self) {
		if let Some(table) = self.old.lock().take() {
			let count = table.lock().len();
			tracing::debug!(count, "registry.old.cleared");
		}
	}

	/// True while an old table is retained.
	pub fn has_old(&self) -> bool {
		self.old.lock().is_some()
	}
}

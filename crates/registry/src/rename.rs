use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Explicit old-key → new-key renames for the in-flight update.
///
/// Registered by the new version before migration runs (typically from its
/// pre-entry hook); consulted whenever an old-version key is translated to a
/// new-version address. Cleared along with the rest of the per-update state.
#[derive(Debug, Default)]
pub struct RenameTable {
	map: Mutex<FxHashMap<String, String>>,
}

impl RenameTable {
	/// Creates an empty rename table.
	pub fn new() -> Self {
		Self::default()
	}

	/// Records that `old_key` is named `new_key` in the new version.
	pub fn register(&self, old_key: impl Into<String>, new_key: impl Into<String>) {
		let (old_key, new_key) = (old_key.into(), new_key.into());
		tracing::debug!(old = %old_key, new = %new_key, "registry.rename");
		self.map.lock().insert(old_key, new_key);
	}

	/// Returns the new-version key for `old_key`, if renamed.
	pub fn mapped(&self, old_key: &str) -> Option<String> {
		self.map.lock().get(old_key).cloned()
	}

	/// Applies the rename if one exists, otherwise keeps the key.
	pub fn resolve(&self, old_key: &str) -> String {
		self.mapped(old_key).unwrap_or_else(|| old_key.to_owned())
	}

	/// Reverse direction: the old-version key behind `new_key`, if renamed.
	pub fn previous(&self, new_key: &str) -> Option<String> {
		let map = self.map.lock();
		map.iter().find(|(_, v)| v.as_str() == new_key).map(|(k, _)| k.clone())
	}

	/// Drops all renames.
	pub fn clear(&self) {
		self.map.lock().clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolve_falls_through() {
		let renames = RenameTable::new();
		renames.register("old_name", "new_name");
		assert_eq!(renames.resolve("old_name"), "new_name");
		assert_eq!(renames.resolve("other"), "other");
		assert_eq!(renames.previous("new_name").as_deref(), Some("old_name"));
		assert_eq!(renames.previous("old_name"), None);
		renames.clear();
		assert_eq!(renames.resolve("old_name"), "old_name");
	}
}

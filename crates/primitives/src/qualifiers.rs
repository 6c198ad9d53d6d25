use std::fmt;

/// The qualifier tuple identifying a program variable across versions.
///
/// A variable's identity is its name plus the scopes that disambiguate it: the
/// enclosing function (for locals and function-scoped statics), the enclosing
/// file (for file statics), and an optional user namespace. The derived
/// [`key`](Qualifiers::key) is the string under which the variable is
/// registered; the same grammar must be used by both versions of a program for
/// migration to line up:
///
/// - `name` (global)
/// - `namespace@name`
/// - `file/name` (file static)
/// - `file/function#name` (function-scoped static)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Qualifiers {
	pub name: String,
	pub function: Option<String>,
	pub file: Option<String>,
	pub namespace: Option<String>,
}

impl Qualifiers {
	/// A plain global variable.
	pub fn global(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			function: None,
			file: None,
			namespace: None,
		}
	}

	/// A local (or formal) of `function`.
	pub fn local(function: impl Into<String>, name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			function: Some(function.into()),
			file: None,
			namespace: None,
		}
	}

	/// A file-scoped static.
	pub fn file_static(file: impl Into<String>, name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			function: None,
			file: Some(file.into()),
			namespace: None,
		}
	}

	/// A function-scoped static.
	pub fn local_static(file: impl Into<String>, function: impl Into<String>, name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			function: Some(function.into()),
			file: Some(file.into()),
			namespace: None,
		}
	}

	/// Returns a copy carrying a user namespace.
	pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
		self.namespace = Some(namespace.into());
		self
	}

	/// True if this names a stack variable: scoped to a function but not a
	/// file (function-scoped statics carry both and live in the registry).
	pub fn is_stack_local(&self) -> bool {
		self.function.is_some() && self.file.is_none()
	}

	/// Derives the registration key for this qualifier tuple.
	pub fn key(&self) -> String {
		let mut key = String::new();
		if let Some(ns) = &self.namespace {
			key.push_str(ns);
			key.push('@');
		}
		if let Some(file) = &self.file {
			key.push_str(file);
			key.push('/');
		}
		if let Some(function) = &self.function {
			key.push_str(function);
			key.push('#');
		}
		key.push_str(&self.name);
		key
	}
}

impl fmt::Display for Qualifiers {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.key())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn key_grammar() {
		assert_eq!(Qualifiers::global("x").key(), "x");
		assert_eq!(Qualifiers::global("x").in_namespace("srv").key(), "srv@x");
		assert_eq!(Qualifiers::file_static("main.c", "y").key(), "main.c/y");
		assert_eq!(Qualifiers::local_static("main.c", "main", "z").key(), "main.c/main#z");
		assert_eq!(
			Qualifiers::local_static("main.c", "main", "z").in_namespace("srv").key(),
			"srv@main.c/main#z"
		);
	}

	#[test]
	fn stack_local_classification() {
		assert!(Qualifiers::local("main", "q").is_stack_local());
		assert!(!Qualifiers::local_static("main.c", "main", "z").is_stack_local());
		assert!(!Qualifiers::global("x").is_stack_local());
	}
}

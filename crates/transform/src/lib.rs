//! State transformation between program versions.
//!
//! A migration is described as a set of [`Closure`]s, small converters that
//! copy one value from its old-version layout into its new-version layout.
//! Converters compose: a pointer converter allocates the new pointee and
//! applies an element converter to it, an array converter strides over both
//! layouts, and so on. A [`Session`] runs closures and carries the memo table
//! that keeps pointer aliasing intact across the whole migration.

mod closure;
mod session;

pub use closure::{Closure, ClosureId, Converter, CopyMode, CustomFn};
pub use session::{Env, Session, SymbolMap};

//! Shared low-level building blocks for the moult runtime.
//!
//! This crate provides the untyped raw-address handle used throughout the
//! state-transfer machinery ([`Addr`]), the qualifier tuple and key grammar
//! that identify program variables across versions ([`Qualifiers`]), and the
//! process-abort path used for protocol violations ([`fatal!`]).

mod addr;
mod qualifiers;

pub mod payload;

pub use addr::Addr;
pub use qualifiers::Qualifiers;

/// Aborts the process after logging a protocol-violation diagnostic.
///
/// Protocol violations (one-sided symbol mappings, mismatched frame exits,
/// unresolvable function pointers) indicate an instrumentation or
/// transformation-authoring bug. Continuing past one would commit an
/// inconsistent update, so there is no error value to propagate: the message
/// is logged at error level and the process aborts.
#[macro_export]
macro_rules! fatal {
	($($arg:tt)*) => {{
		::tracing::error!($($arg)*);
		::std::process::abort();
	}};
}

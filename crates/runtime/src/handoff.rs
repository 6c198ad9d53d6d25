use std::panic;
use std::path::PathBuf;
use std::sync::Arc;

use moult_primitives::payload;
use moult_ranges::AllocTable;
use moult_registry::SymbolTable;
use moult_stackvars::FrameStore;
use moult_threads::ThreadSet;
use parking_lot::Mutex;

use crate::bench::BenchMarks;

/// Everything the old version hands to the new one.
///
/// Shared handles rather than snapshots: when the main thread leaves for the
/// driver, late old-version workers may still be draining toward their update
/// points and touching these structures.
pub struct CarriedState {
	pub symbols: Arc<Mutex<SymbolTable>>,
	pub stacks: Arc<FrameStore>,
	pub threads: Arc<ThreadSet>,
	pub allocs: Arc<AllocTable>,
	pub bench: Option<BenchMarks>,
}

/// The value carried back to the driver when an update point is taken.
pub struct Handoff {
	/// Identifier of the update point that accepted the request; the next
	/// version resumes at the point with the same identifier.
	pub point: String,
	/// Explicit next-image path, when the program overrode discovery.
	pub next_path: Option<PathBuf>,
	pub state: CarriedState,
}

/// Unwind payload wrapping a [`Handoff`]; caught by the driver loop.
pub struct ControlTransfer(pub Handoff);

/// The single-use jump back to the driver.
///
/// The driver captures its loop position simply by wrapping the call into the
/// program in `catch_unwind`; transferring control is an unwind carrying the
/// handoff, filtered out of panic reporting.
pub struct Continuation;

impl Continuation {
	pub fn transfer(handoff: Handoff) -> ! {
		payload::register_control_payload::<ControlTransfer>();
		tracing::info!(point = %handoff.point, "update.handoff");
		panic::panic_any(ControlTransfer(handoff))
	}
}

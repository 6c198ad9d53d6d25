//! Worker thread tracking and the quiescence protocol.
//!
//! Every worker spawned through [`ThreadSet`] gets a descriptor in the live
//! list. When an update is requested, workers stop at their next update point
//! (or are kicked out of an instrumented wait), report in, and exit; the main
//! thread's [`ThreadSet::await_quiescence`] returns once every live worker has
//! reported or finished. After migration, [`ThreadSet::relaunch`] respawns the
//! carried descriptors in the new code and [`ThreadSet::finish_release`] lets
//! them proceed.

mod descriptor;
mod set;

pub use descriptor::{Descriptor, WorkerEntry};
pub use set::{QuiesceExit, SleepOutcome, ThreadSet, current_stack, is_worker};

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThreadError {
	#[error("failed to spawn worker thread: {0}")]
	Spawn(#[from] io::Error),
}

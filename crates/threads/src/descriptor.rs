use std::sync::Arc;

use moult_primitives::Addr;
use moult_stackvars::StackId;
use parking_lot::Condvar;

/// A worker's start routine.
///
/// Plain function pointers only: across an update the routine is identified
/// by its code address, re-resolved by symbol key into the new image. The
/// argument is an opaque address the routine interprets itself.
pub type WorkerEntry = fn(Addr);

/// One tracked worker thread.
///
/// Descriptors outlive the thread they describe: a worker that exits for
/// migration leaves its descriptor behind so the new version can respawn it.
/// `removed` marks descriptors to drop at the next relaunch instead.
#[derive(Debug, Clone)]
pub struct Descriptor {
	pub id: StackId,
	/// Start routine, by code address.
	pub entry: Addr,
	pub arg: Addr,
	pub removed: bool,
	/// Update point at which the worker quiesced, if it has.
	pub reached_point: Option<String>,
	/// Condition the worker is currently parked on, if any.
	pub(crate) waiting: Option<Arc<Condvar>>,
}

impl Descriptor {
	/// Builds a descriptor for a worker that has not been spawned yet.
	pub fn new(entry: WorkerEntry, arg: Addr) -> Self {
		Self {
			id: StackId::next(),
			entry: Addr(entry as usize),
			arg,
			removed: false,
			reached_point: None,
			waiting: None,
		}
	}

	/// True while the worker sits in an instrumented blocking wait.
	pub fn is_parked(&self) -> bool {
		self.waiting.is_some()
	}
}

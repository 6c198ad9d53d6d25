use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

use crate::LoaderError;

static REQUESTED: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_update_signal(_: i32) {
	// Signal context: only the flag store is allowed here.
	if let Some(flag) = REQUESTED.get() {
		flag.store(true, Ordering::Release);
	}
}

/// Installs the SIGUSR2 handler that requests an update.
///
/// Returns the flag the handler sets; the driver hands it to every runtime it
/// builds, and update points poll it. Idempotent: repeated calls return the
/// same flag.
pub fn install_update_signal() -> Result<Arc<AtomicBool>, LoaderError> {
	let flag = REQUESTED.get_or_init(|| Arc::new(AtomicBool::new(false)));
	let action = SigAction::new(SigHandler::Handler(on_update_signal), SaFlags::SA_RESTART, SigSet::empty());
	unsafe { sigaction(Signal::SIGUSR2, &action) }.map_err(LoaderError::Signal)?;
	tracing::debug!("signal.handler.installed");
	Ok(Arc::clone(flag))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn raising_the_signal_sets_the_flag() {
		let flag = install_update_signal().unwrap();
		assert!(!flag.load(Ordering::Acquire));
		nix::sys::signal::raise(Signal::SIGUSR2).unwrap();
		assert!(flag.load(Ordering::Acquire));
		flag.store(false, Ordering::Release);
	}
}

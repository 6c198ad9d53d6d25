//! Panic-payload filtering for protocol control transfers.
//!
//! The runtime leaves normal control flow in two places: a worker thread
//! exiting for migration, and the main thread handing control back to the
//! driver. Both are implemented as unwinds with a dedicated payload type that
//! the spawn wrapper / driver loop catches. The default panic hook would print
//! a spurious "thread panicked" report for each, so payload types used this
//! way register themselves here and a shared hook stays quiet for them.

use std::any::TypeId;
use std::panic;
use std::sync::{Mutex, Once};

static INSTALL: Once = Once::new();
static QUIET: Mutex<Vec<TypeId>> = Mutex::new(Vec::new());

fn is_quiet(payload: &dyn std::any::Any) -> bool {
	let quiet = QUIET.lock().unwrap_or_else(|e| e.into_inner());
	quiet.contains(&payload.type_id())
}

/// Registers `T` as a control-transfer payload the panic hook ignores.
///
/// Idempotent; the filtering hook is installed on first use and delegates to
/// the previously installed hook for every other payload.
pub fn register_control_payload<T: 'static>() {
	{
		let mut quiet = QUIET.lock().unwrap_or_else(|e| e.into_inner());
		let id = TypeId::of::<T>();
		if !quiet.contains(&id) {
			quiet.push(id);
		}
	}
	INSTALL.call_once(|| {
		let prev = panic::take_hook();
		panic::set_hook(Box::new(move |info| {
			if !is_quiet(info.payload()) {
				prev(info);
			}
		}));
	});
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Marker;

	#[test]
	fn registered_payload_unwinds_silently() {
		register_control_payload::<Marker>();
		let caught = panic::catch_unwind(|| panic::panic_any(Marker));
		let payload = caught.expect_err("must unwind");
		assert!(payload.downcast::<Marker>().is_ok());
	}
}

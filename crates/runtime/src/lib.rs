//! The update coordinator.
//!
//! [`Runtime`] owns the per-version state the protocol needs: the symbol
//! registry, the stack frame store, the worker thread set, the tracked
//! allocation table and the per-update transformation session. The program
//! registers its variables and worker routines against it and calls
//! [`Runtime::update_point`] at chosen safe locations; everything else
//! (quiescence, migration, the jump back to the driver) happens inside that
//! call.
//!
//! An update moves through two runtimes. The old version's runtime detects
//! the request at an update point, quiesces the workers, and hands a
//! [`Handoff`] back to the driver through [`Continuation::transfer`]. The
//! driver loads the next image and builds a new runtime from the handoff with
//! [`Runtime::resume`]; the new version's initialization re-registers its
//! variables (auto-migrating ones pull their old values as they register),
//! and the matching update point releases the relaunched workers and frees
//! every piece of old-version state.

mod bench;
mod handoff;
mod image;
mod runtime;

pub use bench::{Bench, BenchMarks};
pub use handoff::{CarriedState, Continuation, ControlTransfer, Handoff};
pub use image::CodeImage;
pub use runtime::{Hook, Options, ResumeArgs, Runtime, VarTransform};

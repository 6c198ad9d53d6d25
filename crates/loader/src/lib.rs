//! The loader collaborator: dynamic code images and the driver loop.
//!
//! The driver owns the position every update jumps back to. It loads a code
//! image, builds a [`moult_runtime::Runtime`] (cold or resuming), and calls
//! the image's entry point inside `catch_unwind`. When the program takes an
//! update, the coordinator's handoff unwinds back here; the driver discovers
//! the next image (explicit override, else the per-process marker file),
//! loads it, and goes around again. A normal return from the entry point ends
//! the loop.

mod driver;
mod image;
mod signal;

pub use driver::Driver;
pub use image::{DylibImage, DylibSource, IMAGE_ABI, ImageSource, ProgramImage};
pub use signal::install_update_signal;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
	#[error("failed to load image {path}: {source}")]
	Load {
		path: PathBuf,
		source: libloading::Error,
	},
	#[error("image {path} lacks required symbol {name}: {source}")]
	MissingSymbol {
		path: PathBuf,
		name: &'static str,
		source: libloading::Error,
	},
	#[error("image {path} carries ABI {found}, this loader speaks {expected}")]
	AbiMismatch {
		path: PathBuf,
		found: u32,
		expected: u32,
	},
	#[error("no next image: no override and no marker file at {path}")]
	NoNextImage { path: PathBuf },
	#[error("failed to read marker file {path}: {source}")]
	Marker {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("failed to install update signal handler: {0}")]
	Signal(nix::errno::Errno),
}

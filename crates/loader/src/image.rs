use std::os::raw::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::{Library, Symbol};
use moult_primitives::Addr;
use moult_runtime::{CodeImage, Runtime};

use crate::LoaderError;

/// Protocol revision a loadable image must declare (its exported
/// `MOULT_IMAGE_ABI`). Bumped when the entry contract changes.
pub const IMAGE_ABI: u32 = 1;

const ABI_SYMBOL: &str = "MOULT_IMAGE_ABI";
const ENTRY_SYMBOL: &str = "moult_entry";
const PRESTART_SYMBOL: &str = "moult_prestart";

type EntryFn = unsafe extern "C" fn(*const Runtime);

/// A loadable program version: symbol resolution plus the protocol entry
/// points.
pub trait ProgramImage: CodeImage {
	/// Calls the image's entry point. Returns when the program finishes;
	/// updates leave by unwinding.
	fn enter(&self, rt: &Arc<Runtime>);

	/// Runs the image's optional pre-entry migration hook.
	fn prestart(&self, rt: &Arc<Runtime>);
}

/// Turns a path into a loaded image. Seam between the driver loop and
/// `dlopen`, swapped out in tests.
pub trait ImageSource {
	fn load(&self, path: &Path) -> Result<Arc<dyn ProgramImage>, LoaderError>;
}

/// A program version loaded from a shared object.
///
/// The library handle is held for the image's whole life; dropping the last
/// reference unloads the code, which must only happen after migration has
/// finished reading from it.
pub struct DylibImage {
	lib: Library,
	path: PathBuf,
}

impl DylibImage {
	/// Loads the shared object and checks its declared ABI.
	pub fn open(path: &Path) -> Result<Self, LoaderError> {
		let lib = unsafe { Library::new(path) }.map_err(|source| LoaderError::Load {
			path: path.to_owned(),
			source,
		})?;
		let abi: Symbol<'_, *const u32> =
			unsafe { lib.get(ABI_SYMBOL.as_bytes()) }.map_err(|source| LoaderError::MissingSymbol {
				path: path.to_owned(),
				name: ABI_SYMBOL,
				source,
			})?;
		let found = unsafe { **abi };
		if found != IMAGE_ABI {
			return Err(LoaderError::AbiMismatch {
				path: path.to_owned(),
				found,
				expected: IMAGE_ABI,
			});
		}
		drop(abi);
		tracing::info!(path = %path.display(), abi = found, "image.loaded");
		Ok(Self {
			lib,
			path: path.to_owned(),
		})
	}

	fn entry(&self, name: &'static str) -> Result<Symbol<'_, EntryFn>, LoaderError> {
		unsafe { self.lib.get(name.as_bytes()) }.map_err(|source| LoaderError::MissingSymbol {
			path: self.path.clone(),
			name,
			source,
		})
	}
}

impl CodeImage for DylibImage {
	fn resolve(&self, name: &str) -> Option<Addr> {
		let sym: Symbol<'_, *mut c_void> = unsafe { self.lib.get(name.as_bytes()) }.ok()?;
		Some(Addr(*sym as usize))
	}
}

impl ProgramImage for DylibImage {
	fn enter(&self, rt: &Arc<Runtime>) {
		// A missing entry point makes the whole process unviable.
		match self.entry(ENTRY_SYMBOL) {
			Ok(entry) => unsafe { entry(Arc::as_ptr(rt)) },
			Err(err) => moult_primitives::fatal!(%err, "image.entry.missing"),
		}
	}

	fn prestart(&self, rt: &Arc<Runtime>) {
		// The hook is optional; most images carry no pre-entry migration.
		if let Ok(hook) = self.entry(PRESTART_SYMBOL) {
			tracing::debug!(path = %self.path.display(), "image.prestart");
			unsafe { hook(Arc::as_ptr(rt)) };
		}
	}
}

/// The production [`ImageSource`]: `dlopen` via [`DylibImage`].
#[derive(Debug, Default)]
pub struct DylibSource;

impl ImageSource for DylibSource {
	fn load(&self, path: &Path) -> Result<Arc<dyn ProgramImage>, LoaderError> {
		Ok(Arc::new(DylibImage::open(path)?))
	}
}

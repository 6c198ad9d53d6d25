use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use moult_primitives::Addr;
use moult_runtime::{CodeImage, ControlTransfer, Options, ResumeArgs, Runtime};

use crate::LoaderError;
use crate::image::{ImageSource, ProgramImage};

/// Resolve-only view of an image, handed to runtimes.
///
/// Keeps the underlying library alive; the previous version's code is
/// actually unloaded when the coordinator releases this handle at the end of
/// migration and the driver has dropped its own reference.
struct ImageHandle(Arc<dyn ProgramImage>);

impl CodeImage for ImageHandle {
	fn resolve(&self, name: &str) -> Option<Addr> {
		self.0.resolve(name)
	}
}

/// The load/enter/handoff loop.
pub struct Driver<S> {
	source: S,
	update_flag: Arc<AtomicBool>,
	marker_dir: PathBuf,
	bench_path: Option<PathBuf>,
}

impl<S: ImageSource> Driver<S> {
	pub fn new(source: S, update_flag: Arc<AtomicBool>, marker_dir: impl Into<PathBuf>) -> Self {
		Self {
			source,
			update_flag,
			marker_dir: marker_dir.into(),
			bench_path: None,
		}
	}

	/// Enables update-timing output to `path`.
	pub fn with_bench(mut self, path: impl Into<PathBuf>) -> Self {
		self.bench_path = Some(path.into());
		self
	}

	/// Runs the program, swapping in new versions as updates are taken.
	/// Returns when the program's entry point returns normally.
	pub fn run(&self, first: &Path) -> Result<(), LoaderError> {
		let mut next = first.to_owned();
		let mut carried: Option<ResumeArgs> = None;
		loop {
			let image = self.source.load(&next)?;
			let options = Options {
				update_flag: Arc::clone(&self.update_flag),
				bench_path: self.bench_path.clone(),
				current_image: Some(Box::new(ImageHandle(Arc::clone(&image)))),
			};
			let rt = match carried.take() {
				None => Runtime::cold_start(options),
				Some(args) => Runtime::resume(args, options),
			};
			if rt.has_updated() {
				image.prestart(&rt);
			}
			match panic::catch_unwind(AssertUnwindSafe(|| image.enter(&rt))) {
				Ok(()) => {
					tracing::info!("driver.program.finished");
					return Ok(());
				}
				Err(payload) => match payload.downcast::<ControlTransfer>() {
					Ok(transfer) => {
						let handoff = transfer.0;
						next = match handoff.next_path {
							Some(path) => path,
							None => self.consume_marker()?,
						};
						tracing::info!(point = %handoff.point, next = %next.display(), "driver.swapping");
						carried = Some(ResumeArgs {
							point: handoff.point,
							state: handoff.state,
							previous: Some(Box::new(ImageHandle(image))),
						});
					}
					Err(other) => panic::resume_unwind(other),
				},
			}
		}
	}

	/// Reads and deletes this process's marker file, yielding the next image
	/// path the operator placed there.
	fn consume_marker(&self) -> Result<PathBuf, LoaderError> {
		let path = self.marker_dir.join(format!("{}.upd", std::process::id()));
		let contents = std::fs::read_to_string(&path).map_err(|source| {
			if source.kind() == io::ErrorKind::NotFound {
				LoaderError::NoNextImage { path: path.clone() }
			} else {
				LoaderError::Marker {
					path: path.clone(),
					source,
				}
			}
		})?;
		std::fs::remove_file(&path).map_err(|source| LoaderError::Marker {
			path: path.clone(),
			source,
		})?;
		Ok(PathBuf::from(contents.trim()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU64, Ordering};

	use moult_primitives::Qualifiers;

	struct FakeImage {
		entry: fn(&Arc<Runtime>),
	}

	impl CodeImage for FakeImage {
		fn resolve(&self, _: &str) -> Option<Addr> {
			None
		}
	}

	impl ProgramImage for FakeImage {
		fn enter(&self, rt: &Arc<Runtime>) {
			(self.entry)(rt);
		}

		fn prestart(&self, _: &Arc<Runtime>) {}
	}

	struct FakeSource;

	impl ImageSource for FakeSource {
		fn load(&self, path: &Path) -> Result<Arc<dyn ProgramImage>, LoaderError> {
			match path.to_str() {
				Some("v1") => Ok(Arc::new(FakeImage { entry: v1_entry })),
				Some("v2") => Ok(Arc::new(FakeImage { entry: v2_entry })),
				_ => Err(LoaderError::NoNextImage { path: path.to_owned() }),
			}
		}
	}

	static COUNTER_V1: AtomicU64 = AtomicU64::new(0);
	static COUNTER_V2: AtomicU64 = AtomicU64::new(0);
	static FINAL: AtomicU64 = AtomicU64::new(0);

	fn v1_entry(rt: &Arc<Runtime>) {
		COUNTER_V1.store(100, Ordering::SeqCst);
		rt.register_var(Qualifiers::global("counter"), Addr::of_ref(&COUNTER_V1), 8, true);
		rt.set_next_version("v2");
		rt.request_update();
		rt.update_point("main");
		unreachable!("the taken update point never returns");
	}

	fn v2_entry(rt: &Arc<Runtime>) {
		rt.register_var(Qualifiers::global("counter"), Addr::of_ref(&COUNTER_V2), 8, true);
		rt.update_point("main");
		FINAL.store(COUNTER_V2.load(Ordering::SeqCst), Ordering::SeqCst);
	}

	#[test]
	fn driver_swaps_versions_and_finishes() {
		let driver = Driver::new(FakeSource, Arc::new(AtomicBool::new(false)), std::env::temp_dir());
		driver.run(Path::new("v1")).unwrap();
		assert_eq!(FINAL.load(Ordering::SeqCst), 100, "value carried across the swap");
	}

	#[test]
	fn marker_file_is_consumed() {
		let dir = tempfile::tempdir().unwrap();
		let driver = Driver::new(FakeSource, Arc::new(AtomicBool::new(false)), dir.path());

		let missing = driver.consume_marker();
		assert!(matches!(missing, Err(LoaderError::NoNextImage { .. })));

		let marker = dir.path().join(format!("{}.upd", std::process::id()));
		std::fs::write(&marker, " /lib/next.so \n").unwrap();
		assert_eq!(driver.consume_marker().unwrap(), PathBuf::from("/lib/next.so"));
		assert!(!marker.exists());
	}
}

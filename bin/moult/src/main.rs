//! Moult launcher binary.
//!
//! Loads a versioned program image as a shared library, runs it under the
//! update runtime, and swaps in replacement images when an update is
//! signalled. The running process never restarts; only the image changes.

use std::path::PathBuf;

use clap::Parser;
use moult_loader::{Driver, DylibSource, install_update_signal};
use tracing::info;

/// Launcher command line arguments.
#[derive(Parser, Debug)]
#[command(name = "moult")]
#[command(about = "Run a program image with in-place live updates")]
struct Args {
	/// First program image to load (.so)
	image: PathBuf,

	/// Directory watched for this process's update marker file
	#[arg(short, long, value_name = "DIR")]
	marker_dir: Option<PathBuf>,

	/// Append update timing lines to this file
	#[arg(short, long, value_name = "PATH")]
	bench: Option<PathBuf>,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	setup_tracing(args.verbose);

	let marker_dir = args.marker_dir.unwrap_or_else(std::env::temp_dir);
	info!(
		image = %args.image.display(),
		marker_dir = %marker_dir.display(),
		pid = std::process::id(),
		"starting moult"
	);

	let update_flag = install_update_signal()?;

	let mut driver = Driver::new(DylibSource, update_flag, marker_dir);
	if let Some(bench) = args.bench {
		driver = driver.with_bench(bench);
	}
	driver.run(&args.image)?;

	info!("program finished");
	Ok(())
}

/// Opens the per-process log file and installs the subscriber.
///
/// Logs land in `MOULT_LOG_DIR` when set, otherwise the system temp
/// directory. The updated program owns stdout and stderr, so if the file
/// cannot be opened logging stays disabled rather than falling back to a
/// stream the program may be using.
fn setup_tracing(verbose: bool) {
	use std::fs::OpenOptions;

	use tracing_subscriber::EnvFilter;
	use tracing_subscriber::prelude::*;

	let log_dir = log_dir();
	if std::fs::create_dir_all(&log_dir).is_err() {
		return;
	}
	let log_path = log_dir.join(format!("moult.{}.log", std::process::id()));
	let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) else {
		return;
	};

	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
		if verbose {
			EnvFilter::new("moult=trace,debug")
		} else {
			EnvFilter::new("moult=debug,info")
		}
	});

	let file_layer = tracing_subscriber::fmt::layer()
		.with_writer(file)
		.with_ansi(false)
		.with_target(true);

	tracing_subscriber::registry()
		.with(filter)
		.with(file_layer)
		.init();

	tracing::info!(path = ?log_path, "tracing initialized");
}

/// Where log files go: `MOULT_LOG_DIR` when set, the system temp directory
/// otherwise.
fn log_dir() -> PathBuf {
	std::env::var_os("MOULT_LOG_DIR")
		.map(PathBuf::from)
		.unwrap_or_else(std::env::temp_dir)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn log_dir_defaults_to_the_system_temp_dir() {
		// Sole test in this binary, so the env var is ours to toggle.
		unsafe { std::env::remove_var("MOULT_LOG_DIR") };
		assert_eq!(log_dir(), std::env::temp_dir());

		unsafe { std::env::set_var("MOULT_LOG_DIR", "/tmp/moult-logs") };
		assert_eq!(log_dir(), PathBuf::from("/tmp/moult-logs"));
		unsafe { std::env::remove_var("MOULT_LOG_DIR") };
	}
}

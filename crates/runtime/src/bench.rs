use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

/// Timestamps taken on the old side of an update, carried across the swap so
/// the new side can report end-to-end durations.
#[derive(Debug, Clone, Copy)]
pub struct BenchMarks {
	requested_at: Instant,
	quiesced_at: Instant,
}

impl BenchMarks {
	/// Taken when an update point accepts a pending request.
	pub fn begin() -> Self {
		let now = Instant::now();
		Self {
			requested_at: now,
			quiesced_at: now,
		}
	}

	/// Taken when the quiescence barrier closes.
	pub fn mark_quiesced(&mut self) {
		self.quiesced_at = Instant::now();
	}
}

/// Optional update-timing output.
///
/// Disabled entirely when no results path is configured; a write failure is
/// logged and skipped, never fatal.
#[derive(Debug, Default)]
pub struct Bench {
	path: Option<PathBuf>,
}

impl Bench {
	pub fn new(path: Option<PathBuf>) -> Self {
		Self { path }
	}

	/// Appends one result line for a completed update.
	pub fn record(&self, point: &str, marks: &BenchMarks) {
		let quiesce_ms = marks.quiesced_at.duration_since(marks.requested_at).as_millis();
		let total_ms = marks.requested_at.elapsed().as_millis();
		tracing::info!(point, quiesce_ms = quiesce_ms as u64, total_ms = total_ms as u64, "update.timing");
		let Some(path) = &self.path else {
			return;
		};
		let line = format!("point={point} quiesce_ms={quiesce_ms} total_ms={total_ms}\n");
		let written = OpenOptions::new()
			.create(true)
			.append(true)
			.open(path)
			.and_then(|mut f| f.write_all(line.as_bytes()));
		if let Err(err) = written {
			tracing::warn!(path = %path.display(), %err, "bench.write.failed");
		}
	}
}

//! Logging prelude and run-log file management
//!
//! Re-exports the tracing macros for convenient access across the codebase
//! and provides the append-only run log under `~/.cccopy/log/`. Log files are
//! named after the start timestamp, rotate after `MAX_LOG_LINES` lines, and
//! the directory is pruned to at most `MAX_LOG_FILES` files, oldest first.

pub use tracing::{debug, error, info, trace, warn};

use chrono::Local;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

/// Rotate the run log after this many lines
pub const MAX_LOG_LINES: usize = 10_000;

/// Keep at most this many run-log files
pub const MAX_LOG_FILES: usize = 10;

struct RunLogInner {
	dir: PathBuf,
	file: Option<fs::File>,
	lines: usize,
}

/// Line-counting writer for the append-only run log
#[derive(Clone)]
pub struct RunLogWriter {
	inner: Arc<Mutex<RunLogInner>>,
}

impl RunLogWriter {
	pub fn new(dir: PathBuf) -> Self {
		RunLogWriter { inner: Arc::new(Mutex::new(RunLogInner { dir, file: None, lines: 0 })) }
	}
}

impl RunLogInner {
	fn open_new(&mut self) -> io::Result<()> {
		fs::create_dir_all(&self.dir)?;
		let name = format!("{}.log", Local::now().format("%Y%m%d%H%M%S"));
		let path = self.dir.join(name);
		let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
		self.file = Some(file);
		self.lines = 0;
		self.prune();
		Ok(())
	}

	/// Remove the oldest run logs until at most MAX_LOG_FILES remain.
	/// Timestamped names sort chronologically, so a name sort suffices.
	fn prune(&self) {
		let mut logs: Vec<PathBuf> = match fs::read_dir(&self.dir) {
			Ok(entries) => entries
				.filter_map(|e| e.ok())
				.map(|e| e.path())
				.filter(|p| p.extension().map(|x| x == "log").unwrap_or(false))
				.collect(),
			Err(_) => return,
		};
		logs.sort();
		while logs.len() > MAX_LOG_FILES {
			let oldest = logs.remove(0);
			let _ = fs::remove_file(oldest);
		}
	}
}

impl Write for RunLogWriter {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		let mut inner = self.inner.lock().map_err(|_| io::Error::other("run log poisoned"))?;
		if inner.file.is_none() || inner.lines >= MAX_LOG_LINES {
			inner.open_new()?;
		}
		inner.lines += buf.iter().filter(|&&b| b == b'\n').count();
		match inner.file.as_mut() {
			Some(file) => file.write(buf),
			None => Ok(buf.len()),
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		let mut inner = self.inner.lock().map_err(|_| io::Error::other("run log poisoned"))?;
		match inner.file.as_mut() {
			Some(file) => file.flush(),
			None => Ok(()),
		}
	}
}

impl<'a> MakeWriter<'a> for RunLogWriter {
	type Writer = RunLogWriter;

	fn make_writer(&'a self) -> Self::Writer {
		self.clone()
	}
}

/// Initialize the tracing subscriber with environment filter support.
///
/// By default, logs at INFO level and above are displayed. Control the log
/// level with the `RUST_LOG` environment variable:
///
/// ```bash
/// RUST_LOG=debug cccopy download
/// RUST_LOG=cccopy::engine=trace cccopy upload
/// ```
///
/// When `log_dir` is given, events are additionally appended to the rotating
/// run log in that directory.
pub fn init_tracing(log_dir: Option<&Path>) {
	use tracing_subscriber::layer::SubscriberExt;
	use tracing_subscriber::util::SubscriberInitExt;

	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
	let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

	match log_dir {
		Some(dir) => {
			let file_layer = tracing_subscriber::fmt::layer()
				.with_ansi(false)
				.with_target(false)
				.with_writer(RunLogWriter::new(dir.to_path_buf()));
			tracing_subscriber::registry().with(filter).with(stderr_layer).with(file_layer).init();
		}
		None => {
			tracing_subscriber::registry().with(filter).with(stderr_layer).init();
		}
	}
}


// vim: ts=4

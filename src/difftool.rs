//! External diff-tool launcher
//!
//! Conflict mediation delegates the actual merge to an external tool. The
//! tool is discovered from `CCCOPY_VSCODE_PATH`, then `code` on PATH, with
//! `gvimdiff` as the fallback. Output is always captured so an active UI
//! never gets corrupted by tool chatter.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::logging::debug;
use crate::ui::{Level, UiHandler};

/// Locate the diff tool binary, if any
pub fn find_diff_tool() -> Option<PathBuf> {
	if let Ok(path) = env::var("CCCOPY_VSCODE_PATH") {
		let path = crate::util::expand_path(&path);
		if path.is_file() {
			return Some(path);
		}
	}
	find_in_path("code")
}

fn find_in_path(name: &str) -> Option<PathBuf> {
	let path_var = env::var_os("PATH")?;
	env::split_paths(&path_var).map(|dir| dir.join(name)).find(|candidate| candidate.is_file())
}

/// Launch the diff tool against `(left, right)` and wait for it to exit.
///
/// Returns true when a tool ran to completion. No resolution is inferred
/// from the tool's exit; the caller re-asks its menu afterwards.
pub async fn run_diff(
	left: &Path,
	right: &Path,
	description: &str,
	ui: &dyn UiHandler,
) -> bool {
	if let Some(tool) = find_diff_tool() {
		ui.display(Level::Info, &format!("Opening {} in diff tool...", description));
		let status = Command::new(&tool)
			.args(["--no-sandbox", "--new-window", "--wait", "--diff"])
			.arg(left)
			.arg(right)
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.status()
			.await;
		match status {
			Ok(status) if status.success() => {
				ui.display(Level::Info, "Diff tool closed.");
				return true;
			}
			Ok(status) => {
				debug!("diff tool exited with {:?}", status.code());
			}
			Err(e) => {
				ui.display(Level::Error, &format!("Failed to run {}: {}", tool.display(), e));
			}
		}
	}

	// Fallback viewer
	ui.display(Level::Info, "Falling back to gvimdiff...");
	let status = Command::new("gvimdiff")
		.arg(left)
		.arg(right)
		.stdout(Stdio::null())
		.stderr(Stdio::null())
		.status()
		.await;
	match status {
		Ok(status) if status.success() => true,
		_ => {
			ui.display(
				Level::Error,
				"No diff tool available. Set CCCOPY_VSCODE_PATH or install `code`/`gvimdiff`.",
			);
			false
		}
	}
}


// vim: ts=4

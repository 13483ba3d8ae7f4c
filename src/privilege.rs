//! Privilege escalation for Production writes
//!
//! Every privileged step is a child-process invocation under the configured
//! POSIX group (`sg <group> -c <command>`); the calling process's own
//! credentials are never modified. When no group is configured, or the group
//! does not exist for the invoking user, commands run with the caller's
//! current credentials instead.

use std::env;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::error::{CcError, PrivilegeError};
use crate::logging::{debug, warn};
use crate::ui::{Level, UiHandler};
use crate::util;

/// Marker set after the process re-executed itself under the required group
pub const REEXEC_ENV: &str = "CCCOPY_REEXEC_DONE";

/// Runs shell commands under a named POSIX group without changing the
/// credentials of the parent process
pub struct GroupPrivilege {
	group: Option<String>,
	gid: Option<u32>,
	ui: Arc<dyn UiHandler>,
}

impl GroupPrivilege {
	pub fn new(group: Option<&str>, ui: Arc<dyn UiHandler>) -> Self {
		let gid = group.and_then(util::group_gid);
		match (group, gid) {
			(Some(name), Some(gid)) => {
				debug!("group verified: {} (gid={})", name, gid);
			}
			(Some(name), None) => {
				ui.display(
					Level::Error,
					&format!("Group '{}' does not exist for the invoking user", name),
				);
			}
			(None, _) => {}
		}
		GroupPrivilege { group: group.map(String::from), gid, ui }
	}

	/// The configured group name, if any
	pub fn group(&self) -> Option<&str> {
		self.group.as_deref()
	}

	/// True when commands will actually run under the group
	pub fn escalates(&self) -> bool {
		self.group.is_some() && self.gid.is_some()
	}

	/// Run a shell command, escalated when a group is configured.
	///
	/// Returns captured stdout on success. When `check` is true a non-zero
	/// exit becomes a `PrivilegeError` carrying the command, stderr and exit
	/// status. One audit line is emitted per attempt.
	pub async fn run(
		&self,
		command: &str,
		timeout: Duration,
		check: bool,
		desc: &str,
	) -> Result<String, PrivilegeError> {
		let mut cmd = if self.escalates() {
			let cmd_preview: String = command.chars().take(150).collect();
			debug!("[sg] escalated run: {}", cmd_preview);
			let mut c = Command::new("sg");
			c.arg(self.group.as_deref().unwrap_or_default()).arg("-c").arg(command);
			c
		} else {
			debug!("no escalation needed (group unset), running with caller credentials");
			let mut c = Command::new("sh");
			c.arg("-c").arg(command);
			c
		};
		cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);

		let started = Instant::now();
		let output = match tokio::time::timeout(timeout, cmd.output()).await {
			Err(_) => {
				self.audit(desc, false, started);
				return Err(PrivilegeError::Timeout {
					operation: desc.to_string(),
					secs: timeout.as_secs(),
				});
			}
			Ok(Err(e)) => {
				self.audit(desc, false, started);
				return Err(PrivilegeError::Spawn { command: command.to_string(), source: e });
			}
			Ok(Ok(output)) => output,
		};

		let stdout = String::from_utf8_lossy(&output.stdout).to_string();
		let stderr = String::from_utf8_lossy(&output.stderr).to_string();

		if check && !output.status.success() {
			self.audit(desc, false, started);
			return Err(PrivilegeError::CommandFailed {
				operation: desc.to_string(),
				command: command.to_string(),
				status: output.status.code(),
				stderr,
			});
		}

		if !stderr.trim().is_empty() {
			warn!("stderr: {}", stderr.trim());
		}
		self.audit(desc, true, started);
		Ok(stdout)
	}

	fn audit(&self, desc: &str, success: bool, started: Instant) {
		if desc.is_empty() {
			return;
		}
		let outcome = if success { "ok" } else { "FAILED" };
		self.ui.display(
			Level::High,
			&format!("[sg] {}: {} ({:.3}s)", desc, outcome, started.elapsed().as_secs_f64()),
		);
	}
}

/// Re-execute the process under the required group when the effective group
/// differs.
///
/// Returns `Ok(None)` when execution should simply continue (already under
/// the group, group unknown, or the re-exec marker is set), or
/// `Ok(Some(code))` when a re-executed child ran to completion and the
/// caller must exit with that code.
pub fn maybe_reexec_under_group(group: &str) -> Result<Option<i32>, CcError> {
	if env::var(REEXEC_ENV).is_ok() {
		return Ok(None);
	}
	let gid = match util::group_gid(group) {
		Some(gid) => gid,
		// Unknown group: continue and let the escalator degrade per call
		None => return Ok(None),
	};
	if util::effective_gid() == gid {
		return Ok(None);
	}

	let exe = env::current_exe()?;
	let mut cmdline = util::sh_quote(&exe.to_string_lossy());
	for arg in env::args().skip(1) {
		cmdline.push(' ');
		cmdline.push_str(&util::sh_quote(&arg));
	}

	debug!("re-executing under group {}: {}", group, cmdline);
	let status = std::process::Command::new("sg")
		.arg(group)
		.arg("-c")
		.arg(&cmdline)
		.env(REEXEC_ENV, "1")
		.status()
		.map_err(|e| {
			CcError::Privilege(PrivilegeError::Spawn { command: cmdline.clone(), source: e })
		})?;
	Ok(Some(status.code().unwrap_or(1)))
}


// vim: ts=4

//! Utility functions for CCCopy
//!
//! This module contains helper functions including safe wrappers around
//! system calls that require unsafe blocks.

use std::env;
use std::path::PathBuf;

/// Get the effective user ID of the current process
#[allow(unsafe_code)] // Safe wrapper around system call
pub fn effective_uid() -> u32 {
	#[cfg(unix)]
	{
		// SAFETY: geteuid() is always safe to call - it just returns a value
		// from the process credentials without any side effects.
		unsafe { libc::geteuid() }
	}

	#[cfg(not(unix))]
	{
		1000
	}
}

/// Get the effective group ID of the current process
#[allow(unsafe_code)] // Safe wrapper around system call
pub fn effective_gid() -> u32 {
	#[cfg(unix)]
	{
		// SAFETY: getegid() is always safe to call - it just returns a value
		// from the process credentials without any side effects.
		unsafe { libc::getegid() }
	}

	#[cfg(not(unix))]
	{
		1000
	}
}

/// Look up a POSIX group by name and return its gid, or None if the group
/// does not exist for the invoking user.
#[allow(unsafe_code)] // Safe wrapper around getgrnam_r
pub fn group_gid(name: &str) -> Option<u32> {
	#[cfg(unix)]
	{
		use std::ffi::CString;

		let c_name = CString::new(name).ok()?;
		let mut grp: libc::group = unsafe { std::mem::zeroed() };
		let mut buf = vec![0i8; 4096];
		let mut result: *mut libc::group = std::ptr::null_mut();

		// SAFETY: all pointers are valid for the duration of the call and the
		// buffer outlives the returned group record, which we only read a
		// plain integer field from.
		let rc = unsafe {
			libc::getgrnam_r(
				c_name.as_ptr(),
				&mut grp,
				buf.as_mut_ptr() as *mut libc::c_char,
				buf.len(),
				&mut result,
			)
		};

		if rc == 0 && !result.is_null() {
			Some(grp.gr_gid)
		} else {
			None
		}
	}

	#[cfg(not(unix))]
	{
		let _ = name;
		None
	}
}

/// Name of the invoking user
///
/// Falls back to a uid-derived name when neither USER nor LOGNAME is set
/// (daemon contexts, stripped-down cron environments).
pub fn current_user() -> String {
	env::var("USER")
		.or_else(|_| env::var("LOGNAME"))
		.unwrap_or_else(|_| format!("uid{}", effective_uid()))
}

/// Hostname of this machine
pub fn hostname() -> String {
	sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}

/// Home directory of the invoking user
pub fn home_dir() -> PathBuf {
	env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."))
}

/// Per-user CCCopy state root (~/.cccopy)
pub fn cccopy_dir() -> PathBuf {
	home_dir().join(".cccopy")
}

/// Expand `~` and `$VAR` / `${VAR}` references in a path string
pub fn expand_path(path: &str) -> PathBuf {
	let mut s = path.to_string();

	if s == "~" {
		return home_dir();
	}
	if let Some(rest) = s.strip_prefix("~/") {
		s = format!("{}/{}", home_dir().display(), rest);
	}

	// Environment variable expansion; unknown variables expand to empty,
	// matching shell behaviour.
	let mut out = String::with_capacity(s.len());
	let mut chars = s.chars().peekable();
	while let Some(ch) = chars.next() {
		if ch != '$' {
			out.push(ch);
			continue;
		}
		let name: String = if chars.peek() == Some(&'{') {
			chars.next();
			let mut n = String::new();
			for c in chars.by_ref() {
				if c == '}' {
					break;
				}
				n.push(c);
			}
			n
		} else {
			let mut n = String::new();
			while let Some(&c) = chars.peek() {
				if c.is_ascii_alphanumeric() || c == '_' {
					n.push(c);
					chars.next();
				} else {
					break;
				}
			}
			n
		};
		if name.is_empty() {
			out.push('$');
		} else if let Ok(value) = env::var(&name) {
			out.push_str(&value);
		}
	}

	PathBuf::from(out)
}

/// Quote a string for safe inclusion in a POSIX shell command line
///
/// Simple arguments (alphanumerics, `.`/`/`/`-`/`_`) pass through unquoted so
/// escalated command lines stay readable in the audit log.
pub fn sh_quote(s: &str) -> String {
	if !s.is_empty()
		&& s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '/' | '-' | '_' | '+'))
	{
		return s.to_string();
	}
	format!("'{}'", s.replace('\'', "'\\''"))
}

/// Sanitize a string for use inside a filename
pub fn sanitize_filename(s: &str) -> String {
	s.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' }).collect()
}


// vim: ts=4

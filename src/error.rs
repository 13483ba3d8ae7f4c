//! Error types for CCCopy operations

use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Main error type for CCCopy operations
///
/// Leaf components raise the nested domain errors; the synchronization
/// engine and the CLI driver only ever see `CcError`.
#[derive(Debug)]
pub enum CcError {
	/// Configuration error (nested) - fatal at startup
	Config(ConfigError),

	/// Lock error (nested)
	Lock(LockError),

	/// Privilege escalation error (nested)
	Privilege(PrivilegeError),

	/// VCS subprocess error (nested)
	Vcs(VcsError),

	/// Pattern compilation error (nested)
	Pattern(PatternError),

	/// I/O error with the path it happened on
	Io { path: Option<PathBuf>, source: io::Error },

	/// Operation aborted by user
	Aborted,

	/// Generic error message
	Other { message: String },
}

impl CcError {
	/// Wrap an I/O error together with the path it happened on
	pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
		CcError::Io { path: Some(path.into()), source }
	}
}

impl fmt::Display for CcError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			CcError::Config(e) => write!(f, "Configuration error: {}", e),
			CcError::Lock(e) => write!(f, "Lock error: {}", e),
			CcError::Privilege(e) => write!(f, "Privilege error: {}", e),
			CcError::Vcs(e) => write!(f, "VCS error: {}", e),
			CcError::Pattern(e) => write!(f, "Pattern error: {}", e),
			CcError::Io { path: Some(path), source } => {
				write!(f, "I/O error on {}: {}", path.display(), source)
			}
			CcError::Io { path: None, source } => write!(f, "I/O error: {}", source),
			CcError::Aborted => write!(f, "Operation aborted by user"),
			CcError::Other { message } => write!(f, "{}", message),
		}
	}
}

impl Error for CcError {}

impl From<io::Error> for CcError {
	fn from(e: io::Error) -> Self {
		CcError::Io { path: None, source: e }
	}
}

impl From<String> for CcError {
	fn from(e: String) -> Self {
		CcError::Other { message: e }
	}
}

impl From<ConfigError> for CcError {
	fn from(e: ConfigError) -> Self {
		CcError::Config(e)
	}
}

impl From<LockError> for CcError {
	fn from(e: LockError) -> Self {
		CcError::Lock(e)
	}
}

impl From<PrivilegeError> for CcError {
	fn from(e: PrivilegeError) -> Self {
		CcError::Privilege(e)
	}
}

impl From<VcsError> for CcError {
	fn from(e: VcsError) -> Self {
		CcError::Vcs(e)
	}
}

impl From<PatternError> for CcError {
	fn from(e: PatternError) -> Self {
		CcError::Pattern(e)
	}
}

/// Configuration errors - these abort startup with exit code 1
#[derive(Debug)]
pub enum ConfigError {
	/// Template directory does not exist
	TemplateDirMissing { path: PathBuf },

	/// Two templates carry the same PROJECT_NAME
	DuplicateProject { name: String },

	/// An INI file could not be parsed
	Malformed { path: PathBuf, message: String },

	/// Named project is not registered
	UnknownProject { name: String },

	/// A resolved value violates a project invariant
	Invalid { message: String },
}

impl fmt::Display for ConfigError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConfigError::TemplateDirMissing { path } => {
				write!(f, "Template directory does not exist: {}", path.display())
			}
			ConfigError::DuplicateProject { name } => {
				write!(f, "Duplicate PROJECT_NAME across templates: {}", name)
			}
			ConfigError::Malformed { path, message } => {
				write!(f, "Malformed config file {}: {}", path.display(), message)
			}
			ConfigError::UnknownProject { name } => write!(f, "Unknown project: {}", name),
			ConfigError::Invalid { message } => write!(f, "Invalid configuration: {}", message),
		}
	}
}

impl Error for ConfigError {}

/// Lock acquisition and release errors
#[derive(Debug)]
pub enum LockError {
	/// Could not acquire the lock within the budget
	Timeout { lock_dir: PathBuf, owner: String },

	/// Lock bookkeeping I/O failed
	Io { path: PathBuf, source: io::Error },
}

impl fmt::Display for LockError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			LockError::Timeout { lock_dir, owner } => write!(
				f,
				"Lock acquisition timeout (held by {}). Manual break: rm -rf {}",
				owner,
				lock_dir.display()
			),
			LockError::Io { path, source } => {
				write!(f, "Lock I/O failed on {}: {}", path.display(), source)
			}
		}
	}
}

impl Error for LockError {}

/// Privilege escalation errors
#[derive(Debug)]
pub enum PrivilegeError {
	/// Escalated command returned non-zero
	CommandFailed { operation: String, command: String, status: Option<i32>, stderr: String },

	/// Escalated command exceeded its per-call deadline
	Timeout { operation: String, secs: u64 },

	/// Could not spawn the escalation helper at all
	Spawn { command: String, source: io::Error },
}

impl fmt::Display for PrivilegeError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			PrivilegeError::CommandFailed { operation, command, status, stderr } => write!(
				f,
				"{} failed (exit={}): command `{}`: {}",
				operation,
				status.map(|s| s.to_string()).unwrap_or_else(|| "signal".to_string()),
				command,
				stderr.trim()
			),
			PrivilegeError::Timeout { operation, secs } => {
				write!(f, "{} timed out after {}s", operation, secs)
			}
			PrivilegeError::Spawn { command, source } => {
				write!(f, "Failed to spawn `{}`: {}", command, source)
			}
		}
	}
}

impl Error for PrivilegeError {}

/// VCS subprocess errors
#[derive(Debug)]
pub enum VcsError {
	/// The VCS binary returned non-zero
	CommandFailed { args: String, stderr: String },

	/// The VCS binary could not be spawned
	Spawn { source: io::Error },

	/// The VCS output could not be parsed
	Parse { message: String },
}

impl fmt::Display for VcsError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			VcsError::CommandFailed { args, stderr } => {
				write!(f, "git {} failed: {}", args, stderr.trim())
			}
			VcsError::Spawn { source } => write!(f, "Failed to spawn git: {}", source),
			VcsError::Parse { message } => write!(f, "Failed to parse git output: {}", message),
		}
	}
}

impl Error for VcsError {}

impl From<io::Error> for VcsError {
	fn from(e: io::Error) -> Self {
		VcsError::Spawn { source: e }
	}
}

/// Pattern compilation errors
#[derive(Debug)]
pub enum PatternError {
	/// A SOURCES/EXCLUDES glob did not compile
	Invalid { pattern: String, message: String },
}

impl fmt::Display for PatternError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			PatternError::Invalid { pattern, message } => {
				write!(f, "Invalid pattern '{}': {}", pattern, message)
			}
		}
	}
}

impl Error for PatternError {}


// vim: ts=4

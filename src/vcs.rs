//! VCS adapter wrapping the external git binary
//!
//! All repository access in the core goes through the `Vcs` trait. Reads run
//! directly with captured output; writes against Production are routed
//! through the privilege escalator by passing a `GroupPrivilege` handle.
//! The adapter detects the git version once and skips `safe.directory`
//! registration on versions that predate it.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::error::{CcError, VcsError};
use crate::logging::{debug, warn};
use crate::privilege::GroupPrivilege;
use crate::util::sh_quote;

/// Synthetic identity used for commits into Production
pub const DUMMY_USER: &str = "cccopy_admin";
pub const DUMMY_EMAIL: &str = "admin@cccopy.com";

/// Mail domain appended to real user names for Work commits and authorship
pub const USER_MAIL_DOMAIN: &str = "cccopy.com";

/// git versions from here on support `safe.directory`
const SAFE_DIRECTORY_MIN: GitVersion = GitVersion { major: 2, minor: 35, patch: 2 };

/// Per-call deadline for escalated metadata operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// Staging whole trees over NFS can be slow; give `add` a generous budget
const ADD_TIMEOUT: Duration = Duration::from_secs(3600);

/// Content hash the VCS assigns to a file version
///
/// The blob id is the sole equality test between two file versions. Files
/// never on disk are the distinct `Missing` sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobId {
	Missing,
	Id(String),
}

impl BlobId {
	pub fn is_missing(&self) -> bool {
		matches!(self, BlobId::Missing)
	}
}

/// Detected version of the external git binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GitVersion {
	pub major: u32,
	pub minor: u32,
	pub patch: u32,
}

impl GitVersion {
	/// Parse the output of `git --version` ("git version 2.39.5")
	pub fn parse(line: &str) -> Option<GitVersion> {
		let numbers = line.split_whitespace().find(|w| w.chars().next().is_some_and(|c| c.is_ascii_digit()))?;
		let mut parts = numbers.split('.');
		let major = parts.next()?.parse().ok()?;
		let minor = parts.next()?.parse().ok()?;
		let patch = parts.next().and_then(|p| {
			let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
			digits.parse().ok()
		});
		Some(GitVersion { major, minor, patch: patch.unwrap_or(0) })
	}

	pub fn supports_safe_directory(&self) -> bool {
		*self >= SAFE_DIRECTORY_MIN
	}
}

/// One row of `log --pretty=format:%h|%an|%ad|%s --date=iso`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
	pub seq: usize,
	pub short_id: String,
	pub author: String,
	pub date: String,
	pub subject: String,
}

/// Kind of change a commit applied to a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
	Added,
	Modified,
	Deleted,
	Renamed,
	Copied,
}

impl ChangeKind {
	pub fn from_code(code: char) -> Option<ChangeKind> {
		match code {
			'A' => Some(ChangeKind::Added),
			'M' => Some(ChangeKind::Modified),
			'D' => Some(ChangeKind::Deleted),
			'R' => Some(ChangeKind::Renamed),
			'C' => Some(ChangeKind::Copied),
			_ => None,
		}
	}

	pub fn label(&self) -> &'static str {
		match self {
			ChangeKind::Added => "Added",
			ChangeKind::Modified => "Modified",
			ChangeKind::Deleted => "Deleted",
			ChangeKind::Renamed => "Renamed",
			ChangeKind::Copied => "Copied",
		}
	}
}

/// A file touched by a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitFile {
	pub kind: ChangeKind,
	pub path: String,
}

/// One row of `status --short`: two-character XY code plus path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
	pub code: String,
	pub path: String,
}

/// Render a status entry as a human-readable line for UI and log output
pub fn format_status_line(entry: &StatusEntry) -> String {
	let label = match entry.code.as_str() {
		"??" => "[new]",
		"M " | " M" | "MM" => "[modified]",
		"A " => "[added]",
		"D " | " D" => "[deleted]",
		"R " => "[renamed]",
		"C " => "[copied]",
		"AM" => "[added+modified]",
		"AD" => "[added+deleted]",
		other => return format!("[{}] {}", other, entry.path),
	};
	format!("{} {}", label, entry.path)
}

/// Parse one `status --short` line ("XY path", rename as "XY old -> new")
pub fn parse_status_line(line: &str) -> Option<StatusEntry> {
	if line.len() < 3 {
		return None;
	}
	let code = line[..2].to_string();
	let rest = line[3..].trim();
	if rest.is_empty() {
		return None;
	}
	let path = match rest.split_once(" -> ") {
		Some((_, new)) => new,
		None => rest,
	};
	Some(StatusEntry { code, path: path.to_string() })
}

/// Parse one pretty-format log line, stripping the timezone suffix from the
/// ISO date (git 1.8 compatible `--date=iso` output)
pub fn parse_log_line(seq: usize, line: &str) -> Option<LogEntry> {
	let mut parts = line.splitn(4, '|');
	let short_id = parts.next()?.to_string();
	let author = parts.next()?.to_string();
	let raw_date = parts.next()?;
	let subject = parts.next()?.to_string();
	let date = match raw_date.rsplit_once(' ') {
		Some((datetime, tz)) if tz.starts_with('+') || tz.starts_with('-') => datetime.to_string(),
		_ => raw_date.to_string(),
	};
	Some(LogEntry { seq, short_id, author, date, subject })
}

/// Operations the core consumes from the external version-control tool
#[async_trait]
pub trait Vcs: Send + Sync {
	/// Does `dir` contain a repository?
	async fn is_repo(&self, dir: &Path) -> bool;

	/// Initialize a repository
	async fn init(&self, dir: &Path, privilege: Option<&GroupPrivilege>) -> Result<(), CcError>;

	/// Set the local identity: the synthetic service identity for Production
	/// (`use_dummy`), or the real invoking user for Work
	async fn configure_identity(
		&self,
		dir: &Path,
		use_dummy: bool,
		privilege: Option<&GroupPrivilege>,
	) -> Result<(), CcError>;

	/// Register `dir` as trusted for cross-ownership access; no-op on git
	/// versions without safe.directory
	async fn configure_safe_directory(
		&self,
		dir: &Path,
		privilege: Option<&GroupPrivilege>,
	) -> Result<(), CcError>;

	/// Stage the enumerated relative paths; per-file failures are logged and
	/// skipped so the remaining files are still attempted
	async fn add(
		&self,
		dir: &Path,
		paths: &[String],
		privilege: Option<&GroupPrivilege>,
	) -> Result<(), CcError>;

	/// Stage everything, including deletions
	async fn add_all(&self, dir: &Path, privilege: Option<&GroupPrivilege>) -> Result<(), CcError>;

	/// Is the working tree dirty?
	async fn has_changes(&self, dir: &Path) -> Result<bool, CcError>;

	/// Commit staged changes; `author` overrides commit authorship so audit
	/// trails name the invoking user even under the synthetic committer
	async fn commit(
		&self,
		dir: &Path,
		message: &str,
		author: Option<&str>,
		privilege: Option<&GroupPrivilege>,
	) -> Result<(), CcError>;

	/// Current commit id, or None before the first commit
	async fn head(&self, dir: &Path) -> Result<Option<String>, CcError>;

	/// Does `commit` exist in this repository's history?
	async fn commit_exists(&self, dir: &Path, commit: &str) -> bool;

	/// Content hash of the current working-tree file, or Missing
	async fn blob_id(&self, dir: &Path, rel_path: &str) -> Result<BlobId, CcError>;

	/// Content hash of the file at a prior commit, or Missing
	async fn blob_id_in_commit(
		&self,
		dir: &Path,
		commit: &str,
		rel_path: &str,
	) -> Result<BlobId, CcError>;

	/// Ordered commit rows, newest first
	async fn log(&self, dir: &Path, limit: Option<usize>) -> Result<Vec<LogEntry>, CcError>;

	/// Files touched by a commit
	async fn files_in_commit(&self, dir: &Path, commit: &str) -> Result<Vec<CommitFile>, CcError>;

	/// `status --short` rows
	async fn status_short(&self, dir: &Path) -> Result<Vec<StatusEntry>, CcError>;

	/// Tracked files
	async fn ls_files(&self, dir: &Path) -> Result<Vec<String>, CcError>;

	/// Drop the whole index so ignore rules are re-evaluated
	async fn rm_cached_all(&self, dir: &Path) -> Result<(), CcError>;

	/// Discard working-tree changes to `path`
	async fn checkout_head(&self, dir: &Path, path: &str) -> Result<(), CcError>;

	/// Revert `from_commit..HEAD` without committing, leaving the diff staged
	async fn revert_range(&self, dir: &Path, from_commit: &str) -> Result<(), CcError>;

	/// Write a zip archive of `commit` to `out_path`
	async fn archive_zip(
		&self,
		dir: &Path,
		commit: &str,
		out_path: &Path,
	) -> Result<(), CcError>;
}

/// The git implementation of `Vcs`
pub struct Git {
	bin: String,
	version: OnceCell<Option<GitVersion>>,
}

impl Git {
	pub fn new() -> Self {
		let bin = std::env::var("CCCOPY_GIT_BIN_PATH").unwrap_or_else(|_| "git".to_string());
		Git { bin, version: OnceCell::new() }
	}

	/// Detected git version, cached after the first call
	pub async fn version(&self) -> Option<GitVersion> {
		*self
			.version
			.get_or_init(|| async {
				match self.run(None, &["--version"]).await {
					Ok(out) => {
						let version = GitVersion::parse(&out);
						debug!("git version detected: {:?}", version);
						version
					}
					Err(e) => {
						warn!("git version detection failed: {}", e);
						None
					}
				}
			})
			.await
	}

	/// Run git directly with captured output
	async fn run(&self, dir: Option<&Path>, args: &[&str]) -> Result<String, VcsError> {
		let mut cmd = Command::new(&self.bin);
		cmd.args(args)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			// Keep git from prompting or complaining when the UI owns the
			// terminal; output is parsed line-by-line, never streamed.
			.env("GIT_TERMINAL_PROMPT", "0")
			.env("GIT_DISCOVERY_ACROSS_FILESYSTEM", "1");
		if let Some(dir) = dir {
			cmd.current_dir(dir);
		}

		let output = cmd.output().await.map_err(|e| VcsError::Spawn { source: e })?;
		if !output.status.success() {
			return Err(VcsError::CommandFailed {
				args: args.join(" "),
				stderr: String::from_utf8_lossy(&output.stderr).to_string(),
			});
		}
		Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
	}

	/// Run a write operation, escalated when a privilege handle is supplied
	async fn run_write(
		&self,
		dir: &Path,
		args: &[String],
		privilege: Option<&GroupPrivilege>,
		timeout: Duration,
		desc: &str,
	) -> Result<String, CcError> {
		match privilege {
			Some(privilege) if privilege.escalates() => {
				let mut command = format!("cd {} && {}", sh_quote(&dir.to_string_lossy()), sh_quote(&self.bin));
				for arg in args {
					command.push(' ');
					command.push_str(&sh_quote(arg));
				}
				let out = privilege.run(&command, timeout, true, desc).await?;
				Ok(out.trim_end().to_string())
			}
			_ => {
				let refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
				Ok(self.run(Some(dir), &refs).await?)
			}
		}
	}
}

impl Default for Git {
	fn default() -> Self {
		Git::new()
	}
}

#[async_trait]
impl Vcs for Git {
	async fn is_repo(&self, dir: &Path) -> bool {
		dir.join(".git").exists()
	}

	async fn init(&self, dir: &Path, privilege: Option<&GroupPrivilege>) -> Result<(), CcError> {
		self.run_write(
			dir,
			&["init".to_string()],
			privilege,
			WRITE_TIMEOUT,
			"Initialize repository",
		)
		.await?;
		Ok(())
	}

	async fn configure_identity(
		&self,
		dir: &Path,
		use_dummy: bool,
		privilege: Option<&GroupPrivilege>,
	) -> Result<(), CcError> {
		let (name, email) = if use_dummy {
			(DUMMY_USER.to_string(), DUMMY_EMAIL.to_string())
		} else {
			let user = crate::util::current_user();
			let email = format!("{}@{}", user, USER_MAIL_DOMAIN);
			(user, email)
		};

		self.run_write(
			dir,
			&["config".to_string(), "user.name".to_string(), name.clone()],
			privilege,
			WRITE_TIMEOUT,
			"Configure identity (user.name)",
		)
		.await?;
		self.run_write(
			dir,
			&["config".to_string(), "user.email".to_string(), email.clone()],
			privilege,
			WRITE_TIMEOUT,
			"Configure identity (user.email)",
		)
		.await?;
		debug!("identity configured for {}: {} <{}>", dir.display(), name, email);
		Ok(())
	}

	async fn configure_safe_directory(
		&self,
		dir: &Path,
		privilege: Option<&GroupPrivilege>,
	) -> Result<(), CcError> {
		// safe.directory exists for cross-ownership access; a repository the
		// invoking user already owns needs no registration.
		#[cfg(unix)]
		{
			use std::os::unix::fs::MetadataExt;
			if let Ok(meta) = std::fs::metadata(dir) {
				if meta.uid() == crate::util::effective_uid() {
					debug!("{} owned by the invoking user, skipping safe.directory", dir.display());
					return Ok(());
				}
			}
		}

		match self.version().await {
			Some(version) if version.supports_safe_directory() => {
				self.run_write(
					dir,
					&[
						"config".to_string(),
						"--global".to_string(),
						"--add".to_string(),
						"safe.directory".to_string(),
						dir.to_string_lossy().to_string(),
					],
					privilege,
					WRITE_TIMEOUT,
					"Register safe.directory",
				)
				.await?;
			}
			_ => {
				debug!("git predates safe.directory, skipping registration");
			}
		}
		Ok(())
	}

	async fn add(
		&self,
		dir: &Path,
		paths: &[String],
		privilege: Option<&GroupPrivilege>,
	) -> Result<(), CcError> {
		for rel_path in paths {
			let result = self
				.run_write(
					dir,
					&["add".to_string(), "--".to_string(), rel_path.clone()],
					privilege,
					ADD_TIMEOUT,
					"Stage file",
				)
				.await;
			if let Err(e) = result {
				// Per-file failure must not stop the remaining files
				warn!("git add failed: {} - {}", rel_path, e);
			}
		}
		Ok(())
	}

	async fn add_all(&self, dir: &Path, privilege: Option<&GroupPrivilege>) -> Result<(), CcError> {
		self.run_write(
			dir,
			&["add".to_string(), "--all".to_string(), ".".to_string()],
			privilege,
			ADD_TIMEOUT,
			"Stage all files",
		)
		.await?;
		Ok(())
	}

	async fn has_changes(&self, dir: &Path) -> Result<bool, CcError> {
		let out = self.run(Some(dir), &["status", "--porcelain"]).await?;
		Ok(!out.trim().is_empty())
	}

	async fn commit(
		&self,
		dir: &Path,
		message: &str,
		author: Option<&str>,
		privilege: Option<&GroupPrivilege>,
	) -> Result<(), CcError> {
		let mut args = vec!["commit".to_string()];
		if let Some(author) = author {
			args.push("--author".to_string());
			args.push(author.to_string());
		}
		args.push("-m".to_string());
		args.push(message.to_string());

		self.run_write(dir, &args, privilege, WRITE_TIMEOUT, "Commit").await?;
		Ok(())
	}

	async fn head(&self, dir: &Path) -> Result<Option<String>, CcError> {
		match self.run(Some(dir), &["rev-parse", "HEAD"]).await {
			Ok(out) if !out.is_empty() => Ok(Some(out)),
			// No commits yet
			_ => Ok(None),
		}
	}

	async fn commit_exists(&self, dir: &Path, commit: &str) -> bool {
		let spec = format!("{}^{{commit}}", commit);
		self.run(Some(dir), &["rev-parse", "--verify", "--quiet", &spec]).await.is_ok()
	}

	async fn blob_id(&self, dir: &Path, rel_path: &str) -> Result<BlobId, CcError> {
		let file = dir.join(rel_path);
		if !file.exists() {
			return Ok(BlobId::Missing);
		}
		let file_arg = file.to_string_lossy().to_string();
		let out = self
			.run(Some(dir), &["hash-object", "--", file_arg.as_str()])
			.await
			.map_err(CcError::from)?;
		if out.is_empty() {
			return Err(VcsError::Parse { message: format!("empty hash-object output for {}", rel_path) }.into());
		}
		Ok(BlobId::Id(out))
	}

	async fn blob_id_in_commit(
		&self,
		dir: &Path,
		commit: &str,
		rel_path: &str,
	) -> Result<BlobId, CcError> {
		let out = self.run(Some(dir), &["ls-tree", commit, "--", rel_path]).await?;
		// ls-tree line: "<mode> blob <hash>\t<path>"
		let hash = out
			.lines()
			.next()
			.and_then(|line| line.split_whitespace().nth(2))
			.map(|h| h.to_string());
		match hash {
			Some(hash) => Ok(BlobId::Id(hash)),
			None => Ok(BlobId::Missing),
		}
	}

	async fn log(&self, dir: &Path, limit: Option<usize>) -> Result<Vec<LogEntry>, CcError> {
		let mut args = vec!["log", "--pretty=format:%h|%an|%ad|%s", "--date=iso"];
		let limit_arg;
		if let Some(limit) = limit {
			limit_arg = limit.to_string();
			args.push("-n");
			args.push(&limit_arg);
		}

		let out = match self.run(Some(dir), &args).await {
			Ok(out) => out,
			// Empty repository has no log
			Err(_) => return Ok(Vec::new()),
		};

		Ok(out
			.lines()
			.enumerate()
			.filter(|(_, line)| !line.trim().is_empty())
			.filter_map(|(i, line)| parse_log_line(i + 1, line))
			.collect())
	}

	async fn files_in_commit(&self, dir: &Path, commit: &str) -> Result<Vec<CommitFile>, CcError> {
		let out = self
			.run(Some(dir), &["diff-tree", "--no-commit-id", "--name-status", "-r", "--root", commit])
			.await?;
		Ok(out
			.lines()
			.filter_map(|line| {
				let (status, path) = line.split_once('\t')?;
				let kind = ChangeKind::from_code(status.chars().next()?)?;
				Some(CommitFile { kind, path: path.to_string() })
			})
			.collect())
	}

	async fn status_short(&self, dir: &Path) -> Result<Vec<StatusEntry>, CcError> {
		let out = self.run(Some(dir), &["status", "--short"]).await?;
		Ok(out.lines().filter_map(parse_status_line).collect())
	}

	async fn ls_files(&self, dir: &Path) -> Result<Vec<String>, CcError> {
		let out = self.run(Some(dir), &["ls-files"]).await?;
		Ok(out.lines().filter(|l| !l.is_empty()).map(String::from).collect())
	}

	async fn rm_cached_all(&self, dir: &Path) -> Result<(), CcError> {
		self.run(Some(dir), &["rm", "-r", "--cached", "."]).await?;
		Ok(())
	}

	async fn checkout_head(&self, dir: &Path, path: &str) -> Result<(), CcError> {
		self.run(Some(dir), &["checkout", "HEAD", "--", path]).await?;
		Ok(())
	}

	async fn revert_range(&self, dir: &Path, from_commit: &str) -> Result<(), CcError> {
		let range = format!("{}..HEAD", from_commit);
		self.run(Some(dir), &["revert", "--no-commit", &range]).await?;
		Ok(())
	}

	async fn archive_zip(
		&self,
		dir: &Path,
		commit: &str,
		out_path: &Path,
	) -> Result<(), CcError> {
		let out_arg = out_path.to_string_lossy().to_string();
		self.run(Some(dir), &["archive", "--format=zip", "-o", out_arg.as_str(), commit]).await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_version_parse() {
		assert_eq!(
			GitVersion::parse("git version 2.39.5"),
			Some(GitVersion { major: 2, minor: 39, patch: 5 })
		);
		assert_eq!(
			GitVersion::parse("git version 2.45.1.windows.1"),
			Some(GitVersion { major: 2, minor: 45, patch: 1 })
		);
		assert_eq!(GitVersion::parse("not a version"), None);
	}

	#[test]
	fn test_safe_directory_threshold() {
		assert!(GitVersion { major: 2, minor: 35, patch: 2 }.supports_safe_directory());
		assert!(GitVersion { major: 2, minor: 39, patch: 0 }.supports_safe_directory());
		assert!(GitVersion { major: 3, minor: 0, patch: 0 }.supports_safe_directory());
		assert!(!GitVersion { major: 2, minor: 35, patch: 1 }.supports_safe_directory());
		assert!(!GitVersion { major: 1, minor: 8, patch: 3 }.supports_safe_directory());
	}

	#[test]
	fn test_parse_log_line_strips_timezone() {
		let entry = parse_log_line(1, "abc1234|alice|2025-10-05 23:35:43 +0900|fix the frobnicator")
			.unwrap();
		assert_eq!(entry.seq, 1);
		assert_eq!(entry.short_id, "abc1234");
		assert_eq!(entry.author, "alice");
		assert_eq!(entry.date, "2025-10-05 23:35:43");
		assert_eq!(entry.subject, "fix the frobnicator");
	}

	#[test]
	fn test_parse_log_line_subject_with_pipes() {
		let entry = parse_log_line(2, "abc|bob|2025-01-01 00:00:00 +0000|a|b|c").unwrap();
		assert_eq!(entry.subject, "a|b|c");
	}

	#[test]
	fn test_parse_status_line() {
		let entry = parse_status_line("?? AAA/new.c").unwrap();
		assert_eq!(entry.code, "??");
		assert_eq!(entry.path, "AAA/new.c");

		let entry = parse_status_line(" M AAA/a.c").unwrap();
		assert_eq!(entry.code, " M");
		assert_eq!(entry.path, "AAA/a.c");
	}

	#[test]
	fn test_parse_status_line_rename() {
		let entry = parse_status_line("R  old.c -> new.c").unwrap();
		assert_eq!(entry.code, "R ");
		assert_eq!(entry.path, "new.c");
	}

	#[test]
	fn test_format_status_line() {
		let entry = StatusEntry { code: "??".to_string(), path: "x.c".to_string() };
		assert_eq!(format_status_line(&entry), "[new] x.c");

		let entry = StatusEntry { code: "MM".to_string(), path: "y.c".to_string() };
		assert_eq!(format_status_line(&entry), "[modified] y.c");

		let entry = StatusEntry { code: "XY".to_string(), path: "z.c".to_string() };
		assert_eq!(format_status_line(&entry), "[XY] z.c");
	}

	#[test]
	fn test_change_kind() {
		assert_eq!(ChangeKind::from_code('A'), Some(ChangeKind::Added));
		assert_eq!(ChangeKind::from_code('R'), Some(ChangeKind::Renamed));
		assert_eq!(ChangeKind::from_code('X'), None);
		assert_eq!(ChangeKind::Modified.label(), "Modified");
	}
}

// vim: ts=4

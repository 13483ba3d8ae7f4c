//! NFS-safe advisory locking
//!
//! The lock is a directory at `<base>.lockdir`: directory creation is atomic
//! on NFS where O_EXCL file creation historically is not. The directory holds
//! an `owner.info` file naming the holder. A lock whose mtime is older than
//! the stale threshold is removed by the next acquirer. Creation and removal
//! are routed through the privilege escalator when one is supplied, so locks
//! inside group-owned Production trees work too.
//!
//! Locks are released on every exit path: explicitly, on drop, and by the
//! signal handler on SIGINT/SIGTERM.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};

use crate::error::LockError;
use crate::logging::{debug, info, warn};
use crate::privilege::GroupPrivilege;
use crate::ui::{Level, UiHandler};
use crate::util::{current_user, hostname, sh_quote};

/// Escalated lock bookkeeping commands get a short budget of their own
const LOCK_CMD_TIMEOUT: Duration = Duration::from_secs(10);

/// Lock directories currently held by this process, for signal cleanup
static HELD_LOCKS: OnceLock<Mutex<Vec<PathBuf>>> = OnceLock::new();

fn held_locks() -> &'static Mutex<Vec<PathBuf>> {
	HELD_LOCKS.get_or_init(|| Mutex::new(Vec::new()))
}

fn register_held(path: &Path) {
	if let Ok(mut locks) = held_locks().lock() {
		locks.push(path.to_path_buf());
	}
}

fn deregister_held(path: &Path) {
	if let Ok(mut locks) = held_locks().lock() {
		locks.retain(|p| p != path);
	}
}

/// Acquisition parameters
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
	/// Give up acquiring after this long
	pub timeout: Duration,

	/// A lock directory older than this is considered abandoned
	pub max_stale: Duration,

	/// Delay between acquisition attempts
	pub poll: Duration,
}

impl Default for LockOptions {
	fn default() -> Self {
		LockOptions {
			timeout: Duration::from_secs(60),
			max_stale: Duration::from_secs(300),
			poll: Duration::from_millis(100),
		}
	}
}

/// Held directory lock; released explicitly, on drop, or on signal
pub struct DirLock {
	lock_dir: PathBuf,
	owner_file: PathBuf,
	unique_id: String,
	privilege: Option<Arc<GroupPrivilege>>,
	held: bool,
}

impl DirLock {
	/// Acquire the lock for `base` (the directory created is `<base>.lockdir`)
	pub async fn acquire(
		base: &Path,
		options: LockOptions,
		privilege: Option<Arc<GroupPrivilege>>,
		ui: &dyn UiHandler,
	) -> Result<DirLock, LockError> {
		let lock_dir = PathBuf::from(format!("{}.lockdir", base.display()));
		let owner_file = lock_dir.join("owner.info");
		let unique_id = generate_unique_id();

		let mut lock = DirLock { lock_dir, owner_file, unique_id, privilege, held: false };

		let started = std::time::Instant::now();
		while started.elapsed() < options.timeout {
			if lock.try_acquire().await {
				info!("lock acquired: {}", lock.lock_dir.display());
				register_held(&lock.lock_dir);
				return Ok(lock);
			}

			if lock.lock_dir.exists() && lock.is_stale(options.max_stale) {
				info!("cleaning stale lock: {}", lock.lock_dir.display());
				lock.remove_lock_dir().await;
			}

			tokio::time::sleep(options.poll).await;
		}

		// Timed out: identify the holder and tell the user how to break it
		let owner = lock.read_owner();
		ui.display(
			Level::Error,
			&format!(
				"Lock acquisition timed out.\n\
				\n\
				Current lock owner: {}\n\
				Lock directory: {}\n\
				\n\
				Another user may be working, or a previous run died.\n\
				Manual break: rm -rf {}\n\
				\n\
				Caution: breaking the lock can interrupt another user's operation.",
				owner,
				lock.lock_dir.display(),
				lock.lock_dir.display()
			),
		);
		Err(LockError::Timeout { lock_dir: lock.lock_dir.clone(), owner })
	}

	/// One acquisition attempt; creation failure means somebody else holds it
	async fn try_acquire(&mut self) -> bool {
		let now = Utc::now().timestamp();
		match &self.privilege {
			Some(privilege) if privilege.escalates() => {
				debug!("creating lock via escalator");
				let parent = self.lock_dir.parent().map(|p| p.to_path_buf()).unwrap_or_default();
				// Plain mkdir (not -p) on the lock directory itself is the
				// atomic exclusion point.
				let command = format!(
					"mkdir -p {} && mkdir {} && printf '%s\\n%s\\n' {} {} > {}",
					sh_quote(&parent.to_string_lossy()),
					sh_quote(&self.lock_dir.to_string_lossy()),
					sh_quote(&self.unique_id),
					now,
					sh_quote(&self.owner_file.to_string_lossy())
				);
				match privilege.run(&command, LOCK_CMD_TIMEOUT, true, "Create lock directory").await
				{
					Ok(_) => {
						self.held = true;
						true
					}
					Err(e) => {
						debug!("lock acquisition attempt failed: {}", e);
						false
					}
				}
			}
			_ => {
				debug!("creating lock directly");
				if let Some(parent) = self.lock_dir.parent() {
					if std::fs::create_dir_all(parent).is_err() {
						return false;
					}
				}
				if std::fs::create_dir(&self.lock_dir).is_err() {
					return false;
				}
				let content = format!("{}\n{}\n", self.unique_id, now);
				if std::fs::write(&self.owner_file, content).is_err() {
					let _ = std::fs::remove_dir_all(&self.lock_dir);
					return false;
				}
				self.held = true;
				true
			}
		}
	}

	fn is_stale(&self, max_stale: Duration) -> bool {
		match std::fs::metadata(&self.lock_dir).and_then(|m| m.modified()) {
			Ok(mtime) => match SystemTime::now().duration_since(mtime) {
				Ok(age) => age > max_stale,
				Err(_) => false,
			},
			// Vanished between the existence check and here
			Err(_) => true,
		}
	}

	/// First line of owner.info, or a placeholder
	fn read_owner(&self) -> String {
		match std::fs::read_to_string(&self.owner_file) {
			Ok(content) => {
				let identity = content.lines().next().unwrap_or("").trim();
				// identity format: user@host:pid:timestamp:random
				match identity.split('@').next() {
					Some(user) if !user.is_empty() => user.to_string(),
					_ => "unknown".to_string(),
				}
			}
			Err(_) => "unknown".to_string(),
		}
	}

	/// The full identity this lock was acquired with
	pub fn unique_id(&self) -> &str {
		&self.unique_id
	}

	pub fn lock_dir(&self) -> &Path {
		&self.lock_dir
	}

	async fn remove_lock_dir(&self) {
		match &self.privilege {
			Some(privilege) if privilege.escalates() => {
				let command = format!("rm -rf {}", sh_quote(&self.lock_dir.to_string_lossy()));
				let _ = privilege
					.run(&command, LOCK_CMD_TIMEOUT, false, "Remove lock directory")
					.await;
			}
			_ => {
				if let Err(e) = std::fs::remove_dir_all(&self.lock_dir) {
					if self.lock_dir.exists() {
						warn!("failed to remove lock directory {}: {}", self.lock_dir.display(), e);
					}
				}
			}
		}
	}

	/// Release the lock. Safe to call more than once.
	pub async fn release(&mut self) {
		if !self.held {
			return;
		}
		self.remove_lock_dir().await;
		self.held = false;
		deregister_held(&self.lock_dir);
		info!("lock released: {}", self.lock_dir.display());
	}
}

impl Drop for DirLock {
	fn drop(&mut self) {
		// Backstop for error and panic paths; the engine releases explicitly.
		if !self.held {
			return;
		}
		match &self.privilege {
			Some(privilege) if privilege.escalates() => {
				let command = format!("rm -rf {}", sh_quote(&self.lock_dir.to_string_lossy()));
				let _ = std::process::Command::new("sg")
					.arg(privilege.group().unwrap_or_default())
					.arg("-c")
					.arg(&command)
					.status();
			}
			_ => {
				let _ = std::fs::remove_dir_all(&self.lock_dir);
			}
		}
		self.held = false;
		deregister_held(&self.lock_dir);
	}
}

fn generate_unique_id() -> String {
	let pid = std::process::id();
	let micros = Utc::now().timestamp_micros();
	let random = uuid::Uuid::new_v4().simple().to_string();
	format!("{}@{}:{}:{}:{}", current_user(), hostname(), pid, micros, &random[..8])
}

/// Remove every lock this process still holds and exit on SIGINT/SIGTERM
pub fn setup_signal_handlers() {
	tokio::spawn(async {
		use tokio::signal::unix::{signal, SignalKind};

		let mut sigterm = match signal(SignalKind::terminate()) {
			Ok(stream) => stream,
			Err(e) => {
				warn!("Failed to setup SIGTERM handler: {}", e);
				return;
			}
		};
		let mut sigint = match signal(SignalKind::interrupt()) {
			Ok(stream) => stream,
			Err(e) => {
				warn!("Failed to setup SIGINT handler: {}", e);
				return;
			}
		};

		tokio::select! {
			_ = sigterm.recv() => {
				debug!("Received SIGTERM, cleaning up lock directories...");
			}
			_ = sigint.recv() => {
				debug!("Received SIGINT, cleaning up lock directories...");
			}
		}
		cleanup_held_locks();
		std::process::exit(130);
	});
}

fn cleanup_held_locks() {
	if let Ok(locks) = held_locks().lock() {
		for lock_dir in locks.iter() {
			let _ = std::fs::remove_dir_all(lock_dir);
			info!("lock cleaned up on signal: {}", lock_dir.display());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ui::ScriptedHandler;
	use tempfile::TempDir;

	fn fast_options() -> LockOptions {
		LockOptions {
			timeout: Duration::from_millis(300),
			max_stale: Duration::from_secs(300),
			poll: Duration::from_millis(50),
		}
	}

	#[tokio::test]
	async fn test_acquire_creates_owner_info() {
		let tmp = TempDir::new().unwrap();
		let base = tmp.path().join("production_lock");
		let ui = ScriptedHandler::default();

		let mut lock = DirLock::acquire(&base, fast_options(), None, &ui).await.unwrap();

		let lock_dir = PathBuf::from(format!("{}.lockdir", base.display()));
		assert!(lock_dir.is_dir());
		let owner = std::fs::read_to_string(lock_dir.join("owner.info")).unwrap();
		assert!(owner.starts_with(&current_user()));
		assert_eq!(owner.lines().count(), 2);

		lock.release().await;
		assert!(!lock_dir.exists());
	}

	#[tokio::test]
	async fn test_mutual_exclusion() {
		let tmp = TempDir::new().unwrap();
		let base = tmp.path().join("production_lock");
		let ui = ScriptedHandler::default();

		let _held = DirLock::acquire(&base, fast_options(), None, &ui).await.unwrap();

		let loser_ui = ScriptedHandler::default();
		let result = DirLock::acquire(&base, fast_options(), None, &loser_ui).await;
		match result {
			Err(LockError::Timeout { owner, .. }) => {
				assert_eq!(owner, current_user());
			}
			other => panic!("expected timeout, got {:?}", other.map(|_| ())),
		}
		assert!(loser_ui.saw("Manual break: rm -rf"));
	}

	#[tokio::test]
	async fn test_acquire_after_release() {
		let tmp = TempDir::new().unwrap();
		let base = tmp.path().join("production_lock");
		let ui = ScriptedHandler::default();

		let mut first = DirLock::acquire(&base, fast_options(), None, &ui).await.unwrap();
		first.release().await;

		let mut second = DirLock::acquire(&base, fast_options(), None, &ui).await.unwrap();
		second.release().await;
	}

	#[tokio::test]
	async fn test_stale_lock_recovery() {
		let tmp = TempDir::new().unwrap();
		let base = tmp.path().join("production_lock");
		let lock_dir = PathBuf::from(format!("{}.lockdir", base.display()));

		// A crashed run left a lock behind, aged past the stale threshold
		std::fs::create_dir_all(&lock_dir).unwrap();
		std::fs::write(lock_dir.join("owner.info"), "ghost@old-host:1:0:abc\n0\n").unwrap();
		let old = filetime::FileTime::from_unix_time(1_000_000, 0);
		filetime::set_file_mtime(&lock_dir, old).unwrap();

		let options = LockOptions {
			timeout: Duration::from_secs(2),
			max_stale: Duration::from_secs(60),
			poll: Duration::from_millis(20),
		};
		let ui = ScriptedHandler::default();
		let mut lock = DirLock::acquire(&base, options, None, &ui).await.unwrap();

		// owner.info now names the new holder
		let owner = std::fs::read_to_string(lock_dir.join("owner.info")).unwrap();
		assert!(owner.starts_with(&current_user()));

		lock.release().await;
	}

	#[tokio::test]
	async fn test_fresh_lock_not_removed() {
		let tmp = TempDir::new().unwrap();
		let base = tmp.path().join("production_lock");
		let lock_dir = PathBuf::from(format!("{}.lockdir", base.display()));

		std::fs::create_dir_all(&lock_dir).unwrap();
		std::fs::write(lock_dir.join("owner.info"), "busy@host:1:0:abc\n0\n").unwrap();

		let ui = ScriptedHandler::default();
		let result = DirLock::acquire(&base, fast_options(), None, &ui).await;
		assert!(result.is_err());
		// The fresh lock survived
		assert!(lock_dir.join("owner.info").exists());
	}

	#[tokio::test]
	async fn test_drop_releases() {
		let tmp = TempDir::new().unwrap();
		let base = tmp.path().join("production_lock");
		let lock_dir = PathBuf::from(format!("{}.lockdir", base.display()));
		let ui = ScriptedHandler::default();

		{
			let _lock = DirLock::acquire(&base, fast_options(), None, &ui).await.unwrap();
			assert!(lock_dir.exists());
		}
		assert!(!lock_dir.exists());
	}
}

// vim: ts=4

//! Synchronization engine: Download, Upload, Save, Rollback, Export
//!
//! All Production writes happen under the Production lock and through the
//! privilege escalator. Within one operation every filesystem write is
//! serialized, so the step ordering here is observable; between operations
//! the lock provides mutual exclusion across processes.

use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::classify::{Classifier, FileState};
use crate::conflict::{ConflictMediator, ConflictOutcome};
use crate::error::{CcError, LockError};
use crate::lock::{DirLock, LockOptions};
use crate::logging::debug;
use crate::pattern::{load_gitignore, SourceSet};
use crate::privilege::GroupPrivilege;
use crate::project::Project;
use crate::tag::{sources_hash, TagStore};
use crate::ui::{Level, Prompt, Reply, UiHandler};
use crate::util::{current_user, sanitize_filename, sh_quote};
use crate::vcs::{format_status_line, Vcs, USER_MAIL_DOMAIN};

/// Production check interval for partial refreshes
const CAPTURE_CHECK_INTERVAL: Duration = Duration::from_secs(300);

const AUTO_COMMIT_MESSAGE: &str = "Auto-commit: Direct changes in production";

/// Outcome counters for a Download
#[derive(Debug, Default, Clone)]
pub struct DownloadReport {
	pub updated: usize,
	pub modified: usize,
	pub same: usize,
	pub resolved: usize,
	pub unresolved: usize,
	pub first_download: bool,
	pub gitignore_changed: bool,
}

/// Outcome of an Upload
#[derive(Debug, Default, Clone)]
pub struct UploadReport {
	pub uploaded: usize,
	pub message: String,
}

/// Outcome of a Save
#[derive(Debug, Default, Clone)]
pub struct SaveReport {
	pub committed: usize,
	pub outside_sources: usize,
}

/// Parse the index out of a backup filename
/// (`<original>_cccopy_<6-digit-index>_<YYMMDDhhmm>`)
pub fn parse_backup_index(filename: &str, original: &str) -> Option<u32> {
	let rest = filename.strip_prefix(original)?.strip_prefix("_cccopy_")?;
	let (index, _timestamp) = rest.split_once('_')?;
	if index.len() != 6 {
		return None;
	}
	index.parse().ok()
}

/// The synchronization engine for one resolved project
pub struct SyncEngine {
	vcs: Arc<dyn Vcs>,
	ui: Arc<dyn UiHandler>,
	project: Project,
	privilege: Arc<GroupPrivilege>,
	sources: SourceSet,
	tags: TagStore,
	lock_options: LockOptions,
	last_capture: Mutex<Option<Instant>>,
}

impl SyncEngine {
	pub fn new(
		project: Project,
		vcs: Arc<dyn Vcs>,
		ui: Arc<dyn UiHandler>,
	) -> Result<SyncEngine, CcError> {
		let privilege = Arc::new(GroupPrivilege::new(project.group.as_deref(), ui.clone()));
		let sources = SourceSet::new(&project.sources, &project.excludes)?;
		let tags = TagStore::new(&project.status_dir());
		Ok(SyncEngine {
			vcs,
			ui,
			project,
			privilege,
			sources,
			tags,
			lock_options: LockOptions {
				timeout: Duration::from_secs(5),
				max_stale: Duration::from_secs(3600),
				poll: Duration::from_millis(100),
			},
			last_capture: Mutex::new(None),
		})
	}

	pub fn project(&self) -> &Project {
		&self.project
	}

	pub fn tags(&self) -> &TagStore {
		&self.tags
	}

	pub fn sources(&self) -> &SourceSet {
		&self.sources
	}

	/// Override lock timing (tests use short budgets)
	pub fn set_lock_options(&mut self, options: LockOptions) {
		self.lock_options = options;
	}

	/// Build a classifier against the currently tagged baseline
	pub async fn classifier(&self) -> Classifier {
		Classifier::new(
			self.vcs.clone(),
			self.project.production_dir.clone(),
			self.project.working_dir.clone(),
			self.tags.read().as_ref(),
		)
		.await
	}

	/// Enumerate the project's files the way the operations do
	pub fn collect_files(&self, include_work_only: bool) -> Vec<(PathBuf, String)> {
		let gitignore = load_gitignore(&self.project.production_dir);
		self.sources.collect(
			&self.project.production_dir,
			include_work_only.then_some(self.project.working_dir.as_path()),
			gitignore.as_ref(),
		)
	}

	fn author_string() -> String {
		let user = current_user();
		format!("{} <{}@{}>", user, user, USER_MAIL_DOMAIN)
	}

	fn lock_base(&self) -> PathBuf {
		self.project.production_dir.join(".cccopy").join("lock").join("production_lock")
	}

	async fn lock_production(&self) -> Result<DirLock, CcError> {
		self.ui.display(Level::Info, "Acquiring production lock...");
		let lock = DirLock::acquire(
			&self.lock_base(),
			self.lock_options,
			Some(self.privilege.clone()),
			self.ui.as_ref(),
		)
		.await?;
		self.ui.display(Level::Info, "Lock acquired");
		Ok(lock)
	}

	// ------------------------------------------------------------------
	// Download (production -> work)
	// ------------------------------------------------------------------

	pub async fn download(&self) -> Result<DownloadReport, CcError> {
		self.ui.display(Level::Info, "=== DOWNLOAD (production -> work) ===");

		if !self.project.production_dir.exists() {
			return Err(CcError::Other {
				message: format!(
					"Production directory does not exist: {}",
					self.project.production_dir.display()
				),
			});
		}
		std::fs::create_dir_all(&self.project.working_dir)
			.map_err(|e| CcError::io(&self.project.working_dir, e))?;

		let mut lock = self.lock_production().await?;
		let result = self.download_locked().await;
		lock.release().await;
		result
	}

	async fn download_locked(&self) -> Result<DownloadReport, CcError> {
		let mut report = DownloadReport::default();

		// SOURCES-change detection against the tag's fingerprint
		if let Some(tag) = self.tags.read() {
			if let Some(saved_hash) = &tag.sources_hash {
				let current_hash = sources_hash(&self.project.sources);
				if *saved_hash != current_hash {
					self.ui.display(Level::Warn, "SOURCES patterns changed since the last sync!");
					self.ui.display(Level::Warn, &format!("  previous hash: {}", saved_hash));
					self.ui.display(Level::Warn, &format!("  current hash:  {}", current_hash));
					self.ui
						.display(Level::Warn, "  The downloaded file set may differ from before.");
					let reply = self.ui.prompt(Prompt::YesNo {
						message: "SOURCES patterns changed. Continue with the download?",
						title: "SOURCES change detected",
						default_yes: false,
					});
					if reply != Reply::Yes {
						self.ui.display(Level::Info, "Download cancelled.");
						return Err(CcError::Aborted);
					}
				}
			}
		}

		// Bootstrap Production, or capture direct edits made outside cccopy
		if !self.vcs.is_repo(&self.project.production_dir).await {
			self.bootstrap_production().await?;
		} else {
			self.capture_direct_edits().await?;
		}

		// Bootstrap Work
		report.first_download = !self.vcs.is_repo(&self.project.working_dir).await;
		if report.first_download {
			self.ui.display(Level::Info, "Initializing work repository...");
			self.vcs.init(&self.project.working_dir, None).await?;
			self.vcs.configure_identity(&self.project.working_dir, false, None).await?;
			self.vcs.configure_safe_directory(&self.project.working_dir, None).await?;
		}

		// Work's .gitignore is owned by Production
		report.gitignore_changed = self.sync_gitignore().await?;
		if report.gitignore_changed {
			self.refresh_work_index().await?;
		}

		let gitignore = load_gitignore(&self.project.production_dir);
		let files = self.sources.collect(&self.project.production_dir, None, gitignore.as_ref());
		self.ui.display(Level::Info, &format!("Collected {} files (.gitignore applied)", files.len()));
		if files.is_empty() {
			self.ui.display(Level::Warn, "No files collected.");
			self.ui.display(Level::Info, "Check the SOURCES patterns in the project config.");
			return Ok(report);
		}

		let classifier = self.classifier().await;
		let mediator = ConflictMediator::new(
			self.vcs.as_ref(),
			self.ui.as_ref(),
			&self.privilege,
			&self.project.production_dir,
			&self.project.working_dir,
		);

		let mut newly_added: Vec<String> = Vec::new();
		for (production_file, rel_path) in &files {
			let work_file = self.project.working_dir.join(rel_path);
			match classifier.state_of(rel_path).await {
				FileState::Updated => {
					let was_new = !work_file.exists();
					copy_preserving_mtime(production_file, &work_file)?;
					self.ui.display(Level::Info, &format!("  updated: {}", rel_path));
					report.updated += 1;
					if was_new {
						newly_added.push(rel_path.clone());
					}
				}
				FileState::Same => report.same += 1,
				// The user has local changes not uploaded yet; leave alone
				FileState::Modified => report.modified += 1,
				FileState::Conflicted => match mediator.mediate(rel_path).await? {
					ConflictOutcome::Resolved => {
						report.resolved += 1;
						report.updated += 1;
					}
					ConflictOutcome::Skipped => {
						report.unresolved += 1;
						self.ui.display(
							Level::Info,
							&format!("  {} stays conflicted - the next download retries it", rel_path),
						);
					}
				},
				FileState::Pending => unreachable!("classifier never returns pending"),
			}
		}

		// The tag only advances when every conflict was dealt with
		if report.unresolved == 0 {
			let hash = sources_hash(&self.project.sources);
			self.tags.save(self.vcs.as_ref(), &self.project.production_dir, Some(&hash)).await?;
		} else {
			self.ui.display(
				Level::Info,
				"Production tag left unchanged because conflicts remain unresolved.",
			);
		}

		self.auto_commit_work(&report, &newly_added).await?;

		self.ui.display(Level::Info, "Download complete:");
		self.ui.display(Level::Info, &format!("  updated:  {}", report.updated));
		self.ui.display(Level::Info, &format!("  modified: {}", report.modified));
		self.ui.display(Level::Info, &format!("  same:     {}", report.same));
		Ok(report)
	}

	/// Initial Production repository: init, synthetic identity, ignore file,
	/// stage only what the pattern matcher yields, first commit.
	async fn bootstrap_production(&self) -> Result<(), CcError> {
		self.ui.display(Level::Info, "Initializing production repository...");
		let production = &self.project.production_dir;
		let privilege = Some(self.privilege.as_ref());

		self.vcs.init(production, privilege).await?;
		self.vcs.configure_identity(production, true, privilege).await?;
		self.vcs.configure_safe_directory(production, privilege).await?;

		// .gitignore: internal state plus the project's EXCLUDES
		let mut content = String::from("# cccopy internal directory\n.cccopy/\n");
		if !self.project.excludes.is_empty() {
			content.push_str("\n# Exclude patterns from project config [EXCLUDES]\n");
			for pattern in &self.project.excludes {
				content.push_str(pattern);
				content.push('\n');
			}
		}
		let gitignore_path = production.join(".gitignore");
		let command = format!(
			"printf '%s' {} > {}",
			sh_quote(&content),
			sh_quote(&gitignore_path.to_string_lossy())
		);
		self.privilege
			.run(&command, Duration::from_secs(10), true, "Create production .gitignore")
			.await?;

		// Stage only the files SOURCES selects, never everything
		let gitignore = load_gitignore(production);
		let files = self.sources.collect(production, None, gitignore.as_ref());
		let rel_paths: Vec<String> = files.iter().map(|(_, rel)| rel.clone()).collect();
		self.ui.display(Level::Info, &format!("Staging {} files matched by SOURCES", rel_paths.len()));
		self.vcs.add(production, &rel_paths, privilege).await?;
		self.vcs
			.commit(
				production,
				"Initial production repository",
				Some(&Self::author_string()),
				privilege,
			)
			.await?;
		self.ui.display(Level::Info, "Initial commit done - files outside SOURCES stay untracked");
		Ok(())
	}

	/// Stage and commit direct edits made in Production, restricted to paths
	/// the pattern matcher accepts. Assumes the Production lock is held.
	async fn capture_direct_edits(&self) -> Result<bool, CcError> {
		if !self.vcs.is_repo(&self.project.production_dir).await {
			return Ok(false);
		}
		self.ui.display(Level::Info, "Checking production for direct changes...");

		let status = self.vcs.status_short(&self.project.production_dir).await?;
		if status.is_empty() {
			debug!("no direct changes in production");
			return Ok(false);
		}

		self.ui.display(Level::Info, "Files changed directly in production:");
		for entry in &status {
			self.ui.display(Level::Info, &format!("  {}", format_status_line(entry)));
		}

		let in_sources: Vec<String> = status
			.iter()
			.filter(|entry| self.sources.accepts(&entry.path))
			.map(|entry| entry.path.clone())
			.collect();

		if in_sources.is_empty() {
			self.ui.display(
				Level::Info,
				"No changed files inside SOURCES - skipping auto-commit (others stay untracked)",
			);
			return Ok(false);
		}

		self.ui.display(
			Level::Info,
			&format!("Auto-committing {} changed files inside SOURCES", in_sources.len()),
		);
		let privilege = Some(self.privilege.as_ref());
		self.vcs.add(&self.project.production_dir, &in_sources, privilege).await?;
		self.vcs
			.commit(
				&self.project.production_dir,
				AUTO_COMMIT_MESSAGE,
				Some(&Self::author_string()),
				privilege,
			)
			.await?;
		Ok(true)
	}

	/// Standalone auto-capture used by browser refreshes. Takes its own lock;
	/// respects a check-interval cache unless `force` is set. A busy lock is
	/// not an error here - the refresh just skips the capture.
	pub async fn auto_capture(&self, force: bool) -> Result<bool, CcError> {
		if !self.project.production_dir.exists()
			|| !self.vcs.is_repo(&self.project.production_dir).await
		{
			return Ok(false);
		}

		if !force {
			let mut last = self.last_capture.lock().map_err(|_| CcError::Other {
				message: "capture interval state poisoned".to_string(),
			})?;
			if let Some(at) = *last {
				if at.elapsed() < CAPTURE_CHECK_INTERVAL {
					debug!("production change check skipped (interval not elapsed)");
					return Ok(false);
				}
			}
			*last = Some(Instant::now());
		}

		let mut lock = match DirLock::acquire(
			&self.lock_base(),
			self.lock_options,
			Some(self.privilege.clone()),
			self.ui.as_ref(),
		)
		.await
		{
			Ok(lock) => lock,
			Err(LockError::Timeout { .. }) => {
				debug!("production busy, skipping auto-capture");
				return Ok(false);
			}
			Err(e) => return Err(e.into()),
		};
		let result = self.capture_direct_edits().await;
		lock.release().await;
		result
	}

	/// Copy Production's .gitignore over Work's, backing up a diverging Work
	/// copy first. Returns whether the file content changed.
	async fn sync_gitignore(&self) -> Result<bool, CcError> {
		let production_gitignore = self.project.production_dir.join(".gitignore");
		let work_gitignore = self.project.working_dir.join(".gitignore");

		let production_content = match std::fs::read_to_string(&production_gitignore) {
			Ok(content) => content,
			Err(_) => {
				debug!("production has no .gitignore, nothing to sync");
				return Ok(false);
			}
		};

		let changed = match std::fs::read_to_string(&work_gitignore) {
			Ok(work_content) => {
				if work_content == production_content {
					false
				} else {
					let backup = std::env::temp_dir().join("cccopy.gitignore.backup");
					std::fs::copy(&work_gitignore, &backup)
						.map_err(|e| CcError::io(&backup, e))?;
					self.ui.display(Level::Warn, "Work .gitignore differs from production!");
					self.ui.display(
						Level::Warn,
						"  .gitignore can only be changed in production.",
					);
					self.ui.display(
						Level::Warn,
						&format!("  The old work copy was backed up to {}", backup.display()),
					);
					true
				}
			}
			Err(_) => {
				self.ui.display(Level::Info, "Copying .gitignore from production to work.");
				true
			}
		};

		if changed {
			std::fs::write(&work_gitignore, &production_content)
				.map_err(|e| CcError::io(&work_gitignore, e))?;
		}
		Ok(changed)
	}

	/// After an ignore-rule change the Work index must be rebuilt so newly
	/// included/excluded paths are re-evaluated.
	async fn refresh_work_index(&self) -> Result<(), CcError> {
		self.ui.display(Level::Info, "Refreshing work index after .gitignore change...");
		let work = &self.project.working_dir;
		match self.vcs.ls_files(work).await {
			Ok(tracked) if !tracked.is_empty() => {
				if let Err(e) = self.vcs.rm_cached_all(work).await {
					// Staged-content conflicts here are expected noise
					debug!("index drop reported: {}", e);
				}
				self.vcs.add_all(work, None).await?;
			}
			_ => {
				self.vcs.add_all(work, None).await?;
			}
		}
		Ok(())
	}

	/// Work-side auto-commit policy after a Download
	async fn auto_commit_work(
		&self,
		report: &DownloadReport,
		newly_added: &[String],
	) -> Result<(), CcError> {
		let work = &self.project.working_dir;

		if report.first_download && report.updated > 0 {
			self.ui.display(Level::Info, "First download - committing everything to work...");
			self.vcs.add_all(work, None).await?;
			self.vcs.commit(work, "Initial download from production", None, None).await?;
		} else if !report.first_download && !newly_added.is_empty() {
			self.ui.display(
				Level::Info,
				&format!("Committing {} newly added files...", newly_added.len()),
			);
			for rel_path in newly_added {
				self.ui.display(Level::Info, &format!("  added: {}", rel_path));
			}
			self.vcs.add(work, newly_added, None).await?;
			let message =
				format!("Auto-commit: Added {} new files from production", newly_added.len());
			self.vcs.commit(work, &message, None, None).await?;
			self.ui.display(Level::Info, "Files you were working on were left uncommitted.");
		} else if !report.first_download && report.updated > 0 {
			// Updated pre-existing files stay uncommitted so they show up in
			// Work's log as explicit user acts (or via Save).
			self.ui.display(
				Level::Info,
				&format!(
					"Downloaded {} updated files - left uncommitted, run SAVE to commit",
					report.updated
				),
			);
		} else if report.gitignore_changed {
			self.ui.display(Level::Info, ".gitignore changed - newly trackable files are staged.");
			self.ui.display(Level::Info, "Run SAVE to commit them.");
		}
		Ok(())
	}

	// ------------------------------------------------------------------
	// Upload (work -> production)
	// ------------------------------------------------------------------

	pub async fn upload(&self) -> Result<UploadReport, CcError> {
		self.ui.display(Level::Info, "=== UPLOAD (work -> production) ===");

		if !self.vcs.is_repo(&self.project.working_dir).await {
			return Err(CcError::Other {
				message: "Work repository missing - run DOWNLOAD first".to_string(),
			});
		}
		if !self.project.production_dir.exists() {
			return Err(CcError::Other {
				message: format!(
					"Production directory does not exist: {}",
					self.project.production_dir.display()
				),
			});
		}

		let mut lock = self.lock_production().await?;
		let result = self.upload_locked().await;
		lock.release().await;
		result
	}

	async fn upload_locked(&self) -> Result<UploadReport, CcError> {
		self.capture_direct_edits().await?;

		// Somebody else may have uploaded since the last download
		if let (Ok(Some(head)), Some(tag)) =
			(self.vcs.head(&self.project.production_dir).await, self.tags.read())
		{
			if head != tag.commit {
				self.ui.display(
					Level::Warn,
					"Production history moved since your last download.",
				);
				let reply = self.ui.prompt(Prompt::YesNo {
					message: "Production has new commits. Upload anyway? (Download first is safer)",
					title: "Production moved",
					default_yes: false,
				});
				if reply != Reply::Yes {
					self.ui.display(Level::Info, "Upload cancelled.");
					return Err(CcError::Aborted);
				}
			}
		}

		self.ui.display(Level::Info, "Searching for uploadable files...");
		let gitignore = load_gitignore(&self.project.production_dir);
		let files = self.sources.collect(
			&self.project.production_dir,
			Some(&self.project.working_dir),
			gitignore.as_ref(),
		);

		let classifier = self.classifier().await;
		let mut modified: Vec<String> = Vec::new();
		let mut conflicted: Vec<String> = Vec::new();
		for (_, rel_path) in &files {
			// Production owns .gitignore; it is never uploaded
			if rel_path == ".gitignore" {
				continue;
			}
			if !self.project.working_dir.join(rel_path).exists() {
				continue;
			}
			match classifier.state_of(rel_path).await {
				FileState::Modified => modified.push(rel_path.clone()),
				FileState::Conflicted => conflicted.push(rel_path.clone()),
				_ => {}
			}
		}

		if !conflicted.is_empty() {
			self.ui.display(Level::Warn, "Conflicted files detected:");
			for rel_path in &conflicted {
				self.ui.display(Level::Warn, &format!("  [conflict] {}", rel_path));
			}
			return Err(CcError::Other {
				message: "Conflicted files present - resolve conflicts first (run DOWNLOAD)"
					.to_string(),
			});
		}

		if modified.is_empty() {
			self.ui.display(Level::Info, "No modified files to upload.");
			self.ui.display(Level::Info, "  Only files you changed in work are uploadable.");
			return Ok(UploadReport::default());
		}

		self.ui.display(Level::Info, &format!("{} uploadable files found:", modified.len()));
		for rel_path in modified.iter().take(5) {
			self.ui.display(Level::Info, &format!("  - [M] {}", rel_path));
		}
		if modified.len() > 5 {
			self.ui.display(Level::Info, &format!("  ... and {} more", modified.len() - 5));
		}

		let reply = self.ui.prompt(Prompt::YesNo {
			message: "Upload these files to production?",
			title: "Confirm upload",
			default_yes: false,
		});
		if reply != Reply::Yes {
			self.ui.display(Level::Info, "Upload cancelled.");
			return Err(CcError::Aborted);
		}

		let message = match self.ui.prompt(Prompt::Input {
			message: "Upload comment",
			title: "Commit message",
			default: "Upload from work directory",
		}) {
			Reply::Text(text) if !text.trim().is_empty() => text,
			Reply::Text(_) => "Upload from work directory".to_string(),
			_ => return Err(CcError::Aborted),
		};

		self.ui.display(Level::Info, "Uploading files...");
		let mut report = UploadReport { uploaded: 0, message: message.clone() };
		for rel_path in &modified {
			let production_file = self.project.production_dir.join(rel_path);
			let work_file = self.project.working_dir.join(rel_path);

			self.backup_production_file(&production_file).await?;

			let command = format!(
				"mkdir -p {} && cp -p {} {}",
				sh_quote(
					&production_file
						.parent()
						.unwrap_or(&self.project.production_dir)
						.to_string_lossy()
				),
				sh_quote(&work_file.to_string_lossy()),
				sh_quote(&production_file.to_string_lossy())
			);
			self.privilege
				.run(
					&command,
					Duration::from_secs(30),
					true,
					&format!("Copy to production ({})", rel_path),
				)
				.await?;
			self.ui.display(Level::Info, &format!("  uploaded: {}", rel_path));
			report.uploaded += 1;
		}

		let privilege = Some(self.privilege.as_ref());
		self.vcs.add(&self.project.production_dir, &modified, privilege).await?;
		self.vcs
			.commit(&self.project.production_dir, &message, Some(&Self::author_string()), privilege)
			.await?;
		self.ui.display(Level::Info, &format!("Upload committed: {}", message));

		let hash = sources_hash(&self.project.sources);
		self.tags.save(self.vcs.as_ref(), &self.project.production_dir, Some(&hash)).await?;
		self.ui.display(Level::Info, "Upload finished successfully.");
		Ok(report)
	}

	/// Copy the current Production file aside before it is overwritten,
	/// enforcing the per-basename retention count (oldest removed first).
	async fn backup_production_file(&self, production_file: &Path) -> Result<(), CcError> {
		let count = self.project.backup_count;
		if count == 0 {
			return Ok(());
		}

		let file_dir = match production_file.parent() {
			Some(dir) => dir,
			None => return Ok(()),
		};
		let backup_dir = file_dir.join("backup");
		let original = match production_file.file_name() {
			Some(name) => name.to_string_lossy().to_string(),
			None => return Ok(()),
		};

		// Retention: collect existing backups for this basename, oldest first
		let mut existing: Vec<(u32, PathBuf)> = match std::fs::read_dir(&backup_dir) {
			Ok(entries) => entries
				.filter_map(|e| e.ok())
				.map(|e| e.path())
				.filter(|p| p.is_file())
				.filter_map(|p| {
					let name = p.file_name()?.to_string_lossy().to_string();
					Some((parse_backup_index(&name, &original)?, p))
				})
				.collect(),
			Err(_) => Vec::new(),
		};
		existing.sort_by_key(|(index, _)| *index);

		while existing.len() >= count as usize {
			let (_, oldest) = existing.remove(0);
			let command = format!("rm -f {}", sh_quote(&oldest.to_string_lossy()));
			self.privilege
				.run(&command, Duration::from_secs(10), false, "Remove oldest backup")
				.await?;
			self.ui.display(
				Level::Info,
				&format!(
					"  removed old backup: {}",
					oldest.file_name().unwrap_or_default().to_string_lossy()
				),
			);
		}

		let next_index = existing.last().map(|(index, _)| index + 1).unwrap_or(0);
		let timestamp = Local::now().format("%y%m%d%H%M");
		let backup_name = format!("{}_cccopy_{:06}_{}", original, next_index, timestamp);
		let backup_path = backup_dir.join(&backup_name);

		// Existence of the original is checked inside the escalated command
		let command = format!(
			"[ -f {prod} ] && mkdir -p {dir} && cp -p {prod} {dest} || true",
			prod = sh_quote(&production_file.to_string_lossy()),
			dir = sh_quote(&backup_dir.to_string_lossy()),
			dest = sh_quote(&backup_path.to_string_lossy())
		);
		self.privilege
			.run(&command, Duration::from_secs(10), false, &format!("Backup file ({})", original))
			.await?;
		Ok(())
	}

	// ------------------------------------------------------------------
	// Save (commit work)
	// ------------------------------------------------------------------

	pub async fn save(&self) -> Result<SaveReport, CcError> {
		self.ui.display(Level::Info, "=== SAVE (commit work repository) ===");

		if !self.vcs.is_repo(&self.project.working_dir).await {
			return Err(CcError::Other {
				message: "Work repository missing - run DOWNLOAD first".to_string(),
			});
		}

		if !self.vcs.has_changes(&self.project.working_dir).await? {
			self.ui.display(Level::Info, "Nothing to commit.");
			return Ok(SaveReport::default());
		}

		let status = self.vcs.status_short(&self.project.working_dir).await?;
		let mut in_sources: Vec<String> = Vec::new();
		let mut outside: Vec<String> = Vec::new();
		for entry in &status {
			if self.sources.accepts(&entry.path) {
				in_sources.push(entry.path.clone());
			} else {
				outside.push(entry.path.clone());
			}
		}

		if !outside.is_empty() {
			self.ui.display(Level::Warn, "Changed files outside the SOURCES patterns:");
			for rel_path in outside.iter().take(5) {
				self.ui.display(Level::Warn, &format!("  - {}", rel_path));
			}
			if outside.len() > 5 {
				self.ui.display(Level::Warn, &format!("  ... and {} more", outside.len() - 5));
			}
			self.ui.display(Level::Warn, "These files are excluded from SAVE.");
		}

		if in_sources.is_empty() {
			self.ui.display(Level::Info, "No changes inside the SOURCES patterns.");
			return Ok(SaveReport { committed: 0, outside_sources: outside.len() });
		}

		self.ui.display(
			Level::Info,
			&format!("{} changed files match the SOURCES patterns", in_sources.len()),
		);

		let message = match self.ui.prompt(Prompt::Input {
			message: "Commit message",
			title: "Save",
			default: "Work changes",
		}) {
			Reply::Text(text) if !text.trim().is_empty() => text,
			Reply::Text(_) => "Work changes".to_string(),
			_ => {
				self.ui.display(Level::Info, "Save cancelled.");
				return Err(CcError::Aborted);
			}
		};

		self.vcs.add(&self.project.working_dir, &in_sources, None).await?;
		self.vcs.commit(&self.project.working_dir, &message, None, None).await?;
		self.ui.display(Level::Info, &format!("Committed {} files: {}", in_sources.len(), message));
		Ok(SaveReport { committed: in_sources.len(), outside_sources: outside.len() })
	}

	// ------------------------------------------------------------------
	// Rollback (work only) and Export (production only)
	// ------------------------------------------------------------------

	/// Restore the Work tree to the post-state of `commit`. Later commits are
	/// reverted as an uncommitted staged change for the user to Save.
	pub async fn rollback(&self, commit: &str) -> Result<(), CcError> {
		if !self.vcs.is_repo(&self.project.working_dir).await {
			return Err(CcError::Other {
				message: "Work repository missing - run DOWNLOAD first".to_string(),
			});
		}

		let reply = self.ui.prompt(Prompt::YesNo {
			message: "Uncommitted work will be discarded. Continue with the rollback?",
			title: "Rollback",
			default_yes: false,
		});
		if reply != Reply::Yes {
			return Err(CcError::Aborted);
		}

		self.vcs.checkout_head(&self.project.working_dir, ".").await?;

		let head = self.vcs.head(&self.project.working_dir).await?.ok_or_else(|| {
			CcError::Other { message: "Work repository has no commits".to_string() }
		})?;
		if head.starts_with(commit) {
			// Selected commit is HEAD; discarding local edits was enough
			self.ui.display(Level::Info, "Working tree restored to HEAD.");
			return Ok(());
		}

		// Undo the selected commit and everything after it, so the tree ends
		// at the previous commit's post-state. A selected commit without a
		// parent can only drop the commits above it.
		let parent = format!("{}~1", commit);
		let from = if self.vcs.commit_exists(&self.project.working_dir, &parent).await {
			parent
		} else {
			commit.to_string()
		};
		self.vcs.revert_range(&self.project.working_dir, &from).await?;
		self.ui.display(
			Level::Info,
			"Rollback staged as an uncommitted change - review it and run SAVE to commit.",
		);
		Ok(())
	}

	/// Write a zip archive of a Production commit. Returns the archive path.
	pub async fn export(&self, commit: &str, out: Option<PathBuf>) -> Result<PathBuf, CcError> {
		if !self.project.production_dir.exists() {
			return Err(CcError::Other {
				message: format!(
					"Production directory does not exist: {}",
					self.project.production_dir.display()
				),
			});
		}

		let out_path = out.unwrap_or_else(|| {
			let short: String = commit.chars().take(7).collect();
			std::env::temp_dir().join(format!(
				"{}_{}.zip",
				sanitize_filename(&self.project.name),
				sanitize_filename(&short)
			))
		});

		let mut lock = self.lock_production().await?;
		let result =
			self.vcs.archive_zip(&self.project.production_dir, commit, &out_path).await;
		lock.release().await;
		result?;

		self.ui.display(Level::Info, &format!("Exported {} to {}", commit, out_path.display()));
		Ok(out_path)
	}

	// ------------------------------------------------------------------
	// History
	// ------------------------------------------------------------------

	/// Production log rows, fetched under the Production lock
	pub async fn production_history(
		&self,
		limit: Option<usize>,
	) -> Result<Vec<crate::vcs::LogEntry>, CcError> {
		if !self.project.production_dir.exists() {
			return Err(CcError::Other {
				message: format!(
					"Production directory does not exist: {}",
					self.project.production_dir.display()
				),
			});
		}
		let mut lock = self.lock_production().await?;
		let result = self.vcs.log(&self.project.production_dir, limit).await;
		lock.release().await;
		result
	}

	pub async fn work_history(
		&self,
		limit: Option<usize>,
	) -> Result<Vec<crate::vcs::LogEntry>, CcError> {
		if !self.vcs.is_repo(&self.project.working_dir).await {
			return Err(CcError::Other {
				message: "Work repository missing - run DOWNLOAD first".to_string(),
			});
		}
		self.vcs.log(&self.project.working_dir, limit).await
	}

	/// Files touched by one Production commit, for the history detail view
	pub async fn production_commit_files(
		&self,
		commit: &str,
	) -> Result<Vec<crate::vcs::CommitFile>, CcError> {
		self.vcs.files_in_commit(&self.project.production_dir, commit).await
	}
}

fn copy_preserving_mtime(from: &Path, to: &Path) -> Result<(), CcError> {
	if let Some(parent) = to.parent() {
		std::fs::create_dir_all(parent).map_err(|e| CcError::io(parent, e))?;
	}
	std::fs::copy(from, to).map_err(|e| CcError::io(to, e))?;
	if let Ok(meta) = std::fs::metadata(from) {
		let mtime = filetime::FileTime::from_last_modification_time(&meta);
		let _ = filetime::set_file_mtime(to, mtime);
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_backup_index_round_trip() {
		let name = format!("a.c_cccopy_{:06}_2607281530", 42);
		assert_eq!(parse_backup_index(&name, "a.c"), Some(42));
	}

	#[test]
	fn test_parse_backup_index_rejects_foreign_files() {
		assert_eq!(parse_backup_index("a.c_cccopy_000001_2607281530", "b.c"), None);
		assert_eq!(parse_backup_index("a.c_backup_000001_2607281530", "a.c"), None);
		assert_eq!(parse_backup_index("a.c_cccopy_1_2607281530", "a.c"), None);
		assert_eq!(parse_backup_index("a.c_cccopy_xxxxxx_2607281530", "a.c"), None);
	}

	#[test]
	fn test_parse_backup_index_orders_for_deletion() {
		let mut names: Vec<String> =
			(0..4).map(|i| format!("a.c_cccopy_{:06}_2607281530", i)).collect();
		names.reverse();
		let mut indices: Vec<u32> =
			names.iter().filter_map(|n| parse_backup_index(n, "a.c")).collect();
		indices.sort();
		assert_eq!(indices, vec![0, 1, 2, 3]);
	}
}

// vim: ts=4

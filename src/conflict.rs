//! Interactive conflict mediation
//!
//! For every conflicted path the user picks one of four ways out: inspect
//! the two versions in an external diff tool (and come back to the menu),
//! take Production's version, push the Work version up to Production, or
//! skip. Skipped files stay conflicted and keep the tag from advancing.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use crate::difftool;
use crate::error::CcError;
use crate::privilege::GroupPrivilege;
use crate::ui::{Level, Prompt, Reply, UiHandler};
use crate::util::{current_user, sh_quote};
use crate::vcs::{Vcs, USER_MAIL_DOMAIN};

/// What the user decided for one conflicted file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
	/// The file now agrees between Work and Production
	Resolved,

	/// Left alone; stays conflicted for the next operation
	Skipped,
}

const MENU: [&str; 4] = [
	"Open external diff (manual merge, then choose again)",
	"Take production version (discard work changes)",
	"Take work version (upload to production)",
	"Skip (resolve later)",
];

/// Drives the per-file conflict menu and reflects the outcome into both
/// repositories. Constructed by the engine while the Production lock is held.
pub struct ConflictMediator<'a> {
	vcs: &'a dyn Vcs,
	ui: &'a dyn UiHandler,
	privilege: &'a GroupPrivilege,
	production_dir: &'a Path,
	work_dir: &'a Path,
}

impl<'a> ConflictMediator<'a> {
	pub fn new(
		vcs: &'a dyn Vcs,
		ui: &'a dyn UiHandler,
		privilege: &'a GroupPrivilege,
		production_dir: &'a Path,
		work_dir: &'a Path,
	) -> Self {
		ConflictMediator { vcs, ui, privilege, production_dir, work_dir }
	}

	pub async fn mediate(&self, rel_path: &str) -> Result<ConflictOutcome, CcError> {
		let production_file = self.production_dir.join(rel_path);
		let work_file = self.work_dir.join(rel_path);

		loop {
			self.ui.display(Level::Warn, &format!("Conflict detected: {}", rel_path));
			self.ui.display(Level::Info, &format!("  Production: {}", production_file.display()));
			self.ui.display(Level::Info, &format!("  Work:       {}", work_file.display()));

			let reply = self.ui.prompt(Prompt::Choice {
				message: &format!("How should {} be resolved?", rel_path),
				title: "Resolve conflict",
				options: &MENU,
				default: 3,
			});

			match reply {
				Reply::Choice(0) => {
					self.show_external_diff(&production_file, &work_file, rel_path).await?;
					// No resolution is inferred from the tool exit; ask again
					continue;
				}
				Reply::Choice(1) => {
					self.take_production(&production_file, &work_file, rel_path).await?;
					return Ok(ConflictOutcome::Resolved);
				}
				Reply::Choice(2) => {
					self.take_work(&production_file, &work_file, rel_path).await?;
					return Ok(ConflictOutcome::Resolved);
				}
				_ => {
					self.ui.display(
						Level::Info,
						&format!("{} skipped - handle it in a later download", rel_path),
					);
					return Ok(ConflictOutcome::Skipped);
				}
			}
		}
	}

	/// Copy Production's version to a read-only temp file and diff it
	/// against the editable Work file.
	async fn show_external_diff(
		&self,
		production_file: &Path,
		work_file: &Path,
		rel_path: &str,
	) -> Result<(), CcError> {
		let basename = production_file
			.file_name()
			.map(|n| n.to_string_lossy().to_string())
			.unwrap_or_else(|| "file".to_string());
		let mut temp = tempfile::Builder::new()
			.prefix(&format!("production_{}_", basename))
			.suffix(".readonly")
			.tempfile()
			.map_err(|e| CcError::io(production_file, e))?;

		let content =
			std::fs::read(production_file).map_err(|e| CcError::io(production_file, e))?;
		temp.write_all(&content).map_err(|e| CcError::io(temp.path(), e))?;
		temp.flush().map_err(|e| CcError::io(temp.path(), e))?;

		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			let _ = std::fs::set_permissions(temp.path(), std::fs::Permissions::from_mode(0o444));
		}

		self.ui.display(Level::Info, "Left: production (read-only), right: work (editable)");
		difftool::run_diff(temp.path(), work_file, &format!("conflict {}", rel_path), self.ui)
			.await;
		self.ui.display(Level::Info, "Choose how to resolve the conflict again.");
		Ok(())
	}

	/// Take theirs: overwrite Work with Production's file and stage the Work
	/// copy so the next status reflects the resolution.
	async fn take_production(
		&self,
		production_file: &Path,
		work_file: &Path,
		rel_path: &str,
	) -> Result<(), CcError> {
		std::fs::copy(production_file, work_file)
			.map_err(|e| CcError::io(work_file, e))?;
		if let Ok(meta) = std::fs::metadata(production_file) {
			let mtime = filetime::FileTime::from_last_modification_time(&meta);
			let _ = filetime::set_file_mtime(work_file, mtime);
		}

		self.vcs.add(self.work_dir, &[rel_path.to_string()], None).await?;
		self.ui.display(Level::Info, "Work file updated to the production version.");
		Ok(())
	}

	/// Take mine: copy Work to Production under the escalator, then stage and
	/// commit Production.
	async fn take_work(
		&self,
		production_file: &Path,
		work_file: &Path,
		rel_path: &str,
	) -> Result<(), CcError> {
		self.ui.display(Level::Info, "Uploading work version to production...");

		let command = format!(
			"cp -p {} {}",
			sh_quote(&work_file.to_string_lossy()),
			sh_quote(&production_file.to_string_lossy())
		);
		self.privilege
			.run(
				&command,
				Duration::from_secs(30),
				true,
				&format!("Resolve conflict: copy work to production ({})", rel_path),
			)
			.await?;

		let user = current_user();
		let author = format!("{} <{}@{}>", user, user, USER_MAIL_DOMAIN);
		self.vcs
			.add(self.production_dir, &[rel_path.to_string()], Some(self.privilege))
			.await?;
		self.vcs
			.commit(
				self.production_dir,
				"Resolve conflict: Use work version",
				Some(&author),
				Some(self.privilege),
			)
			.await?;

		self.ui.display(Level::Info, "Conflict resolved with the work version.");
		Ok(())
	}
}

// vim: ts=4

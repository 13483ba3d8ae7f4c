//! Three-way file-state classification
//!
//! A file is compared across Work, Production, and the tagged Production
//! baseline using VCS blob identities. The decision table is pure; the
//! `Classifier` wrapper resolves the three blob ids and fails closed to
//! `Conflicted` when hashing errors out.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::logging::debug;
use crate::tag::Tag;
use crate::vcs::{BlobId, Vcs};

/// State of a single file relative to Work, Production and the baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileState {
	Same,
	Modified,
	Updated,
	Conflicted,
	/// UI-only placeholder while a classification is in flight
	Pending,
}

impl fmt::Display for FileState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			FileState::Same => "same",
			FileState::Modified => "modified",
			FileState::Updated => "updated",
			FileState::Conflicted => "conflicted",
			FileState::Pending => "pending",
		};
		write!(f, "{}", s)
	}
}

/// The three-way decision table. Missing-file special cases apply first,
/// then hash equality decides:
///
/// | work vs base | work vs prod | base vs prod | result     |
/// |--------------|--------------|--------------|------------|
/// | =            | =            | =            | Same       |
/// | =            | ≠            | ≠            | Updated    |
/// | ≠            | ≠            | =            | Modified   |
/// | ≠            | =            | ≠            | Same       |
/// | ≠            | ≠            | ≠            | Conflicted |
pub fn classify(work: &BlobId, base: &BlobId, prod: &BlobId) -> FileState {
	// Special cases precede the general table
	if work.is_missing() && !prod.is_missing() {
		return FileState::Updated;
	}
	if !work.is_missing() && prod.is_missing() {
		return FileState::Modified;
	}

	let work_eq_base = work == base;
	let work_eq_prod = work == prod;
	let base_eq_prod = base == prod;

	if work_eq_base && work_eq_prod && base_eq_prod {
		FileState::Same
	} else if work_eq_base && !base_eq_prod {
		FileState::Updated
	} else if !work_eq_base && base_eq_prod {
		FileState::Modified
	} else if !work_eq_base && work_eq_prod {
		FileState::Same
	} else {
		FileState::Conflicted
	}
}

/// Resolves blob identities for one project and applies the table
pub struct Classifier {
	vcs: Arc<dyn Vcs>,
	production_dir: PathBuf,
	work_dir: PathBuf,
	base_commit: Option<String>,
}

impl Classifier {
	/// Build a classifier against the given tag.
	///
	/// A missing tag, or a tag whose commit is no longer in Production's
	/// history (inconsistent state), makes every tracked file classify as
	/// `Updated` so the next Download re-reconciles everything.
	pub async fn new(
		vcs: Arc<dyn Vcs>,
		production_dir: PathBuf,
		work_dir: PathBuf,
		tag: Option<&Tag>,
	) -> Self {
		let base_commit = match tag {
			Some(tag) => {
				if vcs.commit_exists(&production_dir, &tag.commit).await {
					Some(tag.commit.clone())
				} else {
					debug!(
						"tag commit {} not in production history, treating all files as updated",
						tag.commit
					);
					None
				}
			}
			None => None,
		};
		Classifier { vcs, production_dir, work_dir, base_commit }
	}

	/// The validated baseline commit, if any
	pub fn base_commit(&self) -> Option<&str> {
		self.base_commit.as_deref()
	}

	/// Classify a single relative path
	pub async fn state_of(&self, rel_path: &str) -> FileState {
		let base_commit = match &self.base_commit {
			Some(commit) => commit,
			// First download
			None => return FileState::Updated,
		};

		let hashes = self.resolve(rel_path, base_commit).await;
		match hashes {
			Ok((work, base, prod)) => classify(&work, &base, &prod),
			Err(e) => {
				// Fail closed: a file we cannot hash must be looked at
				debug!("hashing failed for {}: {}", rel_path, e);
				FileState::Conflicted
			}
		}
	}

	async fn resolve(
		&self,
		rel_path: &str,
		base_commit: &str,
	) -> Result<(BlobId, BlobId, BlobId), crate::error::CcError> {
		let work = self.vcs.blob_id(&self.work_dir, rel_path).await?;
		let prod = self.vcs.blob_id(&self.production_dir, rel_path).await?;
		let base = self.vcs.blob_id_in_commit(&self.production_dir, base_commit, rel_path).await?;
		Ok((work, base, prod))
	}

	pub fn work_dir(&self) -> &Path {
		&self.work_dir
	}

	pub fn production_dir(&self) -> &Path {
		&self.production_dir
	}
}


// vim: ts=4

//! Production tag persistence
//!
//! The tag anchors the Production commit the local Work was last reconciled
//! against. Format on disk is one line, `<commit>` (legacy) or
//! `<commit>:<sources-hash>` where the hash is the CRC-32 of the sorted
//! SOURCES pattern list. The tag is written only at the end of a successful
//! Download with no unresolved conflicts and at the end of a successful
//! Upload.

use std::path::{Path, PathBuf};

use crate::error::CcError;
use crate::logging::debug;
use crate::vcs::Vcs;

/// Parsed production tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
	pub commit: String,
	pub sources_hash: Option<String>,
}

/// Parse tag file content; legacy commit-only tags read with an absent hash
pub fn parse_tag(content: &str) -> Option<Tag> {
	let line = content.trim();
	if line.is_empty() {
		return None;
	}
	match line.split_once(':') {
		Some((commit, hash)) => {
			Some(Tag { commit: commit.to_string(), sources_hash: Some(hash.to_string()) })
		}
		None => Some(Tag { commit: line.to_string(), sources_hash: None }),
	}
}

/// CRC-32 fingerprint of a SOURCES pattern list
///
/// Patterns are sorted before hashing so ordering changes do not count as a
/// SOURCES change. An empty list hashes to "00000000".
pub fn sources_hash(patterns: &[String]) -> String {
	if patterns.is_empty() {
		return "00000000".to_string();
	}
	let mut sorted: Vec<&str> = patterns.iter().map(|s| s.as_str()).collect();
	sorted.sort_unstable();
	let joined = sorted.join("|");
	format!("{:08x}", crc32fast::hash(joined.as_bytes()))
}

/// Reads and writes the per-project production tag file
pub struct TagStore {
	tag_file: PathBuf,
}

impl TagStore {
	/// `status_dir` is the project's private state directory
	/// (~/.cccopy/project/<NNNN>/status)
	pub fn new(status_dir: &Path) -> Self {
		TagStore { tag_file: status_dir.join("production.tag") }
	}

	pub fn path(&self) -> &Path {
		&self.tag_file
	}

	pub fn exists(&self) -> bool {
		self.tag_file.exists() && self.read().is_some()
	}

	/// Read the tag; missing or empty file yields None
	pub fn read(&self) -> Option<Tag> {
		let content = std::fs::read_to_string(&self.tag_file).ok()?;
		parse_tag(&content)
	}

	/// Record Production's current head, optionally with the SOURCES hash.
	/// The write is atomic (temp file + rename).
	pub async fn save(
		&self,
		vcs: &dyn Vcs,
		production_dir: &Path,
		sources_hash: Option<&str>,
	) -> Result<(), CcError> {
		let head = vcs.head(production_dir).await?.ok_or_else(|| CcError::Other {
			message: format!("Cannot tag {}: no HEAD commit", production_dir.display()),
		})?;

		let content = match sources_hash {
			Some(hash) => format!("{}:{}", head, hash),
			None => head,
		};
		debug!("saving production tag: {}", content);

		if let Some(parent) = self.tag_file.parent() {
			std::fs::create_dir_all(parent).map_err(|e| CcError::io(parent, e))?;
		}
		let tmp = self.tag_file.with_extension("tag.tmp");
		std::fs::write(&tmp, &content).map_err(|e| CcError::io(&tmp, e))?;
		std::fs::rename(&tmp, &self.tag_file).map_err(|e| CcError::io(&self.tag_file, e))?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_enhanced_tag() {
		let tag = parse_tag("abc123def456:7f8a9b2c\n").unwrap();
		assert_eq!(tag.commit, "abc123def456");
		assert_eq!(tag.sources_hash.as_deref(), Some("7f8a9b2c"));
	}

	#[test]
	fn test_parse_legacy_tag() {
		let tag = parse_tag("abc123def456").unwrap();
		assert_eq!(tag.commit, "abc123def456");
		assert_eq!(tag.sources_hash, None);
	}

	#[test]
	fn test_parse_empty() {
		assert_eq!(parse_tag(""), None);
		assert_eq!(parse_tag("   \n"), None);
	}

	#[test]
	fn test_sources_hash_order_independent() {
		let a = sources_hash(&["AAA/**".to_string(), "BBB/*.py".to_string()]);
		let b = sources_hash(&["BBB/*.py".to_string(), "AAA/**".to_string()]);
		assert_eq!(a, b);
		assert_eq!(a.len(), 8);
	}

	#[test]
	fn test_sources_hash_detects_change() {
		let a = sources_hash(&["AAA/**".to_string()]);
		let b = sources_hash(&["AAA/**".to_string(), "BBB/**".to_string()]);
		assert_ne!(a, b);
	}

	#[test]
	fn test_sources_hash_empty() {
		assert_eq!(sources_hash(&[]), "00000000");
	}

	#[test]
	fn test_store_missing_reads_none() {
		let tmp = tempfile::TempDir::new().unwrap();
		let store = TagStore::new(tmp.path());
		assert!(!store.exists());
		assert_eq!(store.read(), None);
	}
}

// vim: ts=4

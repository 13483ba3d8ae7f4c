//! SOURCES/EXCLUDES pattern matching and file collection
//!
//! Pattern semantics:
//! - `AAA/**` matches any path whose first segment is `AAA`
//! - `AAA/*` matches any direct child file of `AAA`
//! - `**/NAME` matches any path ending in `NAME` at any depth
//! - plain glob characters follow POSIX glob semantics
//! - a trailing `/` restricts a pattern to directories
//!
//! EXCLUDES are applied after SOURCES. The matcher does no I/O beyond
//! directory enumeration; it never stats or hashes file content.

use globset::{GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::PatternError;
use crate::logging::debug;

/// One segment of a segmented source pattern, used for the directory-prefix
/// predicate that keeps the browser from descending into dead branches
enum Segment {
	/// `**` - matches everything from here on
	Any,
	Glob(GlobMatcher),
}

/// Compiled SOURCES/EXCLUDES pattern set for one project
pub struct SourceSet {
	sources: Vec<String>,
	source_files: GlobSet,
	source_dirs: GlobSet,
	exclude_files: GlobSet,
	exclude_dirs: GlobSet,
	segmented: Vec<Vec<Segment>>,
}

fn compile_glob(pattern: &str) -> Result<globset::Glob, PatternError> {
	GlobBuilder::new(pattern)
		.literal_separator(true)
		.build()
		.map_err(|e| PatternError::Invalid { pattern: pattern.to_string(), message: e.to_string() })
}

/// Split a pattern list into (file globs, directory-only globs); a trailing
/// slash marks a directory-only pattern
fn build_sets(patterns: &[String]) -> Result<(GlobSet, GlobSet), PatternError> {
	let mut files = GlobSetBuilder::new();
	let mut dirs = GlobSetBuilder::new();
	for pattern in patterns {
		match pattern.strip_suffix('/') {
			Some(dir_pattern) => {
				dirs.add(compile_glob(dir_pattern)?);
			}
			None => {
				files.add(compile_glob(pattern)?);
			}
		}
	}
	let files = files.build().map_err(|e| PatternError::Invalid {
		pattern: patterns.join(","),
		message: e.to_string(),
	})?;
	let dirs = dirs.build().map_err(|e| PatternError::Invalid {
		pattern: patterns.join(","),
		message: e.to_string(),
	})?;
	Ok((files, dirs))
}

fn segment_pattern(pattern: &str) -> Result<Vec<Segment>, PatternError> {
	pattern
		.trim_end_matches('/')
		.split('/')
		.map(|seg| {
			if seg == "**" {
				Ok(Segment::Any)
			} else {
				Ok(Segment::Glob(compile_glob(seg)?.compile_matcher()))
			}
		})
		.collect()
}

/// Proper ancestors of a relative path, shallowest first
/// ("AAA/b/c.txt" yields "AAA", "AAA/b")
fn ancestors(rel: &str) -> impl Iterator<Item = &str> {
	rel.match_indices('/').map(move |(i, _)| &rel[..i])
}

impl SourceSet {
	pub fn new(sources: &[String], excludes: &[String]) -> Result<Self, PatternError> {
		let (source_files, source_dirs) = build_sets(sources)?;
		let (exclude_files, exclude_dirs) = build_sets(excludes)?;
		let segmented =
			sources.iter().map(|p| segment_pattern(p)).collect::<Result<Vec<_>, _>>()?;

		Ok(SourceSet {
			sources: sources.to_vec(),
			source_files,
			source_dirs,
			exclude_files,
			exclude_dirs,
			segmented,
		})
	}

	/// The original SOURCES pattern strings
	pub fn sources(&self) -> &[String] {
		&self.sources
	}

	/// Does any SOURCES pattern match this relative file path?
	pub fn matches_source(&self, rel: &str) -> bool {
		if self.source_files.is_match(rel) {
			return true;
		}
		ancestors(rel).any(|dir| self.source_dirs.is_match(dir))
	}

	/// Is this relative path dropped by an EXCLUDES pattern?
	pub fn is_excluded(&self, rel: &str) -> bool {
		if self.exclude_files.is_match(rel) {
			return true;
		}
		ancestors(rel).any(|dir| self.exclude_dirs.is_match(dir))
	}

	/// Included by SOURCES and not dropped by EXCLUDES
	pub fn accepts(&self, rel: &str) -> bool {
		self.matches_source(rel) && !self.is_excluded(rel)
	}

	/// Could any SOURCES pattern match something under this directory?
	///
	/// Works on pattern prefixes, not a tree walk: each pattern is split into
	/// segments and the candidate directory is tested as a prefix. Deep empty
	/// branches collapse in the browser because this returns false for them.
	pub fn could_contain(&self, dir_rel: &str) -> bool {
		if dir_rel.is_empty() {
			return true;
		}
		let dir_segments: Vec<&str> = dir_rel.split('/').collect();
		self.segmented.iter().any(|segments| {
			let mut i = 0;
			for name in &dir_segments {
				match segments.get(i) {
					Some(Segment::Any) => return true,
					Some(Segment::Glob(glob)) if glob.is_match(name) => i += 1,
					_ => return false,
				}
			}
			// Directory consumed as a matching prefix; the pattern can only
			// reach deeper entries if it still has segments left.
			i < segments.len()
		})
	}

	/// Enumerate project files as `(absolute-path, relative-path)` pairs.
	///
	/// Files are yielded from `production_dir`; when `work_dir` is given,
	/// files present only in Work whose relative path matches SOURCES are
	/// included too, mapped to their Production target path. The optional
	/// gitignore filter drops ignored paths.
	pub fn collect(
		&self,
		production_dir: &Path,
		work_dir: Option<&Path>,
		gitignore: Option<&Gitignore>,
	) -> Vec<(PathBuf, String)> {
		let mut matched: BTreeMap<String, PathBuf> = BTreeMap::new();

		self.walk(production_dir, "", false, gitignore, &mut |rel| {
			matched.entry(rel.to_string()).or_insert_with(|| production_dir.join(rel));
		});

		if let Some(work_dir) = work_dir {
			self.walk(work_dir, "", false, gitignore, &mut |rel| {
				matched.entry(rel.to_string()).or_insert_with(|| production_dir.join(rel));
			});
		}

		matched.into_iter().map(|(rel, abs)| (abs, rel)).collect()
	}

	fn walk(
		&self,
		dir: &Path,
		rel_prefix: &str,
		in_source_dir: bool,
		gitignore: Option<&Gitignore>,
		yield_file: &mut dyn FnMut(&str),
	) {
		let entries = match std::fs::read_dir(dir) {
			Ok(entries) => entries,
			Err(e) => {
				debug!("cannot enumerate {}: {}", dir.display(), e);
				return;
			}
		};

		for entry in entries.filter_map(|e| e.ok()) {
			let name = entry.file_name();
			let name = name.to_string_lossy();
			if name == ".git" || name == ".cccopy" {
				continue;
			}
			let rel = if rel_prefix.is_empty() {
				name.to_string()
			} else {
				format!("{}/{}", rel_prefix, name)
			};
			let file_type = match entry.file_type() {
				Ok(t) => t,
				Err(_) => continue,
			};

			if file_type.is_dir() {
				if self.exclude_dirs.is_match(rel.as_str()) {
					continue;
				}
				if let Some(gitignore) = gitignore {
					if gitignore.matched_path_or_any_parents(&rel, true).is_ignore() {
						continue;
					}
				}
				let now_in_source = in_source_dir || self.source_dirs.is_match(rel.as_str());
				if now_in_source || self.could_contain(&rel) {
					self.walk(&entry.path(), &rel, now_in_source, gitignore, yield_file);
				}
			} else if file_type.is_file() {
				if !(in_source_dir || self.source_files.is_match(rel.as_str())) {
					continue;
				}
				if self.is_excluded(&rel) {
					continue;
				}
				if let Some(gitignore) = gitignore {
					if gitignore.matched_path_or_any_parents(&rel, false).is_ignore() {
						continue;
					}
				}
				yield_file(&rel);
			}
		}
	}
}

/// Build a gitignore matcher from `<dir>/.gitignore`, if present
pub fn load_gitignore(dir: &Path) -> Option<Gitignore> {
	let path = dir.join(".gitignore");
	if !path.exists() {
		return None;
	}
	let mut builder = GitignoreBuilder::new(dir);
	builder.add(&path);
	builder.build().ok()
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn set(sources: &[&str], excludes: &[&str]) -> SourceSet {
		let sources: Vec<String> = sources.iter().map(|s| s.to_string()).collect();
		let excludes: Vec<String> = excludes.iter().map(|s| s.to_string()).collect();
		SourceSet::new(&sources, &excludes).unwrap()
	}

	#[test]
	fn test_spec_pattern_table() {
		let set = set(&["AAA/**", "BBB/*.py"], &["**/backup/"]);

		assert!(set.accepts("AAA/x/y.c"));
		assert!(!set.accepts("AAA/backup/x"));
		assert!(set.accepts("BBB/x.py"));
		assert!(!set.accepts("BBB/x.txt"));
		assert!(!set.accepts("CCC/z"));
	}

	#[test]
	fn test_direct_child_only() {
		let set = set(&["AAA/*"], &[]);
		assert!(set.matches_source("AAA/a.c"));
		assert!(!set.matches_source("AAA/sub/a.c"));
		assert!(!set.matches_source("AAA"));
	}

	#[test]
	fn test_name_at_any_depth() {
		let set = set(&["**/Makefile"], &[]);
		assert!(set.matches_source("Makefile"));
		assert!(set.matches_source("a/b/Makefile"));
		assert!(!set.matches_source("a/b/Makefile.in"));
	}

	#[test]
	fn test_character_classes() {
		let set = set(&["src/v[12]/*.c"], &[]);
		assert!(set.matches_source("src/v1/a.c"));
		assert!(set.matches_source("src/v2/b.c"));
		assert!(!set.matches_source("src/v3/c.c"));
	}

	#[test]
	fn test_could_contain() {
		let set = set(&["AAA/**", "BBB/*.py"], &[]);

		assert!(set.could_contain(""));
		assert!(set.could_contain("AAA"));
		assert!(set.could_contain("AAA/deep"));
		assert!(set.could_contain("AAA/deep/deeper"));
		assert!(set.could_contain("BBB"));
		assert!(!set.could_contain("BBB/sub"));
		assert!(!set.could_contain("CCC"));
	}

	#[test]
	fn test_could_contain_star_segment() {
		let set = set(&["*/include/*.h"], &[]);
		assert!(set.could_contain("foo"));
		assert!(set.could_contain("foo/include"));
		assert!(!set.could_contain("foo/src"));
		assert!(!set.could_contain("foo/include/deep"));
	}

	#[test]
	fn test_exclude_directory_pattern() {
		let set = set(&["AAA/**"], &["**/backup/"]);
		assert!(set.is_excluded("AAA/backup/a.c"));
		assert!(set.is_excluded("AAA/x/backup/a.c"));
		// A file literally named backup is not a directory match
		assert!(!set.is_excluded("AAA/backup"));
	}

	#[test]
	fn test_collect_production_only() {
		let tmp = TempDir::new().unwrap();
		let production = tmp.path();
		std::fs::create_dir_all(production.join("AAA/x")).unwrap();
		std::fs::create_dir_all(production.join("AAA/backup")).unwrap();
		std::fs::create_dir_all(production.join("CCC")).unwrap();
		std::fs::write(production.join("AAA/a.c"), "v1").unwrap();
		std::fs::write(production.join("AAA/x/y.c"), "v1").unwrap();
		std::fs::write(production.join("AAA/backup/old.c"), "v0").unwrap();
		std::fs::write(production.join("CCC/z"), "zzz").unwrap();

		let set = set(&["AAA/**"], &["**/backup/"]);
		let files = set.collect(production, None, None);
		let rels: Vec<&str> = files.iter().map(|(_, rel)| rel.as_str()).collect();

		assert_eq!(rels, vec!["AAA/a.c", "AAA/x/y.c"]);
		assert_eq!(files[0].0, production.join("AAA/a.c"));
	}

	#[test]
	fn test_collect_includes_work_only_files() {
		let tmp = TempDir::new().unwrap();
		let production = tmp.path().join("production");
		let work = tmp.path().join("work");
		std::fs::create_dir_all(production.join("AAA")).unwrap();
		std::fs::create_dir_all(work.join("AAA")).unwrap();
		std::fs::write(production.join("AAA/a.c"), "v1").unwrap();
		std::fs::write(work.join("AAA/new.c"), "fresh").unwrap();

		let set = set(&["AAA/**"], &[]);
		let files = set.collect(&production, Some(&work), None);
		let rels: Vec<&str> = files.iter().map(|(_, rel)| rel.as_str()).collect();

		assert_eq!(rels, vec!["AAA/a.c", "AAA/new.c"]);
		// Work-only file maps to its Production target path
		assert_eq!(files[1].0, production.join("AAA/new.c"));
	}

	#[test]
	fn test_collect_respects_gitignore() {
		let tmp = TempDir::new().unwrap();
		let production = tmp.path();
		std::fs::create_dir_all(production.join("AAA")).unwrap();
		std::fs::write(production.join("AAA/a.c"), "v1").unwrap();
		std::fs::write(production.join("AAA/a.tmp"), "scratch").unwrap();
		std::fs::write(production.join(".gitignore"), "*.tmp\n").unwrap();

		let set = set(&["AAA/**"], &[]);
		let gitignore = load_gitignore(production).unwrap();
		let files = set.collect(production, None, Some(&gitignore));
		let rels: Vec<&str> = files.iter().map(|(_, rel)| rel.as_str()).collect();

		assert_eq!(rels, vec!["AAA/a.c"]);
	}

	#[test]
	fn test_collect_skips_internal_dirs() {
		let tmp = TempDir::new().unwrap();
		let production = tmp.path();
		std::fs::create_dir_all(production.join(".git")).unwrap();
		std::fs::create_dir_all(production.join(".cccopy/lock")).unwrap();
		std::fs::create_dir_all(production.join("AAA")).unwrap();
		std::fs::write(production.join("AAA/a.c"), "v1").unwrap();
		std::fs::write(production.join(".git/config"), "x").unwrap();

		// Even a catch-all source pattern must not see internal state
		let set = set(&["**/*"], &[]);
		let files = set.collect(production, None, None);
		let rels: Vec<&str> = files.iter().map(|(_, rel)| rel.as_str()).collect();

		assert_eq!(rels, vec!["AAA/a.c"]);
	}
}

// vim: ts=4

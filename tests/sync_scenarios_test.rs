//! End-to-end synchronization scenarios against the real git binary
//!
//! Each test builds a throwaway Production/Work pair, drives the engine with
//! scripted UI replies, and asserts on the resulting repositories and tag.
//! Tests return early when git is not installed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cccopy::classify::FileState;
use cccopy::engine::SyncEngine;
use cccopy::lock::LockOptions;
use cccopy::project::Project;
use cccopy::tag::{sources_hash, TagStore};
use cccopy::ui::{Reply, ScriptedHandler};
use cccopy::vcs::Git;
use tempfile::TempDir;

fn git_available() -> bool {
	std::process::Command::new("git")
		.arg("--version")
		.output()
		.map(|o| o.status.success())
		.unwrap_or(false)
}

/// Run git in a directory and return trimmed stdout
fn git(dir: &Path, args: &[&str]) -> String {
	let output = std::process::Command::new("git")
		.args(args)
		.current_dir(dir)
		.output()
		.expect("git runs");
	assert!(
		output.status.success(),
		"git {:?} failed: {}",
		args,
		String::from_utf8_lossy(&output.stderr)
	);
	String::from_utf8_lossy(&output.stdout).trim().to_string()
}

struct Fixture {
	_tmp: TempDir,
	production: PathBuf,
	work: PathBuf,
	state_dir: PathBuf,
}

impl Fixture {
	/// Production seeded with AAA/a.c and AAA/b.c at "v1", Work empty
	fn new() -> Fixture {
		let tmp = TempDir::new().unwrap();
		let production = tmp.path().join("production");
		let work = tmp.path().join("work");
		std::fs::create_dir_all(production.join("AAA")).unwrap();
		std::fs::write(production.join("AAA/a.c"), "v1").unwrap();
		std::fs::write(production.join("AAA/b.c"), "v1").unwrap();
		Fixture {
			state_dir: tmp.path().join("state").join("0001"),
			_tmp: tmp,
			production,
			work,
		}
	}

	fn project(&self, sources: &[&str]) -> Project {
		Project {
			name: "demo".to_string(),
			number: "0001".to_string(),
			production_dir: self.production.clone(),
			working_dir: self.work.clone(),
			sources: sources.iter().map(|s| s.to_string()).collect(),
			excludes: vec!["**/backup/".to_string()],
			group: None,
			backup_count: 2,
			state_dir: self.state_dir.clone(),
			tag_label: String::new(),
			create_date: String::new(),
		}
	}

	fn engine(&self, sources: &[&str], replies: Vec<Reply>) -> (SyncEngine, Arc<ScriptedHandler>) {
		let ui = Arc::new(ScriptedHandler::new(replies));
		let engine =
			SyncEngine::new(self.project(sources), Arc::new(Git::new()), ui.clone()).unwrap();
		(engine, ui)
	}

	fn tag_store(&self) -> TagStore {
		TagStore::new(&self.state_dir.join("status"))
	}
}

#[tokio::test]
async fn s1_download_bootstrap() {
	if !git_available() {
		eprintln!("git not available, skipping");
		return;
	}
	let fx = Fixture::new();
	let (engine, _ui) = fx.engine(&["AAA/**"], vec![]);

	let report = engine.download().await.unwrap();
	assert_eq!(report.updated, 2);
	assert_eq!(report.unresolved, 0);
	assert!(report.first_download);

	// Work received both files
	assert_eq!(std::fs::read_to_string(fx.work.join("AAA/a.c")).unwrap(), "v1");
	assert_eq!(std::fs::read_to_string(fx.work.join("AAA/b.c")).unwrap(), "v1");

	// Production became a repository with a single bootstrap commit
	assert!(fx.production.join(".git").is_dir());
	assert_eq!(git(&fx.production, &["log", "--pretty=%s"]), "Initial production repository");

	// Work was auto-committed
	assert_eq!(git(&fx.work, &["log", "--pretty=%s"]), "Initial download from production");

	// Tag anchors the production head plus the SOURCES fingerprint
	let tag = fx.tag_store().read().unwrap();
	assert_eq!(tag.commit, git(&fx.production, &["rev-parse", "HEAD"]));
	assert_eq!(tag.sources_hash.as_deref(), Some(sources_hash(&["AAA/**".to_string()]).as_str()));

	// Everything classifies as SAME afterwards
	let classifier = engine.classifier().await;
	assert_eq!(classifier.state_of("AAA/a.c").await, FileState::Same);
	assert_eq!(classifier.state_of("AAA/b.c").await, FileState::Same);

	// The production lock was released
	assert!(!fx.production.join(".cccopy/lock/production_lock.lockdir").exists());
}

#[tokio::test]
async fn s2_edit_save_upload() {
	if !git_available() {
		eprintln!("git not available, skipping");
		return;
	}
	let fx = Fixture::new();
	let (engine, _ui) = fx.engine(
		&["AAA/**"],
		vec![
			Reply::Text("edit a".to_string()), // save: commit message
			Reply::Yes,                        // upload: confirmation
			Reply::Text("ship a".to_string()), // upload: commit message
		],
	);
	engine.download().await.unwrap();

	// User edits one file
	std::fs::write(fx.work.join("AAA/a.c"), "v2").unwrap();
	let classifier = engine.classifier().await;
	assert_eq!(classifier.state_of("AAA/a.c").await, FileState::Modified);
	assert_eq!(classifier.state_of("AAA/b.c").await, FileState::Same);

	// Save produces one Work commit touching exactly a.c
	let report = engine.save().await.unwrap();
	assert_eq!(report.committed, 1);
	assert_eq!(git(&fx.work, &["log", "-1", "--pretty=%s"]), "edit a");
	assert_eq!(
		git(&fx.work, &["show", "--name-only", "--pretty=format:", "HEAD"]).trim(),
		"AAA/a.c"
	);

	// Upload ships it to production
	let report = engine.upload().await.unwrap();
	assert_eq!(report.uploaded, 1);
	assert_eq!(std::fs::read_to_string(fx.production.join("AAA/a.c")).unwrap(), "v2");

	// Backup of the previous production version was taken (backup_count >= 1)
	let backups: Vec<String> = std::fs::read_dir(fx.production.join("AAA/backup"))
		.unwrap()
		.filter_map(|e| e.ok())
		.map(|e| e.file_name().to_string_lossy().to_string())
		.collect();
	assert_eq!(backups.len(), 1);
	assert!(backups[0].starts_with("a.c_cccopy_000000_"), "unexpected backup {}", backups[0]);

	// Authorship: author is the invoking user, committer the service identity
	let line = git(&fx.production, &["log", "-1", "--pretty=%s|%an|%ae|%cn"]);
	let user = cccopy::util::current_user();
	assert_eq!(line, format!("ship a|{}|{}@cccopy.com|cccopy_admin", user, user));

	// Tag advanced to the new head
	let tag = fx.tag_store().read().unwrap();
	assert_eq!(tag.commit, git(&fx.production, &["rev-parse", "HEAD"]));

	// And the uploaded file is SAME again
	let classifier = engine.classifier().await;
	assert_eq!(classifier.state_of("AAA/a.c").await, FileState::Same);
}

#[tokio::test]
async fn s3_conflict_skip_keeps_tag_and_blocks_upload() {
	if !git_available() {
		eprintln!("git not available, skipping");
		return;
	}
	let fx = Fixture::new();
	let (engine, ui) = fx.engine(
		&["AAA/**"],
		vec![
			Reply::Choice(3), // download: skip the conflict
			Reply::Yes,       // upload: confirm despite moved production head
		],
	);
	engine.download().await.unwrap();
	let tag_before = fx.tag_store().read().unwrap();

	// Production and Work diverge independently
	std::fs::write(fx.production.join("AAA/a.c"), "v1-prod").unwrap();
	std::fs::write(fx.work.join("AAA/a.c"), "v1-work").unwrap();

	// The second download auto-captures production's direct edit, then hits
	// the conflict; the scripted reply skips it.
	let report = engine.download().await.unwrap();
	assert_eq!(report.unresolved, 1);
	assert!(ui.saw("Conflict detected: AAA/a.c"));
	assert_eq!(
		git(&fx.production, &["log", "-1", "--pretty=%s"]),
		"Auto-commit: Direct changes in production"
	);

	// Skipping left both versions alone and the tag unchanged
	assert_eq!(std::fs::read_to_string(fx.work.join("AAA/a.c")).unwrap(), "v1-work");
	assert_eq!(fx.tag_store().read().unwrap(), tag_before);

	// Upload refuses while the conflict stands
	let err = engine.upload().await.unwrap_err();
	assert!(err.to_string().contains("resolve conflicts first"), "got: {}", err);
	assert_eq!(std::fs::read_to_string(fx.production.join("AAA/a.c")).unwrap(), "v1-prod");
}

#[tokio::test]
async fn s3b_conflict_take_production_resolves() {
	if !git_available() {
		eprintln!("git not available, skipping");
		return;
	}
	let fx = Fixture::new();
	let (engine, _ui) = fx.engine(
		&["AAA/**"],
		vec![
			Reply::Choice(1), // take production version
		],
	);
	engine.download().await.unwrap();

	std::fs::write(fx.production.join("AAA/a.c"), "v1-prod").unwrap();
	std::fs::write(fx.work.join("AAA/a.c"), "v1-work").unwrap();

	let report = engine.download().await.unwrap();
	assert_eq!(report.unresolved, 0);
	assert_eq!(report.resolved, 1);
	assert_eq!(std::fs::read_to_string(fx.work.join("AAA/a.c")).unwrap(), "v1-prod");

	// Tag advanced because nothing stayed unresolved
	let tag = fx.tag_store().read().unwrap();
	assert_eq!(tag.commit, git(&fx.production, &["rev-parse", "HEAD"]));
}

#[tokio::test]
async fn s4_sources_change_needs_confirmation() {
	if !git_available() {
		eprintln!("git not available, skipping");
		return;
	}
	let fx = Fixture::new();
	let (engine, _ui) = fx.engine(&["AAA/**"], vec![]);
	engine.download().await.unwrap();

	// The override now tracks a different pattern set; declining aborts
	let (engine2, ui2) = fx.engine(&["AAA/**", "BBB/**"], vec![Reply::No]);
	let err = engine2.download().await.unwrap_err();
	assert!(matches!(err, cccopy::error::CcError::Aborted));
	assert!(ui2.saw("SOURCES patterns changed"));
	let old_hash = sources_hash(&["AAA/**".to_string()]);
	assert_eq!(fx.tag_store().read().unwrap().sources_hash.as_deref(), Some(old_hash.as_str()));

	// Confirming proceeds and rewrites the fingerprint
	let (engine3, _ui3) = fx.engine(&["AAA/**", "BBB/**"], vec![Reply::Yes]);
	engine3.download().await.unwrap();
	let new_hash = sources_hash(&["AAA/**".to_string(), "BBB/**".to_string()]);
	assert_eq!(fx.tag_store().read().unwrap().sources_hash.as_deref(), Some(new_hash.as_str()));
}

#[tokio::test]
async fn s5_stale_lock_recovered() {
	if !git_available() {
		eprintln!("git not available, skipping");
		return;
	}
	let fx = Fixture::new();
	let (mut engine, _ui) = fx.engine(&["AAA/**"], vec![]);
	engine.set_lock_options(LockOptions {
		timeout: Duration::from_secs(3),
		max_stale: Duration::from_secs(60),
		poll: Duration::from_millis(20),
	});

	// A crashed run left an aged lock behind
	let lock_dir = fx.production.join(".cccopy/lock/production_lock.lockdir");
	std::fs::create_dir_all(&lock_dir).unwrap();
	std::fs::write(lock_dir.join("owner.info"), "ghost@dead-host:1:0:abc\n0\n").unwrap();
	filetime::set_file_mtime(&lock_dir, filetime::FileTime::from_unix_time(1_000_000, 0))
		.unwrap();

	let report = engine.download().await.unwrap();
	assert_eq!(report.updated, 2);
	assert!(!lock_dir.exists());
}

#[tokio::test]
async fn s6_rollback_to_prior_commit() {
	if !git_available() {
		eprintln!("git not available, skipping");
		return;
	}
	let fx = Fixture::new();
	let (engine, _ui) = fx.engine(
		&["AAA/**"],
		vec![
			Reply::Text("c2".to_string()),       // save -> C2
			Reply::Text("c3".to_string()),       // save -> C3
			Reply::Yes,                          // rollback confirmation
			Reply::Text("rollback".to_string()), // save after rollback
		],
	);
	engine.download().await.unwrap(); // C1

	std::fs::write(fx.work.join("AAA/a.c"), "v2").unwrap();
	engine.save().await.unwrap(); // C2
	std::fs::write(fx.work.join("AAA/a.c"), "v3").unwrap();
	engine.save().await.unwrap(); // C3

	let hashes = git(&fx.work, &["log", "--pretty=%H"]);
	let c2 = hashes.lines().nth(1).unwrap().to_string();

	// Selecting C2 reverts C2 and C3 as an uncommitted staged change
	engine.rollback(&c2).await.unwrap();
	assert_eq!(std::fs::read_to_string(fx.work.join("AAA/a.c")).unwrap(), "v1");
	assert!(!git(&fx.work, &["status", "--short"]).is_empty());

	// Saving commits the rollback
	engine.save().await.unwrap();
	assert_eq!(git(&fx.work, &["log", "-1", "--pretty=%s"]), "rollback");
	assert_eq!(std::fs::read_to_string(fx.work.join("AAA/a.c")).unwrap(), "v1");
}

#[tokio::test]
async fn backup_rotation_keeps_newest() {
	if !git_available() {
		eprintln!("git not available, skipping");
		return;
	}
	let fx = Fixture::new();
	let mut replies = Vec::new();
	for i in 1..=3 {
		replies.push(Reply::Text(format!("edit {}", i))); // save
		replies.push(Reply::Yes); // upload confirm
		replies.push(Reply::Text(format!("upload {}", i))); // upload message
	}
	let (engine, _ui) = fx.engine(&["AAA/**"], replies);
	engine.download().await.unwrap();

	for i in 1..=3 {
		std::fs::write(fx.work.join("AAA/a.c"), format!("v{}", i + 1)).unwrap();
		engine.save().await.unwrap();
		engine.upload().await.unwrap();
	}

	// backup_count = 2: after three uploads only the two newest remain
	let mut indices: Vec<u32> = std::fs::read_dir(fx.production.join("AAA/backup"))
		.unwrap()
		.filter_map(|e| e.ok())
		.filter_map(|e| {
			cccopy::engine::parse_backup_index(
				&e.file_name().to_string_lossy(),
				"a.c",
			)
		})
		.collect();
	indices.sort();
	assert_eq!(indices, vec![1, 2]);
}

#[tokio::test]
async fn upload_with_clean_work_reports_nothing() {
	if !git_available() {
		eprintln!("git not available, skipping");
		return;
	}
	let fx = Fixture::new();
	let (engine, ui) = fx.engine(&["AAA/**"], vec![]);
	engine.download().await.unwrap();

	let report = engine.upload().await.unwrap();
	assert_eq!(report.uploaded, 0);
	assert!(ui.saw("No modified files to upload"));
}

#[tokio::test]
async fn save_excludes_files_outside_sources() {
	if !git_available() {
		eprintln!("git not available, skipping");
		return;
	}
	let fx = Fixture::new();
	let (engine, ui) = fx.engine(&["AAA/**"], vec![Reply::Text("inside only".to_string())]);
	engine.download().await.unwrap();

	std::fs::write(fx.work.join("AAA/a.c"), "v2").unwrap();
	std::fs::write(fx.work.join("NOTES.txt"), "scratch").unwrap();

	let report = engine.save().await.unwrap();
	assert_eq!(report.committed, 1);
	assert!(report.outside_sources >= 1);
	assert!(ui.saw("outside the SOURCES patterns"));

	// The stray file was not committed
	let shown = git(&fx.work, &["show", "--name-only", "--pretty=format:", "HEAD"]);
	assert!(shown.contains("AAA/a.c"));
	assert!(!shown.contains("NOTES.txt"));
}

#[tokio::test]
async fn download_leaves_updated_existing_files_uncommitted() {
	if !git_available() {
		eprintln!("git not available, skipping");
		return;
	}
	let fx = Fixture::new();
	let (engine, _ui) = fx.engine(&["AAA/**"], vec![]);
	engine.download().await.unwrap();

	// Production moves ahead (direct edit is auto-captured by the download)
	std::fs::write(fx.production.join("AAA/b.c"), "v2").unwrap();
	let report = engine.download().await.unwrap();
	assert_eq!(report.updated, 1);

	// The updated pre-existing file is in Work but not auto-committed
	assert_eq!(std::fs::read_to_string(fx.work.join("AAA/b.c")).unwrap(), "v2");
	let status = git(&fx.work, &["status", "--short"]);
	assert!(status.contains("AAA/b.c"), "expected b.c uncommitted, status: {}", status);
}

#[tokio::test]
async fn download_commits_only_newly_added_files() {
	if !git_available() {
		eprintln!("git not available, skipping");
		return;
	}
	let fx = Fixture::new();
	let (engine, _ui) = fx.engine(&["AAA/**"], vec![]);
	engine.download().await.unwrap();

	// A brand-new file appears in production
	std::fs::write(fx.production.join("AAA/c.c"), "fresh").unwrap();
	let report = engine.download().await.unwrap();
	assert_eq!(report.updated, 1);

	// It was committed on its own in Work
	assert_eq!(
		git(&fx.work, &["log", "-1", "--pretty=%s"]),
		"Auto-commit: Added 1 new files from production"
	);
	let status = git(&fx.work, &["status", "--short"]);
	assert!(status.is_empty(), "work should be clean, status: {}", status);
}

#[tokio::test]
async fn tag_store_round_trip_against_repo() {
	if !git_available() {
		eprintln!("git not available, skipping");
		return;
	}
	let tmp = TempDir::new().unwrap();
	let repo = tmp.path().join("repo");
	std::fs::create_dir_all(&repo).unwrap();
	git(&repo, &["init"]);
	git(&repo, &["config", "user.name", "tester"]);
	git(&repo, &["config", "user.email", "tester@example.com"]);
	std::fs::write(repo.join("x"), "x").unwrap();
	git(&repo, &["add", "x"]);
	git(&repo, &["commit", "-m", "one"]);

	let store = TagStore::new(&tmp.path().join("status"));
	let vcs = Git::new();

	store.save(&vcs, &repo, Some("7f8a9b2c")).await.unwrap();
	let tag = store.read().unwrap();
	assert_eq!(tag.commit, git(&repo, &["rev-parse", "HEAD"]));
	assert_eq!(tag.sources_hash.as_deref(), Some("7f8a9b2c"));

	// Legacy commit-only format reads back with an absent hash
	store.save(&vcs, &repo, None).await.unwrap();
	let tag = store.read().unwrap();
	assert_eq!(tag.sources_hash, None);
}

// vim: ts=4

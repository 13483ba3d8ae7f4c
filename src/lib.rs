//! # CCCopy - Git-based Team Collaboration Tool
//!
//! CCCopy mediates a shared, network-mounted Production directory tree and
//! per-user Work directories, using two independent git repositories (one
//! rooted at Production, one at each Work) for safe, auditable two-way
//! synchronization in the presence of concurrent users on a common
//! filesystem (typically NFS with POSIX group permissions).
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cccopy::engine::SyncEngine;
//! use cccopy::project::{ProjectStore, TemplateStore};
//! use cccopy::ui::CliHandler;
//! use cccopy::vcs::Git;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let templates = TemplateStore::scan()?;
//!     let store = ProjectStore::open(ProjectStore::default_root(), templates)?;
//!     let project = store.resolve(None)?;
//!     let engine = SyncEngine::new(project, Arc::new(Git::new()), Arc::new(CliHandler))?;
//!     let report = engine.download().await?;
//!     println!("updated {} files", report.updated);
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]

pub mod cache;
pub mod classify;
pub mod conflict;
pub mod difftool;
pub mod engine;
pub mod error;
pub mod ini;
pub mod lock;
pub mod logging;
pub mod pattern;
pub mod preference;
pub mod privilege;
pub mod project;
pub mod tag;
pub mod ui;
pub mod util;
pub mod vcs;

// Re-export commonly used types
pub use cache::{StateCache, StatusService, StatusWatcher, WorkerPool};
pub use classify::{classify, Classifier, FileState};
pub use conflict::{ConflictMediator, ConflictOutcome};
pub use engine::{DownloadReport, SaveReport, SyncEngine, UploadReport};
pub use error::{CcError, ConfigError, LockError, PatternError, PrivilegeError, VcsError};
pub use lock::{DirLock, LockOptions};
pub use pattern::SourceSet;
pub use privilege::GroupPrivilege;
pub use project::{Project, ProjectStore, TemplateStore};
pub use tag::{Tag, TagStore};
pub use ui::{CliHandler, Level, Prompt, Reply, ScriptedHandler, UiHandler};
pub use vcs::{BlobId, Git, Vcs};

// vim: ts=4

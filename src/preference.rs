//! Global preference storage
//!
//! Preferences live at `~/.cccopy/preference/cccopy.ini`. Unlike per-project
//! state this file can be edited by two co-resident processes, so every write
//! goes through a dedicated directory lock using the same protocol as the
//! Production lock.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::CcError;
use crate::ini::IniFile;
use crate::lock::{DirLock, LockOptions};
use crate::ui::UiHandler;
use crate::util;

const DEFAULT_CONTENT: &str = "; CCCopy global preference file\n\
	; Values are managed through the application; manual edits are kept.\n\
	[GENERAL]\n";

fn lock_options() -> LockOptions {
	LockOptions {
		timeout: Duration::from_secs(60),
		max_stale: Duration::from_secs(300),
		poll: Duration::from_millis(100),
	}
}

/// Preference file handle
pub struct PreferenceStore {
	dir: PathBuf,
	file: PathBuf,
}

impl PreferenceStore {
	/// Open (creating with defaults if needed) the per-user preference file
	pub async fn open(ui: &dyn UiHandler) -> Result<Self, CcError> {
		Self::open_at(util::cccopy_dir().join("preference"), ui).await
	}

	pub async fn open_at(dir: PathBuf, ui: &dyn UiHandler) -> Result<Self, CcError> {
		std::fs::create_dir_all(&dir).map_err(|e| CcError::io(&dir, e))?;
		let file = dir.join("cccopy.ini");
		let store = PreferenceStore { dir, file };

		if !store.file.exists() {
			let mut lock = store.lock(ui).await?;
			// Re-check under the lock; another process may have won the race
			if !store.file.exists() {
				std::fs::write(&store.file, DEFAULT_CONTENT)
					.map_err(|e| CcError::io(&store.file, e))?;
			}
			lock.release().await;
		}
		Ok(store)
	}

	async fn lock(&self, ui: &dyn UiHandler) -> Result<DirLock, CcError> {
		let lock_dir = self.dir.join(".lock");
		std::fs::create_dir_all(&lock_dir).map_err(|e| CcError::io(&lock_dir, e))?;
		let base = lock_dir.join("preference_lock");
		Ok(DirLock::acquire(&base, lock_options(), None, ui).await?)
	}

	pub fn path(&self) -> &std::path::Path {
		&self.file
	}

	/// Read a single preference value
	pub fn get(&self, section: &str, key: &str) -> Option<String> {
		IniFile::load(&self.file).ok()?.get(section, key)
	}

	/// Write a single preference value under the preference lock
	pub async fn set(
		&self,
		section: &str,
		key: &str,
		value: &str,
		ui: &dyn UiHandler,
	) -> Result<(), CcError> {
		let mut lock = self.lock(ui).await?;
		let result: Result<(), CcError> = (|| {
			let mut ini =
				if self.file.exists() { IniFile::load(&self.file)? } else { IniFile::new(&self.file) };
			ini.set(section, key, value);
			ini.write()?;
			Ok(())
		})();
		lock.release().await;
		result
	}
}


// vim: ts=4

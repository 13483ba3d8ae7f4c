//! Thin wrapper over INI files
//!
//! Template and project configuration live in INI files with `;`/`#` inline
//! comments. Keys and sections are case-sensitive (SOURCES pattern values
//! must keep their case). Section key order is not preserved by the parser,
//! so multi-value sections are read in sorted key order for determinism.

use configparser::ini::Ini;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Strip an inline `;` or `#` comment and surrounding whitespace
pub fn strip_comment(value: &str) -> &str {
	let cut = match (value.find(';'), value.find('#')) {
		(Some(a), Some(b)) => Some(a.min(b)),
		(Some(a), None) => Some(a),
		(None, Some(b)) => Some(b),
		(None, None) => None,
	};
	match cut {
		Some(i) => value[..i].trim(),
		None => value.trim(),
	}
}

/// One INI file, loaded or about to be written
#[derive(Debug)]
pub struct IniFile {
	ini: Ini,
	path: PathBuf,
}

impl IniFile {
	/// An empty file to be written at `path`
	pub fn new(path: impl Into<PathBuf>) -> Self {
		IniFile { ini: Ini::new_cs(), path: path.into() }
	}

	pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
		let path = path.into();
		let mut ini = Ini::new_cs();
		ini.load(&path)
			.map_err(|message| ConfigError::Malformed { path: path.clone(), message })?;
		Ok(IniFile { ini, path })
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn has_section(&self, section: &str) -> bool {
		self.ini.sections().iter().any(|s| s == section)
	}

	pub fn sections(&self) -> Vec<String> {
		self.ini.sections()
	}

	/// A single comment-stripped value; empty values read as None
	pub fn get(&self, section: &str, key: &str) -> Option<String> {
		let raw = self.ini.get(section, key)?;
		let value = strip_comment(&raw);
		if value.is_empty() {
			None
		} else {
			Some(value.to_string())
		}
	}

	/// All values of a section in sorted key order, comment-stripped,
	/// empties dropped. This is how SOURCES/EXCLUDES pattern lists are read.
	pub fn section_values(&self, section: &str) -> Vec<String> {
		let map = self.ini.get_map_ref();
		let Some(entries) = map.get(section) else {
			return Vec::new();
		};
		let mut keys: Vec<&String> = entries.keys().collect();
		keys.sort();
		keys.into_iter()
			.filter_map(|k| entries.get(k).cloned().flatten())
			.map(|v| strip_comment(&v).to_string())
			.filter(|v| !v.is_empty())
			.collect()
	}

	pub fn set(&mut self, section: &str, key: &str, value: &str) {
		self.ini.set(section, key, Some(value.to_string()));
	}

	pub fn write(&self) -> Result<(), ConfigError> {
		if let Some(parent) = self.path.parent() {
			std::fs::create_dir_all(parent).map_err(|e| ConfigError::Malformed {
				path: self.path.clone(),
				message: e.to_string(),
			})?;
		}
		self.ini.write(&self.path).map_err(|e| ConfigError::Malformed {
			path: self.path.clone(),
			message: e.to_string(),
		})
	}
}


// vim: ts=4

//! Project configuration: templates, per-user overrides, lifecycle
//!
//! A project starts from a read-only template (`project/*.ini`, or the
//! directory named by `CCCOPY_PROJECT_TEMPLATE_DIR`) and is overlaid with the
//! per-user override at `~/.cccopy/project/<NNNN>/config.ini`. Merge policy:
//! `[SOURCES]` and `[EXCLUDES]` are replaced wholesale when the override
//! carries them; every other section is key-level merged. Paths accept `~`
//! and `$VAR` expansion.

use chrono::Local;
use std::path::{Path, PathBuf};

use crate::error::{CcError, ConfigError};
use crate::ini::IniFile;
use crate::logging::{debug, warn};
use crate::util::expand_path;

/// A resolved, validated project configuration
#[derive(Debug, Clone)]
pub struct Project {
	pub name: String,
	pub number: String,
	pub production_dir: PathBuf,
	pub working_dir: PathBuf,
	pub sources: Vec<String>,
	pub excludes: Vec<String>,
	pub group: Option<String>,
	pub backup_count: u32,
	/// Per-user private state directory (~/.cccopy/project/<NNNN>)
	pub state_dir: PathBuf,
	pub tag_label: String,
	pub create_date: String,
}

impl Project {
	/// Where the production tag lives
	pub fn status_dir(&self) -> PathBuf {
		self.state_dir.join("status")
	}

	fn validate(&self) -> Result<(), ConfigError> {
		if self.sources.is_empty() {
			return Err(ConfigError::Invalid {
				message: format!("project '{}' has no SOURCES patterns", self.name),
			});
		}
		if self.production_dir == self.working_dir {
			return Err(ConfigError::Invalid {
				message: format!(
					"project '{}': production and work directories must differ ({})",
					self.name,
					self.production_dir.display()
				),
			});
		}
		Ok(())
	}
}

/// Summary row for project listings
#[derive(Debug, Clone)]
pub struct ProjectInfo {
	pub number: String,
	pub name: String,
	pub working_dir: String,
	pub tag_label: String,
	pub create_date: String,
}

/// Read-only template set scanned at startup
#[derive(Debug)]
pub struct TemplateStore {
	dir: PathBuf,
	templates: Vec<(String, IniFile)>,
}

impl TemplateStore {
	/// Scan the default template directory: `CCCOPY_PROJECT_TEMPLATE_DIR`,
	/// else `project/` next to the executable, else `./project`
	pub fn scan() -> Result<Self, ConfigError> {
		let dir = match std::env::var("CCCOPY_PROJECT_TEMPLATE_DIR") {
			Ok(dir) => expand_path(&dir),
			Err(_) => {
				let exe_relative = std::env::current_exe()
					.ok()
					.and_then(|exe| exe.parent().map(|p| p.join("project")))
					.filter(|p| p.is_dir());
				exe_relative.unwrap_or_else(|| PathBuf::from("project"))
			}
		};
		Self::scan_dir(&dir)
	}

	/// Scan a specific template directory; duplicate PROJECT_NAME is fatal
	pub fn scan_dir(dir: &Path) -> Result<Self, ConfigError> {
		if !dir.is_dir() {
			return Err(ConfigError::TemplateDirMissing { path: dir.to_path_buf() });
		}

		let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
			.map_err(|e| ConfigError::Malformed { path: dir.to_path_buf(), message: e.to_string() })?
			.filter_map(|e| e.ok())
			.map(|e| e.path())
			.filter(|p| p.extension().map(|x| x == "ini").unwrap_or(false))
			.collect();
		paths.sort();

		let mut templates: Vec<(String, IniFile)> = Vec::new();
		for path in paths {
			let ini = match IniFile::load(&path) {
				Ok(ini) => ini,
				Err(e) => {
					warn!("skipping unreadable template: {}", e);
					continue;
				}
			};
			let Some(name) = ini.get("CONFIG", "PROJECT_NAME") else {
				warn!("template {} has no PROJECT_NAME, skipping", path.display());
				continue;
			};
			if templates.iter().any(|(n, _)| n == &name) {
				return Err(ConfigError::DuplicateProject { name });
			}
			templates.push((name, ini));
		}

		Ok(TemplateStore { dir: dir.to_path_buf(), templates })
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	pub fn names(&self) -> Vec<&str> {
		self.templates.iter().map(|(n, _)| n.as_str()).collect()
	}

	pub fn get(&self, name: &str) -> Option<&IniFile> {
		self.templates.iter().find(|(n, _)| n == name).map(|(_, ini)| ini)
	}
}

/// Per-user registered projects under ~/.cccopy/project
pub struct ProjectStore {
	root: PathBuf,
	templates: TemplateStore,
}

impl ProjectStore {
	pub fn default_root() -> PathBuf {
		crate::util::cccopy_dir().join("project")
	}

	pub fn open(root: PathBuf, templates: TemplateStore) -> Result<Self, CcError> {
		std::fs::create_dir_all(&root).map_err(|e| CcError::io(&root, e))?;
		Ok(ProjectStore { root, templates })
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn templates(&self) -> &TemplateStore {
		&self.templates
	}

	/// Registered projects in number order
	pub fn list(&self) -> Vec<ProjectInfo> {
		let mut numbers: Vec<String> = match std::fs::read_dir(&self.root) {
			Ok(entries) => entries
				.filter_map(|e| e.ok())
				.filter(|e| e.path().is_dir())
				.filter_map(|e| e.file_name().to_str().map(String::from))
				.filter(|n| n.len() == 4 && n.chars().all(|c| c.is_ascii_digit()))
				.collect(),
			Err(_) => return Vec::new(),
		};
		numbers.sort();

		numbers
			.into_iter()
			.filter_map(|number| {
				let ini = IniFile::load(self.root.join(&number).join("config.ini")).ok()?;
				let name = ini.get("INFO", "PROJECT_NAME")?;
				Some(ProjectInfo {
					number,
					name,
					working_dir: ini.get("CONFIG", "WORKING_BASE_DIR").unwrap_or_default(),
					tag_label: ini.get("INFO", "TAG").unwrap_or_default(),
					create_date: ini.get("INFO", "CREATE_DATE").unwrap_or_default(),
				})
			})
			.collect()
	}

	/// Number recorded as LAST_PROJECT, if any
	pub fn last_project(&self) -> Option<String> {
		let ini = IniFile::load(self.root.join("config.ini")).ok()?;
		ini.get("CONFIG", "LAST_PROJECT")
	}

	pub fn set_last_project(&self, number: &str) -> Result<(), CcError> {
		let path = self.root.join("config.ini");
		let mut ini = if path.exists() { IniFile::load(&path)? } else { IniFile::new(&path) };
		ini.set("CONFIG", "LAST_PROJECT", number);
		ini.write()?;
		Ok(())
	}

	/// Register a new project from a template.
	///
	/// `working_base_dir` overrides the template's WORKING_BASE_DIR; a work
	/// directory already used by another project is rejected.
	pub fn create(
		&self,
		template_name: &str,
		working_base_dir: Option<&Path>,
		tag_label: &str,
	) -> Result<Project, CcError> {
		let template = self
			.templates
			.get(template_name)
			.ok_or_else(|| ConfigError::UnknownProject { name: template_name.to_string() })?;

		let working_dir = match working_base_dir {
			Some(dir) => dir.to_path_buf(),
			None => template
				.get("CONFIG", "WORKING_BASE_DIR")
				.map(|s| expand_path(&s))
				.ok_or_else(|| ConfigError::Invalid {
					message: format!("template '{}' has no WORKING_BASE_DIR", template_name),
				})?,
		};

		for info in self.list() {
			if expand_path(&info.working_dir) == working_dir {
				return Err(ConfigError::Invalid {
					message: format!(
						"work directory already used by project '{}': {}",
						info.name,
						working_dir.display()
					),
				}
				.into());
			}
		}

		let number = self.next_number();
		let state_dir = self.root.join(&number);
		std::fs::create_dir_all(state_dir.join("status"))
			.map_err(|e| CcError::io(&state_dir, e))?;

		let mut ini = IniFile::new(state_dir.join("config.ini"));
		ini.set("INFO", "PROJECT_NAME", template_name);
		ini.set("INFO", "TAG", tag_label);
		ini.set("INFO", "CREATE_DATE", &Local::now().format("%Y-%m-%d %H:%M:%S").to_string());
		ini.set("CONFIG", "WORKING_BASE_DIR", &working_dir.to_string_lossy());
		ini.write()?;

		self.set_last_project(&number)?;
		debug!("project created: {} ({})", template_name, number);
		self.resolve_number(&number)
	}

	/// Remove a registered project; optionally delete the Work tree too
	pub fn delete(&self, number: &str, remove_work_tree: bool) -> Result<(), CcError> {
		let project = self.resolve_number(number)?;
		if remove_work_tree && project.working_dir.is_dir() {
			std::fs::remove_dir_all(&project.working_dir)
				.map_err(|e| CcError::io(&project.working_dir, e))?;
		}
		let state_dir = self.root.join(number);
		std::fs::remove_dir_all(&state_dir).map_err(|e| CcError::io(&state_dir, e))?;

		if self.last_project().as_deref() == Some(number) {
			match self.list().first() {
				Some(next) => self.set_last_project(&next.number)?,
				None => self.set_last_project("")?,
			}
		}
		Ok(())
	}

	/// Resolve a project by number, by name, or by default
	/// (LAST_PROJECT, else the first registered project)
	pub fn resolve(&self, selector: Option<&str>) -> Result<Project, CcError> {
		match selector {
			Some(sel) if sel.len() == 4 && sel.chars().all(|c| c.is_ascii_digit()) => {
				self.resolve_number(sel)
			}
			Some(name) => {
				let info = self
					.list()
					.into_iter()
					.find(|p| p.name == name)
					.ok_or_else(|| ConfigError::UnknownProject { name: name.to_string() })?;
				self.resolve_number(&info.number)
			}
			None => {
				if let Some(number) = self.last_project() {
					if self.root.join(&number).join("config.ini").exists() {
						return self.resolve_number(&number);
					}
					warn!("last project '{}' not found", number);
				}
				let first = self.list().into_iter().next().ok_or_else(|| {
					ConfigError::Invalid { message: "no projects registered".to_string() }
				})?;
				self.set_last_project(&first.number)?;
				self.resolve_number(&first.number)
			}
		}
	}

	/// Overlay the per-user override onto its template
	fn resolve_number(&self, number: &str) -> Result<Project, CcError> {
		let state_dir = self.root.join(number);
		let override_ini = IniFile::load(state_dir.join("config.ini"))?;
		let name = override_ini.get("INFO", "PROJECT_NAME").ok_or_else(|| {
			ConfigError::Malformed {
				path: state_dir.join("config.ini"),
				message: "missing [INFO] PROJECT_NAME".to_string(),
			}
		})?;
		let template = self
			.templates
			.get(&name)
			.ok_or_else(|| ConfigError::UnknownProject { name: name.clone() })?;

		// SOURCES/EXCLUDES: any override entry discards the template section
		let replaced = |section: &str| -> Option<Vec<String>> {
			let values = override_ini.section_values(section);
			if override_ini.has_section(section) && !values.is_empty() {
				Some(values)
			} else {
				None
			}
		};
		let sources = replaced("SOURCES").unwrap_or_else(|| template.section_values("SOURCES"));
		let excludes = replaced("EXCLUDES").unwrap_or_else(|| template.section_values("EXCLUDES"));

		// All other sections are key-level merged, override wins
		let merged = |section: &str, key: &str| -> Option<String> {
			override_ini.get(section, key).or_else(|| template.get(section, key))
		};

		let production_dir = merged("CONFIG", "PRODUCTION_DIR").ok_or_else(|| {
			ConfigError::Invalid { message: format!("project '{}' has no PRODUCTION_DIR", name) }
		})?;
		let working_dir = merged("CONFIG", "WORKING_BASE_DIR").ok_or_else(|| {
			ConfigError::Invalid { message: format!("project '{}' has no WORKING_BASE_DIR", name) }
		})?;

		let backup_count = merged("UPLOAD", "BACKUP_COUNT")
			.and_then(|v| v.parse::<u32>().ok())
			.unwrap_or(0);

		let project = Project {
			name,
			number: number.to_string(),
			production_dir: expand_path(&production_dir),
			working_dir: expand_path(&working_dir),
			sources,
			excludes,
			group: merged("UPLOAD", "GROUP"),
			backup_count,
			state_dir,
			tag_label: override_ini.get("INFO", "TAG").unwrap_or_default(),
			create_date: override_ini.get("INFO", "CREATE_DATE").unwrap_or_default(),
		};
		project.validate()?;
		Ok(project)
	}

	fn next_number(&self) -> String {
		let max = self
			.list()
			.iter()
			.filter_map(|p| p.number.parse::<u32>().ok())
			.max()
			.unwrap_or(0);
		format!("{:04}", max + 1)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn write_template(dir: &Path, file: &str, name: &str, production: &Path, work: &Path) {
		std::fs::write(
			dir.join(file),
			format!(
				"[CONFIG]\nPROJECT_NAME = {}\nPRODUCTION_DIR = {}\nWORKING_BASE_DIR = {}\n\n\
				 [SOURCES]\np1 = AAA/**\n\n[EXCLUDES]\ne1 = **/backup/\n\n\
				 [UPLOAD]\nGROUP = ccgroup\nBACKUP_COUNT = 3\n",
				name,
				production.display(),
				work.display()
			),
		)
		.unwrap();
	}

	struct Fixture {
		_tmp: TempDir,
		store: ProjectStore,
		production: PathBuf,
		work: PathBuf,
	}

	fn fixture() -> Fixture {
		let tmp = TempDir::new().unwrap();
		let template_dir = tmp.path().join("templates");
		let production = tmp.path().join("production");
		let work = tmp.path().join("work");
		std::fs::create_dir_all(&template_dir).unwrap();
		write_template(&template_dir, "demo.ini", "demo", &production, &work);

		let templates = TemplateStore::scan_dir(&template_dir).unwrap();
		let store = ProjectStore::open(tmp.path().join("state"), templates).unwrap();
		Fixture { _tmp: tmp, store, production, work }
	}

	#[test]
	fn test_scan_missing_dir_is_fatal() {
		let err = TemplateStore::scan_dir(Path::new("/no/such/dir")).unwrap_err();
		assert!(matches!(err, ConfigError::TemplateDirMissing { .. }));
	}

	#[test]
	fn test_duplicate_project_name_is_fatal() {
		let tmp = TempDir::new().unwrap();
		write_template(tmp.path(), "a.ini", "demo", Path::new("/p"), Path::new("/w"));
		write_template(tmp.path(), "b.ini", "demo", Path::new("/p2"), Path::new("/w2"));

		let err = TemplateStore::scan_dir(tmp.path()).unwrap_err();
		assert!(matches!(err, ConfigError::DuplicateProject { .. }));
	}

	#[test]
	fn test_create_and_resolve() {
		let fx = fixture();
		let project = fx.store.create("demo", None, "v1").unwrap();

		assert_eq!(project.number, "0001");
		assert_eq!(project.name, "demo");
		assert_eq!(project.production_dir, fx.production);
		assert_eq!(project.working_dir, fx.work);
		assert_eq!(project.sources, vec!["AAA/**"]);
		assert_eq!(project.excludes, vec!["**/backup/"]);
		assert_eq!(project.group.as_deref(), Some("ccgroup"));
		assert_eq!(project.backup_count, 3);
		assert_eq!(fx.store.last_project().as_deref(), Some("0001"));

		// Default resolution goes through LAST_PROJECT
		let resolved = fx.store.resolve(None).unwrap();
		assert_eq!(resolved.number, "0001");
	}

	#[test]
	fn test_sources_override_replaces_wholesale() {
		let fx = fixture();
		let project = fx.store.create("demo", None, "").unwrap();

		// User narrows SOURCES; the template's list must be fully discarded
		let path = project.state_dir.join("config.ini");
		let mut ini = IniFile::load(&path).unwrap();
		ini.set("SOURCES", "p1", "BBB/**");
		ini.write().unwrap();

		let resolved = fx.store.resolve(Some("0001")).unwrap();
		assert_eq!(resolved.sources, vec!["BBB/**"]);
		// EXCLUDES untouched by the override keeps the template's section
		assert_eq!(resolved.excludes, vec!["**/backup/"]);
	}

	#[test]
	fn test_upload_section_key_merges() {
		let fx = fixture();
		let project = fx.store.create("demo", None, "").unwrap();

		let path = project.state_dir.join("config.ini");
		let mut ini = IniFile::load(&path).unwrap();
		ini.set("UPLOAD", "BACKUP_COUNT", "7");
		ini.write().unwrap();

		let resolved = fx.store.resolve(Some("0001")).unwrap();
		assert_eq!(resolved.backup_count, 7);
		// GROUP still comes from the template
		assert_eq!(resolved.group.as_deref(), Some("ccgroup"));
	}

	#[test]
	fn test_work_dir_reuse_rejected() {
		let fx = fixture();
		fx.store.create("demo", None, "").unwrap();
		let err = fx.store.create("demo", Some(&fx.work), "").unwrap_err();
		assert!(err.to_string().contains("already used"));
	}

	#[test]
	fn test_numbers_increment() {
		let fx = fixture();
		fx.store.create("demo", None, "").unwrap();
		let second = fx.store.create("demo", Some(&fx.work.with_file_name("work2")), "").unwrap();
		assert_eq!(second.number, "0002");
	}

	#[test]
	fn test_delete_updates_last_project() {
		let fx = fixture();
		fx.store.create("demo", None, "").unwrap();
		let second = fx.store.create("demo", Some(&fx.work.with_file_name("work2")), "").unwrap();
		assert_eq!(fx.store.last_project().as_deref(), Some("0002"));

		fx.store.delete(&second.number, false).unwrap();
		assert_eq!(fx.store.last_project().as_deref(), Some("0001"));
		assert_eq!(fx.store.list().len(), 1);
	}

	#[test]
	fn test_same_production_and_work_rejected() {
		let tmp = TempDir::new().unwrap();
		let template_dir = tmp.path().join("templates");
		std::fs::create_dir_all(&template_dir).unwrap();
		let dir = tmp.path().join("same");
		write_template(&template_dir, "bad.ini", "bad", &dir, &dir);

		let templates = TemplateStore::scan_dir(&template_dir).unwrap();
		let store = ProjectStore::open(tmp.path().join("state"), templates).unwrap();
		let err = store.create("bad", None, "").unwrap_err();
		assert!(err.to_string().contains("must differ"));
	}
}

// vim: ts=4

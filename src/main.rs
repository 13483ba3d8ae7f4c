use clap::{Arg, ArgAction, Command};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use cccopy::cache::{StatusService, DEFAULT_CACHE_TTL, DEFAULT_WATCH_INTERVAL, DEFAULT_WORKERS};
use cccopy::classify::FileState;
use cccopy::engine::SyncEngine;
use cccopy::error::CcError;
use cccopy::preference::PreferenceStore;
use cccopy::privilege::maybe_reexec_under_group;
use cccopy::project::{ProjectStore, TemplateStore};
use cccopy::ui::{CliHandler, UiHandler};
use cccopy::util;
use cccopy::vcs::{Git, Vcs};
use cccopy::{lock, logging};

const CCCOPY_VERSION: &str = "1.1.0";

fn cli() -> Command {
	Command::new("cccopy")
		.version(CCCOPY_VERSION)
		.about("Git-based team collaboration tool for shared production directories")
		.subcommand_required(true)
		.arg(
			Arg::new("project")
				.short('p')
				.long("project")
				.value_name("NAME_OR_NUMBER")
				.help("Project to operate on (default: last used)")
				.global(true),
		)
		.subcommand(Command::new("download").about("Sync production -> work"))
		.subcommand(Command::new("upload").about("Sync work -> production"))
		.subcommand(Command::new("save").about("Commit work changes"))
		.subcommand(
			Command::new("rollback")
				.about("Restore the work tree to a prior commit's state")
				.arg(Arg::new("commit").required(true)),
		)
		.subcommand(
			Command::new("export")
				.about("Export a production commit as a zip archive")
				.arg(Arg::new("commit").required(true))
				.arg(Arg::new("output").short('o').long("output").value_name("PATH")),
		)
		.subcommand(
			Command::new("history")
				.about("Show commit history")
				.arg(
					Arg::new("work")
						.long("work")
						.action(ArgAction::SetTrue)
						.help("Show work history instead of production"),
				)
				.arg(
					Arg::new("limit")
						.short('n')
						.long("limit")
						.value_name("COUNT")
						.value_parser(clap::value_parser!(usize)),
				)
				.arg(
					Arg::new("detail")
						.long("detail")
						.value_name("COMMIT")
						.help("Show the files touched by one commit"),
				),
		)
		.subcommand(Command::new("status").about("Classify every project file"))
		.subcommand(
			Command::new("project")
				.about("Manage registered projects")
				.subcommand_required(true)
				.subcommand(Command::new("list").about("List registered projects"))
				.subcommand(Command::new("templates").about("List available templates"))
				.subcommand(
					Command::new("create")
						.about("Register a new project from a template")
						.arg(Arg::new("template").required(true))
						.arg(Arg::new("work-dir").long("work-dir").value_name("DIR"))
						.arg(Arg::new("tag").long("tag").value_name("LABEL").default_value("")),
				)
				.subcommand(
					Command::new("delete")
						.about("Delete a registered project")
						.arg(Arg::new("number").required(true))
						.arg(
							Arg::new("remove-work")
								.long("remove-work")
								.action(ArgAction::SetTrue)
								.help("Also delete the work directory tree"),
						),
				)
				.subcommand(
					Command::new("select")
						.about("Set the default project")
						.arg(Arg::new("selector").required(true)),
				),
		)
}

#[tokio::main]
async fn main() {
	std::process::exit(run().await);
}

async fn run() -> i32 {
	let matches = cli().get_matches();

	logging::init_tracing(Some(&util::cccopy_dir().join("log")));
	lock::setup_signal_handlers();

	let ui: Arc<dyn UiHandler> = Arc::new(CliHandler);

	// Startup configuration is fatal: missing template dir, duplicate
	// project names, malformed INI all abort with exit code 1.
	let templates = match TemplateStore::scan() {
		Ok(templates) => templates,
		Err(e) => {
			eprintln!("[ERROR] {}", e);
			return 1;
		}
	};
	let store = match ProjectStore::open(ProjectStore::default_root(), templates) {
		Ok(store) => store,
		Err(e) => {
			eprintln!("[ERROR] {}", e);
			return 1;
		}
	};

	if let Err(e) = PreferenceStore::open(ui.as_ref()).await {
		logging::warn!("preference store unavailable: {}", e);
	}

	let selector = matches.get_one::<String>("project").map(|s| s.as_str());

	if let Some(project_matches) = matches.subcommand_matches("project") {
		return run_project_command(&store, project_matches);
	}

	let project = match store.resolve(selector) {
		Ok(project) => project,
		Err(e) => {
			eprintln!("[ERROR] {}", e);
			return 1;
		}
	};

	// Run under the required POSIX group so Work-side files keep the right
	// ownership; CCCOPY_REEXEC_DONE breaks the recursion.
	if let Some(group) = project.group.clone() {
		match maybe_reexec_under_group(&group) {
			Ok(Some(code)) => return code,
			Ok(None) => {}
			Err(e) => {
				eprintln!("[ERROR] {}", e);
				return 1;
			}
		}
	}

	let vcs: Arc<dyn Vcs> = Arc::new(Git::new());
	let engine = match SyncEngine::new(project, vcs.clone(), ui.clone()) {
		Ok(engine) => engine,
		Err(e) => {
			eprintln!("[ERROR] {}", e);
			return 1;
		}
	};

	let result = dispatch(&matches, &engine, vcs).await;
	match result {
		Ok(()) => 0,
		Err(CcError::Aborted) => {
			println!("Operation aborted.");
			0
		}
		Err(e) => {
			eprintln!("[ERROR] {}", e);
			1
		}
	}
}

async fn dispatch(
	matches: &clap::ArgMatches,
	engine: &SyncEngine,
	vcs: Arc<dyn Vcs>,
) -> Result<(), CcError> {
	match matches.subcommand() {
		Some(("download", _)) => {
			engine.download().await?;
			Ok(())
		}
		Some(("upload", _)) => {
			engine.upload().await?;
			Ok(())
		}
		Some(("save", _)) => {
			engine.save().await?;
			Ok(())
		}
		Some(("rollback", sub)) => {
			let commit = sub.get_one::<String>("commit").expect("required");
			engine.rollback(commit).await
		}
		Some(("export", sub)) => {
			let commit = sub.get_one::<String>("commit").expect("required");
			let out = sub.get_one::<String>("output").map(PathBuf::from);
			engine.export(commit, out).await?;
			Ok(())
		}
		Some(("history", sub)) => run_history(engine, sub).await,
		Some(("status", _)) => run_status(engine, vcs).await,
		_ => Ok(()),
	}
}

fn run_project_command(store: &ProjectStore, matches: &clap::ArgMatches) -> i32 {
	let result: Result<(), CcError> = (|| {
		match matches.subcommand() {
			Some(("list", _)) => {
				let projects = store.list();
				if projects.is_empty() {
					println!("No projects registered.");
					return Ok(());
				}
				let last = store.last_project().unwrap_or_default();
				println!("{:<6} {:<20} {:<12} {}", "No", "Project", "Tag", "Work directory");
				println!("{}", "=".repeat(72));
				for info in projects {
					let marker = if info.number == last { "*" } else { " " };
					println!(
						"{}{:<5} {:<20} {:<12} {}",
						marker, info.number, info.name, info.tag_label, info.working_dir
					);
				}
				Ok(())
			}
			Some(("templates", _)) => {
				for name in store.templates().names() {
					println!("{}", name);
				}
				Ok(())
			}
			Some(("create", sub)) => {
				let template = sub.get_one::<String>("template").expect("required");
				let work_dir = sub.get_one::<String>("work-dir").map(|s| util::expand_path(s));
				let tag = sub.get_one::<String>("tag").expect("defaulted");
				let project = store.create(template, work_dir.as_deref(), tag)?;
				println!("Project '{}' registered as {}", project.name, project.number);
				Ok(())
			}
			Some(("delete", sub)) => {
				let number = sub.get_one::<String>("number").expect("required");
				let remove_work = sub.get_flag("remove-work");
				store.delete(number, remove_work)?;
				println!("Project {} deleted.", number);
				Ok(())
			}
			Some(("select", sub)) => {
				let selector = sub.get_one::<String>("selector").expect("required");
				let project = store.resolve(Some(selector))?;
				store.set_last_project(&project.number)?;
				println!("Default project is now '{}' ({})", project.name, project.number);
				Ok(())
			}
			_ => Ok(()),
		}
	})();

	match result {
		Ok(()) => 0,
		Err(e) => {
			eprintln!("[ERROR] {}", e);
			1
		}
	}
}

async fn run_history(engine: &SyncEngine, sub: &clap::ArgMatches) -> Result<(), CcError> {
	if let Some(commit) = sub.get_one::<String>("detail") {
		let files = engine.production_commit_files(commit).await?;
		if files.is_empty() {
			println!("No files changed.");
		}
		for (i, file) in files.iter().enumerate() {
			println!("{:>3}. [{}] {}", i + 1, file.kind.label(), file.path);
		}
		return Ok(());
	}

	let limit = sub.get_one::<usize>("limit").copied();
	let (title, entries) = if sub.get_flag("work") {
		("WORK HISTORY", engine.work_history(limit).await?)
	} else {
		("PRODUCTION HISTORY", engine.production_history(limit).await?)
	};

	println!("=== {} ===", title);
	if entries.is_empty() {
		println!("No commit history.");
		return Ok(());
	}
	println!("{}", "=".repeat(80));
	println!("{:<4} {:<8} {:<20} {:<15} {}", "No", "Hash", "Date", "Author", "Message");
	println!("{}", "=".repeat(80));
	for entry in entries {
		let mut message = entry.subject.clone();
		if message.chars().count() > 35 {
			message = message.chars().take(32).collect();
			message.push_str("...");
		}
		println!(
			"{:<4} {:<8} {:<20} {:<15} {}",
			entry.seq, entry.short_id, entry.date, entry.author, message
		);
	}
	println!("{}", "=".repeat(80));
	Ok(())
}

/// One-shot browser view: partial refresh through the state cache and the
/// bounded worker pool, then a clean teardown.
async fn run_status(engine: &SyncEngine, vcs: Arc<dyn Vcs>) -> Result<(), CcError> {
	let files = engine.collect_files(true);
	if files.is_empty() {
		println!("No files match the SOURCES patterns.");
		return Ok(());
	}

	engine.auto_capture(false).await?;

	let classifier = Arc::new(engine.classifier().await);
	let service = StatusService::start(
		classifier,
		vcs,
		engine.project().working_dir.clone(),
		DEFAULT_WORKERS,
		DEFAULT_CACHE_TTL,
		DEFAULT_WATCH_INTERVAL,
	);

	let mut states: HashMap<String, FileState> = files
		.iter()
		.map(|(_, rel)| (rel.clone(), service.state_of(rel)))
		.collect();

	// Drain worker results like the browser's redraw tick would
	let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(60);
	while states.values().any(|s| *s == FileState::Pending)
		&& tokio::time::Instant::now() < deadline
	{
		tokio::time::sleep(std::time::Duration::from_millis(50)).await;
		for (rel, state) in service.drain_pending() {
			states.insert(rel, state);
		}
	}

	let mut rows: Vec<(&String, &FileState)> = states.iter().collect();
	rows.sort_by(|a, b| a.0.cmp(b.0));
	for (rel, state) in rows {
		println!("[{:>10}] {}", state.to_string(), rel);
	}

	service.cleanup().await;
	Ok(())
}

// vim: ts=4

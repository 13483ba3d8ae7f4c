//! UI handler interface
//!
//! The core never talks to a terminal directly; it is handed a `UiHandler`
//! at construction time. The CLI driver supplies `CliHandler`; tests supply
//! `ScriptedHandler` with queued replies.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::Mutex;

use crate::logging::{debug, error, info, warn};

/// Severity of a user-visible message
///
/// `High` marks audit lines (escalated operations) that must survive into
/// the run log even at default verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
	Debug,
	Info,
	Warn,
	Error,
	High,
}

/// A question for the user
#[derive(Debug)]
pub enum Prompt<'a> {
	/// Yes/no confirmation
	YesNo { message: &'a str, title: &'a str, default_yes: bool },

	/// Free-text input with a default
	Input { message: &'a str, title: &'a str, default: &'a str },

	/// Numbered menu; returns the selected option index
	Choice { message: &'a str, title: &'a str, options: &'a [&'a str], default: usize },
}

/// The user's answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
	Yes,
	No,
	Text(String),
	Choice(usize),
	Cancelled,
}

/// Narrow interface the core is generic over; supplied by the UI layer
pub trait UiHandler: Send + Sync {
	/// Show a message to the user
	fn display(&self, level: Level, message: &str);

	/// Ask the user a question and wait for the answer
	fn prompt(&self, prompt: Prompt<'_>) -> Reply;
}

/// Plain stdout/stdin handler used by the CLI driver
///
/// Every displayed line is also forwarded to tracing so the run log keeps a
/// complete transcript.
pub struct CliHandler;

impl CliHandler {
	fn read_line() -> Option<String> {
		let mut line = String::new();
		let stdin = io::stdin();
		match stdin.lock().read_line(&mut line) {
			Ok(0) => None,
			Ok(_) => Some(line.trim().to_string()),
			Err(_) => None,
		}
	}
}

impl UiHandler for CliHandler {
	fn display(&self, level: Level, message: &str) {
		match level {
			Level::Debug => debug!("{}", message),
			Level::Info => {
				println!("{}", message);
				info!("{}", message);
			}
			Level::Warn => {
				println!("[WARNING] {}", message);
				warn!("{}", message);
			}
			Level::Error => {
				eprintln!("[ERROR] {}", message);
				error!("{}", message);
			}
			Level::High => {
				println!("{}", message);
				info!("[audit] {}", message);
			}
		}
	}

	fn prompt(&self, prompt: Prompt<'_>) -> Reply {
		match prompt {
			Prompt::YesNo { message, title, default_yes } => {
				let hint = if default_yes { "Y/n" } else { "y/N" };
				print!("[{}] {} ({}): ", title, message, hint);
				let _ = io::stdout().flush();
				match Self::read_line() {
					None => Reply::Cancelled,
					Some(line) if line.is_empty() => {
						if default_yes {
							Reply::Yes
						} else {
							Reply::No
						}
					}
					Some(line) => match line.to_lowercase().as_str() {
						"y" | "yes" => Reply::Yes,
						_ => Reply::No,
					},
				}
			}
			Prompt::Input { message, title, default } => {
				if default.is_empty() {
					print!("[{}] {}: ", title, message);
				} else {
					print!("[{}] {} [{}]: ", title, message, default);
				}
				let _ = io::stdout().flush();
				match Self::read_line() {
					None => Reply::Cancelled,
					Some(line) if line.is_empty() => Reply::Text(default.to_string()),
					Some(line) => Reply::Text(line),
				}
			}
			Prompt::Choice { message, title, options, default } => {
				println!("[{}] {}", title, message);
				for (i, option) in options.iter().enumerate() {
					println!("  {}. {}", i + 1, option);
				}
				print!("Select (1-{}) [{}]: ", options.len(), default + 1);
				let _ = io::stdout().flush();
				match Self::read_line() {
					None => Reply::Cancelled,
					Some(line) if line.is_empty() => Reply::Choice(default),
					Some(line) => match line.parse::<usize>() {
						Ok(n) if n >= 1 && n <= options.len() => Reply::Choice(n - 1),
						_ => Reply::Cancelled,
					},
				}
			}
		}
	}
}

/// Handler with pre-queued replies, for tests and non-interactive runs
///
/// Replies are consumed in order; when the queue is empty every prompt
/// answers `Cancelled`. All displayed messages are recorded.
pub struct ScriptedHandler {
	replies: Mutex<VecDeque<Reply>>,
	messages: Mutex<Vec<(Level, String)>>,
}

impl ScriptedHandler {
	pub fn new(replies: Vec<Reply>) -> Self {
		ScriptedHandler {
			replies: Mutex::new(replies.into_iter().collect()),
			messages: Mutex::new(Vec::new()),
		}
	}

	/// Everything displayed so far
	pub fn messages(&self) -> Vec<(Level, String)> {
		self.messages.lock().map(|m| m.clone()).unwrap_or_default()
	}

	/// True if any recorded message contains the needle
	pub fn saw(&self, needle: &str) -> bool {
		self.messages().iter().any(|(_, m)| m.contains(needle))
	}
}

impl Default for ScriptedHandler {
	fn default() -> Self {
		Self::new(Vec::new())
	}
}

impl UiHandler for ScriptedHandler {
	fn display(&self, level: Level, message: &str) {
		debug!("[scripted-ui] {:?}: {}", level, message);
		if let Ok(mut messages) = self.messages.lock() {
			messages.push((level, message.to_string()));
		}
	}

	fn prompt(&self, prompt: Prompt<'_>) -> Reply {
		let reply = self
			.replies
			.lock()
			.ok()
			.and_then(|mut r| r.pop_front())
			.unwrap_or(Reply::Cancelled);
		debug!("[scripted-ui] prompt {:?} -> {:?}", prompt, reply);
		reply
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_scripted_replies_in_order() {
		let ui = ScriptedHandler::new(vec![Reply::Yes, Reply::Text("msg".to_string())]);

		let first = ui.prompt(Prompt::YesNo { message: "go?", title: "t", default_yes: false });
		assert_eq!(first, Reply::Yes);

		let second = ui.prompt(Prompt::Input { message: "comment", title: "t", default: "" });
		assert_eq!(second, Reply::Text("msg".to_string()));

		// Queue exhausted
		let third = ui.prompt(Prompt::YesNo { message: "go?", title: "t", default_yes: false });
		assert_eq!(third, Reply::Cancelled);
	}

	#[test]
	fn test_scripted_records_messages() {
		let ui = ScriptedHandler::default();
		ui.display(Level::Warn, "conflict detected: AAA/a.c");
		assert!(ui.saw("conflict detected"));
		assert_eq!(ui.messages().len(), 1);
	}
}

// vim: ts=4

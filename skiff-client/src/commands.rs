//! Command interception for terminal input
//!
//! Lines starting with the reserved prefix are client commands and are
//! never forwarded to the remote shell. The interceptor owns a registry
//! of named handlers wired by the host; `help` is always available and
//! enumerates them. Unknown prefixed commands are consumed with a local
//! notice rather than leaking to the shell.

use std::collections::BTreeMap;

use skiff_utils::Result;

/// Reserved prefix marking a line as a client command
pub const DEFAULT_PREFIX: char = ':';

/// Names the standard hosts wire up. Only `help` is built in.
pub mod builtin {
    pub const HELP: &str = "help";
    pub const CLEAR: &str = "clear";
    pub const SESSIONS: &str = "sessions";
    pub const NEW_SESSION: &str = "new-session";
    pub const CLOSE_SESSION: &str = "close-session";
    pub const FOCUS: &str = "focus";
    pub const RUN: &str = "run";
    pub const OPEN: &str = "open";
    pub const SAVE: &str = "save";
}

/// Host callback for one command, invoked with its arguments
pub type CommandHandler = Box<dyn FnMut(&[&str]) -> Result<()> + Send>;

struct Command {
    usage: String,
    description: String,
    handler: CommandHandler,
}

/// Intercepts prefixed lines before they reach the terminal channel
pub struct CommandInterceptor {
    prefix: char,
    commands: BTreeMap<String, Command>,
    notices: Vec<String>,
}

impl Default for CommandInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandInterceptor {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }

    pub fn with_prefix(prefix: char) -> Self {
        Self {
            prefix,
            commands: BTreeMap::new(),
            notices: Vec::new(),
        }
    }

    /// Register a handler. Re-registering a name replaces the previous
    /// handler.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        usage: impl Into<String>,
        description: impl Into<String>,
        handler: CommandHandler,
    ) {
        self.commands.insert(
            name.into(),
            Command {
                usage: usage.into(),
                description: description.into(),
                handler,
            },
        );
    }

    /// Inspect one line of input. Returns true when the line was a
    /// command and must NOT be forwarded to the shell; false means the
    /// line is ordinary input.
    pub fn handle(&mut self, line: &str) -> bool {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let Some(rest) = trimmed.strip_prefix(self.prefix) else {
            return false;
        };

        let mut tokens = rest.split_whitespace();
        let Some(name) = tokens.next() else {
            self.notices
                .push(format!("empty command (try {}help)", self.prefix));
            return true;
        };
        let args: Vec<&str> = tokens.collect();

        if name == builtin::HELP {
            let help = self.help_text();
            self.notices.push(help);
            return true;
        }

        match self.commands.get_mut(name) {
            Some(command) => {
                if let Err(e) = (command.handler)(&args) {
                    self.notices
                        .push(format!("{name}: {e} (usage: {})", command.usage));
                }
            }
            None => {
                self.notices.push(format!(
                    "unknown command: {name} (try {}help)",
                    self.prefix
                ));
            }
        }
        true
    }

    /// Drain notices produced by handled commands, oldest first
    pub fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notices)
    }

    /// Human-readable listing of every registered command
    pub fn help_text(&self) -> String {
        let mut out = String::from("commands:\n");
        out.push_str(&format!("  {}{:<24} show this help\n", self.prefix, builtin::HELP));
        for command in self.commands.values() {
            out.push_str(&format!(
                "  {}{:<24} {}\n",
                self.prefix, command.usage, command.description
            ));
        }
        out
    }

    /// Registered command names, sorted (excluding the built-in help)
    pub fn names(&self) -> Vec<&str> {
        self.commands.keys().map(String::as_str).collect()
    }
}

//! Built-in inspection shell.
//!
//! A deliberately small line-oriented engine so a target is usable without a
//! host-provided engine. Each reply and the following prompt are written with
//! a single flush, so one reply normally arrives as one chunk on the client.
//!
//! ```text
//! (hotattach) info
//! pid:        4242
//! trigger:    SIGINT
//! ...
//! (hotattach) quit
//! ```

use crate::engine::{ActivationContext, DebugEngine};
use crate::error::EngineError;
use fs_err as fs;
use std::env;
use std::fmt::Write as _;
use std::io::{BufRead, Write};

pub const DEFAULT_PROMPT: &str = "(hotattach) ";

type CommandHandler = Box<dyn Fn(&ActivationContext, &str) -> Result<String, String> + Send + Sync>;

struct CustomCommand {
    name: String,
    help: String,
    handler: CommandHandler,
}

pub struct InspectShell {
    prompt: String,
    commands: Vec<CustomCommand>,
}

impl Default for InspectShell {
    fn default() -> Self {
        Self::new()
    }
}

impl InspectShell {
    pub fn new() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            commands: Vec::new(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Registers a host command. The handler receives the text after the
    /// command name; an `Err` ends the session as an engine failure.
    pub fn with_command<F>(mut self, name: impl Into<String>, help: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&ActivationContext, &str) -> Result<String, String> + Send + Sync + 'static,
    {
        let name = name.into();
        self.commands.retain(|command| command.name != name);
        self.commands.push(CustomCommand {
            name,
            help: help.into(),
            handler: Box::new(handler),
        });
        self
    }

    fn help_text(&self) -> String {
        let mut text = String::from(
            "help                 show this help\n\
             info                 pid, trigger, thread and activation time\n\
             where | bt           fault location and backtrace\n\
             threads              threads of this process\n\
             env NAME             value of an environment variable\n\
             context              activation context as JSON\n\
             continue | c         end the session and resume\n\
             quit | q | exit      end the session\n",
        );
        for command in &self.commands {
            let _ = writeln!(text, "{:<20} {}", command.name, command.help);
        }
        text
    }

    fn run_command(
        &self,
        ctx: &ActivationContext,
        command: &str,
        args: &str,
    ) -> Result<Option<String>, EngineError> {
        let reply = match command {
            "" => String::new(),
            "help" | "h" | "?" => self.help_text(),
            "info" => info_text(ctx),
            "where" | "bt" | "backtrace" => where_text(ctx),
            "threads" => threads_text(),
            "env" => env_text(args),
            "context" => match serde_json::to_string_pretty(ctx) {
                Ok(json) => json + "\n",
                Err(err) => format!("*** cannot render context: {}\n", err),
            },
            "continue" | "c" | "quit" | "q" | "exit" => return Ok(None),
            other => match self.commands.iter().find(|custom| custom.name == other) {
                Some(custom) => {
                    let mut text = (custom.handler)(ctx, args).map_err(|message| {
                        EngineError::Command {
                            command: other.to_string(),
                            message,
                        }
                    })?;
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    text
                }
                None => format!("*** unknown command: {}\n", other),
            },
        };
        Ok(Some(reply))
    }
}

impl DebugEngine for InspectShell {
    fn interact(
        &self,
        ctx: &ActivationContext,
        input: &mut dyn BufRead,
        output: &mut dyn Write,
    ) -> Result<(), EngineError> {
        let banner = format!(
            "hotattach: attached to PID {} ({})\nType `help` for commands.\n{}",
            ctx.pid, ctx.trigger, self.prompt
        );
        output.write_all(banner.as_bytes())?;
        output.flush()?;

        loop {
            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                return Ok(());
            }

            let line = line.trim();
            let (command, args) = match line.split_once(char::is_whitespace) {
                Some((command, args)) => (command, args.trim()),
                None => (line, ""),
            };

            let Some(mut reply) = self.run_command(ctx, command, args)? else {
                return Ok(());
            };
            reply.push_str(&self.prompt);
            output.write_all(reply.as_bytes())?;
            output.flush()?;
        }
    }
}

fn info_text(ctx: &ActivationContext) -> String {
    format!(
        "pid:        {}\ntrigger:    {}\nthread:     {}\nactivated:  {}\n",
        ctx.pid,
        ctx.trigger,
        ctx.thread.as_deref().unwrap_or("<unnamed>"),
        ctx.activated_at.to_rfc3339()
    )
}

fn where_text(ctx: &ActivationContext) -> String {
    let Some(fault) = ctx.fault() else {
        return format!(
            "interrupted by {}; no fault backtrace was captured\n",
            ctx.trigger
        );
    };

    let mut text = format!("fault: {}\n", fault.message);
    if let Some(location) = &fault.location {
        let _ = writeln!(text, "at:    {}", location);
    }
    if let Some(thread) = &fault.thread {
        let _ = writeln!(text, "in:    {}", thread);
    }
    match &fault.backtrace {
        Some(backtrace) => {
            text.push_str(backtrace);
            if !backtrace.ends_with('\n') {
                text.push('\n');
            }
        }
        None => text.push_str("no backtrace captured\n"),
    }
    text
}

#[cfg(target_os = "linux")]
fn threads_text() -> String {
    let entries = match fs::read_dir("/proc/self/task") {
        Ok(entries) => entries,
        Err(err) => return format!("*** cannot list threads: {}\n", err),
    };

    let mut threads: Vec<(u64, String)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let tid: u64 = entry.file_name().to_str()?.parse().ok()?;
            let name = fs::read_to_string(entry.path().join("comm"))
                .map(|name| name.trim().to_string())
                .unwrap_or_default();
            Some((tid, name))
        })
        .collect();
    threads.sort();

    let mut text = String::new();
    for (tid, name) in threads {
        let _ = writeln!(text, "{:>8}  {}", tid, name);
    }
    text
}

#[cfg(not(target_os = "linux"))]
fn threads_text() -> String {
    "thread listing is only available on Linux\n".to_string()
}

fn env_text(name: &str) -> String {
    if name.is_empty() {
        return "usage: env NAME\n".to_string();
    }
    match env::var(name) {
        Ok(value) => format!("{}={}\n", name, value),
        Err(_) => format!("{} is not set\n", name),
    }
}

//! Console system.
//!
//! The explicit diagnostics surface for the reconciliation core: typed
//! console variables for the tunables, a command registry, and quoted-arg
//! parsing. A REPL or test harness queries state through this instead of
//! any globally-reachable debug hooks.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context};

/// Console variable value.
#[derive(Debug, Clone, PartialEq)]
pub enum CvarValue {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
}

impl CvarValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            CvarValue::Int(v) => Some(*v),
            CvarValue::Float(v) => Some(*v as i64),
            CvarValue::Bool(v) => Some(if *v { 1 } else { 0 }),
            CvarValue::String(s) => s.parse().ok(),
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            CvarValue::Float(v) => Some(*v),
            CvarValue::Int(v) => Some(*v as f64),
            CvarValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            CvarValue::Bool(v) => *v,
            CvarValue::Int(v) => *v != 0,
            CvarValue::Float(v) => *v != 0.0,
            CvarValue::String(s) => !s.is_empty() && s != "0" && s.to_lowercase() != "false",
        }
    }
}

impl std::fmt::Display for CvarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CvarValue::Int(v) => write!(f, "{}", v),
            CvarValue::Float(v) => write!(f, "{}", v),
            CvarValue::String(v) => write!(f, "\"{}\"", v),
            CvarValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

bitflags::bitflags! {
    /// Cvar flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CvarFlags: u32 {
        const NONE = 0;
        /// Saved to config.
        const ARCHIVE = 1 << 0;
        /// Server value wins on connected clients.
        const REPLICATED = 1 << 1;
        /// Server-side only.
        const SERVER_ONLY = 1 << 2;
    }
}

impl Default for CvarFlags {
    fn default() -> Self {
        Self::NONE
    }
}

/// Console variable metadata.
#[derive(Debug, Clone)]
pub struct Cvar {
    pub name: String,
    pub value: CvarValue,
    pub default: CvarValue,
    pub description: String,
    pub flags: CvarFlags,
}

/// Command handler function type.
pub type CommandHandler =
    Box<dyn Fn(&[&str], &mut ConsoleContext) -> anyhow::Result<()> + Send + Sync>;

/// Context passed to command handlers.
pub struct ConsoleContext {
    /// Output buffer for command responses.
    pub output: Vec<String>,
    cvars: Arc<RwLock<HashMap<String, Cvar>>>,
}

impl ConsoleContext {
    pub fn print(&mut self, msg: impl Into<String>) {
        self.output.push(msg.into());
    }

    pub fn get_cvar(&self, name: &str) -> Option<CvarValue> {
        self.cvars.read().ok()?.get(name).map(|c| c.value.clone())
    }

    pub fn set_cvar(&self, name: &str, value: CvarValue) -> anyhow::Result<()> {
        let mut cvars = self
            .cvars
            .write()
            .map_err(|_| anyhow::anyhow!("lock poisoned"))?;
        match cvars.get_mut(name) {
            Some(cvar) => {
                cvar.value = value;
                Ok(())
            }
            None => bail!("unknown cvar: {}", name),
        }
    }
}

/// The console.
pub struct Console {
    cvars: Arc<RwLock<HashMap<String, Cvar>>>,
    commands: HashMap<String, CommandHandler>,
    history: Vec<String>,
    max_history: usize,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    pub fn new() -> Self {
        let mut console = Self {
            cvars: Arc::new(RwLock::new(HashMap::new())),
            commands: HashMap::new(),
            history: Vec::new(),
            max_history: 100,
        };
        console.register_builtin_commands();
        console
    }

    fn register_builtin_commands(&mut self) {
        self.register_command("echo", |args, ctx| {
            ctx.print(args.join(" "));
            Ok(())
        });

        self.register_command("cvarlist", |_args, ctx| {
            let cvars = ctx.cvars.read().map_err(|_| anyhow::anyhow!("lock"))?;
            let mut lines: Vec<String> = cvars
                .values()
                .map(|c| format!("  {} = {} (default: {}) - {}", c.name, c.value, c.default, c.description))
                .collect();
            lines.sort();
            drop(cvars);
            for line in lines {
                ctx.print(line);
            }
            Ok(())
        });

        self.register_command("set", |args, ctx| {
            if args.len() < 2 {
                bail!("usage: set <cvar> <value>");
            }
            let name = args[0];
            let value_str = args[1..].join(" ");
            let value = parse_value(&value_str);
            let shown = value.clone();
            ctx.set_cvar(name, value)?;
            ctx.print(format!("{} = {}", name, shown));
            Ok(())
        });
    }

    /// Registers a console variable.
    pub fn register_cvar(
        &mut self,
        name: &str,
        default: CvarValue,
        description: &str,
        flags: CvarFlags,
    ) {
        let cvar = Cvar {
            name: name.to_string(),
            value: default.clone(),
            default,
            description: description.to_string(),
            flags,
        };
        if let Ok(mut cvars) = self.cvars.write() {
            cvars.insert(name.to_string(), cvar);
        }
    }

    /// Registers a command.
    pub fn register_command<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&[&str], &mut ConsoleContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.commands.insert(name.to_string(), Box::new(handler));
    }

    /// Executes a console command line and returns its output lines.
    pub fn exec(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            return Ok(Vec::new());
        }

        self.history.push(line.to_string());
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }

        let tokens = parse_command_line(line);
        let Some(cmd_name) = tokens.first() else {
            return Ok(Vec::new());
        };
        let args: Vec<&str> = tokens[1..].iter().map(|s| s.as_str()).collect();

        let mut ctx = ConsoleContext {
            output: Vec::new(),
            cvars: Arc::clone(&self.cvars),
        };

        // Typing a bare cvar name queries it; with arguments, sets it.
        if !self.commands.contains_key(cmd_name.as_str()) {
            let known = self
                .cvars
                .read()
                .ok()
                .and_then(|cvars| cvars.get(cmd_name.as_str()).cloned());
            if let Some(cvar) = known {
                if args.is_empty() {
                    ctx.print(format!(
                        "{} = {} (default: {})",
                        cvar.name, cvar.value, cvar.default
                    ));
                    return Ok(ctx.output);
                }
                return self.exec(&format!("set {} {}", cmd_name, args.join(" ")));
            }
        }

        match self.commands.get(cmd_name.as_str()) {
            Some(handler) => {
                handler(&args, &mut ctx).with_context(|| format!("command '{}'", cmd_name))?
            }
            None => ctx.print(format!("Unknown command: {}", cmd_name)),
        }

        Ok(ctx.output)
    }

    /// Gets a cvar value.
    pub fn get_cvar(&self, name: &str) -> Option<CvarValue> {
        self.cvars.read().ok()?.get(name).map(|c| c.value.clone())
    }

    /// Sets a cvar value.
    pub fn set_cvar(&self, name: &str, value: CvarValue) -> anyhow::Result<()> {
        let mut cvars = self.cvars.write().map_err(|_| anyhow::anyhow!("lock"))?;
        match cvars.get_mut(name) {
            Some(cvar) => {
                cvar.value = value;
                Ok(())
            }
            None => bail!("unknown cvar: {}", name),
        }
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }
}

fn parse_value(s: &str) -> CvarValue {
    if let Ok(v) = s.parse::<i64>() {
        CvarValue::Int(v)
    } else if let Ok(v) = s.parse::<f64>() {
        CvarValue::Float(v)
    } else if s == "true" {
        CvarValue::Bool(true)
    } else if s == "false" {
        CvarValue::Bool(false)
    } else {
        CvarValue::String(s.trim_matches('"').to_string())
    }
}

/// Parses a command line into tokens, respecting quotes.
fn parse_command_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ' ' | '\t' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_cvar_roundtrip() {
        let mut console = Console::new();
        console.register_cvar(
            "cl_sweep_interval",
            CvarValue::Float(2.0),
            "Eviction sweep cadence",
            CvarFlags::NONE,
        );

        assert_eq!(
            console.get_cvar("cl_sweep_interval"),
            Some(CvarValue::Float(2.0))
        );

        console.exec("set cl_sweep_interval 4").unwrap();
        assert_eq!(
            console.get_cvar("cl_sweep_interval"),
            Some(CvarValue::Int(4))
        );
    }

    #[test]
    fn bare_cvar_name_queries_value() {
        let mut console = Console::new();
        console.register_cvar(
            "sv_sync_interval",
            CvarValue::Float(5.0),
            "Presence sync interval",
            CvarFlags::SERVER_ONLY,
        );
        let out = console.exec("sv_sync_interval").unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].contains("sv_sync_interval = 5"));
    }

    #[test]
    fn parse_quoted_args() {
        let tokens = parse_command_line(r#"say "hello world" test"#);
        assert_eq!(tokens, vec!["say", "hello world", "test"]);
    }
}

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A fully described external command. Stages build these; a [`CommandRunner`]
/// decides how they are executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub current_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            current_dir: None,
            env: BTreeMap::new(),
        }
    }

    /// Run `line` through `sh -c`, used for user supplied command overrides.
    pub fn shell(line: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(line)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Human readable command line. Stdin is never included so secrets piped
    /// through it stay out of logs.
    pub fn display(&self) -> String {
        if self.program == "sh" && self.args.len() == 2 && self.args[0] == "-c" {
            return self.args[1].clone();
        }
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into a [`CommandFailed`] carrying the tail of stderr.
    pub fn ensure_success(&self, command: &CommandSpec) -> Result<()> {
        if self.success() {
            return Ok(());
        }
        let tail: Vec<&str> = self.stderr.lines().rev().take(5).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        Err(CommandFailed {
            command: command.display(),
            code: self.code,
            stderr_tail: tail.join(" | "),
        }
        .into())
    }
}

#[derive(Debug, Error)]
#[error("`{command}` exited with status {}{}", status_text(*code), tail_text(stderr_tail))]
pub struct CommandFailed {
    pub command: String,
    pub code: Option<i32>,
    pub stderr_tail: String,
}

fn status_text(code: Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

fn tail_text(tail: &str) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!(": {tail}")
    }
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput>;
}

/// Executes commands on the host and blocks until they finish.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        info!(command = %command.display(), "Running command");
        let mut process = Command::new(&command.program);
        process
            .args(&command.args)
            .envs(&command.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(dir) = &command.current_dir {
            process.current_dir(dir);
        }

        let mut child = process
            .spawn()
            .with_context(|| format!("Failed to start '{}'", command.program))?;

        if let Some(input) = &command.stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input.as_bytes())
                .with_context(|| format!("Failed to write stdin of '{}'", command.program))?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for '{}'", command.program))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        for line in stdout.lines() {
            debug!(target: "dockyard::command", "{line}");
        }
        if !output.status.success() {
            for line in stderr.lines() {
                warn!(target: "dockyard::command", "{line}");
            }
        }

        Ok(CommandOutput {
            code: output.status.code(),
            stdout,
            stderr,
        })
    }
}

/// Records every command instead of executing it. Commands whose display line
/// contains a scripted pattern exit with the scripted code; everything else
/// succeeds. Used for `--dry-run` and in tests.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    invocations: Mutex<Vec<CommandSpec>>,
    failures: Mutex<Vec<(String, i32)>>,
    stdout: Mutex<Vec<(String, String)>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_when(self, pattern: impl Into<String>, code: i32) -> Self {
        if let Ok(mut guard) = self.failures.lock() {
            guard.push((pattern.into(), code));
        }
        self
    }

    pub fn respond_with(self, pattern: impl Into<String>, stdout: impl Into<String>) -> Self {
        if let Ok(mut guard) = self.stdout.lock() {
            guard.push((pattern.into(), stdout.into()));
        }
        self
    }

    pub fn invocations(&self) -> Vec<CommandSpec> {
        self.invocations
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.invocations().iter().map(CommandSpec::display).collect()
    }

    pub fn ran(&self, fragment: &str) -> bool {
        self.command_lines().iter().any(|line| line.contains(fragment))
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        let line = command.display();
        info!(command = %line, "Recording command");
        if let Ok(mut guard) = self.invocations.lock() {
            guard.push(command.clone());
        }

        let code = self
            .failures
            .lock()
            .ok()
            .and_then(|g| {
                g.iter()
                    .find(|(pattern, _)| line.contains(pattern.as_str()))
                    .map(|(_, code)| *code)
            })
            .unwrap_or(0);
        let stdout = self
            .stdout
            .lock()
            .ok()
            .and_then(|g| {
                g.iter()
                    .find(|(pattern, _)| line.contains(pattern.as_str()))
                    .map(|(_, out)| out.clone())
            })
            .unwrap_or_default();

        Ok(CommandOutput {
            code: Some(code),
            stdout,
            stderr: if code == 0 {
                String::new()
            } else {
                format!("scripted failure ({code})")
            },
        })
    }
}

//! External command execution.
//!
//! Every build step, git operation and patch application goes through the
//! [`CommandRunner`] trait so sources can be exercised with a scripted fake.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Errors from running external commands.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run {command}: {status}\n{output}")]
    Failed {
        command: String,
        status: String,
        output: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    /// Captured output of a failed command, empty if it never ran.
    pub fn output(&self) -> &str {
        match self {
            CommandError::Failed { output, .. } => output,
            CommandError::Spawn { .. } | CommandError::Io { .. } => "",
        }
    }
}

/// A command to run to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,

    /// Arguments.
    pub args: Vec<String>,

    /// Working directory; inherits the agent's when unset.
    pub dir: Option<PathBuf>,

    /// Bytes written to stdin; stdin is null when unset.
    pub stdin: Option<Vec<u8>>,

    /// Extra environment variables.
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    /// Create a command with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Feed bytes to stdin.
    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Runs external commands to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command and return its combined stdout and stderr.
    ///
    /// A non-zero exit is an error that carries the captured output.
    async fn run(&self, spec: &CommandSpec) -> Result<Vec<u8>, CommandError>;
}

/// [`CommandRunner`] backed by real OS processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    base_env: HashMap<String, String>,
}

impl ProcessRunner {
    /// Create a runner with no extra environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an environment variable applied to every command.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.base_env.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<Vec<u8>, CommandError> {
        debug!(command = %spec, dir = ?spec.dir, "Running command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&self.base_env)
            .envs(&spec.env)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
            command: spec.to_string(),
            source,
        })?;

        if let (Some(data), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
            // A child that exits without reading stdin closes the pipe; its
            // exit status is what matters.
            let _ = stdin.write_all(data).await;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| CommandError::Spawn {
                command: spec.to_string(),
                source,
            })?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);

        if !output.status.success() {
            return Err(CommandError::Failed {
                command: spec.to_string(),
                status: output.status.to_string(),
                output: String::from_utf8_lossy(&combined).into_owned(),
            });
        }

        Ok(combined)
    }
}

/// Scripted runner for testing and development.
///
/// Records every command and answers from rules matched against the
/// command line. Later rules take priority; unmatched commands succeed with
/// empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    calls: std::sync::Mutex<Vec<CommandSpec>>,
    rules: std::sync::Mutex<Vec<(String, Result<String, String>)>>,
}

impl ScriptedRunner {
    /// Create a runner where every command succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern` with successful `output`.
    pub fn respond(&self, pattern: &str, output: &str) {
        self.push_rule(pattern, Ok(output.to_string()));
    }

    /// Fail commands containing `pattern` with `output`.
    pub fn fail(&self, pattern: &str, output: &str) {
        self.push_rule(pattern, Err(output.to_string()));
    }

    fn push_rule(&self, pattern: &str, outcome: Result<String, String>) {
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((pattern.to_string(), outcome));
    }

    /// All commands run so far.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Command lines run so far.
    pub fn commands(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<Vec<u8>, CommandError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec.clone());

        let line = spec.to_string();
        let rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        match rules.iter().rev().find(|(pattern, _)| line.contains(pattern.as_str())) {
            Some((_, Ok(output))) => Ok(output.clone().into_bytes()),
            Some((_, Err(output))) => Err(CommandError::Failed {
                command: line,
                status: "exit status: 1".to_string(),
                output: output.clone(),
            }),
            None => Ok(Vec::new()),
        }
    }
}

//! Build step execution.
//!
//! Real implementation: `ShellRunner`. Test double: `testing::ScriptedRunner`.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// One shell command to run for a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub service: String,
    pub command: String,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, for failure classification.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Abstraction over build step execution for testability.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion. Dropping the returned future must stop
    /// the command.
    async fn run(&self, request: &CommandRequest) -> std::io::Result<CommandOutput>;
}

/// Runs each step with `sh -c` in the service's working directory.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, request: &CommandRequest) -> std::io::Result<CommandOutput> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&request.command)
            .current_dir(&request.working_dir)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

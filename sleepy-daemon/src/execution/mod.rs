//! External process execution
//!
//! Every collaborator that shells out (docker, lsblk, zpool, mysqldump,
//! docker-compose, unzip) goes through here so failures carry the program
//! name and its stderr.

use crate::error::{AgentError, AgentResult};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Captured result of a finished command
#[derive(Debug)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub struct CommandExecutor;

impl CommandExecutor {
    /// Run a program to completion, capturing its output
    pub async fn run<S: AsRef<str>>(
        program: &str,
        args: &[S],
        dir: Option<&Path>,
    ) -> AgentResult<ExecutionResult> {
        debug!("Executing: {} {}", program, Self::join_args(args));

        let mut cmd = AsyncCommand::new(program);
        cmd.args(args.iter().map(|a| a.as_ref()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|e| AgentError::Command {
            program: program.to_string(),
            message: e.to_string(),
        })?;

        Ok(ExecutionResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }

    /// Run a program and return its stdout, failing on a non-zero exit
    pub async fn output<S: AsRef<str>>(
        program: &str,
        args: &[S],
        dir: Option<&Path>,
    ) -> AgentResult<String> {
        let result = Self::run(program, args, dir).await?;
        if result.success() {
            Ok(result.stdout)
        } else {
            let message = if result.stderr.trim().is_empty() {
                format!("exit code {:?}", result.exit_code)
            } else {
                result.stderr.trim().to_string()
            };
            Err(AgentError::Command {
                program: program.to_string(),
                message,
            })
        }
    }

    /// Whether a program can be spawned at all
    pub async fn exists(program: &str) -> bool {
        Self::run(program, &["--version"], None).await.is_ok()
    }

    fn join_args<S: AsRef<str>>(args: &[S]) -> String {
        args.iter().map(|a| a.as_ref()).collect::<Vec<_>>().join(" ")
    }
}

//! Small helper trait around `tokio::process::Command` used by the `wg` CLI
//! shell-out in [`crate::platform::wg`].

use thiserror::Error;
use tokio::process::Command;

use std::future::Future;
use std::io;
use std::process::Output;

#[derive(Debug, Error)]
pub enum Error {
    #[error("command execution failed")]
    CommandFailed,
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// log errors and warnings or suppress them
#[derive(Debug, Clone, Copy)]
pub enum Logs {
    Print,
    Suppress,
}

pub trait ShellCommandExt {
    fn run(&mut self, logs: Logs) -> impl Future<Output = Result<(), Error>> + Send;
    fn run_stdout(&mut self, logs: Logs) -> impl Future<Output = Result<String, Error>> + Send;
}

impl ShellCommandExt for Command {
    async fn run(&mut self, logs: Logs) -> Result<(), Error> {
        let output = self.output().await?;
        match output.status.success() {
            true => {
                if !output.stderr.is_empty() && matches!(logs, Logs::Print) {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    tracing::warn!(cmd = ?self, %stderr, "non empty stderr on successful command");
                }
                Ok(())
            }
            false => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if matches!(logs, Logs::Print) {
                    tracing::error!(cmd = ?self, status_code = ?output.status.code(), %stdout, %stderr, "error executing command");
                }
                Err(Error::CommandFailed)
            }
        }
    }

    async fn run_stdout(&mut self, logs: Logs) -> Result<String, Error> {
        let output = self.output().await?;
        let cmd_debug = format!("{:?}", self);
        stdout_from_output(cmd_debug, output, logs)
    }
}

pub fn stdout_from_output(cmd: String, output: Output, logs: Logs) -> Result<String, Error> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    match output.status.success() {
        true => {
            if !output.stderr.is_empty() && matches!(logs, Logs::Print) {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!(cmd, %stderr, "non empty stderr on successful command");
            }
            Ok(stdout.trim().to_string())
        }
        false => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if matches!(logs, Logs::Print) {
                tracing::error!(cmd, status_code = ?output.status.code(), %stdout, %stderr, "error executing command");
            }
            Err(Error::CommandFailed)
        }
    }
}

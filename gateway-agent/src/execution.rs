//! Remote program execution for `exec` commands
//!
//! The program is started directly with its argument list (no shell), stdout
//! and stderr are captured, and the run is bounded by a timeout.

use serde::Serialize;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use crate::error::{AgentError, Result};

/// Upper bound for one `exec` run
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Command execution result
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u128,
}

pub struct CommandExecutor;

impl CommandExecutor {
    /// Runs `program` with `args`. A program that cannot be started or does not
    /// finish in time is a resource failure; a non-zero exit is not.
    pub async fn run(program: &str, args: &[String], timeout: Duration) -> Result<ExecutionResult> {
        let start_time = Instant::now();
        debug!("Executing {} {:?} (timeout: {:?})", program, args, timeout);

        let output = tokio::time::timeout(
            timeout,
            AsyncCommand::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| AgentError::Resource(format!("{program} timed out after {timeout:?}")))?
        .map_err(|e| AgentError::Resource(format!("failed to execute {program}: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined_output = if stderr.is_empty() {
            stdout.to_string()
        } else {
            format!("{stdout}{stderr}")
        };

        Ok(ExecutionResult {
            success: output.status.success(),
            output: combined_output,
            exit_code: output.status.code(),
            execution_time_ms: start_time.elapsed().as_millis(),
        })
    }
}

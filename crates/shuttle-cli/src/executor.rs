//! Task executors for the `worker` command.

use std::time::Duration;

use async_trait::async_trait;
use shuttle_core::domain::{TaskId, WorkspaceSlot};
use shuttle_core::ports::TaskExecutor;
use tokio::process::Command;
use tracing::{debug, info};

const STDERR_TAIL_CHARS: usize = 2048;

/// Runs a shell command per task.
///
/// The child is killed when the attempt is dropped (lost lease or shutdown).
pub struct CommandExecutor {
    command: String,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, task_id: &TaskId, slot: &WorkspaceSlot) -> Result<(), String> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .env("SHUTTLE_TASK_ID", task_id.as_str())
            .env("SHUTTLE_SLOT_ID", &slot.slot_id)
            .kill_on_drop(true);
        if let Some(branch) = &slot.branch {
            cmd.env("SHUTTLE_BRANCH", branch);
        }

        debug!(task = %task_id, command = %self.command, "spawning task command");
        let output = cmd
            .output()
            .await
            .map_err(|err| format!("failed to spawn `{}`: {err}", self.command))?;

        if output.status.success() {
            info!(task = %task_id, "task command succeeded");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail_start = stderr
            .char_indices()
            .rev()
            .nth(STDERR_TAIL_CHARS)
            .map_or(0, |(idx, _)| idx);
        Err(format!(
            "command exited with {}: {}",
            output.status,
            stderr[tail_start..].trim()
        ))
    }
}

/// Sleeps for a fixed time and succeeds; for trying out the coordination
/// without a real agent.
pub struct SimulatedExecutor {
    work: Duration,
}

impl SimulatedExecutor {
    pub fn new(work: Duration) -> Self {
        Self { work }
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, task_id: &TaskId, slot: &WorkspaceSlot) -> Result<(), String> {
        info!(task = %task_id, slot = %slot.slot_id, secs = self.work.as_secs(), "simulating work");
        tokio::time::sleep(self.work).await;
        Ok(())
    }
}

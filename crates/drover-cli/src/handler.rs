//! Job handler that runs an external command per job

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::io::ErrorKind;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use drover_queue::JobHandler;

/// Spawns `program args...` for every job and writes the JSON body to its
/// stdin. Exit status 0 acknowledges the job, any other status fails it.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
}

impl CommandHandler {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split `[program, args...]` as given on the command line
    pub fn from_argv(argv: Vec<String>) -> Result<Self> {
        let mut argv = argv.into_iter();
        let program = argv.next().context("No command given")?;
        Ok(Self::new(program, argv))
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn process(&self, body: &Value) -> Result<bool> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut payload = serde_json::to_vec(body)?;
            payload.push(b'\n');

            // A command may exit without reading its input.
            match stdin.write_all(&payload).await {
                Err(e) if e.kind() != ErrorKind::BrokenPipe => {
                    return Err(e).context("Failed to write job to stdin");
                }
                _ => {}
            }
        }

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for {}", self.program))?;

        debug!(program = %self.program, status = %status, "Command finished");
        Ok(status.success())
    }
}

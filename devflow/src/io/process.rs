//! Cancellable child-process runner with a timeout and bounded output capture.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

/// Captured output of a process that exited on its own.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// How a process run ended.
#[derive(Debug)]
pub enum CommandEnd {
    Exited(CommandOutput),
    TimedOut,
    Cancelled,
}

/// Run `cmd`, feeding `stdin`, until it exits, the timeout fires, or `cancel` trips.
///
/// Pipes are drained concurrently so a chatty child cannot deadlock on a full
/// pipe. Bytes beyond `output_limit_bytes` are counted and discarded. On
/// timeout or cancellation the child is killed before returning.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub async fn run_cancellable(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancellationToken,
) -> Result<CommandEnd> {
    if cancel.is_cancelled() {
        return Ok(CommandEnd::Cancelled);
    }
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(err = %err, "failed to spawn command");
            return Err(err).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut pipe = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        tokio::spawn(async move {
            // A child that exits without reading stdin closes the pipe early.
            if let Err(err) = pipe.write_all(&input).await {
                debug!(err = %err, "stdin write ended early");
            }
            let _ = pipe.shutdown().await;
        });
    }

    let stdout = spawn_reader(child.stdout.take(), output_limit_bytes);
    let stderr = spawn_reader(child.stderr.take(), output_limit_bytes);

    tokio::select! {
        waited = tokio::time::timeout(timeout, child.wait()) => match waited {
            Ok(status) => {
                let status = status.context("wait for command")?;
                let (stdout, stdout_truncated) = join_reader(stdout).await.context("join stdout")?;
                let (stderr, stderr_truncated) = join_reader(stderr).await.context("join stderr")?;
                if stdout_truncated > 0 || stderr_truncated > 0 {
                    warn!(stdout_truncated, stderr_truncated, "output truncated");
                }
                debug!(exit_code = ?status.code(), "command finished");
                Ok(CommandEnd::Exited(CommandOutput {
                    status,
                    stdout,
                    stderr,
                    stdout_truncated,
                    stderr_truncated,
                }))
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
                if let Err(err) = child.kill().await {
                    warn!(err = %err, "kill after timeout failed");
                }
                Ok(CommandEnd::TimedOut)
            }
        },
        () = cancel.cancelled() => {
            debug!("cancellation requested, killing command");
            if let Err(err) = child.kill().await {
                warn!(err = %err, "kill after cancellation failed");
            }
            Ok(CommandEnd::Cancelled)
        }
    }
}

type ReaderHandle = JoinHandle<Result<(Vec<u8>, usize)>>;

fn spawn_reader<R>(pipe: Option<R>, limit: usize) -> ReaderHandle
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match pipe {
            Some(pipe) => read_limited(pipe, limit).await,
            None => Ok((Vec::new(), 0)),
        }
    })
}

async fn join_reader(handle: ReaderHandle) -> Result<(Vec<u8>, usize)> {
    handle
        .await
        .map_err(|err| anyhow!("output reader task failed: {err}"))?
}

async fn read_limited<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut collected = Vec::new();
    let mut truncated = 0usize;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await.context("read pipe")?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(collected.len());
        let keep = room.min(n);
        collected.extend_from_slice(&buf[..keep]);
        truncated += n - keep;
    }
    Ok((collected, truncated))
}

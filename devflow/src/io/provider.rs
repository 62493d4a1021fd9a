//! AI provider boundary.
//!
//! The provider is a black box: a request goes in, text and a success flag come
//! out. Retrying transient faults is done here, not by providers.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::config::ProviderConfig;
use super::execution_log::{ExecutionLog, LogRecord};
use super::process::{CommandEnd, run_cancellable};
use super::prompt::render_request;
use super::retry::{RetryPolicy, backoff};
use crate::core::error::{Error, Subject};
use crate::core::types::LogEvent;

/// Exit code a provider command uses to flag a retryable failure (`EX_TEMPFAIL`).
pub const TRANSIENT_EXIT_CODE: i32 = 75;

/// Tail of stderr kept in fault messages.
const STDERR_TAIL_BYTES: usize = 2_000;

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub subject: Subject,
    pub context: String,
    pub instructions: String,
    pub prior_analysis: Option<String>,
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFault {
    pub message: String,
    pub transient: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResponse {
    pub success: bool,
    pub output: String,
    pub fault: Option<ProviderFault>,
}

impl ProviderResponse {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            fault: None,
        }
    }

    pub fn failed(message: impl Into<String>, transient: bool) -> Self {
        Self {
            success: false,
            output: String::new(),
            fault: Some(ProviderFault {
                message: message.into(),
                transient,
            }),
        }
    }
}

/// Executes one request. Cancellation surfaces as [`Error::Cancelled`].
#[async_trait]
pub trait Provider: Send + Sync {
    async fn execute(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderResponse>;
}

/// Runs a configured command with the rendered prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandProvider {
    pub fn new(cfg: &ProviderConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            timeout: cfg.timeout(),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }
}

#[async_trait]
impl Provider for CommandProvider {
    #[instrument(skip_all, fields(subject = %request.subject, program = ?self.command.first()))]
    async fn execute(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderResponse> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("provider command is empty"))?;
        let prompt = render_request(request)?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);

        let end = match run_cancellable(
            cmd,
            Some(prompt.into_bytes()),
            self.timeout,
            self.output_limit_bytes,
            cancel,
        )
        .await
        {
            Ok(end) => end,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "provider command did not run");
                return Ok(ProviderResponse::failed(
                    format!("provider command failed: {err:#}"),
                    false,
                ));
            }
        };

        match end {
            CommandEnd::Exited(out) if out.status.success() => {
                debug!(bytes = out.stdout.len(), "provider succeeded");
                Ok(ProviderResponse::ok(out.stdout_lossy()))
            }
            CommandEnd::Exited(out) => {
                let code = out.status.code();
                let stderr = out.stderr_lossy();
                let message = format!(
                    "provider exited with {}: {}",
                    code.map_or_else(|| "signal".to_string(), |c| format!("code {c}")),
                    tail(stderr.trim(), STDERR_TAIL_BYTES)
                );
                Ok(ProviderResponse {
                    success: false,
                    output: out.stdout_lossy(),
                    fault: Some(ProviderFault {
                        message,
                        transient: code == Some(TRANSIENT_EXIT_CODE),
                    }),
                })
            }
            CommandEnd::TimedOut => Ok(ProviderResponse::failed(
                format!("provider timed out after {}s", self.timeout.as_secs()),
                true,
            )),
            CommandEnd::Cancelled => Err(Error::Cancelled {
                subject: request.subject,
            }
            .into()),
        }
    }
}

/// Call `provider`, retrying transient faults with backoff.
///
/// Each retry of a story call is recorded as a `Retried` event. A final failure becomes
/// [`Error::AiProviderFailure`]; cancellation during a call or a backoff
/// becomes [`Error::Cancelled`].
#[instrument(skip_all, fields(subject = %request.subject, max_retries = policy.max_retries))]
pub async fn execute_with_retry(
    provider: &dyn Provider,
    request: &ProviderRequest,
    policy: &RetryPolicy,
    log: &Mutex<ExecutionLog>,
    cancel: &CancellationToken,
) -> Result<ProviderResponse> {
    let subject = request.subject;
    let mut retry = 0u32;
    loop {
        let response = provider.execute(request, cancel).await?;
        if response.success {
            return Ok(response);
        }
        let fault = response.fault.unwrap_or(ProviderFault {
            message: "provider reported failure without detail".to_string(),
            transient: false,
        });
        if !fault.transient || retry >= policy.max_retries {
            return Err(Error::AiProviderFailure {
                subject,
                message: fault.message,
                transient: fault.transient,
            }
            .into());
        }

        retry += 1;
        let delay = policy.delay_for_retry(retry);
        info!(retry, delay_ms = delay.as_millis() as u64, message = %fault.message, "transient provider failure, retrying");
        if let Subject::Story(story) = subject {
            log.lock()
                .map_err(|_| anyhow!("execution log poisoned"))?
                .record(
                    LogRecord::new(story, LogEvent::Retried)
                        .details(format!("retry {retry} of {}", policy.max_retries))
                        .error(fault.message)
                        .meta("retry", retry)
                        .meta("delay_ms", delay.as_millis() as u64),
                    Utc::now(),
                );
        }
        if !backoff(delay, cancel).await {
            return Err(Error::Cancelled { subject }.into());
        }
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

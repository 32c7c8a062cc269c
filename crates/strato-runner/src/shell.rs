use std::collections::BTreeMap;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::debug;

use crate::error::RunnerError;
use crate::time::parse_time;

// ── Step description ──────────────────────────────────────────────────────────

/// A `shell:` step from the deployment config.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellStep {
    pub cmd: String,
    /// "remote" runs the command over SSH against a named node.
    #[serde(rename = "type")]
    pub step_type: Option<String>,
    pub node: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(rename = "retry-if-fails", default)]
    pub retry_if_fails: bool,
    pub timeout: Option<String>,
    #[serde(rename = "retry-delay")]
    pub retry_delay: Option<String>,
    #[serde(rename = "total-timeout")]
    pub total_timeout: Option<String>,
}

impl ShellStep {
    pub fn is_remote(&self) -> bool {
        self.step_type.as_deref() == Some("remote")
    }
}

// ── Retry policy ──────────────────────────────────────────────────────────────

/// The four interacting execution settings of a shell step, with durations
/// already parsed to seconds.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub retry_if_fails: bool,
    /// Upper bound per invocation.
    pub timeout: Option<u64>,
    /// Sleep between retries.
    pub retry_delay: u64,
    /// Absolute wall-clock cap across all attempts.
    pub total_timeout: Option<u64>,
}

impl RetryPolicy {
    pub fn from_step(step: &ShellStep) -> Result<Self, RunnerError> {
        Ok(Self {
            retry_if_fails: step.retry_if_fails,
            timeout: step.timeout.as_deref().map(parse_time).transpose()?,
            retry_delay: step.retry_delay.as_deref().map(parse_time).transpose()?.unwrap_or(0),
            total_timeout: step.total_timeout.as_deref().map(parse_time).transpose()?,
        })
    }
}

/// Run `invoke` under the retry policy. Each attempt receives its deadline:
/// `min(now + timeout, total_deadline)`.
///
/// On failure, retry after `retry_delay` when `retry_if_fails` is set. On
/// timeout, retry only when `retry_if_fails` is set and the delay still
/// fits before the total deadline; otherwise the timeout propagates.
pub async fn run_with_retries<F, Fut>(policy: &RetryPolicy, mut invoke: F) -> Result<(), RunnerError>
where
    F: FnMut(Option<Instant>) -> Fut,
    Fut: Future<Output = Result<(), RunnerError>>,
{
    let overall_deadline = policy
        .total_timeout
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let retry_delay = Duration::from_secs(policy.retry_delay);

    loop {
        let deadline = match (policy.timeout, overall_deadline) {
            (Some(secs), Some(overall)) => {
                Some((Instant::now() + Duration::from_secs(secs)).min(overall))
            }
            (Some(secs), None) => Some(Instant::now() + Duration::from_secs(secs)),
            (None, Some(overall)) => Some(overall),
            (None, None) => None,
        };

        match invoke(deadline).await {
            Ok(()) => return Ok(()),
            Err(RunnerError::CommandFailed { code }) => {
                if !policy.retry_if_fails {
                    return Err(RunnerError::CommandFailed { code });
                }
                debug!("command failed with {}, retrying", code);
                sleep(retry_delay).await;
            }
            Err(RunnerError::CommandTimedOut) => {
                let budget = overall_deadline.or(deadline);
                let fits = budget.is_some_and(|b| Instant::now() + retry_delay < b);
                if !(policy.retry_if_fails && fits) {
                    return Err(RunnerError::CommandTimedOut);
                }
                debug!("command timed out, retrying");
                sleep(retry_delay).await;
            }
            Err(other) => return Err(other),
        }
    }
}

// ── Command invocation ────────────────────────────────────────────────────────

/// Spawn `shell_cmd` and feed `real_cmd` through its stdin.
///
/// The write happens on a separate task so a script body larger than the
/// pipe buffer cannot deadlock a child that has not started reading yet
/// (the backpressure-aware replacement for the source's one-byte select
/// loop). Exit 0 is success, non-zero is [`RunnerError::CommandFailed`];
/// on deadline expiry the child is killed and
/// [`RunnerError::CommandTimedOut`] raised.
pub async fn run_cmd_once(
    shell_cmd: &str,
    real_cmd: &str,
    deadline: Option<Instant>,
) -> Result<(), RunnerError> {
    debug!("running: {}", shell_cmd);
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(shell_cmd)
        .stdin(Stdio::piped())
        .spawn()?;

    let mut stdin = child.stdin.take().expect("stdin piped");
    let input = format!("{}\n", real_cmd);
    let writer = tokio::spawn(async move {
        let _ = stdin.write_all(input.as_bytes()).await;
        let _ = stdin.shutdown().await;
    });

    let status = match deadline {
        Some(deadline) => match timeout_at(deadline, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.kill().await;
                writer.abort();
                return Err(RunnerError::CommandTimedOut);
            }
        },
        None => child.wait().await?,
    };
    let _ = writer.await;

    if status.success() {
        Ok(())
    } else {
        Err(RunnerError::CommandFailed { code: status.code().unwrap_or(-1) })
    }
}

/// POSIX single-quote a string for inclusion in a shell command line.
pub fn shell_quote(s: &str) -> String {
    const SAFE: &str = "@%+=:,./-_";
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || SAFE.contains(c)) {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

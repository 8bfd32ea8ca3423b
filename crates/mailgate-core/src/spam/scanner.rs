//! External scanner invocation
//!
//! The scanner is executed from a fixed argument vector with the raw
//! message piped to stdin; message content never reaches a shell. The
//! spamc convention applies: exit code 1 flags spam and stdout carries
//! `score/required`. A wall-clock timeout bounds every scan; timing out
//! drops the child handle, which kills the process.

use mailgate_common::config::SpamConfig;
use mailgate_common::{Error, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Outcome of scanning one message
#[derive(Debug, Clone, PartialEq)]
pub struct ScanVerdict {
    /// Whether the message is spam, from the exit code or the score
    /// crossing the scanner-reported or configured threshold
    pub is_spam: bool,
    /// Score reported on stdout, when parseable
    pub score: Option<f64>,
    /// Scanner's own threshold, when reported
    pub required: Option<f64>,
}

pub struct SpamScanner {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    threshold: f64,
}

impl SpamScanner {
    pub fn new(config: &SpamConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            threshold: config.threshold,
        }
    }

    /// Scan one raw message
    pub async fn scan(&self, message: &[u8]) -> Result<ScanVerdict> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ScanFailed(format!("failed to spawn {}: {}", self.command, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::ScanFailed("scanner stdin unavailable".to_string()))?;

        // Feed stdin from a separate task so a scanner that answers
        // before reading everything cannot deadlock the pipe
        let body = message.to_vec();
        let feed = tokio::spawn(async move {
            let _ = stdin.write_all(&body).await;
            let _ = stdin.shutdown().await;
        });

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(waited) => {
                waited.map_err(|e| Error::ScanFailed(format!("scanner wait failed: {}", e)))?
            }
            Err(_) => {
                feed.abort();
                return Err(Error::ScanTimeout(self.timeout.as_secs()));
            }
        };
        let _ = feed.await;

        let code = match output.status.code() {
            Some(code) => code,
            None => {
                return Err(Error::ScanFailed(
                    "scanner terminated by signal".to_string(),
                ))
            }
        };
        if code != 0 && code != 1 {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ScanFailed(format!(
                "scanner exited with code {}: {}",
                code,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (score, required) = parse_score(&stdout);
        // Spam when the exit code says so, or the score reaches either
        // the scanner's own threshold or the configured one
        let is_spam = code == 1
            || score.zip(required).is_some_and(|(s, r)| s >= r)
            || score.is_some_and(|s| s >= self.threshold);

        debug!(is_spam, ?score, code, "Scan finished");
        Ok(ScanVerdict {
            is_spam,
            score,
            required,
        })
    }
}

/// Parse the `score/required` first line of scanner output
fn parse_score(stdout: &str) -> (Option<f64>, Option<f64>) {
    let Some(line) = stdout.lines().next() else {
        return (None, None);
    };
    let Some((score, required)) = line.trim().split_once('/') else {
        return (None, None);
    };
    (
        score.trim().parse::<f64>().ok(),
        required.trim().parse::<f64>().ok(),
    )
}

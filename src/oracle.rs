//! Scoring oracle: an external routine that turns raw agency data into a
//! score and an optional capacity suggestion.
//!
//! Only queue workers call the oracle. [`CommandOracle`] runs it as a
//! subprocess with a hard timeout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// What the oracle made of one input file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OracleReading {
    /// 0-100. `None` when nothing score-like was found.
    pub score: Option<f64>,
    pub capacity: Option<i32>,
}

#[async_trait]
pub trait ScoringOracle: Send + Sync {
    async fn analyze(&self, file: &Path) -> Result<OracleReading>;
}

/// Runs `program args... --file <path>` and reads one JSON object from
/// stdout: `{"score": n, "capacity": n}` or `{"error": "..."}`.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandOracle {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    async fn invoke(&self, file: &Path) -> Result<OracleReading> {
        debug!(
            program = %self.program.display(),
            file = %file.display(),
            "invoking scoring oracle"
        );

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg("--file")
            .arg(file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the future on timeout kills the child.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("scoring oracle on {}", file.display()),
                after: self.timeout,
            })??;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            warn!(stderr = %stderr.trim(), "scoring oracle wrote to stderr");
        }

        if !output.status.success() {
            // A failing oracle may still explain itself on stdout.
            let message = match parse_output(&stdout) {
                Err(Error::Oracle { message, .. }) if !message.starts_with("malformed") => message,
                _ => format!(
                    "oracle exited with status {}",
                    output.status.code().unwrap_or(-1)
                ),
            };
            return Err(Error::Oracle {
                message,
                raw_output: Some(raw(&stdout, &stderr)),
            });
        }

        parse_output(&stdout)
    }
}

#[async_trait]
impl ScoringOracle for CommandOracle {
    async fn analyze(&self, file: &Path) -> Result<OracleReading> {
        let start = Instant::now();
        let result = self.invoke(file).await;
        let label = match &result {
            Ok(_) => "ok",
            Err(Error::Timeout { .. }) => "timeout",
            Err(_) => "error",
        };
        metrics::oracle_invocations().add(1, &[KeyValue::new("result", label)]);
        metrics::operation_duration_ms().record(
            start.elapsed().as_millis() as f64,
            &[KeyValue::new("operation", "oracle")],
        );
        result
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOutput {
    Failure { error: String },
    Reading {
        score: Option<f64>,
        capacity: Option<i64>,
    },
}

/// Parse oracle stdout. Anything other than one well-formed object with
/// in-range values is an `Oracle` error carrying the raw text.
pub fn parse_output(stdout: &str) -> Result<OracleReading> {
    let text = stdout.trim();
    let malformed = |why: String| Error::Oracle {
        message: format!("malformed oracle output: {why}"),
        raw_output: Some(text.to_string()),
    };

    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(malformed("expected a JSON object".to_string()));
    }
    let parsed: RawOutput =
        serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;

    match parsed {
        RawOutput::Failure { error } => Err(Error::Oracle {
            message: error,
            raw_output: Some(text.to_string()),
        }),
        RawOutput::Reading { score, capacity } => {
            if let Some(score) = score.filter(|s| !(0.0..=100.0).contains(s)) {
                return Err(malformed(format!("score {score} outside 0-100")));
            }
            let capacity = capacity
                .map(|c| {
                    i32::try_from(c)
                        .ok()
                        .filter(|c| *c >= 0)
                        .ok_or_else(|| malformed(format!("capacity {c} out of range")))
                })
                .transpose()?;
            Ok(OracleReading { score, capacity })
        }
    }
}

fn raw(stdout: &str, stderr: &str) -> String {
    match (stdout.trim(), stderr.trim()) {
        (out, "") => out.to_string(),
        ("", err) => format!("stderr: {err}"),
        (out, err) => format!("{out}\nstderr: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_score_and_capacity() {
        let reading = parse_output(r#"{"score": 92, "capacity": 7}"#).unwrap();
        assert_eq!(reading.score, Some(92.0));
        assert_eq!(reading.capacity, Some(7));
    }

    #[test]
    fn nulls_are_absent_values() {
        let reading = parse_output("{\"score\": null, \"capacity\": null}\n").unwrap();
        assert_eq!(reading, OracleReading { score: None, capacity: None });
    }

    #[test]
    fn reported_error_keeps_message() {
        let err = parse_output(r#"{"error": "File not found"}"#).unwrap_err();
        match err {
            Error::Oracle { message, raw_output } => {
                assert_eq!(message, "File not found");
                assert!(raw_output.unwrap().contains("File not found"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn garbage_is_malformed_and_not_retryable() {
        let err = parse_output("Traceback (most recent call last):").unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.detail().contains("Traceback"));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(parse_output(r#"{"score": 140}"#).is_err());
        assert!(parse_output(r#"{"score": 80, "capacity": -2}"#).is_err());
        assert!(parse_output("[1, 2]").is_err());
    }

    #[cfg(unix)]
    fn sh(script: &str, timeout: Duration) -> CommandOracle {
        // `sh -c script name --file path`: the trailing args land in $1, $2.
        CommandOracle::new(
            "sh",
            vec!["-c".into(), script.into(), "oracle".into()],
            timeout,
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn subprocess_receives_file_argument() {
        let oracle = sh(
            r#"[ "$1" = "--file" ] && echo "{\"score\": 88, \"capacity\": null}""#,
            Duration::from_secs(5),
        );
        let reading = oracle.analyze(Path::new("/tmp/report.csv")).await.unwrap();
        assert_eq!(reading.score, Some(88.0));
        assert_eq!(reading.capacity, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_a_hard_failure() {
        let oracle = sh(
            r#"echo '{"error": "File not found"}'; exit 1"#,
            Duration::from_secs(5),
        );
        let err = oracle.analyze(Path::new("missing.csv")).await.unwrap_err();
        assert!(matches!(err, Error::Oracle { ref message, .. } if message == "File not found"));
        assert!(!err.is_retryable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_oracle_times_out_and_is_retryable() {
        let oracle = sh("sleep 5", Duration::from_millis(100));
        let err = oracle.analyze(Path::new("slow.csv")).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.is_retryable());
    }
}

//! External tool invocation.
//!
//! Every OS-level operation — bridge manipulation, `tc`, `ip`, the emulator,
//! `qemu-img` — goes through [`ToolRunner`] so the callers above it never
//! touch `tokio::process` directly and tests can swap in [`MockTools`]
//! without real processes or root privileges.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

/// Captured output of a finished tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Abstraction over running an external binary to completion.
///
/// A non-zero exit status maps to [`Error::External`] carrying the trimmed
/// stderr; the caller decides whether that stderr is an idempotency signal.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run `argv[0]` with `argv[1..]`, capturing stdout and stderr.
    async fn run(&self, argv: &[String]) -> Result<ToolOutput> {
        self.run_timeout(argv, None).await
    }

    /// Like [`ToolRunner::run`], killing the process when `timeout` elapses.
    async fn run_timeout(&self, argv: &[String], timeout: Option<Duration>) -> Result<ToolOutput>;
}

/// [`ToolRunner`] backed by real host processes.
#[derive(Debug, Default, Clone)]
pub struct HostTools;

#[async_trait]
impl ToolRunner for HostTools {
    async fn run_timeout(&self, argv: &[String], timeout: Option<Duration>) -> Result<ToolOutput> {
        let program = argv
            .first()
            .ok_or_else(|| Error::Validation("empty argv".into()))?;
        debug!(tool = %program, args = ?&argv[1..], "exec");

        let mut child = Command::new(program)
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::external(program.clone(), e.to_string()))?;

        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => {
                    // wait_with_output consumed the child; kill_on_drop has
                    // already reaped it by the time the timeout fires.
                    return Err(Error::external(
                        program.clone(),
                        format!("killed after {:?}", limit),
                    ));
                }
            },
            None => child.wait_with_output().await?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(Error::external(program.clone(), stderr.trim().to_string()));
        }

        Ok(ToolOutput { stdout, stderr })
    }
}

/// Scripted response for one [`MockTools`] invocation.
#[derive(Debug, Clone)]
pub enum MockResult {
    Ok(&'static str),
    Err(&'static str),
}

/// Recording [`ToolRunner`] double.
///
/// Replays scripted results in FIFO order (defaulting to empty success when
/// the script runs dry) and records every argv for assertions.
#[derive(Default)]
pub struct MockTools {
    calls: Mutex<Vec<Vec<String>>>,
    script: Mutex<VecDeque<MockResult>>,
}

impl MockTools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result for the next unscripted invocation.
    pub fn push_result(&self, result: MockResult) {
        self.script.lock().unwrap().push_back(result);
    }

    /// Every argv this runner has executed, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// The recorded argvs whose program (argv[0]) equals `program`.
    pub fn calls_for(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|argv| argv.first().map(String::as_str) == Some(program))
            .collect()
    }
}

#[async_trait]
impl ToolRunner for MockTools {
    async fn run_timeout(&self, argv: &[String], _timeout: Option<Duration>) -> Result<ToolOutput> {
        let program = argv
            .first()
            .ok_or_else(|| Error::Validation("empty argv".into()))?
            .clone();
        self.calls.lock().unwrap().push(argv.to_vec());

        match self.script.lock().unwrap().pop_front() {
            Some(MockResult::Ok(stdout)) => Ok(ToolOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
            }),
            Some(MockResult::Err(stderr)) => Err(Error::external(program, stderr)),
            None => Ok(ToolOutput::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn host_tools_captures_stdout() {
        let tools = HostTools;
        let out = tools
            .run(&["echo".to_string(), "hello".to_string()])
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn host_tools_wraps_failure_stderr() {
        let tools = HostTools;
        let err = tools
            .run(&["sh".to_string(), "-c".to_string(), "echo bad >&2; exit 3".to_string()])
            .await
            .unwrap_err();
        match err {
            Error::External { stderr, .. } => assert_eq!(stderr, "bad"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn host_tools_kills_on_timeout() {
        let tools = HostTools;
        let err = tools
            .run_timeout(
                &["sleep".to_string(), "10".to_string()],
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("killed"));
    }

    #[tokio::test]
    async fn mock_records_and_replays() {
        let mock = MockTools::new();
        mock.push_result(MockResult::Ok("br0\nbr1\n"));
        mock.push_result(MockResult::Err("no such device"));

        let out = mock
            .run(&["ovs-vsctl".to_string(), "list-br".to_string()])
            .await
            .unwrap();
        assert_eq!(out.stdout, "br0\nbr1\n");
        assert!(mock.run(&["ip".to_string()]).await.is_err());
        // Script exhausted: default empty success.
        assert!(mock.run(&["tc".to_string()]).await.is_ok());

        assert_eq!(mock.calls_for("ovs-vsctl").len(), 1);
        assert_eq!(mock.calls().len(), 3);
    }
}

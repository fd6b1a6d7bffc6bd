//! Subprocess execution for executable credential sources.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::domain::CredentialSourceKind;
use crate::errors::{Result, VaultkeeperError};
use crate::resilience::CallContext;

/// Captured result of a finished child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs a command to completion. Implementations must kill the child when
/// the timeout fires or the context is cancelled.
#[async_trait]
pub trait CommandRunner: Send + Sync + std::fmt::Debug {
    async fn run(
        &self,
        ctx: &CallContext,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<CommandOutput>;
}

#[derive(Debug, Default, Clone)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        ctx: &CallContext,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let kind = CredentialSourceKind::Executable;
        debug!(command = %command, args = args.len(), "Spawning credential command");

        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                VaultkeeperError::credential_source(
                    kind,
                    format!("failed to spawn '{}': {}", command, e),
                )
            })?;

        let stdout = child.stdout.take();
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let stderr_reader =
            child.stderr.take().map(|pipe| tokio::spawn(drain(pipe, stderr.clone())));

        // Dropping `finished` drops the child, which kills it.
        let finished = async move {
            let mut out = Vec::new();
            if let Some(mut pipe) = stdout {
                pipe.read_to_end(&mut out).await?;
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out))
        };

        let finished = tokio::select! {
            biased;
            _ = ctx.done() => return Err(VaultkeeperError::cancelled("credential_command")),
            _ = tokio::time::sleep(timeout) => None,
            result = finished => Some(result.map_err(|e| {
                let message = format!("waiting on '{}': {}", command, e);
                VaultkeeperError::credential_source(kind, message)
            })?),
        };
        let stderr = collect_stderr(stderr_reader, &stderr).await;

        let Some((status, stdout)) = finished else {
            let message = format!("'{}' timed out after {} ms", command, timeout.as_millis());
            let stderr = stderr.trim();
            return Err(VaultkeeperError::credential_source_with_stderr(kind, message, stderr));
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr,
            exit_code: status.code(),
        })
    }
}

/// Upper bound on waiting for the stderr pipe to close once the child is gone.
/// A grandchild holding the pipe open must not stall the caller.
const STDERR_GRACE: Duration = Duration::from_millis(200);

/// Copies the pipe into `sink` chunk by chunk so partial output survives a kill.
async fn drain<R: AsyncRead + Unpin>(mut pipe: R, sink: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buffer) = sink.lock() {
                    buffer.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

async fn collect_stderr(reader: Option<JoinHandle<()>>, buffer: &Mutex<Vec<u8>>) -> String {
    if let Some(mut reader) = reader {
        if tokio::time::timeout(STDERR_GRACE, &mut reader).await.is_err() {
            reader.abort();
        }
    }
    buffer.lock().map(|b| String::from_utf8_lossy(&b).into_owned()).unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let output = TokioCommandRunner
            .run(
                &CallContext::new(),
                "sh",
                &["-c".to_string(), "echo token-value; echo oops >&2; exit 3".to_string()],
                &BTreeMap::new(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "token-value");
        assert_eq!(output.stderr.trim(), "oops");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let err = TokioCommandRunner
            .run(
                &CallContext::new(),
                "sleep",
                &["10".to_string()],
                &BTreeMap::new(),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_timeout_keeps_stderr_written_before_kill() {
        let err = TokioCommandRunner
            .run(
                &CallContext::new(),
                "sh",
                &["-c".to_string(), "echo 'waiting for sso login' >&2; sleep 10".to_string()],
                &BTreeMap::new(),
                Duration::from_millis(300),
            )
            .await
            .unwrap_err();
        match err {
            VaultkeeperError::CredentialSource { message, stderr, .. } => {
                assert!(message.contains("timed out"));
                assert_eq!(stderr.as_deref(), Some("waiting for sso login"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_silent_timeout_has_no_stderr() {
        let err = TokioCommandRunner
            .run(
                &CallContext::new(),
                "sleep",
                &["10".to_string()],
                &BTreeMap::new(),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VaultkeeperError::CredentialSource { stderr: None, .. }));
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let mut env = BTreeMap::new();
        env.insert("VK_TEST_VAR".to_string(), "hello".to_string());
        let output = TokioCommandRunner
            .run(
                &CallContext::new(),
                "sh",
                &["-c".to_string(), "printf %s \"$VK_TEST_VAR\"".to_string()],
                &env,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, "hello");
    }

    #[tokio::test]
    async fn test_missing_binary_is_source_error() {
        let err = TokioCommandRunner
            .run(
                &CallContext::new(),
                "/nonexistent/vaultkeeper-helper",
                &[],
                &BTreeMap::new(),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VaultkeeperError::CredentialSource { .. }));
    }
}

use chrono::Utc;
use tracing::{debug, warn};

use crate::domain::{CredentialSourceKind, CredentialToken};
use crate::errors::{Result, VaultkeeperError};
use crate::resilience::CallContext;

use super::parse::parse_token;
use super::runner::CommandRunner;
use super::source::{ExecutableSource, OutputFormat};

/// Environment variable telling the command which output format is expected.
pub const FORMAT_ENV_VAR: &str = "VAULTKEEPER_CREDENTIAL_FORMAT";

/// Run the configured command and parse its stdout into a token.
pub async fn resolve_executable(
    runner: &dyn CommandRunner,
    ctx: &CallContext,
    source: &ExecutableSource,
) -> Result<CredentialToken> {
    let kind = CredentialSourceKind::Executable;
    let mut env = source.env.clone();
    let format = match source.output_format {
        OutputFormat::Json => "json",
        OutputFormat::Text => "text",
    };
    env.insert(FORMAT_ENV_VAR.to_string(), format.to_string());

    let output =
        runner.run(ctx, &source.command, &source.args, &env, source.timeout()).await?;

    if !output.success() {
        let status = output
            .exit_code
            .map(|code| format!("exit status {}", code))
            .unwrap_or_else(|| "terminated by signal".to_string());
        warn!(command = %source.command, status = %status, "Credential command failed");
        return Err(VaultkeeperError::credential_source_with_stderr(
            kind,
            format!("'{}' failed with {}", source.command, status),
            output.stderr.trim(),
        ));
    }

    debug!(command = %source.command, "Credential command succeeded");
    parse_token(
        kind,
        &output.stdout,
        source.output_format,
        source.token_field.as_deref(),
        source.default_ttl_seconds,
        Utc::now(),
    )
    .map_err(|err| match err {
        VaultkeeperError::CredentialSource { source_kind, message, stderr: None } => {
            VaultkeeperError::credential_source_with_stderr(
                source_kind,
                message,
                output.stderr.trim(),
            )
        }
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::runner::CommandOutput;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug)]
    struct ScriptedRunner {
        output: CommandOutput,
        seen_env: Mutex<Option<BTreeMap<String, String>>>,
    }

    impl ScriptedRunner {
        fn new(stdout: &str, stderr: &str, exit_code: Option<i32>) -> Self {
            Self {
                output: CommandOutput {
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                    exit_code,
                },
                seen_env: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            _ctx: &CallContext,
            _command: &str,
            _args: &[String],
            env: &BTreeMap<String, String>,
            _timeout: Duration,
        ) -> Result<CommandOutput> {
            *self.seen_env.lock().unwrap() = Some(env.clone());
            Ok(self.output.clone())
        }
    }

    #[tokio::test]
    async fn test_json_output_parsed() {
        let runner = ScriptedRunner::new(r#"{"token":"abc","expires_in":120}"#, "", Some(0));
        let source = ExecutableSource::new("helper");
        let token = resolve_executable(&runner, &CallContext::new(), &source).await.unwrap();
        assert_eq!(token.value.expose_secret(), "abc");
        assert_eq!(token.source, CredentialSourceKind::Executable);

        let env = runner.seen_env.lock().unwrap().clone().unwrap();
        assert_eq!(env.get(FORMAT_ENV_VAR).map(String::as_str), Some("json"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let runner = ScriptedRunner::new("", "permission denied\n", Some(1));
        let source = ExecutableSource::new("helper");
        let err = resolve_executable(&runner, &CallContext::new(), &source).await.unwrap_err();
        match err {
            VaultkeeperError::CredentialSource { stderr, message, .. } => {
                assert_eq!(stderr.as_deref(), Some("permission denied"));
                assert!(message.contains("exit status 1"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_signal_termination() {
        let runner = ScriptedRunner::new("", "", None);
        let source = ExecutableSource::new("helper");
        let err = resolve_executable(&runner, &CallContext::new(), &source).await.unwrap_err();
        assert!(err.to_string().contains("terminated by signal"));
    }

    #[tokio::test]
    async fn test_unparsable_output_keeps_stderr() {
        let runner = ScriptedRunner::new("not json", "helper: upstream 502\n", Some(0));
        let source = ExecutableSource::new("helper");
        let err = resolve_executable(&runner, &CallContext::new(), &source).await.unwrap_err();
        match err {
            VaultkeeperError::CredentialSource { stderr, .. } => {
                assert_eq!(stderr.as_deref(), Some("helper: upstream 502"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let quiet = ScriptedRunner::new("not json", "", Some(0));
        let err = resolve_executable(&quiet, &CallContext::new(), &source).await.unwrap_err();
        assert!(matches!(err, VaultkeeperError::CredentialSource { stderr: None, .. }));
    }
}

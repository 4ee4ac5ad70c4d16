//! Command execution bridge for services managed through PowerShell.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use log::{debug, warn};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::error::SessionError;
use crate::sanitize::Sanitizer;

pub const DEFAULT_SHELL: &str = "pwsh";

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs scripts inside a stateful session and returns their output.
#[async_trait]
pub trait SessionBridge: Send + Sync {
    async fn execute(&self, script: &str) -> Result<String, SessionError>;
}

/// Quote a value as a single-quoted PowerShell string literal.
pub fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

struct ShellProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// One long-lived PowerShell process fed through stdin.
///
/// Each script is sent base64 encoded on a single line and followed by a
/// unique sentinel, so module imports and connections persist between
/// calls. The process is respawned after it dies or a command times out.
pub struct PowerShellBridge {
    shell: String,
    command_timeout: Duration,
    sanitizer: Arc<Sanitizer>,
    process: Mutex<Option<ShellProcess>>,
}

impl PowerShellBridge {
    pub fn new(shell: impl Into<String>, sanitizer: Arc<Sanitizer>) -> Self {
        Self {
            shell: shell.into(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            sanitizer,
            process: Mutex::new(None),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn spawn(&self) -> Result<ShellProcess, SessionError> {
        debug!("Starting {}", self.shell);
        let mut child = Command::new(&self.shell)
            .args(["-NoLogo", "-NoProfile", "-NonInteractive", "-Command", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::ToolingUnavailable(format!("cannot start {}: {}", self.shell, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Bridge("shell stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Bridge("shell stdout unavailable".into()))?;

        Ok(ShellProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Ask the shell to exit and wait briefly for it.
    pub async fn shutdown(&self) {
        let Some(mut process) = self.process.lock().await.take() else {
            return;
        };
        if process.stdin.write_all(b"exit\n").await.is_ok() {
            let _ = process.stdin.flush().await;
        }
        match tokio::time::timeout(Duration::from_secs(5), process.child.wait()).await {
            Ok(Ok(status)) => debug!("{} exited with {}", self.shell, status),
            _ => warn!("{} did not exit cleanly", self.shell),
        }
    }
}

fn wrap_script(script: &str, sentinel: &str) -> String {
    let encoded = STANDARD.encode(script.as_bytes());
    format!(
        "try {{ $ErrorActionPreference = 'Stop'; \
         Invoke-Expression ([System.Text.Encoding]::UTF8.GetString([System.Convert]::FromBase64String('{encoded}'))) \
         | Out-String -Width 4096 | Write-Output; Write-Output '{sentinel}:0' }} \
         catch {{ Write-Output ($_ | Out-String); Write-Output '{sentinel}:1' }}\n"
    )
}

/// Output lines up to the sentinel, and whether the script succeeded.
async fn run_wrapped(
    process: &mut ShellProcess,
    script: &str,
    sentinel: &str,
) -> Result<(bool, String), SessionError> {
    let broken = |e: std::io::Error| SessionError::Bridge(format!("shell pipe failed: {}", e));

    process
        .stdin
        .write_all(wrap_script(script, sentinel).as_bytes())
        .await
        .map_err(broken)?;
    process.stdin.flush().await.map_err(broken)?;

    let mut output = String::new();
    loop {
        let mut line = String::new();
        if process.stdout.read_line(&mut line).await.map_err(broken)? == 0 {
            return Err(SessionError::Bridge("shell exited unexpectedly".into()));
        }
        let trimmed = line.trim_end();
        if let Some(status) = trimmed.strip_prefix(sentinel).and_then(|rest| rest.strip_prefix(':')) {
            return Ok((status == "0", output.trim_end().to_string()));
        }
        output.push_str(&line);
    }
}

#[async_trait]
impl SessionBridge for PowerShellBridge {
    async fn execute(&self, script: &str) -> Result<String, SessionError> {
        let mut guard = self.process.lock().await;
        if guard.is_none() {
            *guard = Some(self.spawn()?);
        }
        let process = guard.as_mut().ok_or(SessionError::Disconnected)?;

        let sentinel = format!("__M365_DONE_{}__", uuid::Uuid::new_v4().simple());
        debug!("Session command: {}", self.sanitizer.sanitize(script));

        match tokio::time::timeout(self.command_timeout, run_wrapped(process, script, &sentinel)).await {
            Ok(Ok((true, output))) => Ok(output),
            Ok(Ok((false, output))) => Err(SessionError::Bridge(self.sanitizer.sanitize(&output))),
            Ok(Err(e)) => {
                *guard = None;
                Err(e)
            }
            Err(_) => {
                *guard = None;
                Err(SessionError::Bridge(format!(
                    "command did not finish within {}s",
                    self.command_timeout.as_secs()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ps_quote_escapes_single_quotes() {
        assert_eq!(ps_quote("contoso"), "'contoso'");
        assert_eq!(ps_quote("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn test_wrapped_script_is_one_line() {
        let wrapped = wrap_script("Get-Mailbox\nGet-User", "__DONE__");
        assert_eq!(wrapped.matches('\n').count(), 1);
        assert!(wrapped.ends_with('\n'));
        assert!(wrapped.contains("'__DONE__:0'"));
        assert!(wrapped.contains("'__DONE__:1'"));
        assert!(!wrapped.contains("Get-Mailbox"));
    }

    #[tokio::test]
    async fn test_missing_shell_is_tooling_unavailable() {
        let bridge = PowerShellBridge::new("m365-admin-no-such-shell", Arc::new(Sanitizer::new()));
        let err = bridge.execute("Get-Date").await.unwrap_err();
        assert!(matches!(err, SessionError::ToolingUnavailable(_)));
    }
}

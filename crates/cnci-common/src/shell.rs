//! Shell command execution for the concentrator daemon.
//!
//! Every kernel-facing mutation the concentrator performs is an `ip(8)` or
//! `sysctl(8)` invocation; this module runs them with safe quoting so that
//! tenant-supplied strings can never escape into the shell.

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{CnciError, CnciResult};

/// Path to the `ip` command for link/address/neighbor/route configuration.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `sysctl` command for forwarding enablement.
pub const SYSCTL_CMD: &str = "/sbin/sysctl";

/// Path to the `dnsmasq` binary serving per-bridge DHCP/DNS.
pub const DNSMASQ_CMD: &str = "/usr/sbin/dnsmasq";

/// Path to the `kill` command used by the DHCP supervisor.
pub const KILL_CMD: &str = "/bin/kill";

/// Characters that must be escaped inside shell double-quotes.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe interpolation into a shell command.
///
/// Wraps the value in double quotes and escapes `$`, backtick, `"`, `\` and
/// newline, the characters with special meaning inside double quotes.
///
/// # Example
///
/// ```
/// use cnci_common::shell::shellquote;
///
/// assert_eq!(shellquote("cncibr0"), "\"cncibr0\"");
/// assert_eq!(shellquote("a$b"), "\"a\\$b\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// Trimmed stdout.
    pub stdout: String,
    /// Trimmed stderr.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns stdout and stderr joined for error reporting.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Executes a shell command asynchronously through `/bin/sh -c`.
///
/// Returns the exit code and captured output; a non-zero exit is not an
/// error at this layer. Fails only if the command could not be spawned.
pub async fn exec(cmd: &str) -> CnciResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| CnciError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let exit_code = output.status.code().unwrap_or(-1);
    let result = ExecResult {
        exit_code,
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if !result.success() {
        tracing::warn!(
            command = %cmd,
            exit_code = exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Executes a shell command, treating a non-zero exit code as an error.
///
/// Returns stdout on success.
pub async fn exec_or_throw(cmd: &str) -> CnciResult<String> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(CnciError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shellquote_simple() {
        assert_eq!(shellquote("simple"), "\"simple\"");
        assert_eq!(shellquote("192.168.1.0/24"), "\"192.168.1.0/24\"");
        assert_eq!(shellquote(""), "\"\"");
    }

    #[test]
    fn test_shellquote_special_chars() {
        assert_eq!(shellquote("$HOME"), "\"\\$HOME\"");
        assert_eq!(shellquote("`id`"), "\"\\`id\\`\"");
        assert_eq!(shellquote("a\"b"), "\"a\\\"b\"");
        assert_eq!(shellquote("a\\b"), "\"a\\\\b\"");
    }

    #[test]
    fn test_exec_result_combined() {
        let result = ExecResult {
            exit_code: 1,
            stdout: "out".to_string(),
            stderr: "err".to_string(),
        };
        assert!(!result.success());
        assert_eq!(result.combined_output(), "out\nerr");
    }

    #[tokio::test]
    async fn test_exec_echo() {
        let result = exec("echo hello").await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hello");
    }

    #[tokio::test]
    async fn test_exec_or_throw_failure() {
        let result = exec_or_throw("exit 3").await;
        match result {
            Err(CnciError::ShellCommandFailed { exit_code, .. }) => assert_eq!(exit_code, 3),
            other => panic!("Expected ShellCommandFailed, got {:?}", other),
        }
    }
}

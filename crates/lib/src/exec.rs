//! Safe execution layer: run allowlisted binaries with allowlisted subcommands only.
//! No shell is used; arguments are passed as a list to avoid injection.
//! Every run is bounded by a timeout and the child is killed when it expires.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("binary not allowlisted: {0}")]
    BinaryNotAllowed(String),
    #[error("subcommand not allowlisted: {0} {1}")]
    SubcommandNotAllowed(String, String),
    #[error("exec failed: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("exit {status}: {output}")]
    Failed { status: String, output: String },
}

/// One allowlisted invocation: options placed before the subcommand, then the subcommand and its args.
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub binary: &'a str,
    pub global_args: &'a [String],
    pub subcommand: &'a str,
    pub args: &'a [String],
}

/// Allowlist: binary name -> set of allowed subcommands (e.g. "signal-cli" -> ["send", "receive"]).
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    bins: HashMap<String, Vec<String>>,
}

impl Allowlist {
    pub fn new() -> Self {
        Self {
            bins: HashMap::new(),
        }
    }

    /// Allow a binary to run only the given subcommands.
    pub fn allow(&mut self, binary: impl Into<String>, subcommands: Vec<&'static str>) {
        self.bins.insert(
            binary.into(),
            subcommands.into_iter().map(String::from).collect(),
        );
    }

    fn check(&self, binary: &str, subcommand: &str) -> Result<(), ExecError> {
        let allowed = self
            .bins
            .get(binary)
            .ok_or_else(|| ExecError::BinaryNotAllowed(binary.to_string()))?;
        if !allowed.iter().any(|s| s == subcommand) {
            return Err(ExecError::SubcommandNotAllowed(
                binary.to_string(),
                subcommand.to_string(),
            ));
        }
        Ok(())
    }

    /// Run the invocation if allowed. Returns stdout; on failure stderr is included in the error.
    pub async fn run(&self, inv: Invocation<'_>, timeout: Duration) -> Result<String, ExecError> {
        self.check(inv.binary, inv.subcommand)?;
        let child = Command::new(inv.binary)
            .args(inv.global_args)
            .arg(inv.subcommand)
            .args(inv.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(res) => res?,
            Err(_) => return Err(ExecError::TimedOut(timeout)),
        };
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.success() {
            if !stderr.trim().is_empty() {
                log::debug!("{} {} stderr: {}", inv.binary, inv.subcommand, stderr.trim());
            }
            Ok(stdout)
        } else {
            let mut msg = stdout;
            if !stderr.is_empty() {
                if !msg.is_empty() {
                    msg.push('\n');
                }
                msg.push_str(&stderr);
            }
            Err(ExecError::Failed {
                status: output.status.to_string(),
                output: msg.trim().to_string(),
            })
        }
    }
}

/// Allowlist for signal-cli: `send` and `receive` only.
pub fn signal_cli_allowlist(binary: &str) -> Allowlist {
    let mut a = Allowlist::new();
    a.allow(binary, vec!["send", "receive"]);
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inv<'a>(binary: &'a str, subcommand: &'a str, args: &'a [String]) -> Invocation<'a> {
        Invocation {
            binary,
            global_args: &[],
            subcommand,
            args,
        }
    }

    #[tokio::test]
    async fn rejects_unknown_binary_and_subcommand() {
        let a = signal_cli_allowlist("signal-cli");
        let err = a
            .run(inv("rm", "-rf", &[]), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::BinaryNotAllowed(_)));
        let err = a
            .run(inv("signal-cli", "register", &[]), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::SubcommandNotAllowed(_, _)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_and_failures() {
        let mut a = Allowlist::new();
        a.allow("sh", vec!["-c"]);
        let out = a
            .run(inv("sh", "-c", &["echo hello".to_string()]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");

        let err = a
            .run(
                inv("sh", "-c", &["echo oops >&2; exit 3".to_string()]),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        match err {
            ExecError::Failed { output, .. } => assert_eq!(output, "oops"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn times_out_long_running_child() {
        let mut a = Allowlist::new();
        a.allow("sh", vec!["-c"]);
        let err = a
            .run(inv("sh", "-c", &["sleep 5".to_string()]), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::TimedOut(_)));
    }
}

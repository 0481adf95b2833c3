//! Subprocess runner for external checkers.
//!
//! Children run in their own process group. On deadline expiry or caller
//! cancellation the whole group gets a soft signal, then a hard kill
//! after a grace period. Streams are captured with a per-stream byte cap
//! and a truncation marker; a spawn failure reports a null exit code,
//! distinct from a non-zero exit.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Captured result of one subprocess run.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    /// None when the process failed to spawn.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// True when the deadline or cancellation terminated the child.
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    fn spawn_failure(detail: String) -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: detail,
            timed_out: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    stream_cap_bytes: usize,
    grace: Duration,
    envs: Vec<(String, String)>,
}

impl SubprocessRunner {
    pub fn new(stream_cap_bytes: usize) -> Self {
        Self {
            stream_cap_bytes,
            grace: Duration::from_secs(2),
            envs: Vec::new(),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Extra environment delivered to every child.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Run `argv` in `cwd` with a deadline. Never returns an error: every
    /// failure mode is encoded in the output.
    pub async fn run(
        &self,
        argv: &[String],
        cwd: &Path,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> CommandOutput {
        let Some((program, args)) = argv.split_first() else {
            return CommandOutput::spawn_failure("empty argv".into());
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %program, error = %e, "failed to spawn checker");
                return CommandOutput::spawn_failure(format!("failed to spawn {program}: {e}"));
            }
        };

        let pid = child.id();
        let cap = self.stream_cap_bytes;
        let stdout_task = child
            .stdout
            .take()
            .map(|s| tokio::spawn(read_capped(s, cap)));
        let stderr_task = child
            .stderr
            .take()
            .map(|s| tokio::spawn(read_capped(s, cap)));

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(deadline) => None,
            _ = cancel.cancelled() => None,
        };

        let timed_out = status.is_none();
        let exit_code = match status {
            Some(Ok(status)) => Some(exit_code_of(status)),
            Some(Err(e)) => {
                warn!(error = %e, "failed to await child");
                Some(-1)
            }
            None => {
                self.terminate_group(pid, &mut child).await;
                None
            }
        };

        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        debug!(?exit_code, timed_out, "checker finished");
        CommandOutput {
            // A terminated child still gets a synthetic non-null code so a
            // timeout is never confused with a spawn failure.
            exit_code: exit_code.or(Some(-1)),
            stdout,
            stderr,
            timed_out,
        }
    }

    /// Soft-signal the process group, wait out the grace period, then
    /// hard-kill whatever is left.
    async fn terminate_group(&self, pid: Option<u32>, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = pid {
            let _ = Command::new("kill")
                .args(["-TERM", "--", &format!("-{pid}")])
                .output()
                .await;
        }

        let soft_exit = tokio::time::timeout(self.grace, child.wait()).await;
        if soft_exit.is_err() {
            let _ = child.start_kill();
            #[cfg(unix)]
            if let Some(pid) = pid {
                let _ = Command::new("kill")
                    .args(["-KILL", "--", &format!("-{pid}")])
                    .output()
                    .await;
            }
            let _ = child.wait().await;
        }
    }
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Read a stream up to the cap, then drain the rest so the child never
/// blocks on a full pipe.
async fn read_capped<R: tokio::io::AsyncRead + Unpin>(mut stream: R, cap: usize) -> String {
    let mut collected: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if collected.len() < cap {
                    let take = n.min(cap - collected.len());
                    collected.extend_from_slice(&buf[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }

    let mut text = String::from_utf8_lossy(&collected).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn runner() -> SubprocessRunner {
        SubprocessRunner::new(1024).with_grace(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn captures_streams_and_exit_code() {
        let dir = tempdir().unwrap();
        let out = runner()
            .run(
                &sh("echo out; echo err >&2; exit 3"),
                dir.path(),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.timed_out);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn spawn_failure_reports_null_exit() {
        let dir = tempdir().unwrap();
        let out = runner()
            .run(
                &["definitely-not-a-real-binary-7f3a".to_string()],
                dir.path(),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(out.exit_code, None);
        assert!(out.stderr.contains("failed to spawn"));
    }

    #[tokio::test]
    async fn deadline_kills_the_child() {
        let dir = tempdir().unwrap();
        let start = std::time::Instant::now();
        let out = runner()
            .run(
                &sh("sleep 30"),
                dir.path(),
                Duration::from_millis(200),
                &CancellationToken::new(),
            )
            .await;
        assert!(out.timed_out);
        assert!(out.exit_code.is_some(), "timeout is not a spawn failure");
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let start = std::time::Instant::now();
        let out = runner()
            .run(&sh("sleep 30"), dir.path(), Duration::from_secs(60), &cancel)
            .await;
        assert!(out.timed_out);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn oversized_output_is_truncated_with_marker() {
        let dir = tempdir().unwrap();
        let out = runner()
            .run(
                &sh("yes x | head -c 100000"),
                dir.path(),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await;
        assert!(out.stdout.len() <= 1024 + TRUNCATION_MARKER.len());
        assert!(out.stdout.ends_with(TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn extra_env_reaches_the_child() {
        let dir = tempdir().unwrap();
        let out = SubprocessRunner::new(1024)
            .with_env("MANIFEST_ALLOW_NETWORK", "0")
            .run(
                &sh("printf %s \"$MANIFEST_ALLOW_NETWORK\""),
                dir.path(),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(out.stdout, "0");
    }

    #[tokio::test]
    async fn empty_argv_is_a_spawn_failure() {
        let dir = tempdir().unwrap();
        let out = runner()
            .run(&[], dir.path(), Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert_eq!(out.exit_code, None);
    }
}

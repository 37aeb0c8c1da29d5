//! Async child processes with a wall-clock timeout and bounded output capture.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// The child could not be started. Keeps the `std::io::Error` so callers can
/// tell a missing program apart from other failures.
#[derive(Debug, thiserror::Error)]
#[error("spawn {program}: {source}")]
pub struct SpawnError {
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Run `cmd`, feeding `stdin` and capturing stdout/stderr.
///
/// Both pipes are drained concurrently while the child runs; bytes beyond
/// `output_limit_bytes` are counted and discarded. One deadline covers the
/// child's exit and the draining of both pipes: a child still running at the
/// deadline is killed and reaped, and a pipe still held open (say by a
/// backgrounded grandchild) has its reader aborted. Either way the result has
/// `timed_out` set. Spawn failures surface as [`SpawnError`].
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub async fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    debug!("spawning child process");
    let mut child = cmd.spawn().map_err(|source| SpawnError {
        program: cmd.as_std().get_program().to_string_lossy().into_owned(),
        source,
    })?;

    let stdin_task = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => Some(tokio::spawn(async move {
            // A child that exits without reading its input closes the pipe early.
            if let Err(err) = pipe.write_all(&input).await {
                debug!(err = %err, "child stdin closed before payload was written");
            }
        })),
        _ => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let mut stdout_task = tokio::spawn(read_stream_limited(stdout, output_limit_bytes));
    let mut stderr_task = tokio::spawn(read_stream_limited(stderr, output_limit_bytes));

    let deadline = Instant::now() + timeout;
    let (status, mut timed_out) = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(status) => (status.context("wait for command")?, false),
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            child.kill().await.context("kill command")?;
            let status = child.wait().await.context("wait command after kill")?;
            (status, true)
        }
    };

    if let Some(task) = stdin_task {
        task.abort();
    }

    let mut drained = None;
    if !timed_out {
        let joined = tokio::time::timeout_at(deadline, async {
            let stdout = join_output(&mut stdout_task).await.context("join stdout")?;
            let stderr = join_output(&mut stderr_task).await.context("join stderr")?;
            Ok::<_, anyhow::Error>((stdout, stderr))
        })
        .await;
        match joined {
            Ok(result) => drained = Some(result?),
            Err(_) => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "command exited but its output pipes stayed open"
                );
                timed_out = true;
            }
        }
    }

    let ((stdout, stdout_truncated), (stderr, stderr_truncated)) = match drained {
        Some(output) => output,
        None => {
            // Grandchildren may still hold the pipes open; do not wait on them.
            stdout_task.abort();
            stderr_task.abort();
            ((Vec::new(), 0), (Vec::new(), 0))
        }
    };

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

async fn join_output(
    handle: &mut JoinHandle<Result<(Vec<u8>, usize)>>,
) -> Result<(Vec<u8>, usize)> {
    handle
        .await
        .map_err(|err| anyhow!("output reader task failed: {err}"))?
}

async fn read_stream_limited<R>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await.context("read output")?;
        if n == 0 {
            break;
        }
        let keep = n.min(limit.saturating_sub(buf.len()));
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_stdout_and_stdin() {
        let output = run_command_with_timeout(
            sh("cat; echo done >&2"),
            Some(b"payload".to_vec()),
            Duration::from_secs(10),
            1024,
        )
        .await
        .expect("run");
        assert!(output.status.success());
        assert!(!output.timed_out);
        assert_eq!(output.stdout_lossy(), "payload");
        assert_eq!(output.stderr_lossy().trim(), "done");
    }

    #[tokio::test]
    async fn bounds_captured_output() {
        let output = run_command_with_timeout(
            sh("printf 'abcdefghij'"),
            None,
            Duration::from_secs(10),
            4,
        )
        .await
        .expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 6);
    }

    #[tokio::test]
    async fn kills_child_on_timeout() {
        let started = std::time::Instant::now();
        let output = run_command_with_timeout(
            sh("exec sleep 30"),
            None,
            Duration::from_millis(200),
            1024,
        )
        .await
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn pipes_held_by_grandchild_count_against_the_timeout() {
        let started = std::time::Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 5 & printf started"),
            None,
            Duration::from_millis(300),
            1024,
        )
        .await
        .expect("run");
        assert!(output.timed_out);
        assert!(output.status.success());
        assert!(output.stdout.is_empty());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn missing_program_keeps_io_error() {
        let err = run_command_with_timeout(
            Command::new("stepwise-test-no-such-program"),
            None,
            Duration::from_secs(1),
            1024,
        )
        .await
        .unwrap_err();
        let spawn = err.downcast_ref::<SpawnError>().expect("spawn error");
        assert_eq!(spawn.program, "stepwise-test-no-such-program");
        assert_eq!(spawn.source.kind(), std::io::ErrorKind::NotFound);
    }
}

//! Bounded shell execution on the host.
//!
//! Every command runs under `sh -c` in its own process group with a hard
//! timeout. On expiry the whole group is killed and a failure result with
//! exit code [`TIMEOUT_EXIT_CODE`] is returned instead of an error.
//!
//! Completion is the shell's exit, not EOF on its pipes: a backgrounded child
//! may keep stdout open, so output is drained for at most
//! [`PIPE_DRAIN_GRACE`] after exit.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ExecOptions, ExecOutput, DEFAULT_COMMAND_TIMEOUT, TIMEOUT_EXIT_CODE};

/// How long output pipes may stay open after the shell has exited.
pub const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Collects a pipe in the background so partial output survives an abort.
struct PipeCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl PipeCapture {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let task = tokio::spawn(async move {
            let Some(mut pipe) = pipe else { return };
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => match sink.lock() {
                        Ok(mut buf) => buf.extend_from_slice(&chunk[..n]),
                        Err(poisoned) => poisoned.into_inner().extend_from_slice(&chunk[..n]),
                    },
                }
            }
        });
        Self { buffer, task }
    }

    /// Waits up to `grace` for EOF, then returns what was read.
    async fn finish(self, grace: Duration) -> String {
        let mut task = self.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            task.abort();
            debug!("Output pipe still open after exit; keeping partial output");
        }
        let bytes = match self.buffer.lock() {
            Ok(buf) => buf.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn abort(&self) {
        self.task.abort();
    }
}

/// Quotes a string for safe interpolation into a POSIX shell command.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Runs `command` through `sh -c` in `cwd`, bounded by the options' timeout.
pub async fn run_shell(command: &str, cwd: &Path, options: &ExecOptions) -> ExecOutput {
    let timeout = options.timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);
    let start = Instant::now();

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if options.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }

    for (key, value) in &options.env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    debug!(command = command, cwd = %cwd.display(), timeout_ms = timeout.as_millis() as u64, "Spawning shell command");

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecOutput::failure(
                format!("Failed to spawn command: {e}"),
                start.elapsed(),
            );
        }
    };
    let pid = child.id();

    if let Some(input) = options.stdin.clone() {
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!(error = %e, "Failed to write command stdin");
                }
                stdin.shutdown().await.ok();
            });
        }
    }

    let stdout = PipeCapture::spawn(child.stdout.take());
    let stderr = PipeCapture::spawn(child.stderr.take());

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            let (stdout, stderr) = tokio::join!(
                stdout.finish(PIPE_DRAIN_GRACE),
                stderr.finish(PIPE_DRAIN_GRACE)
            );
            ExecOutput {
                stdout,
                stderr,
                exit_code: status.code().unwrap_or(-1),
                duration_ms,
                timed_out: false,
            }
        }
        Ok(Err(e)) => {
            stdout.abort();
            stderr.abort();
            ExecOutput::failure(format!("Process error: {e}"), start.elapsed())
        }
        Err(_) => {
            stdout.abort();
            stderr.abort();
            // The shell is killed when `child` drops; grandchildren in the
            // group need an explicit signal.
            if let Some(pid) = pid {
                kill_process_group(pid).await;
            }
            warn!(command = command, timeout_ms = timeout.as_millis() as u64, "Command timed out");
            ExecOutput::timed_out(timeout, start.elapsed())
        }
    }
}

#[cfg(unix)]
async fn kill_process_group(pid: u32) {
    let group = format!("-{pid}");
    let result = Command::new("kill")
        .args(["-KILL", "--", &group])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = tokio::time::timeout(Duration::from_secs(5), result).await {
        debug!(pid = pid, error = %e, "Timed out signalling process group");
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_pid: u32) {}

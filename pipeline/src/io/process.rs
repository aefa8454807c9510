//! Helpers for running child processes with timeouts, cancellation and bounded output.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::cancel::CancelToken;

/// How often a waiting child is checked for cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Why a child was killed before it exited on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    TimedOut,
    Cancelled,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub terminated: Option<Termination>,
}

impl CommandOutput {
    pub fn timed_out(&self) -> bool {
        self.terminated == Some(Termination::TimedOut)
    }

    pub fn cancelled(&self) -> bool {
        self.terminated == Some(Termination::Cancelled)
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

type StreamSink = Arc<Option<Mutex<BufWriter<File>>>>;

/// Called with every complete stdout line, before the capture limit applies.
pub type LineObserver = Box<dyn FnMut(&[u8]) + Send>;

/// Run a command with a hard timeout, capturing stdout/stderr and optionally teeing stdout
/// line-by-line to `stream_path`.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr kept in memory (bytes beyond this are discarded while still draining the pipe).
/// `on_line` still sees every stdout line, so callers that need the end of a long stream
/// can digest it as it arrives. The child is killed when `timeout` elapses or `cancel` fires.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes, streaming = stream_path.is_some()))]
pub fn run_command_with_stream(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    stream_path: Option<&Path>,
    on_line: Option<LineObserver>,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let sink: StreamSink = Arc::new(match stream_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create stream dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create stream file {}", path.display()))?;
            Some(Mutex::new(BufWriter::new(file)))
        }
        None => None,
    });

    let stdout_sink = sink.clone();
    let stdout_handle = thread::spawn(move || {
        read_stream_limited_with_tee(stdout, output_limit_bytes, stdout_sink, on_line)
    });
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    // Readers are already draining, so a large prompt cannot deadlock against a chatty child.
    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        if let Err(e) = child_stdin.write_all(input) {
            warn!(err = %e, "failed to write child stdin");
        }
    }

    let deadline = Instant::now() + timeout;
    let mut terminated = None;
    let status = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || cancel.is_cancelled() {
            let reason = if cancel.is_cancelled() {
                Termination::Cancelled
            } else {
                Termination::TimedOut
            };
            warn!(?reason, timeout_secs = timeout.as_secs(), "killing command");
            terminated = Some(reason);
            child.kill().context("kill command")?;
            break child.wait().context("wait command after kill")?;
        }
        if let Some(status) = child
            .wait_timeout(remaining.min(CANCEL_POLL_INTERVAL))
            .context("wait for command")?
        {
            break status;
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), ?terminated, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        terminated,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream line-by-line with a size limit, tee-ing each line to the sink and observer.
fn read_stream_limited_with_tee<R: Read>(
    reader: R,
    limit: usize,
    sink: StreamSink,
    mut on_line: Option<LineObserver>,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(ref mutex) = *sink
            && let Ok(mut writer) = mutex.lock()
        {
            // Flush per line so the stream file can be tailed while the call runs.
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write to stream file");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush stream file");
            }
        }

        if let Some(observe) = on_line.as_mut() {
            observe(&line);
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

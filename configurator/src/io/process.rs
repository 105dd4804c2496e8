//! Helpers for running child processes with timeouts and bounded output.

use std::io::{ErrorKind, Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Minimum time allowed for the reader to reach EOF once the child has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Captured child process output.
///
/// `output` interleaves stdout and stderr in the order the child wrote them.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub output: Vec<u8>,
    pub truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Lossy UTF-8 rendering of the captured output plus a truncation notice.
    pub fn text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.output).into_owned();
        if self.truncated > 0 {
            text.push_str(&format!("\n[output truncated {} bytes]\n", self.truncated));
        }
        text
    }
}

/// Run a command with a timeout, capturing stdout and stderr through one pipe.
///
/// The child runs in its own process group. Stdin is fed and output is read on
/// separate threads, so neither a child that ignores its input nor a chatty
/// child can stall the deadline. `output_limit_bytes` bounds the amount stored
/// in memory (bytes beyond it are discarded while still draining the pipe).
///
/// The deadline covers the whole run, including processes the child leaves
/// behind holding the output pipe. On expiry the process group is killed and
/// `timed_out` is set.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    let (reader, writer) = std::io::pipe().context("create output pipe")?;
    let stderr_writer = writer.try_clone().context("clone output pipe")?;
    cmd.stdout(writer).stderr(stderr_writer);
    isolate_process_group(&mut cmd);

    debug!("spawning child process");
    let started = Instant::now();
    let spawned = cmd.spawn();
    // The command holds the parent's copies of the write end; drop them so the
    // reader sees EOF once the child exits.
    drop(cmd);
    let mut child = match spawned {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let (output_tx, output_rx) = mpsc::channel();
    thread::spawn(move || {
        // The receiver only goes away once the result no longer matters.
        let _ = output_tx.send(read_stream_limited(reader, output_limit_bytes));
    });

    let stdin_handle = match stdin {
        Some(input) => {
            let child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || write_stdin(child_stdin, &input)))
        }
        None => None,
    };

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_group(&mut child).context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    // Processes left behind by the child may still hold the output pipe.
    let remaining = timeout.saturating_sub(started.elapsed()).max(DRAIN_GRACE);
    let read = match output_rx.recv_timeout(remaining) {
        Ok(read) => read,
        Err(RecvTimeoutError::Timeout) => {
            if !timed_out {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "leftover processes hold the output open, killing"
                );
            }
            timed_out = true;
            kill_process_group(&mut child).context("kill leftover processes")?;
            output_rx
                .recv()
                .map_err(|_| anyhow!("output reader thread panicked"))?
        }
        Err(RecvTimeoutError::Disconnected) => {
            return Err(anyhow!("output reader thread panicked"));
        }
    };
    let (output, truncated) = read.context("join output")?;

    if let Some(handle) = stdin_handle {
        handle
            .join()
            .map_err(|_| anyhow!("stdin writer thread panicked"))?
            .context("write stdin")?;
    }

    if truncated > 0 {
        warn!(truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        output,
        truncated,
        timed_out,
    })
}

/// Write `input` and close stdin. A child that exits (or is killed) without
/// reading its input is not an error.
fn write_stdin(mut stdin: ChildStdin, input: &[u8]) -> std::io::Result<()> {
    match stdin.write_all(input) {
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            debug!("child closed stdin before reading all input");
            Ok(())
        }
        other => other,
    }
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

/// SIGKILL the child's process group, which outlives the child itself.
#[cfg(unix)]
fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(child.id())
        .map_err(|_| std::io::Error::other(format!("pid {} out of range", child.id())))?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        // The whole group already exited.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(errno.into()),
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    match child.kill() {
        Err(e) if e.kind() == ErrorKind::InvalidInput => Ok(()),
        other => other,
    }
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

//! Running external tools on the host.
//!
//! Arguments are always passed as a vector, never through a shell. A
//! non-zero exit is not an error here: callers get the captured output and
//! decide what it means.

use std::ffi::{OsStr, OsString};
use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// How often a running child is polled while a timeout is in effect.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Minimum time left for collecting output once the child has exited, even
/// if it exited right at the deadline.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the process exited with status zero.
    pub success: bool,
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

impl CommandOutput {
    /// A successful result with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed result with the given stderr.
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Executes external commands to completion.
pub trait Runner {
    /// Run `program` with `args`, waiting for it to exit.
    ///
    /// Returns `Err` only if the process could not be run or was killed;
    /// a non-zero exit is reported through [`CommandOutput::success`].
    fn run(&self, program: &OsStr, args: &[OsString]) -> Result<CommandOutput>;
}

impl<R: Runner + ?Sized> Runner for &R {
    fn run(&self, program: &OsStr, args: &[OsString]) -> Result<CommandOutput> {
        (**self).run(program, args)
    }
}

/// Runs commands as child processes of this one.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    /// A runner that kills commands running longer than `timeout`.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

fn describe(program: &OsStr, args: &[OsString]) -> (String, String) {
    let program = program.to_string_lossy().into_owned();
    let subcommand = args
        .first()
        .map(|a| a.to_string_lossy().into_owned())
        .unwrap_or_default();
    (program, subcommand)
}

/// Forward everything read from `pipe` as chunks; the channel disconnects at
/// EOF.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    if let Some(mut pipe) = pipe {
        std::thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(chunk[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    // A read error only truncates the capture; the exit
                    // status still tells the caller what happened.
                    Err(e) => {
                        debug!("Failed to read child output: {e}");
                        break;
                    }
                }
            }
        });
    }
    rx
}

/// Gather the output of one pipe, giving up at `deadline`.
///
/// The flag is false if the pipe was still open at the deadline, which
/// happens when a background grandchild inherited it.
fn collect(rx: &Receiver<Vec<u8>>, deadline: Option<Instant>) -> (String, bool) {
    let mut buf = Vec::new();
    let complete = loop {
        let chunk = match deadline {
            Some(deadline) => {
                rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match chunk {
            Ok(chunk) => buf.extend_from_slice(&chunk),
            Err(RecvTimeoutError::Disconnected) => break true,
            Err(RecvTimeoutError::Timeout) => break false,
        }
    };
    (String::from_utf8_lossy(&buf).into_owned(), complete)
}

/// Wait for `child`, killing it once `deadline` has passed.
///
/// Returns `None` if the child had to be killed.
fn wait_with_deadline(child: &mut Child, deadline: Instant) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            if let Err(e) = child.kill() {
                warn!("Failed to kill timed out child {}: {e}", child.id());
            }
            // Reap it so we don't leave a zombie behind.
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

impl Runner for ProcessRunner {
    fn run(&self, program: &OsStr, args: &[OsString]) -> Result<CommandOutput> {
        debug!("Running {:?} {:?}", program, args);
        let (name, subcommand) = describe(program, args);
        let deadline = self.timeout.map(|t| Instant::now() + t);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::Spawn {
                program: name.clone(),
                source,
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match deadline {
            Some(deadline) => wait_with_deadline(&mut child, deadline),
            None => child.wait().map(Some),
        }
        .map_err(|e| Error::io(format!("Waiting for {name}"), e))?;

        let Some(status) = status else {
            // The reader threads are left to finish on their own.
            return Err(Error::Timeout {
                program: name,
                subcommand,
                timeout_secs: self.timeout.map(|t| t.as_secs()).unwrap_or_default(),
            });
        };

        // The child is gone but its pipes may not be: anything it forked
        // into the background keeps them open for as long as it runs.
        let drain_deadline = deadline.map(|d| d.max(Instant::now() + DRAIN_GRACE));
        let (stdout, stdout_complete) = collect(&stdout, drain_deadline);
        let (stderr, stderr_complete) = collect(&stderr, drain_deadline);
        if !(stdout_complete && stderr_complete) {
            warn!(
                "{name} {subcommand} exited but left its output open; using what was captured"
            );
        }

        let output = CommandOutput {
            success: status.success(),
            code: status.code(),
            stdout,
            stderr,
        };
        if !output.success {
            debug!("{name} {subcommand} exited with {status}");
        }
        Ok(output)
    }
}

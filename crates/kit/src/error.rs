//! Error types for VBoxManage-driven operations.

use std::fmt;
use std::io;

use thiserror::Error;

/// Stage of the SSH key injection pipeline that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum InjectStage {
    /// Looking up the disk image of the VM.
    ResolveImage,
    /// Copying the image into scratch space.
    CopyToScratch,
    /// Running the guest customization tool on the scratch copy.
    Customize,
    /// Replacing the original image with the customized copy.
    WriteBack,
    /// Removing the scratch copy after a successful write-back.
    RemoveScratch,
}

/// Errors returned by the library.
#[derive(Error, Debug)]
pub enum Error {
    /// An external command exited unsuccessfully.
    #[error("{program} {subcommand} failed: {}", .stderr.trim_end())]
    Tool {
        /// Program that was run.
        program: String,
        /// First argument, usually the VBoxManage subcommand.
        subcommand: String,
        /// Captured standard error, verbatim.
        stderr: String,
    },

    /// An external command could not be started at all.
    #[error("Failed to execute {program}: {source}")]
    Spawn {
        /// Program that was run.
        program: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// An external command did not finish in time and was killed.
    #[error("{program} {subcommand} did not finish within {timeout_secs}s and was killed")]
    Timeout {
        /// Program that was run.
        program: String,
        /// First argument, usually the VBoxManage subcommand.
        subcommand: String,
        /// Configured timeout.
        timeout_secs: u64,
    },

    /// No free TCP port could be found in the configured range.
    #[error("No free TCP port on 127.0.0.1 in range {min}-{max}")]
    PortsExhausted {
        /// Lower bound, inclusive.
        min: u16,
        /// Upper bound, inclusive.
        max: u16,
    },

    /// Tool output did not have the expected shape.
    #[error("Malformed {what} output: {detail}")]
    MalformedOutput {
        /// Which output was being parsed.
        what: &'static str,
        /// What was wrong with it.
        detail: String,
    },

    /// An argument was rejected before being passed to an external tool.
    #[error("Invalid {field} '{value}': {reason}")]
    InvalidArgument {
        /// Name of the rejected parameter.
        field: &'static str,
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The VM has no disk attached at the configured controller slot.
    #[error("VM '{vm}' has no disk image attached at '{slot}'")]
    NoDiskImage {
        /// VM that was inspected.
        vm: String,
        /// Controller slot that was looked up.
        slot: String,
    },

    /// Local filesystem failure.
    #[error("{context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// SSH key injection failed at a specific stage.
    #[error("SSH key injection failed at stage '{stage}': {source}")]
    Inject {
        /// Stage that failed.
        stage: InjectStage,
        /// What went wrong.
        #[source]
        source: Box<Error>,
    },
}

/// Result alias for library operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn at_stage(self, stage: InjectStage) -> Self {
        Error::Inject {
            stage,
            source: Box::new(self),
        }
    }
}

/// Extension for tagging injection failures with their stage.
pub(crate) trait StageExt<T> {
    fn stage(self, stage: InjectStage) -> Result<T>;
}

impl<T> StageExt<T> for Result<T> {
    fn stage(self, stage: InjectStage) -> Result<T> {
        self.map_err(|e| e.at_stage(stage))
    }
}

/// One failed step of a multi-step operation.
#[derive(Debug)]
pub struct Diagnostic {
    /// Short description of the step, e.g. "Error creating VM".
    pub summary: String,
    /// The error the step produced.
    pub error: Error,
}

/// Errors accumulated over a sequence of steps, including rollback attempts.
///
/// A rollback that fails does not replace the error that triggered it; both
/// are kept, in order.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    /// Record a failed step.
    pub fn push(&mut self, summary: impl Into<String>, error: Error) {
        self.entries.push(Diagnostic {
            summary: summary.into(),
            error,
        });
    }

    /// All recorded failures in the order they happened.
    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    /// Whether anything was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.entries.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}: {}", d.summary, d.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostics {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.entries
            .first()
            .map(|d| &d.error as &(dyn std::error::Error + 'static))
    }
}

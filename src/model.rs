use crate::session::{Rejection, SessionState};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use time::OffsetDateTime;

pub const DEFAULT_RAW_FOLDER: &str = "data/raw";
pub const DEFAULT_EXPORT_FOLDER: &str = "out_midis";
pub const DEFAULT_SPLIT_FOLDER: &str = "out_midis_split";
pub const DEFAULT_PIPELINE_SCRIPT: &str = "pipeline.py";
pub const DEFAULT_SPLIT_SCRIPT: &str = "utils/split_midi_tracks.py";

/// Logical operations the shell can ask the pipeline to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    RunBatch,
    ReviewPending,
    ExportMidi,
    SplitTracks,
}

impl Operation {
    pub fn label(self) -> &'static str {
        match self {
            Operation::RunBatch => "run-batch",
            Operation::ReviewPending => "review-pending",
            Operation::ExportMidi => "export-midi",
            Operation::SplitTracks => "split-midi-tracks",
        }
    }

    /// Whether a completed `RunBatch` must precede this operation.
    pub fn requires_batch(self) -> bool {
        matches!(self, Operation::ExportMidi)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Session-wide settings fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub split_support: bool,
    pub require_batch_success: bool,
    pub assume_batch_completed: bool,
    pub timeout: Option<Duration>,
}

/// Primitive inputs the presentation layer hands over with every request.
///
/// Folder fields may be blank; the argument builder substitutes defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineParams {
    pub python: PathBuf,
    pub repo_root: PathBuf,
    pub pipeline_script: String,
    pub split_script: String,
    pub raw_folder: String,
    pub normalize_key: bool,
    pub export_folder: String,
    pub split_folder: String,
    pub split_tracks: bool,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            python: PathBuf::new(),
            repo_root: PathBuf::new(),
            pipeline_script: DEFAULT_PIPELINE_SCRIPT.into(),
            split_script: DEFAULT_SPLIT_SCRIPT.into(),
            raw_folder: DEFAULT_RAW_FOLDER.into(),
            normalize_key: false,
            export_folder: DEFAULT_EXPORT_FOLDER.into(),
            split_folder: DEFAULT_SPLIT_FOLDER.into(),
            split_tracks: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub operation: Operation,
    pub params: PipelineParams,
}

/// One concrete external process launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInvocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
    /// Merged over the inherited environment.
    pub env: Vec<(OsString, OsString)>,
}

impl ProcessInvocation {
    /// Render the invocation as a single shell-like line for the log.
    pub fn command_line(&self) -> String {
        let mut out = quote_arg(&self.program.to_string_lossy());
        for arg in &self.args {
            out.push(' ');
            out.push_str(&quote_arg(&arg.to_string_lossy()));
        }
        out
    }
}

fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.chars().any(|c| c.is_whitespace() || c == '"') {
        return arg.to_string();
    }
    format!("\"{}\"", arg.replace('"', "\\\""))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Completed,
    Faulted(String),
    Cancelled,
    TimedOut(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    /// `None` when the process never started or was terminated by a signal.
    pub exit_code: Option<i32>,
    pub completion: Completion,
}

impl ProcessResult {
    pub fn completed(exit_code: Option<i32>) -> Self {
        Self {
            exit_code,
            completion: Completion::Completed,
        }
    }

    pub fn faulted(message: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            completion: Completion::Faulted(message.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            exit_code: None,
            completion: Completion::Cancelled,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completion == Completion::Completed
    }

    pub fn is_success(&self) -> bool {
        self.is_completed() && self.exit_code == Some(0)
    }

    /// Keep the first failure when folding several results into one.
    pub fn merge(self, other: ProcessResult) -> ProcessResult {
        if self.is_success() {
            other
        } else {
            self
        }
    }

    /// Trailing audit line written after every invocation.
    pub fn summary(&self) -> String {
        match (&self.completion, self.exit_code) {
            (Completion::Completed, Some(code)) => format!("Process exited with code {code}"),
            (Completion::Completed, None) => "Process terminated by signal".to_string(),
            (Completion::Faulted(msg), _) => format!("EXCEPTION: {msg}"),
            (Completion::Cancelled, _) => "Process cancelled".to_string(),
            (Completion::TimedOut(after), _) => format!(
                "Process timed out after {}",
                humantime::format_duration(*after)
            ),
        }
    }
}

/// Where a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
    Status,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => f.write_str("stdout"),
            Stream::Stderr => f.write_str("stderr"),
            Stream::Status => f.write_str("status"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub stream: Stream,
    pub text: String,
}

impl LogEntry {
    pub fn new(stream: Stream, text: impl Into<String>) -> Self {
        Self {
            // Local offset lookup can fail on multi-threaded unix processes.
            timestamp: OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc()),
            stream,
            text: text.into(),
        }
    }

    pub fn status(text: impl Into<String>) -> Self {
        Self::new(Stream::Status, text)
    }

    /// `HH:MM:SS text`, with stderr lines tagged `[ERR]`.
    pub fn render(&self) -> String {
        let stamp = self
            .timestamp
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .unwrap_or_else(|_| "--:--:--".into());
        match self.stream {
            Stream::Stderr => format!("{stamp} [ERR] {}", self.text),
            _ => format!("{stamp} {}", self.text),
        }
    }
}

/// How a requested operation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// Refused by the session gate; state never left `Idle`.
    Rejected(Rejection),
    /// Checked before spawning; no process ran.
    PreconditionFailed(String),
    /// Nothing in the export folder to work on.
    NoArtifacts(PathBuf),
    Process(ProcessResult),
}

/// Events emitted by the controller for presentation layers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Log(LogEntry),
    StateChanged {
        state: SessionState,
        batch_completed: bool,
        status: String,
    },
    OperationFinished {
        operation: Operation,
        outcome: OperationOutcome,
    },
}

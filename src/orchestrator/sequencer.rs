//! Multi-step operations built on the process runner.
//!
//! Export-then-split lives here: the export folder is scanned between the two
//! stages and the split script runs once per artifact, strictly one at a time.

use crate::model::{
    LogEntry, Operation, OperationOutcome, OperationRequest, PipelineParams, ProcessResult,
    SessionEvent,
};
use crate::runner::{ArgumentBuilder, ProcessRunner};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// File extension of exported artifacts.
const ARTIFACT_EXTENSION: &str = "mid";

#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("ERROR: Python not found at {}", .0.display())]
    MissingExecutable(PathBuf),
    #[error("ERROR: Repo root not found at {}", .0.display())]
    MissingRepoRoot(PathBuf),
    #[error("ERROR: Could not create {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("ERROR: Could not read {}: {source}", path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub struct Sequencer {
    runner: ProcessRunner,
    split_support: bool,
}

impl Sequencer {
    pub fn new(runner: ProcessRunner, split_support: bool) -> Self {
        Self {
            runner,
            split_support,
        }
    }

    /// Run `request` to completion. Never fails; every problem becomes an outcome.
    pub async fn run(
        &self,
        request: &OperationRequest,
        event_tx: &UnboundedSender<SessionEvent>,
        cancel: &CancellationToken,
    ) -> OperationOutcome {
        if let Err(e) = preflight(&request.params) {
            return precondition_failed(event_tx, e);
        }

        let builder = ArgumentBuilder::new(&request.params);
        match request.operation {
            Operation::ExportMidi => self.export_then_split(&builder, request, event_tx, cancel).await,
            Operation::SplitTracks => self.split_existing(&builder, event_tx, cancel).await,
            op => match builder.for_operation(op) {
                Some(invocation) => OperationOutcome::Process(
                    self.runner.execute(&invocation, event_tx, cancel).await,
                ),
                None => OperationOutcome::PreconditionFailed(format!("no invocation for {op}")),
            },
        }
    }

    async fn export_then_split(
        &self,
        builder: &ArgumentBuilder<'_>,
        request: &OperationRequest,
        event_tx: &UnboundedSender<SessionEvent>,
        cancel: &CancellationToken,
    ) -> OperationOutcome {
        let export_dir = builder.export_dir();
        if let Err(e) = create_dir(&export_dir) {
            return precondition_failed(event_tx, e);
        }

        let export = self
            .runner
            .execute(&builder.export_midi(), event_tx, cancel)
            .await;
        // A non-zero exit still leaves whatever was written behind; faults and
        // cancellations end the sequence.
        if !export.is_completed() {
            return OperationOutcome::Process(export);
        }

        let artifacts = match find_artifacts(&export_dir) {
            Ok(found) => found,
            Err(e) => {
                log(event_tx, e.to_string());
                return OperationOutcome::Process(export);
            }
        };
        if artifacts.is_empty() {
            log(
                event_tx,
                format!(
                    "[WARN] No .{ARTIFACT_EXTENSION} files found in export folder: {}",
                    export_dir.display()
                ),
            );
            return OperationOutcome::Process(export);
        }
        tracing::debug!(count = artifacts.len(), "export produced artifacts");

        if request.params.split_tracks && self.split_support {
            let split = self.split_all(builder, &artifacts, event_tx, cancel).await;
            return OperationOutcome::Process(export.merge(split));
        }
        OperationOutcome::Process(export)
    }

    async fn split_existing(
        &self,
        builder: &ArgumentBuilder<'_>,
        event_tx: &UnboundedSender<SessionEvent>,
        cancel: &CancellationToken,
    ) -> OperationOutcome {
        let export_dir = builder.export_dir();
        let artifacts = match find_artifacts(&export_dir) {
            Ok(found) => found,
            Err(e) => return precondition_failed(event_tx, e),
        };
        if artifacts.is_empty() {
            log(
                event_tx,
                format!(
                    "[WARN] No .{ARTIFACT_EXTENSION} files found in: {}",
                    export_dir.display()
                ),
            );
            return OperationOutcome::NoArtifacts(export_dir);
        }

        OperationOutcome::Process(self.split_all(builder, &artifacts, event_tx, cancel).await)
    }

    /// Split every artifact into `<split>/<stem>/`, one invocation at a time.
    ///
    /// Returns the first failing result, or the last one when all succeed. A
    /// cancel or an unusable output folder stops the loop and counts as a failure.
    async fn split_all(
        &self,
        builder: &ArgumentBuilder<'_>,
        artifacts: &[PathBuf],
        event_tx: &UnboundedSender<SessionEvent>,
        cancel: &CancellationToken,
    ) -> ProcessResult {
        if cancel.is_cancelled() {
            log(event_tx, "Splitting cancelled.".to_string());
            return ProcessResult::cancelled();
        }
        let split_root = builder.split_dir();
        if let Err(e) = create_dir(&split_root) {
            return dir_failure(event_tx, e);
        }
        log(
            event_tx,
            "--- Splitting exported MIDIs into per-track files ---".to_string(),
        );

        let mut combined: Option<ProcessResult> = None;
        for midi in artifacts {
            let result = if cancel.is_cancelled() {
                log(event_tx, "Splitting cancelled.".to_string());
                ProcessResult::cancelled()
            } else {
                let stem = midi.file_stem().unwrap_or(midi.as_os_str());
                let out_dir = split_root.join(stem);
                match create_dir(&out_dir) {
                    Ok(()) => {
                        self.runner
                            .execute(&builder.split_tracks(midi, &out_dir), event_tx, cancel)
                            .await
                    }
                    Err(e) => dir_failure(event_tx, e),
                }
            };
            let stop = !result.is_completed();
            combined = Some(match combined {
                Some(prev) => prev.merge(result),
                None => result,
            });
            if stop {
                break;
            }
        }
        combined.unwrap_or_else(|| ProcessResult::completed(Some(0)))
    }
}

/// Checks made before anything is spawned.
pub fn preflight(params: &PipelineParams) -> Result<(), PreconditionError> {
    if !params.python.is_file() {
        return Err(PreconditionError::MissingExecutable(params.python.clone()));
    }
    if !params.repo_root.is_dir() {
        return Err(PreconditionError::MissingRepoRoot(params.repo_root.clone()));
    }
    Ok(())
}

/// Top-level `*.mid` files in `dir`, sorted by name.
pub fn find_artifacts(dir: &Path) -> Result<Vec<PathBuf>, PreconditionError> {
    let read_err = |source| PreconditionError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_err)? {
        let path = entry.map_err(read_err)?.path();
        let matches = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(ARTIFACT_EXTENSION));
        if matches && path.is_file() {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

fn create_dir(path: &Path) -> Result<(), PreconditionError> {
    std::fs::create_dir_all(path).map_err(|source| PreconditionError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

fn log(event_tx: &UnboundedSender<SessionEvent>, text: String) {
    let _ = event_tx.send(SessionEvent::Log(LogEntry::status(text)));
}

fn dir_failure(event_tx: &UnboundedSender<SessionEvent>, err: PreconditionError) -> ProcessResult {
    let message = err.to_string();
    log(event_tx, message.clone());
    ProcessResult::faulted(message)
}

fn precondition_failed(
    event_tx: &UnboundedSender<SessionEvent>,
    err: PreconditionError,
) -> OperationOutcome {
    let message = err.to_string();
    log(event_tx, message.clone());
    OperationOutcome::PreconditionFailed(message)
}

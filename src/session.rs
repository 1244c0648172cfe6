//! Session state machine.
//!
//! Tracks whether an operation is in flight and whether the batch prerequisite
//! has been met. All gating decisions go through [`gate`], so presentation layers
//! can derive their affordances from the same rules the controller enforces.

use crate::model::{Completion, Operation, OperationOutcome, SessionConfig};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Busy(Operation),
}

impl SessionState {
    pub fn is_busy(self) -> bool {
        matches!(self, SessionState::Busy(_))
    }
}

/// Why a start request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("[WARN] Busy running {running}; {requested} ignored.")]
    Busy {
        running: Operation,
        requested: Operation,
    },
    #[error("ERROR: Run Batch must be completed before {requested}.")]
    PrerequisiteUnmet { requested: Operation },
    #[error("ERROR: Split support is disabled; {0} is unavailable.")]
    Unsupported(Operation),
}

/// Rules that never change during a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatePolicy {
    pub split_support: bool,
    pub require_batch_success: bool,
}

impl From<&SessionConfig> for GatePolicy {
    fn from(cfg: &SessionConfig) -> Self {
        Self {
            split_support: cfg.split_support,
            require_batch_success: cfg.require_batch_success,
        }
    }
}

/// Decide whether `requested` may start given the current state.
pub fn gate(
    state: SessionState,
    batch_completed: bool,
    policy: GatePolicy,
    requested: Operation,
) -> Result<(), Rejection> {
    if let SessionState::Busy(running) = state {
        return Err(Rejection::Busy { running, requested });
    }
    if requested == Operation::SplitTracks && !policy.split_support {
        return Err(Rejection::Unsupported(requested));
    }
    if requested.requires_batch() && !batch_completed {
        return Err(Rejection::PrerequisiteUnmet { requested });
    }
    Ok(())
}

#[derive(Debug)]
pub struct Session {
    state: SessionState,
    batch_completed: bool,
    policy: GatePolicy,
}

impl Session {
    pub fn new(cfg: &SessionConfig) -> Self {
        Self {
            state: SessionState::Idle,
            batch_completed: cfg.assume_batch_completed,
            policy: GatePolicy::from(cfg),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn batch_completed(&self) -> bool {
        self.batch_completed
    }

    #[cfg(test)]
    pub fn permits(&self, op: Operation) -> bool {
        gate(self.state, self.batch_completed, self.policy, op).is_ok()
    }

    /// `Idle -> Busy(op)`; a rejection leaves the state untouched.
    pub fn begin(&mut self, op: Operation) -> Result<String, Rejection> {
        gate(self.state, self.batch_completed, self.policy, op)?;
        self.state = SessionState::Busy(op);
        Ok(format!("Running: {op} …"))
    }

    /// `Busy -> Idle` for every outcome. Returns the status line to show.
    pub fn finish(&mut self, op: Operation, outcome: &OperationOutcome) -> String {
        if self.state != SessionState::Busy(op) {
            tracing::warn!(?op, state = ?self.state, "finish without matching begin");
        }
        self.state = SessionState::Idle;

        match outcome {
            OperationOutcome::Rejected(_) => "Idle".to_string(),
            OperationOutcome::PreconditionFailed(_) => "Idle (error)".to_string(),
            OperationOutcome::NoArtifacts(_) => "Idle (nothing to split)".to_string(),
            OperationOutcome::Process(result) => {
                if op == Operation::RunBatch
                    && result.is_completed()
                    && (!self.policy.require_batch_success || result.exit_code == Some(0))
                {
                    self.batch_completed = true;
                }
                match (&result.completion, result.exit_code) {
                    (Completion::Completed, Some(code)) => format!("Finished: {op} (exit {code})"),
                    (Completion::Completed, None) => format!("Finished: {op} (terminated)"),
                    (Completion::Faulted(_), _) => "Idle (exception)".to_string(),
                    (Completion::Cancelled, _) => "Idle (cancelled)".to_string(),
                    (Completion::TimedOut(_), _) => "Idle (timed out)".to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProcessResult;

    fn config() -> SessionConfig {
        SessionConfig {
            split_support: true,
            ..Default::default()
        }
    }

    fn exited(code: i32) -> OperationOutcome {
        OperationOutcome::Process(ProcessResult::completed(Some(code)))
    }

    #[test]
    fn starts_idle_without_batch() {
        let s = Session::new(&config());
        assert_eq!(s.state(), SessionState::Idle);
        assert!(!s.batch_completed());
    }

    #[test]
    fn export_rejected_before_batch() {
        let mut s = Session::new(&config());
        let err = s.begin(Operation::ExportMidi).unwrap_err();
        assert_eq!(
            err,
            Rejection::PrerequisiteUnmet {
                requested: Operation::ExportMidi
            }
        );
        assert!(err.to_string().contains("Run Batch must be completed"));
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn second_start_while_busy_is_rejected_without_side_effects() {
        let mut s = Session::new(&config());
        s.begin(Operation::ReviewPending).unwrap();
        let err = s.begin(Operation::RunBatch).unwrap_err();
        assert!(matches!(err, Rejection::Busy { .. }));
        assert_eq!(s.state(), SessionState::Busy(Operation::ReviewPending));
        assert!(!s.batch_completed());
    }

    #[test]
    fn failed_batch_still_opens_export_gate() {
        let mut s = Session::new(&config());
        s.begin(Operation::RunBatch).unwrap();
        let status = s.finish(Operation::RunBatch, &exited(1));
        assert_eq!(status, "Finished: run-batch (exit 1)");
        assert!(s.batch_completed());
        assert!(s.permits(Operation::ExportMidi));
    }

    #[test]
    fn batch_flag_is_sticky() {
        let mut s = Session::new(&config());
        s.begin(Operation::RunBatch).unwrap();
        s.finish(Operation::RunBatch, &exited(0));
        s.begin(Operation::RunBatch).unwrap();
        s.finish(
            Operation::RunBatch,
            &OperationOutcome::Process(ProcessResult::faulted("gone")),
        );
        assert!(s.batch_completed());
    }

    #[test]
    fn faulted_batch_does_not_open_gate() {
        let mut s = Session::new(&config());
        s.begin(Operation::RunBatch).unwrap();
        let status = s.finish(
            Operation::RunBatch,
            &OperationOutcome::Process(ProcessResult::faulted("spawn failed")),
        );
        assert_eq!(status, "Idle (exception)");
        assert!(!s.batch_completed());
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn strict_policy_requires_exit_zero() {
        let mut s = Session::new(&SessionConfig {
            require_batch_success: true,
            ..config()
        });
        s.begin(Operation::RunBatch).unwrap();
        s.finish(Operation::RunBatch, &exited(1));
        assert!(!s.batch_completed());
        s.begin(Operation::RunBatch).unwrap();
        s.finish(Operation::RunBatch, &exited(0));
        assert!(s.batch_completed());
    }

    #[test]
    fn split_rejected_when_unsupported() {
        let mut s = Session::new(&SessionConfig::default());
        assert_eq!(
            s.begin(Operation::SplitTracks),
            Err(Rejection::Unsupported(Operation::SplitTracks))
        );
    }

    #[test]
    fn precondition_failure_returns_to_idle() {
        let mut s = Session::new(&config());
        s.begin(Operation::RunBatch).unwrap();
        let status = s.finish(
            Operation::RunBatch,
            &OperationOutcome::PreconditionFailed("missing".into()),
        );
        assert_eq!(status, "Idle (error)");
        assert_eq!(s.state(), SessionState::Idle);
        assert!(!s.batch_completed());
    }

    #[test]
    fn assumed_batch_permits_export_immediately() {
        let s = Session::new(&SessionConfig {
            assume_batch_completed: true,
            ..config()
        });
        assert!(s.permits(Operation::ExportMidi));
    }
}

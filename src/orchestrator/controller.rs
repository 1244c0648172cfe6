//! Operation lifecycle controller.
//!
//! Owns the session state machine, starts operations on request and emits events
//! for presentation layers. Exactly one operation runs at a time.

use super::sequencer::Sequencer;
use crate::model::{
    LogEntry, Operation, OperationOutcome, OperationRequest, ProcessResult, SessionConfig,
    SessionEvent,
};
use crate::runner::ProcessRunner;
use crate::session::Session;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Commands emitted by presentation layers.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    Start(OperationRequest),
    Cancel,
    Quit,
}

/// Internal handle for the operation in flight.
struct RunCtx {
    operation: Operation,
    cancel: CancellationToken,
    handle: Option<tokio::task::JoinHandle<OperationOutcome>>,
}

fn start_operation(
    sequencer: Arc<Sequencer>,
    request: OperationRequest,
    event_tx: UnboundedSender<SessionEvent>,
) -> RunCtx {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let operation = request.operation;
    let handle = tokio::spawn(async move { sequencer.run(&request, &event_tx, &token).await });
    RunCtx {
        operation,
        cancel,
        handle: Some(handle),
    }
}

fn log(event_tx: &UnboundedSender<SessionEvent>, text: impl Into<String>) {
    let _ = event_tx.send(SessionEvent::Log(LogEntry::status(text)));
}

fn emit_state(event_tx: &UnboundedSender<SessionEvent>, session: &Session, status: String) {
    let _ = event_tx.send(SessionEvent::StateChanged {
        state: session.state(),
        batch_completed: session.batch_completed(),
        status,
    });
}

/// Serve presentation-layer commands until `Quit` (or the command channel closes)
/// and no operation is left running.
pub(crate) async fn run_controller(
    cfg: &SessionConfig,
    event_tx: UnboundedSender<SessionEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    let mut session = Session::new(cfg);
    let sequencer = Arc::new(Sequencer::new(
        ProcessRunner::new(cfg.timeout),
        cfg.split_support,
    ));
    let mut run_ctx: Option<RunCtx> = None;
    let mut quit_pending = false;
    // Cancel watchdog: if a cancel takes too long, emit a status message to keep UI feedback alive.
    let mut cancel_deadline: Option<tokio::time::Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));

    emit_state(&event_tx, &session, "Idle".into());

    loop {
        tokio::select! {
            // A closed channel would resolve immediately forever; stop reading once quitting.
            cmd = cmd_rx.recv(), if !quit_pending => {
                match cmd {
                    Some(UiCommand::Start(request)) => {
                        let op = request.operation;
                        match session.begin(op) {
                            Ok(status) => {
                                tracing::info!(%op, "operation started");
                                emit_state(&event_tx, &session, status);
                                run_ctx = Some(start_operation(
                                    sequencer.clone(),
                                    request,
                                    event_tx.clone(),
                                ));
                            }
                            Err(rejection) => {
                                tracing::info!(%op, %rejection, "operation rejected");
                                log(&event_tx, rejection.to_string());
                                let _ = event_tx.send(SessionEvent::OperationFinished {
                                    operation: op,
                                    outcome: OperationOutcome::Rejected(rejection),
                                });
                            }
                        }
                    }
                    Some(UiCommand::Cancel) => {
                        if let Some(ctx) = &run_ctx {
                            ctx.cancel.cancel();
                            log(&event_tx, format!("Cancelling {}…", ctx.operation));
                            cancel_deadline = Some(tokio::time::Instant::now() + Duration::from_secs(3));
                        } else {
                            log(&event_tx, "Nothing to cancel.");
                        }
                    }
                    Some(UiCommand::Quit) | None => {
                        // Quit waits for the current operation to wind down so its child is reaped.
                        quit_pending = true;
                        if let Some(ctx) = &run_ctx {
                            ctx.cancel.cancel();
                        } else {
                            break Ok(());
                        }
                    }
                }
            }
            // Do not take the JoinHandle before this branch wins; otherwise it can be dropped
            // if another select branch is chosen, and we'll never observe completion.
            maybe_done = async {
                if let Some(ctx) = &mut run_ctx {
                    if let Some(h) = ctx.handle.as_mut() {
                        return Some(h.await);
                    }
                }
                futures::future::pending().await
            } => {
                if let Some(join_res) = maybe_done {
                    let Some(ctx) = run_ctx.take() else { continue };
                    let op = ctx.operation;
                    let outcome = match join_res {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            let msg = format!("{op} task failed: {e}");
                            log(&event_tx, format!("EXCEPTION: {msg}"));
                            OperationOutcome::Process(ProcessResult::faulted(msg))
                        }
                    };

                    let had_batch = session.batch_completed();
                    let status = session.finish(op, &outcome);
                    tracing::info!(%op, %status, "operation finished");
                    if op == Operation::RunBatch && session.batch_completed() && !had_batch {
                        log(&event_tx, "✔ Batch complete; Export MIDI is now enabled.");
                    }
                    emit_state(&event_tx, &session, status);
                    let _ = event_tx.send(SessionEvent::OperationFinished { operation: op, outcome });

                    cancel_deadline = None;
                    if quit_pending {
                        break Ok(());
                    }
                }
            }
            // If cancel stalls, keep the user informed.
            _ = watchdog.tick() => {
                if let Some(deadline) = cancel_deadline {
                    if tokio::time::Instant::now() >= deadline && run_ctx.is_some() {
                        log(&event_tx, "Still cancelling…");
                        cancel_deadline = None;
                    }
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model::{PipelineParams, Stream};
    use crate::session::SessionState;
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    struct Harness {
        cmd_tx: UnboundedSender<UiCommand>,
        event_rx: UnboundedReceiver<SessionEvent>,
        handle: tokio::task::JoinHandle<Result<()>>,
    }

    fn spawn_controller() -> Harness {
        let cfg = SessionConfig {
            split_support: true,
            ..Default::default()
        };
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move { run_controller(&cfg, event_tx, cmd_rx).await });
        Harness {
            cmd_tx,
            event_rx,
            handle,
        }
    }

    fn fake_repo(script: &str) -> (tempfile::TempDir, PipelineParams) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pipeline.py"), script).unwrap();
        let params = PipelineParams {
            python: PathBuf::from("/bin/sh"),
            repo_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        (dir, params)
    }

    fn start(h: &Harness, operation: Operation, params: &PipelineParams) {
        h.cmd_tx
            .send(UiCommand::Start(OperationRequest {
                operation,
                params: params.clone(),
            }))
            .unwrap();
    }

    /// Collect events until `operation` reports its outcome.
    async fn until_finished(
        h: &mut Harness,
        operation: Operation,
    ) -> (Vec<SessionEvent>, OperationOutcome) {
        let mut seen = Vec::new();
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(10), h.event_rx.recv())
                .await
                .expect("controller went quiet")
                .expect("event channel closed");
            if let SessionEvent::OperationFinished {
                operation: op,
                outcome,
            } = &ev
            {
                if *op == operation {
                    let outcome = outcome.clone();
                    seen.push(ev);
                    return (seen, outcome);
                }
            }
            seen.push(ev);
        }
    }

    fn last_state(events: &[SessionEvent]) -> Option<(SessionState, bool, String)> {
        events.iter().rev().find_map(|ev| match ev {
            SessionEvent::StateChanged {
                state,
                batch_completed,
                status,
            } => Some((*state, *batch_completed, status.clone())),
            _ => None,
        })
    }

    fn log_texts(events: &[SessionEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|ev| match ev {
                SessionEvent::Log(e) if e.stream == Stream::Status => Some(e.text.clone()),
                _ => None,
            })
            .collect()
    }

    async fn quit(h: Harness) {
        h.cmd_tx.send(UiCommand::Quit).unwrap();
        h.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn export_before_batch_is_rejected_without_spawning() {
        let (dir, params) = fake_repo("touch spawned\n");
        let mut h = spawn_controller();
        start(&h, Operation::ExportMidi, &params);

        let (events, outcome) = until_finished(&mut h, Operation::ExportMidi).await;
        assert!(matches!(outcome, OperationOutcome::Rejected(_)));
        assert!(log_texts(&events)
            .iter()
            .any(|l| l.contains("Run Batch must be completed")));
        assert!(!dir.path().join("spawned").exists());
        assert!(!dir.path().join("out_midis").exists());
        quit(h).await;
    }

    #[tokio::test]
    async fn second_start_while_busy_is_rejected() {
        let (_dir, params) = fake_repo("sleep 1\n");
        let mut h = spawn_controller();
        start(&h, Operation::ReviewPending, &params);
        start(&h, Operation::RunBatch, &params);

        let (_, outcome) = until_finished(&mut h, Operation::RunBatch).await;
        assert!(matches!(
            outcome,
            OperationOutcome::Rejected(crate::session::Rejection::Busy { .. })
        ));
        let (events, outcome) = until_finished(&mut h, Operation::ReviewPending).await;
        assert_eq!(
            outcome,
            OperationOutcome::Process(ProcessResult::completed(Some(0)))
        );
        let (state, batch, _) = last_state(&events).unwrap();
        assert_eq!(state, SessionState::Idle);
        assert!(!batch);
        quit(h).await;
    }

    #[tokio::test]
    async fn invalid_interpreter_logs_path_and_stays_idle() {
        let (dir, mut params) = fake_repo("exit 0\n");
        params.python = dir.path().join("no-venv/bin/python");
        let mut h = spawn_controller();
        start(&h, Operation::RunBatch, &params);

        let (events, outcome) = until_finished(&mut h, Operation::RunBatch).await;
        assert!(matches!(outcome, OperationOutcome::PreconditionFailed(_)));
        assert!(log_texts(&events)
            .iter()
            .any(|l| l.contains("no-venv/bin/python")));
        let (state, batch, status) = last_state(&events).unwrap();
        assert_eq!(state, SessionState::Idle);
        assert!(!batch);
        assert_eq!(status, "Idle (error)");
        quit(h).await;
    }

    #[tokio::test]
    async fn failing_batch_still_unlocks_export() {
        let (dir, params) = fake_repo(
            "case \"$1\" in\n  run-batch) echo batch; exit 1 ;;\n  export-midi) touch exported ;;\nesac\n",
        );
        let mut h = spawn_controller();
        start(&h, Operation::RunBatch, &params);

        let (events, _) = until_finished(&mut h, Operation::RunBatch).await;
        let (state, batch, status) = last_state(&events).unwrap();
        assert_eq!(state, SessionState::Idle);
        assert!(batch);
        assert_eq!(status, "Finished: run-batch (exit 1)");
        assert!(log_texts(&events)
            .iter()
            .any(|l| l.contains("Export MIDI is now enabled")));

        start(&h, Operation::ExportMidi, &params);
        let (_, outcome) = until_finished(&mut h, Operation::ExportMidi).await;
        assert_eq!(
            outcome,
            OperationOutcome::Process(ProcessResult::completed(Some(0)))
        );
        assert!(dir.path().join("exported").exists());
        quit(h).await;
    }

    #[tokio::test]
    async fn cancel_returns_session_to_idle() {
        let (_dir, params) = fake_repo("exec sleep 30\n");
        let mut h = spawn_controller();
        start(&h, Operation::ReviewPending, &params);
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.cmd_tx.send(UiCommand::Cancel).unwrap();

        let (events, outcome) = until_finished(&mut h, Operation::ReviewPending).await;
        assert!(matches!(
            outcome,
            OperationOutcome::Process(ProcessResult {
                completion: crate::model::Completion::Cancelled,
                ..
            })
        ));
        let (state, _, status) = last_state(&events).unwrap();
        assert_eq!(state, SessionState::Idle);
        assert_eq!(status, "Idle (cancelled)");
        quit(h).await;
    }
}

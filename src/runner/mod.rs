mod args;
mod env;

pub use args::{relativize_to_root, ArgumentBuilder};

use crate::model::{
    Completion, LogEntry, ProcessInvocation, ProcessResult, SessionEvent, Stream,
};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Lines buffered between the stream readers and the forwarding loop.
const LINE_BUFFER: usize = 256;

/// Runs one external process at a time and streams its output as session events.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Launch `invocation`, forward its output, and report how it ended.
    ///
    /// The command line is logged before the launch and a summary line after it,
    /// whatever the outcome.
    pub async fn execute(
        &self,
        invocation: &ProcessInvocation,
        event_tx: &mpsc::UnboundedSender<SessionEvent>,
        cancel: &CancellationToken,
    ) -> ProcessResult {
        let mut invocation = invocation.clone();
        match env::venv_overlay(
            &invocation.program,
            std::env::var_os("PATH").as_deref(),
        ) {
            Ok(overlay) => invocation.env.extend(overlay),
            Err(e) => emit(
                event_tx,
                LogEntry::status(format!("[WARN] Failed to adjust PATH for venv: {e}")),
            ),
        }

        emit(
            event_tx,
            LogEntry::status(format!("> {}", invocation.command_line())),
        );
        let result = self.run(&invocation, event_tx, cancel).await;
        emit(event_tx, LogEntry::status(result.summary()));
        result
    }

    async fn run(
        &self,
        invocation: &ProcessInvocation,
        event_tx: &mpsc::UnboundedSender<SessionEvent>,
        cancel: &CancellationToken,
    ) -> ProcessResult {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .envs(invocation.env.clone())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Every early return drops the child; make sure it does not outlive us.
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::debug!(program = %invocation.program.display(), error = %e, "spawn failed");
                return ProcessResult::faulted(format!(
                    "failed to start {}: {e}",
                    invocation.program.display()
                ));
            }
        };
        tracing::debug!(pid = ?child.id(), "process started");

        let (line_tx, mut line_rx) = mpsc::channel::<LogEntry>(LINE_BUFFER);
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(pump_lines(out, Stream::Stdout, line_tx.clone())));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(pump_lines(err, Stream::Stderr, line_tx.clone())));
        }
        // Readers hold the only senders, so `recv` yields `None` once both streams close.
        drop(line_tx);

        let deadline = async {
            match self.timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => futures::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let mut streams_open = true;
        let mut exited = None;
        let mut stop: Option<Completion> = None;
        let mut kill_sent = false;

        let waited = loop {
            // A killed child can leave grandchildren holding the pipes, so a stop
            // request does not wait for the streams to close.
            if !streams_open || stop.is_some() {
                if let Some(w) = exited.take() {
                    break w;
                }
            }

            tokio::select! {
                entry = line_rx.recv(), if streams_open => match entry {
                    Some(entry) => emit(event_tx, entry),
                    None => streams_open = false,
                },
                status = child.wait(), if exited.is_none() => exited = Some(status),
                _ = cancel.cancelled(), if stop.is_none() && exited.is_none() => {
                    stop = Some(Completion::Cancelled);
                }
                _ = &mut deadline, if stop.is_none() && exited.is_none() => {
                    stop = Some(Completion::TimedOut(self.timeout.unwrap_or_default()));
                }
            }

            if stop.is_some() && !kill_sent {
                kill_sent = true;
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "failed to kill child process");
                }
            }
        };

        for reader in readers {
            reader.abort();
        }
        // Anything the readers queued before the abort still belongs in the log.
        while let Ok(entry) = line_rx.try_recv() {
            emit(event_tx, entry);
        }

        match (waited, stop) {
            (Ok(status), Some(completion)) => ProcessResult {
                exit_code: status.code(),
                completion,
            },
            (Ok(status), None) => ProcessResult::completed(status.code()),
            (Err(e), _) => ProcessResult::faulted(format!("failed waiting for process: {e}")),
        }
    }
}

fn emit(event_tx: &mpsc::UnboundedSender<SessionEvent>, entry: LogEntry) {
    let _ = event_tx.send(SessionEvent::Log(entry));
}

/// Drain one output stream line by line. Invalid UTF-8 is replaced, not fatal.
async fn pump_lines<R>(reader: R, stream: Stream, tx: mpsc::Sender<LogEntry>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
                if tx.send(LogEntry::new(stream, line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx
                    .send(LogEntry::status(format!("[WARN] {stream} read failed: {e}")))
                    .await;
                break;
            }
        }
    }
}

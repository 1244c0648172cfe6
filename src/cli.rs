use crate::model::{
    Completion, LogEntry, Operation, OperationOutcome, OperationRequest, PipelineParams,
    SessionConfig, SessionEvent, Stream, DEFAULT_EXPORT_FOLDER, DEFAULT_PIPELINE_SCRIPT,
    DEFAULT_RAW_FOLDER, DEFAULT_SPLIT_FOLDER, DEFAULT_SPLIT_SCRIPT,
};
use crate::orchestrator::{run_controller, UiCommand};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "midi-pipeline-shell",
    version,
    about = "Drive the audio-to-MIDI pipeline from a terminal UI or headless"
)]
pub struct Cli {
    /// Python interpreter that runs the pipeline [default: <repo-root>/.venv interpreter]
    #[arg(long, env = "MIDI_SHELL_PYTHON")]
    pub python: Option<PathBuf>,

    /// Root of the pipeline checkout; every process runs from here
    #[arg(long, env = "MIDI_SHELL_REPO_ROOT", default_value = ".")]
    pub repo_root: PathBuf,

    /// Folder with the raw .wav files, relative to the repo root or absolute
    #[arg(long, env = "MIDI_SHELL_RAW_FOLDER", default_value = DEFAULT_RAW_FOLDER)]
    pub raw_folder: String,

    /// Normalize the key of every song during run-batch
    #[arg(long)]
    pub normalize_key: bool,

    /// Destination of export-midi
    #[arg(long, env = "MIDI_SHELL_EXPORT_FOLDER", default_value = DEFAULT_EXPORT_FOLDER)]
    pub export_folder: String,

    /// Destination of per-track files produced by splitting
    #[arg(long, env = "MIDI_SHELL_SPLIT_FOLDER", default_value = DEFAULT_SPLIT_FOLDER)]
    pub split_folder: String,

    /// Split every exported MIDI into per-track files after export-midi
    #[arg(long)]
    pub split_tracks: bool,

    /// Use --split-support true or --split-support false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub split_support: bool,

    /// Pipeline entry script, relative to the repo root
    #[arg(long, default_value = DEFAULT_PIPELINE_SCRIPT)]
    pub pipeline_script: String,

    /// Track splitting script, relative to the repo root
    #[arg(long, default_value = DEFAULT_SPLIT_SCRIPT)]
    pub split_script: String,

    /// Only unlock export-midi after run-batch exits with code 0
    #[arg(long)]
    pub require_batch_success: bool,

    /// Treat run-batch as already done in this session (headless export-midi)
    #[arg(long)]
    pub assume_batch_completed: bool,

    /// Kill any single pipeline process that runs longer than this (e.g. 30m)
    #[arg(long)]
    pub timeout: Option<humantime::Duration>,

    /// Print log lines as text and exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Print log lines as JSON and exit (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Write diagnostic traces to this file (filter with RUST_LOG)
    #[arg(long)]
    pub trace_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Headless operations.
#[derive(Debug, Subcommand, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the full pipeline over every .wav in the raw folder
    RunBatch,
    /// Show songs waiting for review
    ReviewPending,
    /// Export MIDI files (and split them with --split-tracks)
    ExportMidi,
    /// Split the MIDI files already in the export folder
    SplitTracks,
    /// run-batch followed by export-midi
    All,
}

impl Command {
    fn operations(self) -> &'static [Operation] {
        match self {
            Command::RunBatch => &[Operation::RunBatch],
            Command::ReviewPending => &[Operation::ReviewPending],
            Command::ExportMidi => &[Operation::ExportMidi],
            Command::SplitTracks => &[Operation::SplitTracks],
            Command::All => &[Operation::RunBatch, Operation::ExportMidi],
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputFormat {
    Text,
    Json,
}

pub async fn run(args: Cli) -> Result<i32> {
    if args.text && args.json {
        bail!("--text and --json are mutually exclusive");
    }
    let headless = args.text || args.json || args.command.is_some();
    init_tracing(&args, headless)?;

    if !headless {
        #[cfg(feature = "tui")]
        {
            crate::tui::run(args).await?;
            return Ok(0);
        }
        #[cfg(not(feature = "tui"))]
        {
            bail!("built without TUI support; pass a subcommand such as run-batch");
        }
    }

    let Some(command) = args.command else {
        bail!("--text/--json need a subcommand, e.g. `--text run-batch`");
    };
    run_headless(args, command).await
}

fn init_tracing(args: &Cli, headless: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    if let Some(path) = args.trace_file.as_deref() {
        let file = std::fs::File::create(path)
            .with_context(|| format!("create trace file {}", path.display()))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    } else if headless {
        // The TUI owns the terminal; without a trace file it stays silent.
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

/// Interpreter inside the repository's `.venv`.
fn default_python(repo_root: &Path) -> PathBuf {
    let venv = repo_root.join(".venv");
    if cfg!(windows) {
        venv.join("Scripts").join("python.exe")
    } else {
        venv.join("bin").join("python")
    }
}

/// Build the request parameters from CLI arguments.
pub fn build_params(args: &Cli) -> Result<PipelineParams> {
    let repo_root = std::path::absolute(&args.repo_root)
        .with_context(|| format!("resolve repo root {}", args.repo_root.display()))?;
    let python = match args.python.as_deref() {
        Some(p) => std::path::absolute(p)
            .with_context(|| format!("resolve python path {}", p.display()))?,
        None => default_python(&repo_root),
    };
    Ok(PipelineParams {
        python,
        repo_root,
        pipeline_script: args.pipeline_script.clone(),
        split_script: args.split_script.clone(),
        raw_folder: args.raw_folder.clone(),
        normalize_key: args.normalize_key,
        export_folder: args.export_folder.clone(),
        split_folder: args.split_folder.clone(),
        split_tracks: args.split_tracks,
    })
}

/// Build a `SessionConfig` from CLI arguments.
pub fn build_session_config(args: &Cli) -> SessionConfig {
    SessionConfig {
        split_support: args.split_support,
        require_batch_success: args.require_batch_success,
        assume_batch_completed: args.assume_batch_completed,
        timeout: args.timeout.map(Duration::from),
    }
}

/// Run `command` without a UI, streaming the log to stdout/stderr.
/// Returns the process exit code the binary should finish with.
async fn run_headless(args: Cli, command: Command) -> Result<i32> {
    let cfg = build_session_config(&args);
    let require_success = cfg.require_batch_success;
    let params = build_params(&args)?;
    let format = if args.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let (out_tx, out_handle) = spawn_output_writer();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let controller = tokio::spawn(async move { run_controller(&cfg, event_tx, cmd_rx).await });

    // Ctrl-C cancels the running process instead of killing the shell outright.
    let interrupt_tx = cmd_tx.clone();
    let interrupt = tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if interrupt_tx.send(UiCommand::Cancel).is_err() {
                break;
            }
        }
    });

    let mut last = None;
    for &op in command.operations() {
        cmd_tx
            .send(UiCommand::Start(OperationRequest {
                operation: op,
                params: params.clone(),
            }))
            .context("controller stopped")?;

        let outcome = loop {
            match event_rx.recv().await {
                Some(SessionEvent::OperationFinished { operation, outcome }) if operation == op => {
                    break outcome
                }
                Some(ev) => write_event(&out_tx, format, ev)?,
                None => bail!("controller stopped before {op} finished"),
            }
        };
        let proceed = allows_next(&outcome, require_success);
        last = Some(outcome);
        if !proceed {
            break;
        }
    }

    interrupt.abort();
    let _ = cmd_tx.send(UiCommand::Quit);
    drop(cmd_tx);
    while let Some(ev) = event_rx.recv().await {
        write_event(&out_tx, format, ev)?;
    }
    controller
        .await
        .context("controller task failed")?
        .context("controller failed")?;

    drop(out_tx);
    let _ = out_handle.await;

    Ok(last.as_ref().map(exit_code).unwrap_or(0))
}

fn write_event(
    out_tx: &mpsc::UnboundedSender<OutputLine>,
    format: OutputFormat,
    ev: SessionEvent,
) -> Result<()> {
    let entry = match ev {
        SessionEvent::Log(entry) => entry,
        SessionEvent::StateChanged { status, .. } => LogEntry::status(format!("status: {status}")),
        SessionEvent::OperationFinished { .. } => return Ok(()),
    };
    let line = match format {
        OutputFormat::Json => OutputLine::Stdout(serde_json::to_string(&entry)?),
        OutputFormat::Text if entry.stream == Stream::Stdout => OutputLine::Stdout(entry.render()),
        OutputFormat::Text => OutputLine::Stderr(entry.render()),
    };
    let _ = out_tx.send(line);
    Ok(())
}

/// Whether a headless sequence should go on after `outcome`. With
/// `require_success` a non-zero exit stops it, matching the batch gate.
fn allows_next(outcome: &OperationOutcome, require_success: bool) -> bool {
    match outcome {
        OperationOutcome::Process(r) if require_success => r.is_success(),
        OperationOutcome::Process(r) => r.is_completed(),
        _ => false,
    }
}

fn exit_code(outcome: &OperationOutcome) -> i32 {
    match outcome {
        OperationOutcome::Process(r) => match (&r.completion, r.exit_code) {
            (Completion::Completed, Some(code)) => code,
            (Completion::Completed, None) => 1,
            (Completion::Cancelled, _) => 130,
            (Completion::TimedOut(_), _) => 124,
            (Completion::Faulted(_), _) => 1,
        },
        OperationOutcome::NoArtifacts(_) => 0,
        OperationOutcome::Rejected(_) | OperationOutcome::PreconditionFailed(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProcessResult;

    #[test]
    fn defaults_match_pipeline_layout() {
        let args = Cli::parse_from(["midi-pipeline-shell", "--repo-root", "/work/ai-midi"]);
        let params = build_params(&args).unwrap();
        assert_eq!(params.repo_root, PathBuf::from("/work/ai-midi"));
        if cfg!(unix) {
            assert_eq!(params.python, PathBuf::from("/work/ai-midi/.venv/bin/python"));
        }
        assert_eq!(params.raw_folder, "data/raw");
        assert_eq!(params.export_folder, "out_midis");
        assert_eq!(params.split_folder, "out_midis_split");
        assert!(!params.split_tracks);

        let cfg = build_session_config(&args);
        assert!(cfg.split_support);
        assert!(!cfg.require_batch_success);
        assert_eq!(cfg.timeout, None);
    }

    #[test]
    fn parses_headless_flags() {
        let args = Cli::parse_from([
            "midi-pipeline-shell",
            "--split-support",
            "false",
            "--timeout",
            "90s",
            "--json",
            "all",
        ]);
        assert!(!args.split_support);
        assert!(args.json);
        assert_eq!(args.command, Some(Command::All));
        assert_eq!(
            build_session_config(&args).timeout,
            Some(Duration::from_secs(90))
        );
        assert_eq!(
            Command::All.operations(),
            [Operation::RunBatch, Operation::ExportMidi]
        );
    }

    #[test]
    fn exit_codes_follow_outcomes() {
        let done = |code| OperationOutcome::Process(ProcessResult::completed(Some(code)));
        assert_eq!(exit_code(&done(0)), 0);
        assert_eq!(exit_code(&done(2)), 2);
        assert_eq!(
            exit_code(&OperationOutcome::PreconditionFailed("x".into())),
            1
        );
        assert_eq!(
            exit_code(&OperationOutcome::Process(ProcessResult {
                exit_code: None,
                completion: Completion::Cancelled,
            })),
            130
        );
        assert!(allows_next(&done(1), false));
        assert!(!allows_next(&done(1), true));
        assert!(allows_next(&done(0), true));
        assert!(!allows_next(
            &OperationOutcome::Process(ProcessResult::faulted("boom")),
            false
        ));
        assert!(!allows_next(
            &OperationOutcome::Process(ProcessResult::cancelled()),
            false
        ));
    }

    fn drain_lines(rx: &mut mpsc::UnboundedReceiver<OutputLine>) -> (Vec<String>, Vec<String>) {
        let (mut out, mut err) = (Vec::new(), Vec::new());
        while let Ok(line) = rx.try_recv() {
            match line {
                OutputLine::Stdout(l) => out.push(l),
                OutputLine::Stderr(l) => err.push(l),
            }
        }
        (out, err)
    }

    #[test]
    fn text_output_routes_by_stream() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = [
            SessionEvent::Log(LogEntry::new(Stream::Stdout, "song 1 done")),
            SessionEvent::Log(LogEntry::new(Stream::Stderr, "warning: clipped")),
            SessionEvent::Log(LogEntry::status("> python pipeline.py run-batch")),
            SessionEvent::StateChanged {
                state: crate::session::SessionState::Idle,
                batch_completed: true,
                status: "Finished: run-batch (exit 0)".into(),
            },
            SessionEvent::OperationFinished {
                operation: Operation::RunBatch,
                outcome: OperationOutcome::Process(ProcessResult::completed(Some(0))),
            },
        ];
        for ev in events {
            write_event(&tx, OutputFormat::Text, ev).unwrap();
        }

        let (out, err) = drain_lines(&mut rx);
        assert_eq!(out.len(), 1);
        assert!(out[0].ends_with("song 1 done"));
        assert_eq!(err.len(), 3);
        assert!(err[0].ends_with("[ERR] warning: clipped"));
        assert!(err[1].ends_with("> python pipeline.py run-batch"));
        assert!(err[2].ends_with("status: Finished: run-batch (exit 0)"));
    }

    #[test]
    fn json_output_is_one_entry_per_line_on_stdout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        write_event(
            &tx,
            OutputFormat::Json,
            SessionEvent::Log(LogEntry::new(Stream::Stderr, "oops")),
        )
        .unwrap();
        write_event(
            &tx,
            OutputFormat::Json,
            SessionEvent::StateChanged {
                state: crate::session::SessionState::Idle,
                batch_completed: false,
                status: "Idle (error)".into(),
            },
        )
        .unwrap();

        let (out, err) = drain_lines(&mut rx);
        assert!(err.is_empty());
        assert_eq!(out.len(), 2);

        let first: serde_json::Value = serde_json::from_str(&out[0]).unwrap();
        assert_eq!(first["stream"], "stderr");
        assert_eq!(first["text"], "oops");
        let ts = first["timestamp"].as_str().unwrap();
        time::OffsetDateTime::parse(ts, &time::format_description::well_known::Rfc3339)
            .unwrap();

        let second: LogEntry = serde_json::from_str(&out[1]).unwrap();
        assert_eq!(second.stream, Stream::Status);
        assert_eq!(second.text, "status: Idle (error)");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn all_stops_after_failed_batch_when_success_required() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("pipeline.py"),
            "echo \"$1\" >> calls.txt\nexit 1\n",
        )
        .unwrap();
        let args = Cli::parse_from([
            "midi-pipeline-shell",
            "--python",
            "/bin/sh",
            "--repo-root",
            dir.path().to_str().unwrap(),
            "--require-batch-success",
            "--json",
            "all",
        ]);

        let code = run_headless(args, Command::All).await.unwrap();

        assert_eq!(code, 1);
        let calls = std::fs::read_to_string(dir.path().join("calls.txt")).unwrap();
        assert_eq!(calls.lines().collect::<Vec<_>>(), ["run-batch"]);
    }
}

mod help;
mod state;

use crate::cli::{build_params, build_session_config, Cli};
use crate::model::{Operation, SessionEvent, Stream};
use crate::orchestrator::{self, UiCommand};
use crate::session::SessionState;
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Tabs},
    Terminal,
};
use state::{Field, UiState};
use std::sync::mpsc as std_mpsc;
use std::sync::OnceLock;
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

const SPINNER: [&str; 4] = ["|", "/", "-", "\\"];

/// Action keys and the operations they start, in display order.
const ACTIONS: [(char, Operation, &str); 4] = [
    ('b', Operation::RunBatch, "Run Batch"),
    ('v', Operation::ReviewPending, "Review Pending"),
    ('e', Operation::ExportMidi, "Export MIDI"),
    ('s', Operation::SplitTracks, "Split Tracks"),
];

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_session_config(&args);
    let params = build_params(&args)?;

    // Unbounded channels keep the process readers from ever waiting on the UI.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let mut state = UiState::new(params, &cfg);
    state.info = format!(
        "pipeline: {}  split: {}",
        args.pipeline_script, args.split_script
    );
    let ui_handle = std::thread::spawn(move || run_threaded(state, event_rx, cmd_tx));

    let res = orchestrator::run_controller(&cfg, event_tx, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(
    mut state: UiState,
    mut event_rx: UnboundedReceiver<SessionEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        while let Ok(ev) = event_rx.try_recv() {
            state.apply_event(ev);
        }

        if last_tick.elapsed() >= tick_rate {
            state.ticks = state.ticks.wrapping_add(1);
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                if state.editing.is_some() {
                    handle_edit_key(&mut state, k.code);
                    continue;
                }
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        // The controller cancels whatever is running before it exits.
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(());
                    }
                    (_, KeyCode::Tab) => state.tab = (state.tab + 1) % 2,
                    (_, KeyCode::Char('?')) => state.tab = 1,
                    (_, KeyCode::Char('x')) => {
                        let _ = cmd_tx.send(UiCommand::Cancel);
                    }
                    (_, KeyCode::Char('c')) => {
                        state.clear_log();
                        state.info = "Log cleared".into();
                    }
                    (_, KeyCode::Char('y')) if state.log.is_empty() => {
                        state.info = "Log is empty".into();
                    }
                    (_, KeyCode::Char('y')) => {
                        state.info = match copy_to_clipboard(&state.log.render()) {
                            Ok(()) => format!("Copied {} log line(s)", state.log.len()),
                            Err(e) => format!("Copy failed: {e:#}"),
                        };
                    }
                    (_, KeyCode::Up) | (_, KeyCode::Char('k')) => state.select_prev(),
                    (_, KeyCode::Down) | (_, KeyCode::Char('j')) => state.select_next(),
                    (_, KeyCode::Enter) | (_, KeyCode::Char(' ')) => state.begin_edit(),
                    (_, KeyCode::PageUp) => state.scroll_up(10),
                    (_, KeyCode::PageDown) => state.scroll_down(10),
                    (_, KeyCode::End) => state.log_scroll = 0,
                    (_, KeyCode::Char(ch)) => {
                        if let Some(&(_, op, _)) = ACTIONS.iter().find(|(key, ..)| *key == ch) {
                            // The controller rejects anything the gate forbids and
                            // logs why, so disabled actions still give feedback.
                            let _ = cmd_tx.send(UiCommand::Start(state.request(op)));
                        }
                    }
                    _ => {}
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn handle_edit_key(state: &mut UiState, code: KeyCode) {
    match code {
        KeyCode::Enter => state.commit_edit(),
        KeyCode::Esc => state.cancel_edit(),
        KeyCode::Backspace => {
            if let Some(buf) = state.editing.as_mut() {
                buf.pop();
            }
        }
        KeyCode::Char(ch) => {
            if let Some(buf) = state.editing.as_mut() {
                buf.push(ch);
            }
        }
        _ => {}
    }
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![Line::from("Dashboard"), Line::from("Help")])
        .select(state.tab)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("midi-pipeline-shell"),
        )
        .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        0 => draw_dashboard(chunks[1], f, state),
        _ => help::draw_help(chunks[1], f),
    }
}

fn draw_dashboard(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let settings_height = state.fields.len() as u16 + 2;
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(settings_height),
                Constraint::Length(3),
                Constraint::Min(3),
                Constraint::Length(3),
            ]
            .as_ref(),
        )
        .split(area);

    draw_settings(rows[0], f, state);
    draw_actions(rows[1], f, state);
    draw_log(rows[2], f, state);
    draw_status(rows[3], f, state);
}

fn draw_settings(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let lines: Vec<Line> = state
        .fields
        .iter()
        .enumerate()
        .map(|(i, &field)| {
            let selected = i == state.selected;
            let value = match (&state.editing, selected) {
                (Some(buf), true) => format!("{buf}_"),
                _ => state.field_value(field),
            };
            let label_style = if selected {
                Style::default()
                    .fg(Color::Yellow)
                    .add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(Color::Gray)
            };
            let value_style = if selected && state.editing.is_some() {
                Style::default().fg(Color::Cyan)
            } else if field.is_toggle() {
                Style::default().fg(Color::Green)
            } else {
                Style::default()
            };
            Line::from(vec![
                Span::styled(if selected { "> " } else { "  " }, label_style),
                Span::styled(format!("{:<14}", field.label()), label_style),
                Span::styled(value, value_style),
            ])
        })
        .collect();

    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Settings"));
    f.render_widget(p, area);
}

fn draw_actions(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let mut spans = Vec::new();
    for (key, op, label) in ACTIONS {
        if op == Operation::SplitTracks && !state.policy.split_support {
            continue;
        }
        let style = if state.permits(op) {
            Style::default().fg(Color::Magenta)
        } else {
            Style::default().fg(Color::DarkGray)
        };
        spans.push(Span::styled(format!("[{key}]"), style));
        spans.push(Span::styled(format!(" {label}   "), style));
    }
    let cancel_style = if state.session_state.is_busy() {
        Style::default().fg(Color::Red)
    } else {
        Style::default().fg(Color::DarkGray)
    };
    spans.push(Span::styled("[x] Cancel", cancel_style));

    let p = Paragraph::new(Line::from(spans))
        .block(Block::default().borders(Borders::ALL).title("Actions"));
    f.render_widget(p, area);
}

fn draw_log(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let visible = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = state
        .log
        .window(visible, state.log_scroll)
        .iter()
        .map(|entry| {
            let style = match entry.stream {
                Stream::Stdout => Style::default(),
                Stream::Stderr => Style::default().fg(Color::Red),
                Stream::Status => Style::default().fg(Color::Cyan),
            };
            Line::from(Span::styled(entry.render(), style))
        })
        .collect();

    let title = if state.log_scroll > 0 {
        format!("Log ({} lines, {} below)", state.log.len(), state.log_scroll)
    } else {
        format!("Log ({} lines)", state.log.len())
    };
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(p, area);
}

fn draw_status(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let (indicator, color) = match state.session_state {
        SessionState::Busy(_) => (SPINNER[state.ticks % SPINNER.len()], Color::Yellow),
        SessionState::Idle => ("●", Color::Green),
    };
    let batch = if state.batch_completed {
        Span::styled("batch done", Style::default().fg(Color::Green))
    } else {
        Span::styled("batch pending", Style::default().fg(Color::DarkGray))
    };
    let mut spans = vec![
        Span::styled(format!("{indicator} "), Style::default().fg(color)),
        Span::raw(state.status.clone()),
        Span::raw("  |  "),
        batch,
    ];
    if !state.info.is_empty() {
        spans.push(Span::raw("  |  "));
        spans.push(Span::styled(
            state.info.clone(),
            Style::default().fg(Color::Gray),
        ));
    }
    let p = Paragraph::new(Line::from(spans))
        .block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(p, area);
}

// Global clipboard manager channel - initialized once on first use
static CLIPBOARD_SENDER: OnceLock<std_mpsc::Sender<String>> = OnceLock::new();

/// Start the clipboard thread on first use. Each copy keeps its clipboard
/// instance alive for a while so clipboard managers on Linux can read it.
fn init_clipboard_manager() -> Result<&'static std_mpsc::Sender<String>> {
    CLIPBOARD_SENDER.get_or_init(|| {
        let (tx, rx) = std_mpsc::channel::<String>();

        std::thread::spawn(move || {
            use arboard::Clipboard;

            for text in rx {
                if let Ok(mut clipboard) = Clipboard::new() {
                    if clipboard.set_text(&text).is_ok() {
                        std::thread::sleep(Duration::from_secs(2));
                    }
                }
            }
        });

        tx
    });

    CLIPBOARD_SENDER
        .get()
        .ok_or_else(|| anyhow::anyhow!("Failed to initialize clipboard manager"))
}

/// Queue `text` for the clipboard without blocking the UI thread.
fn copy_to_clipboard(text: &str) -> Result<()> {
    let sender = init_clipboard_manager()?;
    sender
        .send(text.to_string())
        .map_err(|_| anyhow::anyhow!("Clipboard manager channel closed"))?;
    Ok(())
}

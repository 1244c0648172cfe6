use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

fn key_line(key: &'static str, pad: usize, what: &'static str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(key, Style::default().fg(Color::Magenta)),
        Span::raw(format!("{:pad$}{what}", "")),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let p = Paragraph::new(vec![
        Line::from("Keybinds:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("q", Style::default().fg(Color::Magenta)),
            Span::raw(" / "),
            Span::styled("Ctrl-C", Style::default().fg(Color::Magenta)),
            Span::raw("  Quit (cancels the running process)"),
        ]),
        key_line("b", 11, "Run Batch"),
        key_line("v", 11, "Review Pending"),
        key_line("e", 11, "Export MIDI (unlocked once Run Batch has finished)"),
        key_line("s", 11, "Split the MIDI files already exported"),
        key_line("x", 11, "Cancel the running process"),
        key_line("tab", 9, "Switch tabs"),
        key_line("?", 11, "Show this help"),
        Line::from(""),
        Line::from("Settings:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("↑/↓", Style::default().fg(Color::Magenta)),
            Span::raw(" or "),
            Span::styled("j/k", Style::default().fg(Color::Magenta)),
            Span::raw("  Select field"),
        ]),
        key_line("enter", 7, "Edit field / toggle checkbox (enter saves, esc discards)"),
        key_line("space", 7, "Toggle checkbox"),
        Line::from(""),
        Line::from("Log:"),
        key_line("PgUp/PgDn", 3, "Scroll"),
        key_line("End", 9, "Follow newest output"),
        key_line("c", 11, "Clear"),
        key_line("y", 11, "Copy to clipboard"),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}

use crate::model::LogEntry;

/// Append-only log buffer owned by a single consumer.
///
/// Producers never touch this directly; their entries arrive through the session
/// event channel and are appended here in arrival order.
#[derive(Debug, Default, Clone)]
pub struct LogSink {
    entries: Vec<LogEntry>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    /// User-requested reset.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Up to `count` entries ending `offset` entries before the newest one.
    pub fn window(&self, count: usize, offset: usize) -> &[LogEntry] {
        let end = self.entries.len().saturating_sub(offset);
        let start = end.saturating_sub(count);
        &self.entries[start..end]
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.render());
            out.push('\n');
        }
        out
    }
}

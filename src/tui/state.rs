use crate::log_sink::LogSink;
use crate::model::{Operation, OperationRequest, PipelineParams, SessionConfig, SessionEvent};
use crate::runner::relativize_to_root;
use crate::session::{self, GatePolicy, SessionState};
use std::path::PathBuf;

/// Editable settings shown on the dashboard, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Python,
    RepoRoot,
    RawFolder,
    NormalizeKey,
    ExportFolder,
    SplitTracks,
    SplitFolder,
}

impl Field {
    pub fn label(self) -> &'static str {
        match self {
            Field::Python => "Python",
            Field::RepoRoot => "Repo root",
            Field::RawFolder => "Raw folder",
            Field::NormalizeKey => "Normalize key",
            Field::ExportFolder => "Export folder",
            Field::SplitTracks => "Split tracks",
            Field::SplitFolder => "Split folder",
        }
    }

    pub fn is_toggle(self) -> bool {
        matches!(self, Field::NormalizeKey | Field::SplitTracks)
    }
}

pub struct UiState {
    pub tab: usize,
    pub params: PipelineParams,
    pub fields: Vec<Field>,
    pub selected: usize,
    /// Text being typed into the selected field, if editing.
    pub editing: Option<String>,
    pub log: LogSink,
    /// Entries hidden below the view; 0 follows the newest line.
    pub log_scroll: usize,
    pub status: String,
    pub session_state: SessionState,
    pub batch_completed: bool,
    pub policy: GatePolicy,
    pub info: String,
    pub ticks: usize,
}

impl UiState {
    pub fn new(params: PipelineParams, cfg: &SessionConfig) -> Self {
        let policy = GatePolicy::from(cfg);
        let mut fields = vec![
            Field::Python,
            Field::RepoRoot,
            Field::RawFolder,
            Field::NormalizeKey,
            Field::ExportFolder,
        ];
        if policy.split_support {
            fields.extend([Field::SplitTracks, Field::SplitFolder]);
        }
        Self {
            tab: 0,
            params,
            fields,
            selected: 0,
            editing: None,
            log: LogSink::new(),
            log_scroll: 0,
            status: "Idle".into(),
            session_state: SessionState::Idle,
            batch_completed: cfg.assume_batch_completed,
            policy,
            info: String::new(),
            ticks: 0,
        }
    }

    pub fn selected_field(&self) -> Field {
        self.fields
            .get(self.selected)
            .copied()
            .unwrap_or(Field::Python)
    }

    pub fn field_value(&self, field: Field) -> String {
        let on_off = |b: bool| if b { "[x]" } else { "[ ]" }.to_string();
        match field {
            Field::Python => self.params.python.display().to_string(),
            Field::RepoRoot => self.params.repo_root.display().to_string(),
            Field::RawFolder => self.params.raw_folder.clone(),
            Field::NormalizeKey => on_off(self.params.normalize_key),
            Field::ExportFolder => self.params.export_folder.clone(),
            Field::SplitTracks => on_off(self.params.split_tracks),
            Field::SplitFolder => self.params.split_folder.clone(),
        }
    }

    pub fn select_next(&mut self) {
        if self.editing.is_none() && self.selected + 1 < self.fields.len() {
            self.selected += 1;
        }
    }

    pub fn select_prev(&mut self) {
        if self.editing.is_none() {
            self.selected = self.selected.saturating_sub(1);
        }
    }

    /// Flip a toggle, or open the text editor on the selected field.
    pub fn begin_edit(&mut self) {
        let field = self.selected_field();
        match field {
            Field::NormalizeKey => self.params.normalize_key = !self.params.normalize_key,
            Field::SplitTracks => self.params.split_tracks = !self.params.split_tracks,
            _ => self.editing = Some(self.field_value(field)),
        }
    }

    pub fn cancel_edit(&mut self) {
        self.editing = None;
    }

    /// Store the edited text. Folders picked as absolute paths inside the repo
    /// are kept relative to it.
    pub fn commit_edit(&mut self) {
        let Some(text) = self.editing.take() else {
            return;
        };
        let text = text.trim().to_string();
        let root = self.params.repo_root.clone();
        match self.selected_field() {
            Field::Python => self.params.python = absolute(&text),
            Field::RepoRoot => self.params.repo_root = absolute(&text),
            Field::RawFolder => self.params.raw_folder = relativize_to_root(&root, &text),
            Field::ExportFolder => self.params.export_folder = relativize_to_root(&root, &text),
            Field::SplitFolder => self.params.split_folder = relativize_to_root(&root, &text),
            Field::NormalizeKey | Field::SplitTracks => {}
        }
    }

    /// Whether `op` would be accepted right now. Mirrors the controller's gate.
    pub fn permits(&self, op: Operation) -> bool {
        session::gate(self.session_state, self.batch_completed, self.policy, op).is_ok()
    }

    pub fn request(&self, operation: Operation) -> OperationRequest {
        OperationRequest {
            operation,
            params: self.params.clone(),
        }
    }

    pub fn apply_event(&mut self, ev: SessionEvent) {
        match ev {
            SessionEvent::Log(entry) => {
                self.log.append(entry);
                // Keep a scrolled-back view pinned to the same lines.
                if self.log_scroll > 0 {
                    self.log_scroll += 1;
                }
            }
            SessionEvent::StateChanged {
                state,
                batch_completed,
                status,
            } => {
                self.session_state = state;
                self.batch_completed = batch_completed;
                self.status = status;
            }
            SessionEvent::OperationFinished { .. } => {}
        }
    }

    pub fn scroll_up(&mut self, lines: usize) {
        self.log_scroll = (self.log_scroll + lines).min(self.log.len().saturating_sub(1));
    }

    pub fn scroll_down(&mut self, lines: usize) {
        self.log_scroll = self.log_scroll.saturating_sub(lines);
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
        self.log_scroll = 0;
    }
}

/// Same resolution the command line applies; an empty entry stays empty.
fn absolute(text: &str) -> PathBuf {
    std::path::absolute(text).unwrap_or_else(|_| PathBuf::from(text))
}

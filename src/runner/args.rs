//! Argument construction for pipeline invocations.
//!
//! Everything here is pure: no filesystem access, no environment lookups.

use crate::model::{
    Operation, PipelineParams, ProcessInvocation, DEFAULT_EXPORT_FOLDER, DEFAULT_RAW_FOLDER,
    DEFAULT_SPLIT_FOLDER,
};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub struct ArgumentBuilder<'a> {
    params: &'a PipelineParams,
}

impl<'a> ArgumentBuilder<'a> {
    pub fn new(params: &'a PipelineParams) -> Self {
        Self { params }
    }

    /// Invocation for a standalone operation. `SplitTracks` needs a concrete
    /// artifact and goes through [`ArgumentBuilder::split_tracks`] instead.
    pub fn for_operation(&self, op: Operation) -> Option<ProcessInvocation> {
        match op {
            Operation::RunBatch => Some(self.run_batch()),
            Operation::ReviewPending => Some(self.review_pending()),
            Operation::ExportMidi => Some(self.export_midi()),
            Operation::SplitTracks => None,
        }
    }

    pub fn run_batch(&self) -> ProcessInvocation {
        let raw = or_default(&self.params.raw_folder, DEFAULT_RAW_FOLDER);
        let pattern = Path::new(raw).join("*.wav");
        let mut args = self.script_args("run-batch");
        args.push(pattern.into_os_string());
        if self.params.normalize_key {
            args.push("--normalize-key".into());
        }
        self.invocation(args)
    }

    pub fn review_pending(&self) -> ProcessInvocation {
        self.invocation(self.script_args("review-pending"))
    }

    /// The `--out` argument stays as typed; the process runs from the repo root.
    pub fn export_midi(&self) -> ProcessInvocation {
        let mut args = self.script_args("export-midi");
        args.push("--out".into());
        args.push(self.export_folder().into());
        self.invocation(args)
    }

    pub fn split_tracks(&self, midi: &Path, out_dir: &Path) -> ProcessInvocation {
        let args = vec![
            OsString::from(&self.params.split_script),
            midi.as_os_str().to_owned(),
            "--out".into(),
            out_dir.as_os_str().to_owned(),
        ];
        self.invocation(args)
    }

    pub fn export_folder(&self) -> &str {
        or_default(&self.params.export_folder, DEFAULT_EXPORT_FOLDER)
    }

    pub fn split_folder(&self) -> &str {
        or_default(&self.params.split_folder, DEFAULT_SPLIT_FOLDER)
    }

    /// Absolute export directory used for creation and artifact scans.
    pub fn export_dir(&self) -> PathBuf {
        resolve_under_root(&self.params.repo_root, self.export_folder())
    }

    pub fn split_dir(&self) -> PathBuf {
        resolve_under_root(&self.params.repo_root, self.split_folder())
    }

    fn script_args(&self, subcommand: &str) -> Vec<OsString> {
        vec![
            OsString::from(&self.params.pipeline_script),
            OsString::from(subcommand),
        ]
    }

    fn invocation(&self, args: Vec<OsString>) -> ProcessInvocation {
        ProcessInvocation {
            program: self.params.python.clone(),
            args,
            working_dir: self.params.repo_root.clone(),
            env: Vec::new(),
        }
    }
}

fn or_default<'s>(value: &'s str, default: &'s str) -> &'s str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        default
    } else {
        trimmed
    }
}

/// Absolute folders are kept; relative ones are taken from the repo root.
pub fn resolve_under_root(root: &Path, folder: &str) -> PathBuf {
    let folder = Path::new(folder);
    if folder.is_absolute() {
        folder.to_path_buf()
    } else {
        root.join(folder)
    }
}

/// Store a picked folder relative to the repo root when it lives inside it.
pub fn relativize_to_root(root: &Path, picked: &str) -> String {
    let picked = picked.trim();
    if root.as_os_str().is_empty() {
        return picked.to_string();
    }
    match Path::new(picked).strip_prefix(root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_string_lossy().into_owned(),
        _ => picked.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> PipelineParams {
        PipelineParams {
            python: PathBuf::from("/venv/bin/python"),
            repo_root: PathBuf::from("/repo"),
            ..Default::default()
        }
    }

    fn args_of(inv: &ProcessInvocation) -> Vec<String> {
        inv.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn run_batch_globs_wav_files_under_raw_folder() {
        let p = params();
        let inv = ArgumentBuilder::new(&p).run_batch();
        assert_eq!(inv.program, PathBuf::from("/venv/bin/python"));
        assert_eq!(inv.working_dir, PathBuf::from("/repo"));
        assert_eq!(args_of(&inv), ["pipeline.py", "run-batch", "data/raw/*.wav"]);
    }

    #[test]
    fn run_batch_appends_normalize_flag() {
        let p = PipelineParams {
            normalize_key: true,
            raw_folder: "My Audio".into(),
            ..params()
        };
        let inv = ArgumentBuilder::new(&p).run_batch();
        assert_eq!(
            args_of(&inv),
            ["pipeline.py", "run-batch", "My Audio/*.wav", "--normalize-key"]
        );
        assert!(inv.command_line().contains("\"My Audio/*.wav\""));
    }

    #[test]
    fn blank_fields_fall_back_to_defaults() {
        let p = PipelineParams {
            raw_folder: "  ".into(),
            export_folder: String::new(),
            split_folder: String::new(),
            ..params()
        };
        let b = ArgumentBuilder::new(&p);
        assert_eq!(args_of(&b.run_batch())[2], "data/raw/*.wav");
        assert_eq!(
            args_of(&b.export_midi()),
            ["pipeline.py", "export-midi", "--out", "out_midis"]
        );
        assert_eq!(b.split_dir(), PathBuf::from("/repo/out_midis_split"));
    }

    #[test]
    fn review_pending_has_no_extra_arguments() {
        let p = params();
        let inv = ArgumentBuilder::new(&p).review_pending();
        assert_eq!(args_of(&inv), ["pipeline.py", "review-pending"]);
    }

    #[test]
    fn split_uses_secondary_script() {
        let p = params();
        let inv = ArgumentBuilder::new(&p).split_tracks(
            Path::new("/repo/out_midis/song one.mid"),
            Path::new("/repo/out_midis_split/song one"),
        );
        assert_eq!(
            args_of(&inv),
            [
                "utils/split_midi_tracks.py",
                "/repo/out_midis/song one.mid",
                "--out",
                "/repo/out_midis_split/song one"
            ]
        );
        assert!(ArgumentBuilder::new(&p)
            .for_operation(Operation::SplitTracks)
            .is_none());
    }

    #[test]
    fn export_dir_respects_absolute_paths() {
        let p = PipelineParams {
            export_folder: "/tmp/exports".into(),
            ..params()
        };
        assert_eq!(
            ArgumentBuilder::new(&p).export_dir(),
            PathBuf::from("/tmp/exports")
        );
    }

    #[test]
    fn relativize_strips_repo_root() {
        let root = Path::new("/repo");
        assert_eq!(relativize_to_root(root, "/repo/data/raw"), "data/raw");
        assert_eq!(relativize_to_root(root, "/elsewhere/raw"), "/elsewhere/raw");
        assert_eq!(relativize_to_root(root, "/repo"), "/repo");
        assert_eq!(relativize_to_root(Path::new(""), "x/y"), "x/y");
    }
}

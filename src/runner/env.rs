use std::env::{self, JoinPathsError};
use std::ffi::{OsStr, OsString};
use std::path::Path;

/// Environment overrides that make nested interpreter calls resolve to the same venv:
/// the interpreter's directory goes first on `PATH`, and `VIRTUAL_ENV` points at its parent.
///
/// Returns nothing when `program` has no directory component.
pub fn venv_overlay(
    program: &Path,
    inherited_path: Option<&OsStr>,
) -> Result<Vec<(OsString, OsString)>, JoinPathsError> {
    let Some(bin_dir) = program.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return Ok(Vec::new());
    };

    let path = match inherited_path.filter(|p| !p.is_empty()) {
        Some(existing) => env::join_paths(
            std::iter::once(bin_dir.to_path_buf()).chain(env::split_paths(existing)),
        )?,
        None => env::join_paths(std::iter::once(bin_dir))?,
    };

    let mut overlay = vec![(OsString::from("PATH"), path)];
    if let Some(venv_root) = bin_dir.parent().filter(|d| !d.as_os_str().is_empty()) {
        overlay.push((OsString::from("VIRTUAL_ENV"), venv_root.as_os_str().to_owned()));
    }
    Ok(overlay)
}

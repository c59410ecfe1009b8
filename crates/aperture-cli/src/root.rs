use std::path::{Path, PathBuf};

/// Resolve the workspace root.
///
/// `--root` / `APERTURE_ROOT` wins; otherwise walk upward from the current
/// directory looking for `.aperture/`, falling back to the current directory.
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_marked(&cwd).unwrap_or(cwd)
}

fn find_marked(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(aperture_core::paths::APERTURE_DIR).is_dir())
        .map(Path::to_path_buf)
}

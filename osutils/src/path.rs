use std::{
    fs,
    path::{Path, PathBuf},
};

/// Returns the directory containing `path`, or `.` when `path` has no
/// directory part.
pub fn parent_dir(path: impl AsRef<Path>) -> PathBuf {
    match path.as_ref().parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        None if path.as_ref().has_root() => PathBuf::from("/"),
        _ => PathBuf::from("."),
    }
}

/// Resolves `relative` against the directory of `path` without touching the
/// filesystem. No normalization happens, so `..` components are kept.
pub fn sibling_path(path: impl AsRef<Path>, relative: impl AsRef<Path>) -> PathBuf {
    parent_dir(path).join(relative)
}

/// Returns the directory part of `path` including its trailing slash, or an
/// empty string when there is none.
pub fn dir_prefix(path: &str) -> &str {
    match path.rfind('/') {
        Some(index) => &path[..=index],
        None => "",
    }
}

/// Checks whether `name`, looked up from `dir`, refers to the same file as
/// `target` once all symlinks are resolved. Paths that cannot be resolved
/// never match.
pub fn link_points_to(
    dir: impl AsRef<Path>,
    name: impl AsRef<Path>,
    target: impl AsRef<Path>,
) -> bool {
    match (
        fs::canonicalize(dir.as_ref().join(name)),
        fs::canonicalize(target),
    ) {
        (Ok(link), Ok(target)) => link == target,
        _ => false,
    }
}

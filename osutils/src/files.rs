use std::{
    fmt::{Display, Formatter},
    fs,
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use log::trace;
use sysdefs::storage::StorageType;

/// Classifies a local path as a directory, block device or plain file.
/// Paths that cannot be inspected are treated as files.
pub fn storage_type(path: impl AsRef<Path>) -> StorageType {
    match fs::metadata(path.as_ref()) {
        Ok(metadata) if metadata.is_dir() => StorageType::Dir,
        Ok(metadata) if metadata.file_type().is_block_device() => StorageType::Block,
        Ok(_) => StorageType::File,
        Err(e) => {
            trace!("Cannot stat '{}': {e}", path.as_ref().display());
            StorageType::File
        }
    }
}

/// Resolves every symlink and relative component of `path`.
pub fn canonical_path(path: impl AsRef<Path>) -> Result<PathBuf, Error> {
    fs::canonicalize(path.as_ref())
        .with_context(|| format!("Failed to resolve path '{}'", path.as_ref().display()))
}

/// User and group that images are accessed as. Unset ids mean the current
/// process credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Identity {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Identity {
    pub fn new(uid: Option<u32>, gid: Option<u32>) -> Self {
        Self { uid, gid }
    }

    pub fn is_unset(&self) -> bool {
        self.uid.is_none() && self.gid.is_none()
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let id = |id: Option<u32>| id.map_or_else(|| "-".to_string(), |id| id.to_string());
        write!(f, "{}:{}", id(self.uid), id(self.gid))
    }
}

/// Checks the read permission bits of `path` for `identity`. Only the
/// owner, group and other classes are considered, uid 0 reads everything.
pub fn readable_by(path: impl AsRef<Path>, identity: Identity) -> Result<bool, Error> {
    let metadata = fs::metadata(path.as_ref())
        .with_context(|| format!("Failed to stat '{}'", path.as_ref().display()))?;

    if identity.uid == Some(0) {
        return Ok(true);
    }

    let mask = if identity.uid == Some(metadata.uid()) {
        0o400
    } else if identity.gid == Some(metadata.gid()) {
        0o040
    } else {
        0o004
    };

    Ok(metadata.mode() & mask != 0)
}

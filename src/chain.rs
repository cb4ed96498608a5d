//! Construction of backing chains.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use log::{debug, trace};
use sysdefs::storage::{StorageFormat, StorageType};

use imgchain_api::{
    config::ChainConfig,
    constants::DEFAULT_MAX_CHAIN_DEPTH,
    error::{ChainError, ImgChainError, ReportError},
    source::Source,
};
use osutils::{
    files::{self, Identity},
    path,
};

use crate::{
    locator,
    probe::{self, HeaderProber, Prober},
};

/// Follows the backing stores recorded in image headers, starting at a root
/// image.
pub struct ChainBuilder {
    max_depth: usize,
    allow_probe: bool,
    identity: Identity,
    prober: Box<dyn Prober>,
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self::new(Box::new(HeaderProber))
    }
}

impl ChainBuilder {
    pub fn new(prober: Box<dyn Prober>) -> Self {
        Self {
            max_depth: DEFAULT_MAX_CHAIN_DEPTH,
            allow_probe: false,
            identity: Identity::default(),
            prober,
        }
    }

    pub fn from_config(config: &ChainConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            allow_probe: config.allow_probe,
            identity: Identity::new(config.uid, config.gid),
            prober: probe::from_config(config),
        }
    }

    /// Limits the number of backing images below the root.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Allows the format of images that do not record one to be detected.
    /// Otherwise such images are treated as raw.
    pub fn with_allow_probe(mut self, allow_probe: bool) -> Self {
        self.allow_probe = allow_probe;
        self
    }

    /// Probes images as `identity` instead of the current user.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// Builds the chain rooted at `root`. Either the whole chain is returned
    /// or an error, never a partial chain.
    pub fn build(
        &self,
        root: impl AsRef<Path>,
        format: StorageFormat,
    ) -> Result<Source, ImgChainError> {
        let root = root.as_ref();
        debug!(
            "Building backing chain of '{}' using the {} prober",
            root.display(),
            self.prober.name()
        );

        let kind = files::storage_type(root);
        let mut visited = HashSet::new();
        visited.insert(identity(root, &root.display().to_string())?);

        let mut current = Source::local(kind, root, self.settle_format(kind, format));
        let mut nodes = Vec::new();

        while let Some(backing) = self.inspect(&mut current)? {
            let next_id = current.id + 1;
            if next_id > self.max_depth {
                return Err(ImgChainError::new(ChainError::TooDeep {
                    path: root.to_path_buf(),
                    max_depth: self.max_depth,
                }));
            }

            let mut next = self.resolve(&current, &backing)?;
            next.id = next_id;

            if let Some(next_path) = next.path.as_deref().filter(|_| next.is_local()) {
                if !visited.insert(identity(next_path, &backing.locator)?) {
                    return Err(ImgChainError::new(ChainError::Loop {
                        path: next_path.to_path_buf(),
                    }));
                }
            }

            debug!(
                "Image {} '{}' backs image {}",
                next.id, backing.locator, current.id
            );
            current.backing_store_raw = Some(backing.locator);
            nodes.push(current);
            current = next;
        }

        while let Some(mut parent) = nodes.pop() {
            parent.backing_store = Some(Box::new(current));
            current = parent;
        }

        Ok(current)
    }

    /// Picks the format of an image that did not record one.
    fn settle_format(&self, kind: StorageType, format: StorageFormat) -> StorageFormat {
        match (kind, format) {
            (_, format) if !format.is_unknown() => format,
            (StorageType::Dir, _) => StorageFormat::Dir,
            _ if self.allow_probe => StorageFormat::Auto,
            _ => StorageFormat::Raw,
        }
    }

    /// Probes a local image, settles its format and returns its backing
    /// locator with the format recorded for it. Directories and remote
    /// sources end the chain.
    fn inspect(&self, node: &mut Source) -> Result<Option<Backing>, ImgChainError> {
        let path = match (node.kind, node.path.as_deref()) {
            (StorageType::File | StorageType::Block, Some(path)) => path,
            _ => return Ok(None),
        };

        let info = self
            .prober
            .probe(path, self.identity, node.format)
            .structured(ChainError::Unresolvable {
                locator: path.display().to_string(),
            })?;
        trace!("Probed '{}': {info:?}", path.display());

        if !info.format.is_unknown() {
            node.format = info.format;
        }
        Ok(info.backing.map(|locator| Backing {
            locator,
            format: info.backing_format,
        }))
    }

    /// Turns the backing locator recorded in `parent` into the next node.
    fn resolve(&self, parent: &Source, backing: &Backing) -> Result<Source, ImgChainError> {
        let locator = backing.locator.as_str();
        let mut next = if locator::is_relative_locator(locator) {
            let path = match parent.path() {
                Some(parent_path) => path::sibling_path(parent_path, locator),
                None => PathBuf::from(locator),
            };
            let mut next = Source::local(files::storage_type(&path), path, StorageFormat::None);
            next.rel_path = Some(locator.to_string());
            next
        } else {
            let mut next = locator::parse(locator).structured(ChainError::Unresolvable {
                locator: locator.to_string(),
            })?;
            if next.kind == StorageType::File {
                if let Some(kind) = next.path().map(|path| files::storage_type(path)) {
                    next.kind = kind;
                }
            }
            next
        };

        if !backing.format.is_unknown() {
            next.format = backing.format;
        }
        next.format = self.settle_format(next.kind, next.format);
        Ok(next)
    }
}

/// A backing store as recorded in its parent's header.
struct Backing {
    locator: String,
    format: StorageFormat,
}

/// Canonical path of a local image, used to detect loops.
fn identity(path: &Path, locator: &str) -> Result<PathBuf, ImgChainError> {
    files::canonical_path(path).structured(ChainError::Unresolvable {
        locator: locator.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        os::unix::fs::{symlink, MetadataExt, PermissionsExt},
    };

    use imgchain_api::error::ErrorKind;
    use osutils::testutils::image::{write_qcow2, write_qed};
    use sysdefs::storage::NetProtocol;

    use super::*;

    fn chain_error(error: ImgChainError) -> ChainError {
        match error.kind() {
            ErrorKind::Chain(e) => e.clone(),
            other => panic!("unexpected error kind: {other:?}"),
        }
    }

    #[test]
    fn test_raw_root() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("raw");
        fs::write(&image, b"not an image header").unwrap();

        let chain = ChainBuilder::default()
            .build(&image, StorageFormat::Auto)
            .unwrap();
        assert_eq!(chain.id, 0);
        assert_eq!(chain.kind, StorageType::File);
        assert_eq!(chain.format, StorageFormat::Raw);
        assert_eq!(chain.path(), Some(image.as_path()));
        assert_eq!(chain.backing_store_raw, None);
        assert!(!chain.has_backing());

        let chain = ChainBuilder::default()
            .with_allow_probe(true)
            .build(&image, StorageFormat::None)
            .unwrap();
        assert_eq!(chain.format, StorageFormat::Raw);
    }

    #[test]
    fn test_qcow2_relative_backing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("base.raw"), b"").unwrap();
        let top = dir.path().join("top.qcow2");
        write_qcow2(&top, Some("base.raw"), Some(StorageFormat::Raw)).unwrap();

        let chain = ChainBuilder::default()
            .build(&top, StorageFormat::Qcow2)
            .unwrap();
        assert_eq!(chain.format, StorageFormat::Qcow2);
        assert_eq!(chain.backing_store_raw.as_deref(), Some("base.raw"));
        assert_eq!(chain.rel_path, None);

        let base = chain.backing().unwrap();
        assert_eq!(base.id, 1);
        assert_eq!(base.path(), Some(dir.path().join("base.raw").as_path()));
        assert_eq!(base.rel_path.as_deref(), Some("base.raw"));
        assert_eq!(base.format, StorageFormat::Raw);
        assert_eq!(base.backing_store_raw, None);
        assert!(!base.has_backing());
    }

    #[test]
    fn test_absolute_backing_format_probe() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.qcow2");
        write_qcow2(&base, None, None).unwrap();
        let top = dir.path().join("top.qcow2");
        let base_locator = base.display().to_string();
        write_qcow2(&top, Some(&base_locator), None).unwrap();

        // Without probing the unrecorded format is taken as raw
        let chain = ChainBuilder::default()
            .build(&top, StorageFormat::Qcow2)
            .unwrap();
        let backing = chain.backing().unwrap();
        assert_eq!(backing.format, StorageFormat::Raw);
        assert_eq!(backing.rel_path, None);
        assert_eq!(backing.path(), Some(base.as_path()));

        let chain = ChainBuilder::default()
            .with_allow_probe(true)
            .build(&top, StorageFormat::Auto)
            .unwrap();
        assert_eq!(chain.format, StorageFormat::Qcow2);
        assert_eq!(chain.backing().unwrap().format, StorageFormat::Qcow2);
        assert_eq!(
            chain.chain_iter().map(|node| node.id).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[test]
    fn test_wrapped_chain() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("raw"), b"").unwrap();
        write_qcow2(dir.path().join("qcow2"), Some("raw"), Some(StorageFormat::Raw)).unwrap();
        let wrap = dir.path().join("wrap");
        write_qcow2(&wrap, Some("qcow2"), Some(StorageFormat::Qcow2)).unwrap();

        let chain = ChainBuilder::default()
            .build(&wrap, StorageFormat::Qcow2)
            .unwrap();
        let nodes = chain.chain_iter().collect::<Vec<_>>();
        assert_eq!(nodes.len(), 3);
        assert_eq!(
            nodes.iter().map(|node| node.format).collect::<Vec<_>>(),
            vec![StorageFormat::Qcow2, StorageFormat::Qcow2, StorageFormat::Raw]
        );
        assert_eq!(
            nodes
                .iter()
                .map(|node| node.rel_path.as_deref())
                .collect::<Vec<_>>(),
            vec![None, Some("qcow2"), Some("raw")]
        );
        assert_eq!(
            nodes
                .iter()
                .map(|node| node.backing_store_raw.as_deref())
                .collect::<Vec<_>>(),
            vec![Some("qcow2"), Some("raw"), None]
        );
    }

    #[test]
    fn test_qed_backing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("base"), b"").unwrap();
        let top = dir.path().join("top.qed");
        write_qed(&top, Some("base"), true).unwrap();

        let chain = ChainBuilder::default()
            .with_allow_probe(true)
            .build(&top, StorageFormat::Auto)
            .unwrap();
        assert_eq!(chain.format, StorageFormat::Qed);
        assert_eq!(chain.backing().unwrap().format, StorageFormat::Raw);
    }

    #[test]
    fn test_empty_backing_name() {
        let dir = tempfile::tempdir().unwrap();
        let top = dir.path().join("top.qcow2");
        write_qcow2(&top, Some(""), None).unwrap();
        let qed = dir.path().join("top.qed");
        write_qed(&qed, Some(""), false).unwrap();

        let chain = ChainBuilder::default()
            .build(&top, StorageFormat::Qcow2)
            .unwrap();
        assert_eq!(chain.format, StorageFormat::Qcow2);
        assert_eq!(chain.backing_store_raw, None);
        assert!(!chain.has_backing());

        let chain = ChainBuilder::default()
            .with_allow_probe(true)
            .build(&qed, StorageFormat::Auto)
            .unwrap();
        assert_eq!(chain.format, StorageFormat::Qed);
        assert!(!chain.has_backing());
    }

    #[test]
    fn test_directory_backing() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("dir")).unwrap();
        let top = dir.path().join("top.qcow2");
        write_qcow2(&top, Some("dir"), None).unwrap();

        let chain = ChainBuilder::default()
            .with_allow_probe(true)
            .build(&top, StorageFormat::Qcow2)
            .unwrap();
        let backing = chain.backing().unwrap();
        assert_eq!(backing.kind, StorageType::Dir);
        assert_eq!(backing.format, StorageFormat::Dir);
        assert!(!backing.has_backing());

        let fat = format!("fat:{}", dir.path().join("dir").display());
        write_qcow2(&top, Some(&fat), None).unwrap();
        let chain = ChainBuilder::default()
            .build(&top, StorageFormat::Qcow2)
            .unwrap();
        let backing = chain.backing().unwrap();
        assert_eq!(backing.kind, StorageType::Dir);
        assert_eq!(backing.format, StorageFormat::Fat);
        assert_eq!(backing.rel_path, None);

        let chain = ChainBuilder::default()
            .build(dir.path().join("dir"), StorageFormat::Auto)
            .unwrap();
        assert_eq!(chain.kind, StorageType::Dir);
        assert_eq!(chain.format, StorageFormat::Dir);
    }

    #[test]
    fn test_relative_backing_through_symlink() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("base"), b"").unwrap();
        write_qcow2(dir.path().join("top"), Some("../base"), Some(StorageFormat::Raw)).unwrap();
        let link = dir.path().join("sub").join("link");
        symlink("../top", &link).unwrap();

        let chain = ChainBuilder::default()
            .build(&link, StorageFormat::Qcow2)
            .unwrap();
        assert_eq!(chain.path(), Some(link.as_path()));

        // Resolved against the directory of the link, not of its target
        let base = chain.backing().unwrap();
        assert_eq!(
            base.path(),
            Some(dir.path().join("sub").join("../base").as_path())
        );
        assert_eq!(base.rel_path.as_deref(), Some("../base"));
    }

    #[test]
    fn test_network_backing() {
        let dir = tempfile::tempdir().unwrap();
        let top = dir.path().join("top.qcow2");
        write_qcow2(&top, Some("nbd:example.org:6000:exportname=disk"), None).unwrap();

        let chain = ChainBuilder::default()
            .build(&top, StorageFormat::Qcow2)
            .unwrap();
        let backing = chain.backing().unwrap();
        assert_eq!(backing.kind, StorageType::Network);
        assert_eq!(backing.protocol, NetProtocol::Nbd);
        assert_eq!(backing.name.as_deref(), Some("disk"));
        assert_eq!(backing.rel_path, None);
        assert_eq!(backing.id, 1);
        assert!(!backing.has_backing());
    }

    #[test]
    fn test_loops() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("self");
        write_qcow2(&image, Some("self"), Some(StorageFormat::Qcow2)).unwrap();
        assert!(matches!(
            chain_error(
                ChainBuilder::default()
                    .build(&image, StorageFormat::Qcow2)
                    .unwrap_err()
            ),
            ChainError::Loop { .. }
        ));

        // Same loop spelled with an absolute path through a symlink
        symlink("self", dir.path().join("alias")).unwrap();
        let alias = dir.path().join("alias").display().to_string();
        write_qcow2(&image, Some(&alias), Some(StorageFormat::Qcow2)).unwrap();
        assert!(matches!(
            chain_error(
                ChainBuilder::default()
                    .build(&image, StorageFormat::Qcow2)
                    .unwrap_err()
            ),
            ChainError::Loop { .. }
        ));

        let first = dir.path().join("first");
        write_qcow2(&first, Some("second"), Some(StorageFormat::Qcow2)).unwrap();
        write_qcow2(dir.path().join("second"), Some("first"), Some(StorageFormat::Qcow2))
            .unwrap();
        assert_eq!(
            chain_error(
                ChainBuilder::default()
                    .build(&first, StorageFormat::Qcow2)
                    .unwrap_err()
            ),
            ChainError::Loop {
                path: dir.path().join("first")
            }
        );
    }

    #[test]
    fn test_unresolvable() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            chain_error(
                ChainBuilder::default()
                    .build(dir.path().join("missing"), StorageFormat::Raw)
                    .unwrap_err()
            ),
            ChainError::Unresolvable {
                locator: dir.path().join("missing").display().to_string()
            }
        );

        let top = dir.path().join("top");
        write_qcow2(&top, Some("missing"), None).unwrap();
        assert_eq!(
            chain_error(
                ChainBuilder::default()
                    .build(&top, StorageFormat::Qcow2)
                    .unwrap_err()
            ),
            ChainError::Unresolvable {
                locator: "missing".into()
            }
        );

        write_qcow2(&top, Some("json:{}"), None).unwrap();
        assert_eq!(
            chain_error(
                ChainBuilder::default()
                    .build(&top, StorageFormat::Qcow2)
                    .unwrap_err()
            ),
            ChainError::Unresolvable {
                locator: "json:{}".into()
            }
        );

        // A raw image handed in as qcow2 cannot be inspected
        fs::write(dir.path().join("raw"), b"").unwrap();
        assert!(matches!(
            chain_error(
                ChainBuilder::default()
                    .build(dir.path().join("raw"), StorageFormat::Qcow2)
                    .unwrap_err()
            ),
            ChainError::Unresolvable { .. }
        ));
    }

    #[test]
    fn test_max_depth() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("3"), b"").unwrap();
        for (image, backing, format) in [
            ("0", "1", StorageFormat::Qcow2),
            ("1", "2", StorageFormat::Qcow2),
            ("2", "3", StorageFormat::Raw),
        ] {
            write_qcow2(dir.path().join(image), Some(backing), Some(format)).unwrap();
        }
        let root = dir.path().join("0");

        assert_eq!(
            chain_error(
                ChainBuilder::default()
                    .with_max_depth(2)
                    .build(&root, StorageFormat::Qcow2)
                    .unwrap_err()
            ),
            ChainError::TooDeep {
                path: root.clone(),
                max_depth: 2
            }
        );

        let chain = ChainBuilder::default()
            .with_max_depth(3)
            .build(&root, StorageFormat::Qcow2)
            .unwrap();
        assert_eq!(
            chain.chain_iter().map(|node| node.id).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(chain.base().format, StorageFormat::Raw);
    }

    #[test]
    fn test_from_config() {
        let config = ChainConfig {
            max_depth: 1,
            allow_probe: true,
            uid: Some(107),
            gid: Some(36),
            ..Default::default()
        };
        let builder = ChainBuilder::from_config(&config);
        assert_eq!(builder.max_depth, 1);
        assert!(builder.allow_probe);
        assert_eq!(builder.identity, Identity::new(Some(107), Some(36)));
        assert_eq!(builder.prober.name(), "header");
    }

    #[test]
    fn test_access_identity() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("base"), b"").unwrap();
        let top = dir.path().join("top");
        write_qcow2(&top, Some("base"), Some(StorageFormat::Raw)).unwrap();
        fs::set_permissions(&top, fs::Permissions::from_mode(0o600)).unwrap();
        let owner = fs::metadata(&top).unwrap().uid();

        let chain = ChainBuilder::default()
            .with_identity(Identity::new(Some(owner), None))
            .build(&top, StorageFormat::Qcow2)
            .unwrap();
        assert!(chain.has_backing());

        let stranger = owner.wrapping_add(1).max(1);
        assert_eq!(
            chain_error(
                ChainBuilder::default()
                    .with_identity(Identity::new(Some(stranger), None))
                    .build(&top, StorageFormat::Qcow2)
                    .unwrap_err()
            ),
            ChainError::Unresolvable {
                locator: top.display().to_string()
            }
        );
    }
}

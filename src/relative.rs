//! Composition of relative backing locators between images of a chain.

use std::ptr;

use log::debug;

use imgchain_api::{
    error::{ImgChainError, RelativePathError},
    source::Source,
};
use osutils::path;

/// Composes the locator that reaches `base` from the image that records
/// `top` as its backing store, using the relative locators of every image
/// from `top` down to `base`.
///
/// Returns `Ok(None)` when one of those images was reached through an
/// absolute or non-path locator. The composition is purely textual, so
/// `..` components pile up instead of being folded.
pub fn relative_path(top: &Source, base: &Source) -> Result<Option<String>, ImgChainError> {
    let mut composed = String::new();

    for node in top.chain_iter() {
        let Some(rel_path) = node.rel_path.as_deref() else {
            debug!("Image {} has no relative backing locator", node.id);
            return Ok(None);
        };

        composed = format!("{}{rel_path}", path::dir_prefix(&composed));

        if ptr::eq(node, base) {
            return Ok(Some(composed));
        }
    }

    Err(ImgChainError::new(RelativePathError::NotInChain))
}

#[cfg(test)]
mod tests {
    use imgchain_api::error::ErrorKind;
    use sysdefs::storage::{StorageFormat, StorageType};

    use super::*;

    /// Builds a chain from `(path, relative locator)` pairs.
    fn chain_of(nodes: &[(&str, Option<&str>)]) -> Source {
        let mut nodes = nodes
            .iter()
            .enumerate()
            .map(|(id, (path, rel_path))| Source {
                id,
                rel_path: rel_path.map(str::to_string),
                ..Source::local(StorageType::File, *path, StorageFormat::Qcow2)
            })
            .collect::<Vec<_>>();

        let mut chain = nodes.pop().unwrap();
        while let Some(mut parent) = nodes.pop() {
            parent.backing_store = Some(Box::new(chain));
            chain = parent;
        }
        chain
    }

    fn fixture() -> Source {
        chain_of(&[
            // Plain relative chain
            ("/path/to/some/img", None),
            ("/path/to/some/asdf", Some("asdf")),
            ("/path/to/some/test", Some("test")),
            ("/path/to/some/blah", Some("blah")),
            // Every volume in its own directory level
            ("/path/to/volume/image1", None),
            ("/path/to/volume/image2", Some("../volume/image2")),
            ("/path/to/volume/image3", Some("../volume/image3")),
            ("/path/to/volume/image4", Some("../volume/image4")),
            // Wandering between directories
            ("/crazy/base/image", None),
            (
                "/crazy/base/directory/stuff/volumes/garbage/image2",
                Some("directory/stuff/volumes/garbage/image2"),
            ),
            ("/crazy/base/directory/image3", Some("../../../image3")),
            ("/crazy/base/blah/image4", Some("../blah/image4")),
        ])
    }

    #[test]
    fn test_relative_path() {
        let chain = fixture();
        let nodes = chain.chain_iter().collect::<Vec<_>>();
        let relative = |top: usize, base: usize| relative_path(nodes[top], nodes[base]).unwrap();

        // An absolute hop on the way
        assert_eq!(relative(0, 1), None);
        assert_eq!(relative(0, 2), None);
        assert_eq!(relative(0, 3), None);
        assert_eq!(relative(1, 5), None);

        // Base above top, the walk ends at an absolute hop
        assert_eq!(relative(2, 1), None);

        assert_eq!(relative(1, 1).as_deref(), Some("asdf"));
        assert_eq!(relative(1, 2).as_deref(), Some("test"));
        assert_eq!(relative(1, 3).as_deref(), Some("blah"));
        assert_eq!(relative(2, 2).as_deref(), Some("test"));
        assert_eq!(relative(2, 3).as_deref(), Some("blah"));
        assert_eq!(relative(3, 3).as_deref(), Some("blah"));

        assert_eq!(relative(5, 5).as_deref(), Some("../volume/image2"));
        assert_eq!(
            relative(5, 6).as_deref(),
            Some("../volume/../volume/image3")
        );
        assert_eq!(
            relative(5, 7).as_deref(),
            Some("../volume/../volume/../volume/image4")
        );
        assert_eq!(relative(6, 6).as_deref(), Some("../volume/image3"));
        assert_eq!(
            relative(6, 7).as_deref(),
            Some("../volume/../volume/image4")
        );
        assert_eq!(relative(7, 7).as_deref(), Some("../volume/image4"));

        assert_eq!(
            relative(9, 9).as_deref(),
            Some("directory/stuff/volumes/garbage/image2")
        );
        assert_eq!(
            relative(9, 10).as_deref(),
            Some("directory/stuff/volumes/garbage/../../../image3")
        );
        assert_eq!(
            relative(9, 11).as_deref(),
            Some("directory/stuff/volumes/garbage/../../../../blah/image4")
        );
        assert_eq!(relative(10, 10).as_deref(), Some("../../../image3"));
        assert_eq!(
            relative(10, 11).as_deref(),
            Some("../../../../blah/image4")
        );
        assert_eq!(relative(11, 11).as_deref(), Some("../blah/image4"));
    }

    #[test]
    fn test_not_in_chain() {
        let chain = chain_of(&[("/a/top", Some("top")), ("/a/base", Some("base"))]);
        let other = chain_of(&[("/a/base", Some("base"))]);

        let base = chain.backing().unwrap();
        assert_eq!(
            relative_path(&chain, base).unwrap().as_deref(),
            Some("base")
        );

        // Equal contents do not make a node part of the chain
        let error = relative_path(&chain, &other).unwrap_err();
        assert_eq!(
            error.kind(),
            &ErrorKind::RelativePath(RelativePathError::NotInChain)
        );
    }

    #[test]
    fn test_composition() {
        let chain = fixture();
        let nodes = chain.chain_iter().collect::<Vec<_>>();
        let relative = |top: usize, base: usize| {
            relative_path(nodes[top], nodes[base])
                .unwrap()
                .unwrap()
        };

        // Relative segments of the fixture, each three hops long
        for (first, last) in [(1, 3), (5, 7), (9, 11)] {
            for top in first..=last {
                for mid in top..last {
                    for base in mid + 1..=last {
                        assert_eq!(
                            relative(top, base),
                            format!(
                                "{}{}",
                                path::dir_prefix(&relative(top, mid)),
                                relative(mid + 1, base)
                            ),
                            "{top} -> {mid} -> {base}"
                        );
                    }
                }
            }
        }
    }
}

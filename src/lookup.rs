//! Searching a backing chain for an image given by name or index.

use std::ptr;

use log::trace;

use imgchain_api::source::Source;
use osutils::path;

use crate::locator;

/// How a lookup selects its match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selector<'a> {
    /// The last image of the chain.
    Base,

    /// The image at this position, from `TARGET[INDEX]`.
    Index(usize),

    /// The image recorded, stored or resolving under this name.
    Name(&'a str),
}

/// Splits `TARGET[INDEX]`. Only a positive decimal index closed by a single
/// `]` counts.
fn parse_index(name: &str) -> Option<(&str, usize)> {
    let (target, rest) = name.split_once('[')?;
    let index = rest.strip_suffix(']')?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    match index.parse() {
        Ok(0) | Err(_) => None,
        Ok(index) => Some((target, index)),
    }
}

/// Picks the selector for `name`. `None` means the name addresses another
/// disk target, which never matches.
fn selector<'a>(name: Option<&'a str>, target: Option<&str>) -> Option<Selector<'a>> {
    let Some(name) = name else {
        return Some(Selector::Base);
    };

    match (target, parse_index(name)) {
        (Some(target), Some((requested, index))) if requested == target => {
            Some(Selector::Index(index))
        }
        (Some(target), Some((requested, _))) => {
            trace!("Requested target '{requested}' does not match target '{target}'");
            None
        }
        _ => Some(Selector::Name(name)),
    }
}

fn name_matches(name: &str, node: &Source, parent: Option<&Source>) -> bool {
    if node.rel_path.as_deref() == Some(name)
        || node.path().is_some_and(|path| path.as_os_str() == name)
    {
        return true;
    }

    if !node.is_local() {
        return node.name.as_deref() == Some(name);
    }

    if !locator::is_file_locator(name) {
        return false;
    }

    let Some(node_path) = node.path() else {
        return false;
    };

    let dir = match parent {
        Some(parent) if parent.is_local() => parent.path().map(path::parent_dir),
        _ => None,
    }
    .unwrap_or_else(|| ".".into());

    path::link_points_to(dir, name, node_path)
}

/// Looks up an image of `chain`.
///
/// The scan starts after `from`, which must be a node of `chain`, or at the
/// root when `from` is `None`. `name` is matched against the relative
/// locator, the path or the resolved file of each image. `TARGET[INDEX]`
/// selects the image with that id when TARGET equals `target`. Without a
/// name the base image of the chain is selected.
///
/// Returns the match and its parent within the chain. Finding nothing is not
/// an error.
pub fn lookup<'a>(
    chain: &'a Source,
    from: Option<&Source>,
    name: Option<&str>,
    target: Option<&str>,
) -> Option<(&'a Source, Option<&'a Source>)> {
    let selector = selector(name, target)?;

    let (mut node, mut parent) = match from {
        Some(from) => {
            let from = chain.chain_iter().find(|node| ptr::eq(*node, from))?;
            (from.backing(), Some(from))
        }
        None => (Some(chain), None),
    };

    while let Some(current) = node {
        let found = match selector {
            Selector::Base => !current.has_backing(),
            Selector::Index(index) => current.id == index,
            Selector::Name(name) => name_matches(name, current, parent),
        };

        if found {
            return Some((current, parent));
        }

        parent = Some(current);
        node = current.backing();
    }

    None
}

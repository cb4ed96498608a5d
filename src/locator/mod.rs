//! Parsing of backing store locators.
//!
//! A locator is the string an image records to name its backing image. It
//! can be a plain path, a `fat:` directory wrapper, a URI, one of the legacy
//! colon separated network syntaxes or a `json:` block graph.

use log::debug;
use sysdefs::storage::{NetProtocol, StorageFormat, StorageType};

use imgchain_api::{
    constants::{FAT_LOCATOR_PREFIX, JSON_LOCATOR_PREFIX},
    error::ParseError,
    source::Source,
};

mod colon;
mod drivers;
mod json;
mod uri;

pub use json::normalize;

/// Returns whether `locator` names a filesystem path rather than a protocol.
pub fn is_file_locator(locator: &str) -> bool {
    let Some(colon) = locator.find(':') else {
        return true;
    };

    if locator.find('/').is_some_and(|slash| slash < colon) {
        return true;
    }

    // Drive letter prefix, e.g. `c:image.qcow2`
    colon == 1 && locator.as_bytes()[0].is_ascii_alphabetic()
}

/// Returns whether `locator` is a filesystem path relative to the image that
/// recorded it.
pub fn is_relative_locator(locator: &str) -> bool {
    !locator.starts_with('/') && is_file_locator(locator)
}

/// Parses a backing locator into a source description. Nothing of a
/// partially parsed locator is returned on failure.
pub fn parse(locator: &str) -> Result<Source, ParseError> {
    debug!("Parsing backing locator '{locator}'");

    if is_file_locator(locator) {
        return Ok(Source::local(StorageType::File, locator, StorageFormat::None));
    }

    if let Some(dir) = locator.strip_prefix(FAT_LOCATOR_PREFIX) {
        return Ok(Source::local(StorageType::Dir, dir, StorageFormat::Fat));
    }

    let mut source = if let Some(json) = locator.strip_prefix(JSON_LOCATOR_PREFIX) {
        drivers::parse_json(json)?
    } else if locator.contains("://") {
        uri::parse_uri(locator)?
    } else {
        colon::parse_colon(locator)?
    };

    source.assign_default_ports();
    if source.auth_warning {
        debug!("Backing locator '{locator}' carries inline credentials, they are ignored");
    }

    Ok(source)
}

/// Parses a port number as it appears in a locator.
pub(crate) fn parse_port(port: &str) -> Result<u16, ParseError> {
    port.parse().map_err(|_| ParseError::InvalidPort {
        port: port.to_string(),
    })
}

/// Looks up a protocol name as written before `:` or `+` in a locator.
pub(crate) fn parse_protocol(name: &str) -> Result<NetProtocol, ParseError> {
    NetProtocol::from_locator(name).ok_or_else(|| ParseError::InvalidProtocol {
        protocol: name.to_string(),
    })
}

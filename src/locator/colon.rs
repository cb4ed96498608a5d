//! Legacy `PROTOCOL:...` locators understood by nbd, rbd and sheepdog.

use imgchain_api::{
    constants::NBD_EXPORT_NAME_MARKER,
    error::ParseError,
    source::{Host, Source},
};
use sysdefs::storage::NetProtocol;

use super::{parse_port, parse_protocol};

pub(super) fn parse_colon(locator: &str) -> Result<Source, ParseError> {
    let (protocol, _) = locator
        .split_once(':')
        .ok_or_else(|| ParseError::InvalidProtocol {
            protocol: locator.to_string(),
        })?;

    match parse_protocol(protocol)? {
        NetProtocol::Nbd => parse_nbd(locator),
        NetProtocol::Rbd => parse_rbd(locator),
        NetProtocol::Sheepdog => parse_sheepdog(locator),
        protocol => Err(ParseError::MalformedProtocolString { protocol }),
    }
}

/// Parses `nbd:unix:SOCKET[:exportname=NAME]` and
/// `nbd:HOST:PORT[:exportname=NAME]`, where HOST may be a bracketed IPv6
/// address.
pub(super) fn parse_nbd(locator: &str) -> Result<Source, ParseError> {
    let malformed = || ParseError::MalformedNbd {
        locator: locator.to_string(),
    };

    let mut source = Source::network(NetProtocol::Nbd);

    // The export name may contain anything, including further markers
    let spec = match locator.split_once(NBD_EXPORT_NAME_MARKER) {
        Some((spec, export)) => {
            source.name = Some(export.to_string());
            spec
        }
        None => locator,
    };

    let host_spec = spec
        .strip_prefix("nbd:")
        .filter(|host_spec| !host_spec.is_empty())
        .ok_or_else(malformed)?;

    let host = if let Some(socket) = host_spec.strip_prefix("unix:") {
        if socket.is_empty() {
            return Err(malformed());
        }
        Host::unix(socket)
    } else if let Some(bracketed) = host_spec.strip_prefix('[') {
        let (address, port) = bracketed.split_once("]:").ok_or_else(malformed)?;
        if address.is_empty() {
            return Err(malformed());
        }
        Host::tcp(address, Some(parse_port(port)?))
    } else {
        let (name, port) = host_spec.split_once(':').ok_or_else(malformed)?;
        if name.is_empty() {
            return Err(malformed());
        }
        Host::tcp(name, Some(parse_port(port)?))
    };

    source.hosts = vec![host];
    Ok(source)
}

/// Splits `text` at every `:` that is not escaped by a backslash. Escapes are
/// kept in the pieces.
fn split_unescaped_colons(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut escaped = false;

    for (index, c) in text.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            ':' => {
                pieces.push(&text[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }

    pieces.push(&text[start..]);
    pieces
}

/// Parses one `mon_host` entry: `HOST[\:PORT]` or `[ADDRESS][\:PORT]`.
/// Colons inside an IPv6 address are escaped as well.
fn parse_rbd_host(entry: &str, malformed: impl Fn() -> ParseError) -> Result<Host, ParseError> {
    let (name, port) = if let Some(bracketed) = entry.strip_prefix('[') {
        let (address, rest) = bracketed.split_once(']').ok_or_else(&malformed)?;
        let port = match rest {
            "" => None,
            rest => Some(
                rest.strip_prefix("\\:")
                    .or_else(|| rest.strip_prefix(':'))
                    .ok_or_else(&malformed)?,
            ),
        };
        (address.replace("\\:", ":"), port)
    } else {
        match entry.split_once("\\:") {
            Some((name, port)) => (name.to_string(), Some(port)),
            None => (entry.to_string(), None),
        }
    };

    if name.is_empty() {
        return Err(malformed());
    }

    Ok(Host::tcp(name, port.map(parse_port).transpose()?))
}

/// Parses `rbd:POOL/IMAGE[@SNAPSHOT][:KEY=VALUE...]`.
pub(super) fn parse_rbd(locator: &str) -> Result<Source, ParseError> {
    let malformed = || ParseError::MalformedRbd {
        locator: locator.to_string(),
    };

    let rest = locator.strip_prefix("rbd:").ok_or_else(malformed)?;
    let mut source = Source::network(NetProtocol::Rbd);

    let (image, options) = match rest.split_once(':') {
        Some((image, options)) => (image, Some(options)),
        None => (rest, None),
    };

    let image = match image.split_once('@') {
        Some((image, snapshot)) => {
            source.snapshot = Some(snapshot.to_string());
            image
        }
        None => image,
    };
    if image.is_empty() {
        return Err(malformed());
    }
    source.name = Some(image.to_string());

    for option in options.map(split_unescaped_colons).unwrap_or_default() {
        if let Some(hosts) = option.strip_prefix("mon_host=") {
            for entry in hosts
                .split([';', ',', ' '])
                .map(|entry| entry.strip_suffix('\\').unwrap_or(entry))
                .filter(|entry| !entry.is_empty())
            {
                source.hosts.push(parse_rbd_host(entry, malformed)?);
            }
        } else if let Some(conf) = option.strip_prefix("conf=") {
            source.config_file = Some(conf.replace("\\:", ":").into());
        }
        // `id` and other client options do not describe the image
    }

    Ok(source)
}

/// Parses `sheepdog:VDI` and `sheepdog:HOST:PORT:VDI`.
pub(super) fn parse_sheepdog(locator: &str) -> Result<Source, ParseError> {
    let malformed = || ParseError::MalformedSheepdog {
        locator: locator.to_string(),
    };

    let parts = locator.split(':').collect::<Vec<_>>();
    let mut source = Source::network(NetProtocol::Sheepdog);

    match parts[..] {
        ["sheepdog", vdi] if !vdi.is_empty() => {
            source.name = Some(vdi.to_string());
        }
        ["sheepdog", host, port, vdi] if !host.is_empty() && !vdi.is_empty() => {
            source.name = Some(vdi.to_string());
            source.hosts = vec![Host::tcp(host, Some(parse_port(port)?))];
        }
        _ => return Err(malformed()),
    }

    Ok(source)
}

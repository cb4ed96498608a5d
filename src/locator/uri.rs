use std::str::FromStr;

use log::trace;
use percent_encoding::percent_decode_str;
use sysdefs::storage::{HostTransport, NetProtocol};
use url::Url;

use imgchain_api::{
    error::ParseError,
    source::{Host, Source},
};

use super::parse_protocol;

const SOCKET_QUERY_PREFIX: &str = "socket=";

/// Splits a URI scheme of the form `PROTOCOL[+TRANSPORT]`.
fn parse_scheme(scheme: &str) -> Result<(NetProtocol, HostTransport), ParseError> {
    let (protocol, transport) = match scheme.split_once('+') {
        Some((protocol, transport)) => {
            let transport =
                HostTransport::from_str(transport).map_err(|_| ParseError::InvalidTransport {
                    transport: transport.to_string(),
                })?;
            (protocol, transport)
        }
        None => (scheme, HostTransport::Tcp),
    };

    Ok((parse_protocol(protocol)?, transport))
}

fn host_name(url: &Url) -> Option<String> {
    match url.host()? {
        url::Host::Domain(domain) if domain.is_empty() => None,
        url::Host::Domain(domain) => Some(domain.to_string()),
        url::Host::Ipv4(address) => Some(address.to_string()),
        url::Host::Ipv6(address) => Some(address.to_string()),
    }
}

/// Parses a `PROTOCOL[+TRANSPORT]://[USER@]HOST[:PORT]/PATH[?QUERY]` locator.
pub(super) fn parse_uri(locator: &str) -> Result<Source, ParseError> {
    let malformed = || ParseError::MalformedUri {
        uri: locator.to_string(),
    };

    let url = Url::parse(locator).map_err(|e| {
        trace!("Failed to parse '{locator}' as URI: {e}");
        malformed()
    })?;
    let (protocol, transport) = parse_scheme(url.scheme())?;

    let mut source = Source::network(protocol);
    source.auth_warning = !url.username().is_empty() || url.password().is_some();

    let mut host = Host {
        name: host_name(&url),
        port: url.port(),
        transport,
        socket: None,
    };

    match protocol {
        NetProtocol::Http | NetProtocol::Https => source.query = url.query().map(str::to_string),
        _ => {
            host.socket = url
                .query()
                .and_then(|query| query.strip_prefix(SOCKET_QUERY_PREFIX))
                .map(str::to_string)
        }
    }

    let path = percent_decode_str(url.path())
        .decode_utf8()
        .map_err(|_| malformed())?;
    let name = path.strip_prefix('/').unwrap_or(&path);

    source.name = match protocol {
        // An empty export name selects the default export
        NetProtocol::Nbd if name.is_empty() => None,
        NetProtocol::Gluster => match name.find('/') {
            Some(index) if index > 0 => Some(name.to_string()),
            _ => {
                return Err(ParseError::MalformedGlusterPath {
                    path: name.to_string(),
                })
            }
        },
        _ => Some(name.to_string()),
    };

    source.hosts = vec![host];
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scheme() {
        assert_eq!(
            parse_scheme("nbd").unwrap(),
            (NetProtocol::Nbd, HostTransport::Tcp)
        );
        assert_eq!(
            parse_scheme("gluster+unix").unwrap(),
            (NetProtocol::Gluster, HostTransport::Unix)
        );
        assert_eq!(
            parse_scheme("gluster+rdma").unwrap(),
            (NetProtocol::Gluster, HostTransport::Rdma)
        );
        assert_eq!(
            parse_scheme("nbd+udp").unwrap_err(),
            ParseError::InvalidTransport {
                transport: "udp".into()
            }
        );
        assert_eq!(
            parse_scheme("blah").unwrap_err(),
            ParseError::InvalidProtocol {
                protocol: "blah".into()
            }
        );
    }

    #[test]
    fn test_parse_gluster() {
        let source = parse_uri("gluster://example.com/vol/dir/file").unwrap();
        assert_eq!(source.protocol, NetProtocol::Gluster);
        assert_eq!(source.name.as_deref(), Some("vol/dir/file"));
        assert_eq!(source.hosts, vec![Host::tcp("example.com", None)]);

        let source = parse_uri("gluster+unix:///vol/file?socket=/run/glusterd.sock").unwrap();
        assert_eq!(source.name.as_deref(), Some("vol/file"));
        assert_eq!(source.hosts, vec![Host::unix("/run/glusterd.sock")]);

        assert_eq!(
            parse_uri("gluster://example.com/vol").unwrap_err(),
            ParseError::MalformedGlusterPath { path: "vol".into() }
        );
        parse_uri("gluster://example.com//file").unwrap_err();
    }

    #[test]
    fn test_parse_http() {
        let source = parse_uri("https://host/folder/x86%5f64.vmdk?dcPath=data&dsName=ds").unwrap();
        assert_eq!(source.protocol, NetProtocol::Https);
        assert_eq!(source.name.as_deref(), Some("folder/x86_64.vmdk"));
        assert_eq!(source.query.as_deref(), Some("dcPath=data&dsName=ds"));
        assert_eq!(source.hosts, vec![Host::tcp("host", None)]);
        assert!(!source.auth_warning);

        let source = parse_uri("http://user@example.com:8080/file").unwrap();
        assert!(source.auth_warning);
        assert_eq!(source.hosts, vec![Host::tcp("example.com", Some(8080))]);
    }

    #[test]
    fn test_parse_ipv6() {
        let source = parse_uri("nbd://[::1]:6000/export").unwrap();
        assert_eq!(source.hosts, vec![Host::tcp("::1", Some(6000))]);
        assert_eq!(source.name.as_deref(), Some("export"));
    }

    #[test]
    fn test_parse_malformed() {
        assert_eq!(
            parse_uri("://").unwrap_err(),
            ParseError::MalformedUri { uri: "://".into() }
        );
        assert!(matches!(
            parse_uri("nbd://example.org:99999/").unwrap_err(),
            ParseError::MalformedUri { .. }
        ));
    }
}

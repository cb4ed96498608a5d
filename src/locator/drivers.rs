//! Decoding of `json:` block graph descriptions, one decoder per driver.

use std::str::FromStr;

use log::trace;
use serde_json::{Map, Value};
use strum_macros::{EnumString, IntoStaticStr};
use sysdefs::storage::{NetProtocol, StorageFormat, StorageType};

use imgchain_api::{
    constants::ISCSI_DEFAULT_LUN,
    error::ParseError,
    source::{Cookie, Host, NfsIdentity, NvmeDisk, PciAddress, Slice, Source},
};

use super::{colon, json, parse_port, uri};

/// Block drivers that can appear in a backing graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
enum Driver {
    File,
    HostDevice,
    HostCdrom,
    Http,
    Https,
    Ftp,
    Ftps,
    Tftp,
    Gluster,
    Iscsi,
    Nbd,
    Sheepdog,
    Ssh,
    Rbd,
    Nfs,
    Vxhs,
    Nvme,
    Raw,
}

impl Driver {
    /// Format drivers sit on top of a protocol driver given as `file`.
    fn is_format_driver(self) -> bool {
        matches!(self, Driver::Raw)
    }
}

/// Typed access to the fields of one driver object.
struct Fields<'a> {
    driver: &'static str,
    map: &'a Map<String, Value>,
}

impl<'a> Fields<'a> {
    fn missing(&self, field: &str) -> ParseError {
        ParseError::MissingField {
            driver: self.driver.to_string(),
            field: field.to_string(),
        }
    }

    fn malformed(&self, field: &str) -> ParseError {
        ParseError::MalformedField {
            driver: self.driver.to_string(),
            field: field.to_string(),
        }
    }

    fn has(&self, field: &str) -> bool {
        self.map.contains_key(field)
    }

    fn string(&self, field: &str) -> Result<Option<&'a str>, ParseError> {
        match self.map.get(field) {
            None => Ok(None),
            Some(Value::String(value)) => Ok(Some(value)),
            Some(_) => Err(self.malformed(field)),
        }
    }

    fn required_string(&self, field: &str) -> Result<&'a str, ParseError> {
        self.string(field)?.ok_or_else(|| self.missing(field))
    }

    fn integer(&self, field: &str) -> Result<Option<u64>, ParseError> {
        match self.map.get(field) {
            None => Ok(None),
            Some(Value::Number(value)) => value
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.malformed(field)),
            Some(_) => Err(self.malformed(field)),
        }
    }

    fn required_integer(&self, field: &str) -> Result<u64, ParseError> {
        self.integer(field)?.ok_or_else(|| self.missing(field))
    }

    fn boolean(&self, field: &str) -> Result<Option<bool>, ParseError> {
        match self.map.get(field) {
            None => Ok(None),
            Some(Value::Bool(value)) => Ok(Some(*value)),
            Some(_) => Err(self.malformed(field)),
        }
    }

    fn port(&self, field: &str) -> Result<Option<u16>, ParseError> {
        match self.map.get(field) {
            None => Ok(None),
            Some(Value::Number(port)) => port
                .as_u64()
                .and_then(|port| u16::try_from(port).ok())
                .map(Some)
                .ok_or_else(|| ParseError::InvalidPort {
                    port: port.to_string(),
                }),
            Some(Value::String(port)) => parse_port(port).map(Some),
            Some(_) => Err(self.malformed(field)),
        }
    }

    fn object(&self, field: &str) -> Result<Option<&'a Map<String, Value>>, ParseError> {
        match self.map.get(field) {
            None => Ok(None),
            Some(Value::Object(value)) => Ok(Some(value)),
            Some(_) => Err(self.malformed(field)),
        }
    }

    fn nested(&self, map: &'a Map<String, Value>) -> Fields<'a> {
        Fields {
            driver: self.driver,
            map,
        }
    }

    /// Decodes every entry of the `server` array.
    fn servers(&self) -> Result<Option<Vec<Host>>, ParseError> {
        let Some(servers) = self.map.get("server") else {
            return Ok(None);
        };
        let Value::Array(servers) = servers else {
            return Err(self.malformed("server"));
        };

        servers
            .iter()
            .map(|server| match server {
                Value::Object(server) => socket_address(&self.nested(server)),
                _ => Err(self.malformed("server")),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// Decodes a `server` that must name exactly one host.
    fn server(&self) -> Result<Option<Host>, ParseError> {
        match self.servers()? {
            None => Ok(None),
            Some(servers) if servers.len() == 1 => Ok(servers.into_iter().next()),
            Some(_) => Err(self.malformed("server")),
        }
    }

    fn required_server(&self) -> Result<Host, ParseError> {
        self.server()?.ok_or_else(|| self.missing("server"))
    }
}

/// Decodes a socket address object: `inet`/`tcp` hosts or `unix` sockets.
fn socket_address(fields: &Fields) -> Result<Host, ParseError> {
    match fields.string("type")? {
        None | Some("inet") | Some("tcp") => Ok(Host::tcp(
            fields.required_string("host")?,
            fields.port("port")?,
        )),
        Some("unix") => {
            let socket = match fields.string("path")? {
                Some(path) => path,
                None => fields.required_string("socket")?,
            };
            Ok(Host::unix(socket))
        }
        Some(other) => Err(ParseError::UnsupportedSocketType {
            socket_type: other.to_string(),
        }),
    }
}

/// Parses the text following `json:`.
pub(super) fn parse_json(text: &str) -> Result<Source, ParseError> {
    let root = json::normalize(text)?;

    // Both `{"driver": ...}` and `{"file": {"driver": ...}}` are accepted
    let graph = if root.contains_key("driver") {
        &root
    } else {
        match root.get("file") {
            Some(Value::Object(file)) => file,
            _ => return Err(ParseError::MissingFileObject),
        }
    };

    decode(graph, true)
}

fn decode(graph: &Map<String, Value>, allow_format: bool) -> Result<Source, ParseError> {
    let name = match graph.get("driver") {
        Some(Value::String(name)) => name.as_str(),
        _ => return Err(ParseError::MissingDriver),
    };

    let driver = Driver::from_str(name).map_err(|_| ParseError::UnknownDriver {
        driver: name.to_string(),
    })?;
    if !allow_format && driver.is_format_driver() {
        return Err(ParseError::NestedFormatDriver {
            driver: name.to_string(),
        });
    }

    trace!("Decoding JSON backing definition for driver '{name}'");
    let fields = Fields {
        driver: driver.into(),
        map: graph,
    };

    match driver {
        Driver::File => decode_local(&fields, StorageType::File),
        Driver::HostDevice | Driver::HostCdrom => decode_local(&fields, StorageType::Block),
        Driver::Http => decode_url(&fields, NetProtocol::Http),
        Driver::Https => decode_url(&fields, NetProtocol::Https),
        Driver::Ftp => decode_url(&fields, NetProtocol::Ftp),
        Driver::Ftps => decode_url(&fields, NetProtocol::Ftps),
        Driver::Tftp => decode_url(&fields, NetProtocol::Tftp),
        Driver::Gluster => decode_gluster(&fields),
        Driver::Iscsi => decode_iscsi(&fields),
        Driver::Nbd => decode_nbd(&fields),
        Driver::Sheepdog => decode_sheepdog(&fields),
        Driver::Ssh => decode_ssh(&fields),
        Driver::Rbd => decode_rbd(&fields),
        Driver::Nfs => decode_nfs(&fields),
        Driver::Vxhs => decode_vxhs(&fields),
        Driver::Nvme => decode_nvme(&fields),
        Driver::Raw => decode_raw(&fields),
    }
}

fn decode_local(fields: &Fields, kind: StorageType) -> Result<Source, ParseError> {
    Ok(Source::local(
        kind,
        fields.required_string("filename")?,
        StorageFormat::None,
    ))
}

/// Parses a URI that must use `expected` as its protocol.
fn uri_with_protocol(uri: &str, expected: NetProtocol) -> Result<Source, ParseError> {
    let source = uri::parse_uri(uri)?;
    if source.protocol != expected {
        return Err(ParseError::ProtocolMismatch {
            expected,
            actual: source.protocol,
        });
    }
    Ok(source)
}

fn parse_cookies(cookies: &str) -> Result<Vec<Cookie>, ParseError> {
    cookies
        .split(';')
        .map(|cookie| cookie.trim_start_matches(' '))
        .filter(|cookie| !cookie.is_empty())
        .map(|cookie| {
            cookie
                .split_once('=')
                .map(|(name, value)| Cookie {
                    name: name.to_string(),
                    value: value.to_string(),
                })
                .ok_or_else(|| ParseError::MalformedCookie {
                    cookie: cookie.to_string(),
                })
        })
        .collect()
}

fn decode_url(fields: &Fields, protocol: NetProtocol) -> Result<Source, ParseError> {
    let mut source = uri_with_protocol(fields.required_string("url")?, protocol)?;

    if matches!(protocol, NetProtocol::Https | NetProtocol::Ftps) {
        source.ssl_verify = fields.boolean("sslverify")?;
    }

    if matches!(protocol, NetProtocol::Http | NetProtocol::Https) {
        if let Some(cookies) = fields.string("cookie")? {
            source.cookies = parse_cookies(cookies)?;
        }
    }

    source.timeout_seconds = fields.integer("timeout")?;
    Ok(source)
}

fn decode_gluster(fields: &Fields) -> Result<Source, ParseError> {
    if let Some(filename) = fields.string("filename")? {
        return uri_with_protocol(filename, NetProtocol::Gluster);
    }

    let volume = fields.required_string("volume")?;
    let path = fields.required_string("path")?;
    let servers = fields.servers()?.ok_or_else(|| fields.missing("server"))?;
    if servers.is_empty() {
        return Err(fields.malformed("server"));
    }

    let mut source = Source::network(NetProtocol::Gluster);
    source.name = Some(format!("{volume}/{path}"));
    source.hosts = servers;
    Ok(source)
}

/// Splits an iSCSI portal into host and port. The last `:` only separates a
/// port when it is not part of a bracketed IPv6 address.
fn split_portal(portal: &str) -> Result<Host, ParseError> {
    match portal.rsplit_once(':') {
        Some((host, port)) if !port.contains(']') => Ok(Host::tcp(host, Some(parse_port(port)?))),
        _ => Ok(Host::tcp(portal, None)),
    }
}

fn decode_iscsi(fields: &Fields) -> Result<Source, ParseError> {
    if let Some(filename) = fields.string("filename")? {
        return uri_with_protocol(filename, NetProtocol::Iscsi);
    }

    match fields.string("transport")? {
        Some("tcp") => {}
        Some(transport) => {
            return Err(ParseError::UnsupportedTransport {
                driver: fields.driver.to_string(),
                transport: transport.to_string(),
            })
        }
        None => return Err(fields.missing("transport")),
    }

    let portal = fields.required_string("portal")?;
    let target = fields.required_string("target")?;
    let lun = match fields.map.get("lun") {
        None => ISCSI_DEFAULT_LUN.to_string(),
        Some(Value::Number(lun)) => lun.to_string(),
        Some(Value::String(lun)) => lun.clone(),
        Some(_) => return Err(fields.malformed("lun")),
    };

    let mut source = Source::network(NetProtocol::Iscsi);
    source.hosts = vec![split_portal(portal)?];
    source.name = Some(format!("{target}/{lun}"));
    source.auth_warning = fields.has("user") || fields.has("password");
    Ok(source)
}

fn decode_nbd(fields: &Fields) -> Result<Source, ParseError> {
    let host = if let Some(server) = fields.server()? {
        server
    } else if let Some(path) = fields.string("path")? {
        Host::unix(path)
    } else if let Some(host) = fields.string("host")? {
        Host::tcp(host, fields.port("port")?)
    } else {
        return Err(fields.missing("server"));
    };

    let mut source = Source::network(NetProtocol::Nbd);
    source.name = fields.string("export")?.map(str::to_string);
    source.hosts = vec![host];
    Ok(source)
}

fn decode_sheepdog(fields: &Fields) -> Result<Source, ParseError> {
    if let Some(filename) = fields.string("filename")? {
        return uri_with_protocol(filename, NetProtocol::Sheepdog);
    }

    let mut source = Source::network(NetProtocol::Sheepdog);
    source.name = Some(fields.required_string("vdi")?.to_string());
    source.hosts = vec![fields.required_server()?];
    Ok(source)
}

fn decode_ssh(fields: &Fields) -> Result<Source, ParseError> {
    let path = fields.required_string("path")?;
    let host = if let Some(server) = fields.server()? {
        server
    } else if let Some(host) = fields.string("host")? {
        Host::tcp(host, fields.port("port")?)
    } else {
        return Err(fields.missing("server"));
    };

    // `user` is a login detail and not part of the image address
    let mut source = Source::network(NetProtocol::Ssh);
    source.name = Some(path.to_string());
    source.hosts = vec![host];
    Ok(source)
}

fn decode_rbd(fields: &Fields) -> Result<Source, ParseError> {
    if let Some(filename) = fields.string("filename")? {
        return colon::parse_rbd(filename);
    }

    let pool = fields.required_string("pool")?;
    let image = fields.required_string("image")?;

    let mut source = Source::network(NetProtocol::Rbd);
    source.name = Some(format!("{pool}/{image}"));
    source.snapshot = fields.string("snapshot")?.map(str::to_string);
    source.config_file = fields.string("conf")?.map(Into::into);
    source.hosts = fields.servers()?.unwrap_or_default();
    Ok(source)
}

fn decode_nfs(fields: &Fields) -> Result<Source, ParseError> {
    let path = fields.required_string("path")?;
    let host = fields.required_server()?;
    let user = fields.required_integer("user")?;
    let group = fields.required_integer("group")?;

    let mut source = Source::network(NetProtocol::Nfs);
    source.name = Some(path.to_string());
    source.hosts = vec![host];
    source.nfs_identity = Some(NfsIdentity {
        user: format!("+{user}"),
        group: format!("+{group}"),
    });
    Ok(source)
}

fn decode_vxhs(fields: &Fields) -> Result<Source, ParseError> {
    let mut source = Source::network(NetProtocol::Vxhs);
    source.name = Some(fields.required_string("vdisk-id")?.to_string());
    source.hosts = vec![fields.required_server()?];
    Ok(source)
}

fn decode_nvme(fields: &Fields) -> Result<Source, ParseError> {
    let address = PciAddress::from_str(fields.required_string("device")?)?;
    let namespace = fields.required_integer("namespace")?;

    let mut source = Source::new(StorageType::Nvme);
    source.nvme = Some(NvmeDisk { address, namespace });
    Ok(source)
}

fn decode_raw(fields: &Fields) -> Result<Source, ParseError> {
    let slice = if fields.has("offset") || fields.has("size") {
        Some(Slice {
            offset: fields.required_integer("offset")?,
            size: fields.required_integer("size")?,
        })
    } else {
        None
    };

    let file = fields.object("file")?.ok_or_else(|| fields.missing("file"))?;
    let mut source = decode(file, false)?;
    source.slice = slice;
    Ok(source)
}

use std::{
    fmt::{Display, Formatter},
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use sysdefs::storage::{HostTransport, NetProtocol, StorageFormat, StorageType};

use crate::error::ParseError;

/// One server a network source talks to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Host {
    /// Hostname or address for TCP/RDMA transports.
    pub name: Option<String>,

    /// Port for TCP/RDMA transports. Filled with the protocol default when
    /// the locator did not carry one.
    pub port: Option<u16>,

    pub transport: HostTransport,

    /// Socket path for the UNIX transport.
    pub socket: Option<String>,
}

impl Host {
    pub fn tcp(name: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            name: Some(name.into()),
            port,
            transport: HostTransport::Tcp,
            socket: None,
        }
    }

    pub fn unix(socket: impl Into<String>) -> Self {
        Self {
            name: None,
            port: None,
            transport: HostTransport::Unix,
            socket: Some(socket.into()),
        }
    }
}

/// Byte range of the underlying storage exposed as the image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slice {
    pub offset: u64,
    pub size: u64,
}

/// HTTP cookie passed along with requests to the image server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

/// Identity used to access an NFS export, rendered as `+UID` / `+GID`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsIdentity {
    pub user: String,
    pub group: String,
}

/// PCI address in `DDDD:BB:SS.F` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl FromStr for PciAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ParseError::MalformedPciAddress {
            address: s.to_string(),
        };

        let (domain, rest) = s.split_once(':').ok_or_else(malformed)?;
        let (bus, rest) = rest.split_once(':').ok_or_else(malformed)?;
        let (slot, function) = rest.split_once('.').ok_or_else(malformed)?;

        let function = u8::from_str_radix(function, 16).map_err(|_| malformed())?;
        if function > 7 {
            return Err(malformed());
        }

        Ok(Self {
            domain: u16::from_str_radix(domain, 16).map_err(|_| malformed())?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| malformed())?,
            slot: u8::from_str_radix(slot, 16).map_err(|_| malformed())?,
            function,
        })
    }
}

impl Display for PciAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

/// NVMe namespace on a PCI controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeDisk {
    pub address: PciAddress,
    pub namespace: u64,
}

/// One image in a backing chain.
///
/// A chain is a singly linked list: every node exclusively owns the next
/// image through `backing_store`, and releasing the root releases the whole
/// chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Source {
    /// Position in the chain, 0 for the root.
    pub id: usize,

    pub kind: StorageType,

    /// Filesystem path for local storage.
    pub path: Option<PathBuf>,

    pub format: StorageFormat,

    pub protocol: NetProtocol,

    /// Servers of a network source. The first one is the primary.
    pub hosts: Vec<Host>,

    /// Protocol level object name: nbd export, `pool/image` for rbd,
    /// `volume/path` for gluster, `target/lun` for iscsi, ...
    pub name: Option<String>,

    /// Query string of an http(s) URL.
    pub query: Option<String>,

    /// rbd snapshot name.
    pub snapshot: Option<String>,

    /// rbd configuration file.
    pub config_file: Option<PathBuf>,

    /// Whether the https peer certificate is verified.
    pub ssl_verify: Option<bool>,

    pub cookies: Vec<Cookie>,

    pub timeout_seconds: Option<u64>,

    pub slice: Option<Slice>,

    pub nfs_identity: Option<NfsIdentity>,

    pub nvme: Option<NvmeDisk>,

    /// Backing locator as stored in this image's metadata.
    pub backing_store_raw: Option<String>,

    /// The locator that produced this node, when it was a relative path.
    pub rel_path: Option<String>,

    pub backing_store: Option<Box<Source>>,

    /// Set when the locator carried inline credentials, which are dropped.
    pub auth_warning: bool,
}

impl Source {
    /// Creates an empty source of the given kind.
    pub fn new(kind: StorageType) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// Creates a local source for `path`.
    pub fn local(kind: StorageType, path: impl Into<PathBuf>, format: StorageFormat) -> Self {
        Self {
            kind,
            path: Some(path.into()),
            format,
            ..Default::default()
        }
    }

    /// Creates a network source for `protocol`.
    pub fn network(protocol: NetProtocol) -> Self {
        Self {
            kind: StorageType::Network,
            protocol,
            ..Default::default()
        }
    }

    pub fn is_local(&self) -> bool {
        self.kind.is_local()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the next image in the chain.
    pub fn backing(&self) -> Option<&Source> {
        self.backing_store.as_deref()
    }

    pub fn has_backing(&self) -> bool {
        self.backing_store.is_some()
    }

    /// Iterates over this node and every image below it.
    pub fn chain_iter(&self) -> impl Iterator<Item = &Source> {
        std::iter::successors(Some(self), |node| node.backing())
    }

    /// Returns the last image of the chain starting at this node.
    pub fn base(&self) -> &Source {
        let mut node = self;
        while let Some(next) = node.backing() {
            node = next;
        }
        node
    }

    /// Fills in the protocol's well-known port on TCP hosts that lack one.
    pub fn assign_default_ports(&mut self) {
        let Some(port) = self.protocol.default_port() else {
            return;
        };

        for host in self
            .hosts
            .iter_mut()
            .filter(|host| host.transport == HostTransport::Tcp && host.port.is_none())
        {
            host.port = Some(port);
        }
    }
}

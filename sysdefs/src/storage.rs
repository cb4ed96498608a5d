use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString, IntoStaticStr};

/// Kind of storage a disk source lives on.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, IntoStaticStr, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StorageType {
    /// No storage assigned, e.g. a chain terminator.
    #[default]
    None,
    File,
    Block,
    Dir,
    Network,
    Nvme,
}

impl StorageType {
    /// Returns whether the storage is reachable through the local filesystem.
    pub fn is_local(self) -> bool {
        matches!(self, StorageType::File | StorageType::Block | StorageType::Dir)
    }
}

/// Image formats that can appear in a backing chain.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoStaticStr,
    EnumString,
    Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StorageFormat {
    /// Format was never specified.
    #[default]
    None,
    /// Format is to be detected from the image contents.
    Auto,
    Raw,
    Dir,
    Fat,
    Qcow2,
    Qed,
}

impl StorageFormat {
    /// Returns whether the format still needs to be determined.
    pub fn is_unknown(self) -> bool {
        matches!(self, StorageFormat::None | StorageFormat::Auto)
    }
}

/// Network protocols whose addressing syntax can appear in a backing locator.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoStaticStr,
    EnumString,
    Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NetProtocol {
    /// Not a network source.
    #[default]
    None,
    Nbd,
    Rbd,
    Sheepdog,
    Gluster,
    Iscsi,
    Http,
    Https,
    Ftp,
    Ftps,
    Tftp,
    Ssh,
    Vxhs,
    Nfs,
}

impl NetProtocol {
    /// Parses a protocol name as it appears in a locator. `none` is not a
    /// protocol.
    pub fn from_locator(name: &str) -> Option<Self> {
        name.parse().ok().filter(|protocol| *protocol != NetProtocol::None)
    }

    /// Well-known TCP port of the protocol, if it has one.
    pub fn default_port(self) -> Option<u16> {
        match self {
            NetProtocol::Nbd => Some(10809),
            NetProtocol::Sheepdog => Some(7000),
            NetProtocol::Gluster => Some(24007),
            NetProtocol::Iscsi => Some(3260),
            NetProtocol::Http => Some(80),
            NetProtocol::Https => Some(443),
            NetProtocol::Ftp => Some(21),
            NetProtocol::Ftps => Some(990),
            NetProtocol::Tftp => Some(69),
            NetProtocol::Ssh => Some(22),
            NetProtocol::Vxhs => Some(9999),
            NetProtocol::None | NetProtocol::Rbd | NetProtocol::Nfs => None,
        }
    }
}

/// Transport used to reach a network host.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoStaticStr,
    EnumString,
    Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HostTransport {
    #[default]
    Tcp,
    Unix,
    Rdma,
}

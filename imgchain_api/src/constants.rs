// Chain building constants

/// Number of backing images allowed below the chain root.
pub const DEFAULT_MAX_CHAIN_DEPTH: usize = 20;

/// Binary used by the `qemu-img` prober.
pub const DEFAULT_QEMU_IMG_PATH: &str = "qemu-img";

/// Configuration file read by the command line tool when none is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/imgchain/config.yaml";

// Locator syntax constants

/// Prefix of the JSON block-graph pseudo protocol.
pub const JSON_LOCATOR_PREFIX: &str = "json:";

/// Prefix of the FAT directory wrapper.
pub const FAT_LOCATOR_PREFIX: &str = "fat:";

/// Separator of the nbd export name in colon syntax.
pub const NBD_EXPORT_NAME_MARKER: &str = ":exportname=";

/// LUN used for iSCSI targets that do not name one.
pub const ISCSI_DEFAULT_LUN: &str = "0";

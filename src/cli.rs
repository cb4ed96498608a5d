use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
};

use clap::{Parser, Subcommand};
use log::LevelFilter;
use sysdefs::storage::StorageFormat;

use imgchain_api::source::Source;

use crate::IMGCHAIN_VERSION;

#[derive(Parser, Debug)]
#[clap(version = IMGCHAIN_VERSION)]
pub struct Cli {
    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(global = true, short, long, default_value_t = LevelFilter::Warn)]
    pub verbosity: LevelFilter,

    /// Configuration file, `/etc/imgchain/config.yaml` is read when present
    #[arg(global = true, short, long)]
    pub config: Option<PathBuf>,

    /// Path to save an eventual fatal error
    #[arg(global = true, short, long)]
    pub error: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve and print the backing chain of an image
    Chain {
        /// Image at the top of the chain
        #[clap(index = 1)]
        path: PathBuf,

        /// Format of the top image
        #[clap(short, long, default_value = "auto")]
        format: StorageFormat,

        /// Number of backing images allowed below the top image
        #[clap(long)]
        max_depth: Option<usize>,

        /// Detect the format of images that do not record one
        #[clap(long)]
        allow_probe: bool,

        /// Print the chain as YAML
        #[clap(long)]
        yaml: bool,
    },

    /// Parse a backing locator and print its source description
    Parse {
        /// Locator as recorded in an image header
        #[clap(index = 1)]
        locator: String,
    },

    /// Find an image of a backing chain by name or index
    Lookup {
        /// Image at the top of the chain
        #[clap(index = 1)]
        path: PathBuf,

        /// Path, relative locator or `TARGET[INDEX]` of the image. The base
        /// image is selected when omitted.
        #[clap(index = 2)]
        name: Option<String>,

        /// Disk target that `TARGET[INDEX]` names must refer to
        #[clap(short, long)]
        target: Option<String>,

        /// Format of the top image
        #[clap(short, long, default_value = "auto")]
        format: StorageFormat,
    },

    /// Compose the relative locator between two images of a backing chain
    Relative {
        /// Image at the top of the chain
        #[clap(index = 1)]
        path: PathBuf,

        /// Image the locator starts from
        #[clap(index = 2)]
        top: String,

        /// Image the locator leads to
        #[clap(index = 3)]
        base: String,

        /// Format of the top image
        #[clap(short, long, default_value = "auto")]
        format: StorageFormat,
    },
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Chain { .. } => "chain",
            Commands::Parse { .. } => "parse",
            Commands::Lookup { .. } => "lookup",
            Commands::Relative { .. } => "relative",
        }
    }
}

impl Display for Commands {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.name())
    }
}

fn or_dash(value: Option<impl Display>) -> String {
    value.map_or_else(|| "-".into(), |value| value.to_string())
}

/// Renders one chain image as a block of `key: value` lines.
pub fn describe_node(node: &Source) -> String {
    let host = node.hosts.first().map(|host| match (&host.name, &host.socket) {
        (Some(name), _) => match host.port {
            Some(port) => format!("{name}:{port}"),
            None => name.clone(),
        },
        (None, Some(socket)) => format!("unix:{socket}"),
        (None, None) => "-".into(),
    });

    [
        ("id", node.id.to_string()),
        ("path", or_dash(node.path().map(|path| path.display()))),
        ("format", node.format.to_string()),
        ("type", node.kind.to_string()),
        ("relPath", or_dash(node.rel_path.as_deref())),
        ("backingStoreRaw", or_dash(node.backing_store_raw.as_deref())),
        ("protocol", node.protocol.to_string()),
        ("name", or_dash(node.name.as_deref())),
        ("host", or_dash(host)),
    ]
    .iter()
    .map(|(key, value)| format!("{key}: {value}\n"))
    .collect()
}

/// Renders every image of `chain`, separated by empty lines.
pub fn describe_chain(chain: &Source) -> String {
    chain
        .chain_iter()
        .map(describe_node)
        .collect::<Vec<_>>()
        .join("\n")
}

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    constants::{DEFAULT_MAX_CHAIN_DEPTH, DEFAULT_QEMU_IMG_PATH},
    error::{ConfigError, ImgChainError, ReportError},
};

/// Definition of the chain resolver configuration file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    /// Number of backing images allowed below the chain root.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Whether images without a recorded format may have their format
    /// detected from their contents. When disabled they are treated as raw.
    #[serde(default)]
    pub allow_probe: bool,

    /// How image headers are inspected.
    #[serde(default)]
    pub prober: ProberKind,

    /// Path of the `qemu-img` binary used by the `qemu-img` prober.
    #[serde(default = "default_qemu_img")]
    pub qemu_img: PathBuf,

    /// User images are probed as. The current user when unset.
    #[serde(default)]
    pub uid: Option<u32>,

    /// Group images are probed as. The current group when unset.
    #[serde(default)]
    pub gid: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProberKind {
    /// Read qcow2/qed headers directly.
    #[default]
    Header,

    /// Ask `qemu-img info` about each image.
    QemuImg,
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_CHAIN_DEPTH
}

fn default_qemu_img() -> PathBuf {
    DEFAULT_QEMU_IMG_PATH.into()
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            allow_probe: false,
            prober: ProberKind::default(),
            qemu_img: default_qemu_img(),
            uid: None,
            gid: None,
        }
    }
}

impl ChainConfig {
    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ImgChainError> {
        log::debug!("Loading configuration from '{}'", path.as_ref().display());
        let contents = std::fs::read_to_string(path.as_ref()).structured(ConfigError::Load {
            path: path.as_ref().display().to_string(),
        })?;
        Self::from_yaml(&contents)
    }

    /// Parses and validates configuration contents.
    pub fn from_yaml(contents: &str) -> Result<Self, ImgChainError> {
        let config: Self = serde_yaml::from_str(contents).structured(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ImgChainError> {
        if self.max_depth == 0 {
            return Err(ImgChainError::new(ConfigError::InvalidMaxDepth));
        }
        Ok(())
    }
}

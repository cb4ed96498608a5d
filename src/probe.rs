//! Inspection of local images for their format and backing store.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Error};
use sysdefs::storage::StorageFormat;

use imgchain_api::config::{ChainConfig, ProberKind};
use osutils::{
    files::{self, Identity},
    image_header::{self, ImageInfo},
    qemu_img,
};

/// Reads what a local image records about its backing store.
pub trait Prober {
    /// Name used in log messages.
    fn name(&self) -> &'static str;

    /// Inspects the image at `path` on behalf of `identity`. An unknown
    /// `format` asks the prober to detect it.
    fn probe(
        &self,
        path: &Path,
        identity: Identity,
        format: StorageFormat,
    ) -> Result<ImageInfo, Error>;
}

/// Parses qcow2 and qed headers directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderProber;

impl Prober for HeaderProber {
    fn name(&self) -> &'static str {
        "header"
    }

    fn probe(
        &self,
        path: &Path,
        identity: Identity,
        format: StorageFormat,
    ) -> Result<ImageInfo, Error> {
        if !identity.is_unset() {
            ensure!(
                files::readable_by(path, identity)?,
                "Image '{}' is not readable by {identity}",
                path.display()
            );
        }
        image_header::inspect(path, format)
    }
}

/// Asks `qemu-img info` about every image.
#[derive(Debug, Clone)]
pub struct QemuImgProber {
    qemu_img: PathBuf,
}

impl QemuImgProber {
    pub fn new(qemu_img: impl Into<PathBuf>) -> Self {
        Self {
            qemu_img: qemu_img.into(),
        }
    }
}

impl Prober for QemuImgProber {
    fn name(&self) -> &'static str {
        "qemu-img"
    }

    fn probe(
        &self,
        path: &Path,
        identity: Identity,
        format: StorageFormat,
    ) -> Result<ImageInfo, Error> {
        Ok(qemu_img::info(&self.qemu_img, path, identity, format)?.image_info())
    }
}

/// Creates the prober selected in `config`.
pub fn from_config(config: &ChainConfig) -> Box<dyn Prober> {
    match config.prober {
        ProberKind::Header => Box::new(HeaderProber),
        ProberKind::QemuImg => Box::new(QemuImgProber::new(&config.qemu_img)),
    }
}

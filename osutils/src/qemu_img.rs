use std::{
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::Command,
    str::FromStr,
};

use anyhow::{Context, Error};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sysdefs::storage::StorageFormat;

use crate::{exe::RunAndCheck, files::Identity, image_header::ImageInfo};

/// Subset of `qemu-img info --output=json`.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct QemuImgInfo {
    pub filename: PathBuf,
    pub format: String,
    pub virtual_size: Option<u64>,
    pub backing_filename: Option<String>,
    pub backing_filename_format: Option<String>,
}

impl QemuImgInfo {
    /// Converts the report into the backing store description of the image.
    /// Formats that are not part of a chain are left to detection.
    pub fn image_info(&self) -> ImageInfo {
        let format = parse_format(&self.format);
        let backing_format = match (&self.backing_filename, &self.backing_filename_format) {
            (None, _) => StorageFormat::None,
            (Some(_), Some(name)) => parse_format(name),
            (Some(_), None) => StorageFormat::Auto,
        };

        ImageInfo {
            format,
            backing: self.backing_filename.clone(),
            backing_format,
        }
    }
}

fn parse_format(name: &str) -> StorageFormat {
    StorageFormat::from_str(name).unwrap_or_else(|_| {
        debug!("qemu-img reported unhandled format '{name}'");
        StorageFormat::Auto
    })
}

/// Runs `qemu-img info` on `image` as `identity`. A known `format` is passed
/// along so that qemu-img does not probe the image.
pub fn info(
    qemu_img: impl AsRef<Path>,
    image: impl AsRef<Path>,
    identity: Identity,
    format: StorageFormat,
) -> Result<QemuImgInfo, Error> {
    let mut cmd = Command::new(qemu_img.as_ref());
    if let Some(gid) = identity.gid {
        cmd.gid(gid);
    }
    if let Some(uid) = identity.uid {
        cmd.uid(uid);
    }
    cmd.arg("info").arg("--output=json").arg("--force-share");
    if !format.is_unknown() {
        cmd.arg("-f").arg(<&str>::from(format));
    }

    let output = cmd
        .arg(image.as_ref())
        .output_and_check()
        .context("Failed to execute qemu-img")?;

    let parsed = parse_info_output(&output);
    if parsed.is_err() {
        warn!("qemu-img output: {output}");
    }

    parsed
}

fn parse_info_output(output: &str) -> Result<QemuImgInfo, Error> {
    serde_json::from_str(output).context("Failed to parse qemu-img output")
}

//! Builders for minimal qcow2 and qed images carrying a backing store.

use std::{fs, path::Path};

use anyhow::{Context, Error};
use sysdefs::storage::StorageFormat;

const QCOW2_V3_HEADER_LENGTH: u32 = 104;
const QCOW2_EXT_BACKING_FORMAT: u32 = 0xE279_2ACA;
const QED_HEADER_LENGTH: usize = 64;

/// Builds a qcow2 v3 header. The backing format, when given, is stored as a
/// header extension and the backing name follows the extension list.
pub fn qcow2_header(backing: Option<&str>, backing_format: Option<&str>) -> Vec<u8> {
    let mut header = Vec::new();
    header.extend_from_slice(b"QFI\xfb");
    header.extend_from_slice(&3u32.to_be_bytes());
    header.resize(QCOW2_V3_HEADER_LENGTH as usize, 0);
    header[20..24].copy_from_slice(&16u32.to_be_bytes());
    header[100..104].copy_from_slice(&QCOW2_V3_HEADER_LENGTH.to_be_bytes());

    if let Some(format) = backing_format {
        header.extend_from_slice(&QCOW2_EXT_BACKING_FORMAT.to_be_bytes());
        header.extend_from_slice(&(format.len() as u32).to_be_bytes());
        header.extend_from_slice(format.as_bytes());
        header.resize(header.len().next_multiple_of(8), 0);
    }

    // End of the extension list
    header.extend_from_slice(&[0; 8]);

    if let Some(backing) = backing {
        let offset = header.len() as u64;
        header[8..16].copy_from_slice(&offset.to_be_bytes());
        header[16..20].copy_from_slice(&(backing.len() as u32).to_be_bytes());
        header.extend_from_slice(backing.as_bytes());
    }

    header
}

/// Builds a qed header. `raw_backing` marks the backing image as raw so that
/// it is never probed.
pub fn qed_header(backing: Option<&str>, raw_backing: bool) -> Vec<u8> {
    let mut header = vec![0; QED_HEADER_LENGTH];
    header[..4].copy_from_slice(b"QED\0");
    header[4..8].copy_from_slice(&65536u32.to_le_bytes());
    header[8..12].copy_from_slice(&4u32.to_le_bytes());
    header[12..16].copy_from_slice(&1u32.to_le_bytes());

    if let Some(backing) = backing {
        let features: u64 = if raw_backing { 0x05 } else { 0x01 };
        header[16..24].copy_from_slice(&features.to_le_bytes());
        header[56..60].copy_from_slice(&(QED_HEADER_LENGTH as u32).to_le_bytes());
        header[60..64].copy_from_slice(&(backing.len() as u32).to_le_bytes());
        header.extend_from_slice(backing.as_bytes());
    }

    header
}

pub fn write_qcow2(
    path: impl AsRef<Path>,
    backing: Option<&str>,
    backing_format: Option<StorageFormat>,
) -> Result<(), Error> {
    let header = qcow2_header(backing, backing_format.map(<&str>::from));
    fs::write(path.as_ref(), header)
        .with_context(|| format!("Failed to write qcow2 image '{}'", path.as_ref().display()))
}

pub fn write_qed(
    path: impl AsRef<Path>,
    backing: Option<&str>,
    raw_backing: bool,
) -> Result<(), Error> {
    fs::write(path.as_ref(), qed_header(backing, raw_backing))
        .with_context(|| format!("Failed to write qed image '{}'", path.as_ref().display()))
}

use std::{
    fs::File,
    io::Read,
    path::Path,
    str::{self, FromStr},
};

use anyhow::{bail, ensure, Context, Error};
use log::{debug, trace};
use sysdefs::storage::StorageFormat;

/// How much of an image is read when inspecting its header. Backing file
/// names and header extensions must lie within this range.
pub const HEADER_MAX: u64 = 0x8000;

const QCOW2_MAGIC: [u8; 4] = *b"QFI\xfb";
const QCOW2_V2_HEADER_SIZE: usize = 72;
const QCOW2_HEADER_LENGTH_OFFSET: usize = 100;
const QCOW2_EXT_END: u32 = 0;
const QCOW2_EXT_BACKING_FORMAT: u32 = 0xE279_2ACA;

const QED_MAGIC: [u8; 4] = *b"QED\0";
const QED_FEATURES_OFFSET: usize = 16;
const QED_BACKING_OFFSET: usize = 56;
const QED_F_BACKING_FILE: u64 = 0x01;
const QED_F_BACKING_FORMAT_NO_PROBE: u64 = 0x04;

/// What an image header says about the image and its backing store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: StorageFormat,

    /// Backing locator exactly as stored in the header.
    pub backing: Option<String>,

    /// Recorded format of the backing image. [`StorageFormat::Auto`] when the
    /// header leaves it to be detected.
    pub backing_format: StorageFormat,
}

/// Detects the image format from its magic values. Unknown images are raw.
pub fn detect_format(header: &[u8]) -> StorageFormat {
    match header.get(..4) {
        Some(magic) if magic == QCOW2_MAGIC => match be_u32(header, 4) {
            Some(2 | 3) => StorageFormat::Qcow2,
            _ => StorageFormat::Raw,
        },
        Some(magic) if magic == QED_MAGIC => StorageFormat::Qed,
        _ => StorageFormat::Raw,
    }
}

/// Reads the header of the image at `path` and extracts its backing store.
///
/// When `format` is unknown it is detected from the header first.
pub fn inspect(path: impl AsRef<Path>, format: StorageFormat) -> Result<ImageInfo, Error> {
    let path = path.as_ref();
    let mut header = Vec::new();
    File::open(path)
        .with_context(|| format!("Failed to open image '{}'", path.display()))?
        .take(HEADER_MAX)
        .read_to_end(&mut header)
        .with_context(|| format!("Failed to read header of image '{}'", path.display()))?;

    trace!(
        "Read {} header bytes from image '{}'",
        header.len(),
        path.display()
    );

    let info = parse_header(&header, format)
        .with_context(|| format!("Failed to inspect image '{}'", path.display()))?;
    debug!(
        "Image '{}' is {} with backing {:?} ({})",
        path.display(),
        info.format,
        info.backing,
        info.backing_format
    );

    Ok(info)
}

/// Extracts the backing store from an image header of the given format.
pub fn parse_header(header: &[u8], format: StorageFormat) -> Result<ImageInfo, Error> {
    let format = if format.is_unknown() {
        detect_format(header)
    } else {
        format
    };

    let (backing, backing_format) = match format {
        StorageFormat::Qcow2 => parse_qcow2(header)?,
        StorageFormat::Qed => parse_qed(header)?,
        _ => (None, StorageFormat::None),
    };

    Ok(ImageInfo {
        format,
        backing,
        backing_format,
    })
}

fn parse_qcow2(header: &[u8]) -> Result<(Option<String>, StorageFormat), Error> {
    ensure!(
        header.get(..4) == Some(&QCOW2_MAGIC[..]),
        "Missing qcow2 magic"
    );

    let version = be_u32(header, 4).context("Truncated qcow2 header")?;
    let backing_offset = be_u64(header, 8).context("Truncated qcow2 header")?;
    let backing_size = be_u32(header, 16).context("Truncated qcow2 header")?;

    // An empty backing name means no backing store, like a zero offset
    if backing_offset == 0 || backing_size == 0 {
        return Ok((None, StorageFormat::None));
    }

    let backing_offset =
        usize::try_from(backing_offset).context("qcow2 backing file offset overflows")?;
    let backing = string_at(header, backing_offset, backing_size as usize)
        .context("Invalid qcow2 backing file name")?;

    let extensions_start = match version {
        2 => QCOW2_V2_HEADER_SIZE,
        3 => be_u32(header, QCOW2_HEADER_LENGTH_OFFSET)
            .context("Truncated qcow2 v3 header")? as usize,
        version => bail!("Unsupported qcow2 version {version}"),
    };

    // Extensions sit between the header and the backing file name.
    let extensions_end = if backing_offset > extensions_start {
        backing_offset
    } else {
        header.len()
    };

    let backing_format = qcow2_backing_format(header, extensions_start, extensions_end)?;
    Ok((Some(backing), backing_format))
}

fn qcow2_backing_format(
    header: &[u8],
    mut offset: usize,
    end: usize,
) -> Result<StorageFormat, Error> {
    while offset + 8 <= end {
        let (Some(kind), Some(len)) = (be_u32(header, offset), be_u32(header, offset + 4)) else {
            break;
        };
        let len = len as usize;
        let data = offset + 8;

        ensure!(
            data + len <= end,
            "qcow2 header extension at offset {offset} is truncated"
        );

        match kind {
            QCOW2_EXT_END => break,
            QCOW2_EXT_BACKING_FORMAT => {
                let name = string_at(header, data, len)?;
                return Ok(StorageFormat::from_str(&name).unwrap_or_else(|_| {
                    debug!("Unrecognized backing format '{name}', leaving it to detection");
                    StorageFormat::Auto
                }));
            }
            _ => trace!("Skipping qcow2 header extension {kind:#x}"),
        }

        offset = data + len.next_multiple_of(8);
    }

    Ok(StorageFormat::Auto)
}

fn parse_qed(header: &[u8]) -> Result<(Option<String>, StorageFormat), Error> {
    ensure!(header.get(..4) == Some(&QED_MAGIC[..]), "Missing qed magic");

    let features = le_u64(header, QED_FEATURES_OFFSET).context("Truncated qed header")?;
    if features & QED_F_BACKING_FILE == 0 {
        return Ok((None, StorageFormat::None));
    }

    let offset = le_u32(header, QED_BACKING_OFFSET).context("Truncated qed header")?;
    let size = le_u32(header, QED_BACKING_OFFSET + 4).context("Truncated qed header")?;
    if size == 0 {
        return Ok((None, StorageFormat::None));
    }

    let backing = string_at(header, offset as usize, size as usize)
        .context("Invalid qed backing file name")?;

    let backing_format = if features & QED_F_BACKING_FORMAT_NO_PROBE != 0 {
        StorageFormat::Raw
    } else {
        StorageFormat::Auto
    };

    Ok((Some(backing), backing_format))
}

/// Reads a string stored at `offset`, dropping any NUL padding.
fn string_at(header: &[u8], offset: usize, len: usize) -> Result<String, Error> {
    let bytes = header
        .get(offset..offset.saturating_add(len))
        .with_context(|| format!("{len} bytes at offset {offset} lie outside the header"))?;
    let value = str::from_utf8(bytes)
        .context("String is not valid UTF-8")?
        .trim_end_matches('\0');
    Ok(value.to_string())
}

fn bytes<const N: usize>(header: &[u8], offset: usize) -> Option<[u8; N]> {
    header.get(offset..offset + N)?.try_into().ok()
}

fn be_u32(header: &[u8], offset: usize) -> Option<u32> {
    bytes(header, offset).map(u32::from_be_bytes)
}

fn be_u64(header: &[u8], offset: usize) -> Option<u64> {
    bytes(header, offset).map(u64::from_be_bytes)
}

fn le_u32(header: &[u8], offset: usize) -> Option<u32> {
    bytes(header, offset).map(u32::from_le_bytes)
}

fn le_u64(header: &[u8], offset: usize) -> Option<u64> {
    bytes(header, offset).map(u64::from_le_bytes)
}

#[cfg(test)]
mod tests {
    use crate::testutils::image::{qcow2_header, qed_header, write_qcow2};

    use super::*;

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(b""), StorageFormat::Raw);
        assert_eq!(detect_format(b"hello world"), StorageFormat::Raw);
        assert_eq!(detect_format(&qcow2_header(None, None)), StorageFormat::Qcow2);
        assert_eq!(detect_format(&qed_header(None, false)), StorageFormat::Qed);

        // Unknown qcow2 versions are not trusted
        let mut header = qcow2_header(None, None);
        header[7] = 9;
        assert_eq!(detect_format(&header), StorageFormat::Raw);
    }

    #[test]
    fn test_parse_qcow2() {
        let info = parse_header(&qcow2_header(None, None), StorageFormat::Auto).unwrap();
        assert_eq!(
            info,
            ImageInfo {
                format: StorageFormat::Qcow2,
                backing: None,
                backing_format: StorageFormat::None,
            }
        );

        let info = parse_header(&qcow2_header(Some("raw"), None), StorageFormat::None).unwrap();
        assert_eq!(info.backing.as_deref(), Some("raw"));
        assert_eq!(info.backing_format, StorageFormat::Auto);

        let info = parse_header(
            &qcow2_header(Some("../sub/base.qcow2"), Some("qcow2")),
            StorageFormat::Qcow2,
        )
        .unwrap();
        assert_eq!(info.backing.as_deref(), Some("../sub/base.qcow2"));
        assert_eq!(info.backing_format, StorageFormat::Qcow2);

        let info =
            parse_header(&qcow2_header(Some("base"), Some("vmdk")), StorageFormat::Auto).unwrap();
        assert_eq!(info.backing_format, StorageFormat::Auto);
    }

    #[test]
    fn test_parse_qcow2_errors() {
        // Declared as qcow2 but is not
        parse_header(b"just some raw data", StorageFormat::Qcow2).unwrap_err();

        // Backing name past the end of the header
        let mut header = qcow2_header(Some("base"), None);
        header.truncate(header.len() - 2);
        parse_header(&header, StorageFormat::Qcow2).unwrap_err();
    }

    #[test]
    fn test_parse_qed() {
        let info = parse_header(&qed_header(None, false), StorageFormat::Auto).unwrap();
        assert_eq!(info.format, StorageFormat::Qed);
        assert_eq!(info.backing, None);

        let info = parse_header(&qed_header(Some("base.img"), false), StorageFormat::Auto).unwrap();
        assert_eq!(info.backing.as_deref(), Some("base.img"));
        assert_eq!(info.backing_format, StorageFormat::Auto);

        let info = parse_header(&qed_header(Some("base.img"), true), StorageFormat::Qed).unwrap();
        assert_eq!(info.backing_format, StorageFormat::Raw);
    }

    #[test]
    fn test_parse_empty_backing_name() {
        let info = parse_header(&qcow2_header(Some(""), Some("raw")), StorageFormat::Auto).unwrap();
        assert_eq!(info.format, StorageFormat::Qcow2);
        assert_eq!(info.backing, None);
        assert_eq!(info.backing_format, StorageFormat::None);

        let info = parse_header(&qed_header(Some(""), true), StorageFormat::Auto).unwrap();
        assert_eq!(info.format, StorageFormat::Qed);
        assert_eq!(info.backing, None);
        assert_eq!(info.backing_format, StorageFormat::None);
    }

    #[test]
    fn test_parse_raw() {
        let info = parse_header(&qcow2_header(Some("base"), None), StorageFormat::Raw).unwrap();
        assert_eq!(info.format, StorageFormat::Raw);
        assert_eq!(info.backing, None);
    }

    #[test]
    fn test_inspect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("top.qcow2");
        write_qcow2(&path, Some("base.qcow2"), Some(StorageFormat::Qcow2)).unwrap();

        let info = inspect(&path, StorageFormat::Auto).unwrap();
        assert_eq!(info.format, StorageFormat::Qcow2);
        assert_eq!(info.backing.as_deref(), Some("base.qcow2"));
        assert_eq!(info.backing_format, StorageFormat::Qcow2);

        inspect(dir.path().join("missing"), StorageFormat::Auto).unwrap_err();
    }
}

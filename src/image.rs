use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::chip;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFormat {
    /// Pick by file extension (`.hex`/`.ihex` => Intel HEX, anything else => raw).
    #[default]
    Auto,
    Bin,
    IntelHex,
}

impl ImageFormat {
    fn resolve(self, path: &Path) -> ImageFormat {
        match self {
            ImageFormat::Auto => {
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.to_ascii_lowercase());
                match ext.as_deref() {
                    Some("hex") | Some("ihex") => ImageFormat::IntelHex,
                    _ => ImageFormat::Bin,
                }
            }
            other => other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub format: ImageFormat,
    /// Flash offset of a raw binary. Ignored for Intel HEX.
    pub address: u32,
    pub flash_size: u32,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            format: ImageFormat::Auto,
            address: 0,
            flash_size: chip::DEFAULT_FLASH_SIZE,
        }
    }
}

/// Contiguous flash image starting at `address`.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    pub data: Vec<u8>,
    pub address: u32,
    pub sha256: [u8; chip::SHA256_LEN],
}

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("io: {0}")]
    Io(io::Error),

    #[error(
        "input is not a text Intel HEX file (invalid UTF-8 at line {line_no}); did you mean --format bin?"
    )]
    NotText { line_no: usize },

    #[error("invalid hex line {line_no}: {msg}")]
    InvalidLine { line_no: usize, msg: String },

    #[error("invalid checksum at line {line_no}")]
    InvalidChecksum { line_no: usize },

    #[error("address overflow at line {line_no}")]
    AddressOverflow { line_no: usize },

    #[error("image is empty")]
    Empty,

    #[error("image does not fit in flash: 0x{address:08X}+{len} > {flash_size} bytes")]
    TooLarge {
        address: u32,
        len: usize,
        flash_size: u32,
    },
}

impl FirmwareImage {
    pub fn load(path: &Path, opts: &LoadOptions) -> Result<Self, ImageError> {
        let (address, data) = match opts.format.resolve(path) {
            ImageFormat::IntelHex => load_intel_hex(path, opts.flash_size)?,
            _ => (opts.address, fs::read(path).map_err(ImageError::Io)?),
        };
        Self::from_bytes(address, data, opts.flash_size)
    }

    pub fn from_bytes(address: u32, data: Vec<u8>, flash_size: u32) -> Result<Self, ImageError> {
        if data.is_empty() {
            return Err(ImageError::Empty);
        }
        let end = address as u64 + data.len() as u64;
        if end > flash_size as u64 {
            return Err(ImageError::TooLarge {
                address,
                len: data.len(),
                flash_size,
            });
        }

        let sha256: [u8; chip::SHA256_LEN] = Sha256::digest(&data).into();
        Ok(Self {
            data,
            address,
            sha256,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sha256_hex(&self) -> String {
        hex::encode(self.sha256)
    }

    /// Sector-aligned erase range covering the image, end inclusive.
    pub fn erase_range(&self) -> (u32, u32) {
        let sector = chip::FLASH_SECTOR_SIZE as u64;
        let start = self.address as u64 / sector * sector;
        let end = self.address as u64 + self.data.len() as u64;
        let end = (end.div_ceil(sector) * sector - 1).min(u32::MAX as u64);
        (start as u32, end as u32)
    }

    /// `(offset, chunk)` pairs of at most `max` bytes, offsets relative to `address`.
    pub fn chunks(&self, max: usize) -> impl Iterator<Item = (usize, &[u8])> {
        let max = max.max(1);
        self.data
            .chunks(max)
            .enumerate()
            .map(move |(i, c)| (i * max, c))
    }
}

fn load_intel_hex(path: &Path, flash_size: u32) -> Result<(u32, Vec<u8>), ImageError> {
    let f = File::open(path).map_err(ImageError::Io)?;
    let r = BufReader::new(f);

    let mut records: Vec<(u32, Vec<u8>)> = Vec::new();
    let mut ext_addr: u32 = 0;

    for (line_no, line) in r.lines().enumerate() {
        let line_no = line_no + 1;
        let line = match line {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(ImageError::NotText { line_no });
            }
            Err(e) => return Err(ImageError::Io(e)),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(body) = line.strip_prefix(':') else {
            return Err(ImageError::InvalidLine {
                line_no,
                msg: "missing ':' prefix".to_string(),
            });
        };

        let bytes = hex::decode(body).map_err(|e| ImageError::InvalidLine {
            line_no,
            msg: e.to_string(),
        })?;
        if bytes.len() < 5 {
            return Err(ImageError::InvalidLine {
                line_no,
                msg: "record too short".to_string(),
            });
        }

        let len = bytes[0] as usize;
        let addr = u16::from_be_bytes([bytes[1], bytes[2]]) as u32;
        let rec_type = bytes[3];
        if bytes.len() != 5 + len {
            return Err(ImageError::InvalidLine {
                line_no,
                msg: format!(
                    "bad length (expected {} bytes after ':', got {})",
                    2 * (5 + len),
                    2 * bytes.len()
                ),
            });
        }

        let payload = &bytes[4..4 + len];
        if bytes[4 + len] != checksum_ihex(&bytes[..4 + len]) {
            return Err(ImageError::InvalidChecksum { line_no });
        }

        match rec_type {
            0x00 => {
                let abs = ext_addr
                    .checked_add(addr)
                    .ok_or(ImageError::AddressOverflow { line_no })?;
                let abs = map_xip_addr(abs, flash_size);
                abs.checked_add(len as u32)
                    .ok_or(ImageError::AddressOverflow { line_no })?;
                records.push((abs, payload.to_vec()));
            }
            0x01 => break,
            0x02 | 0x04 if len != 2 => {
                return Err(ImageError::InvalidLine {
                    line_no,
                    msg: format!("address record type {rec_type:02X} needs 2 data bytes, got {len}"),
                });
            }
            0x02 => {
                ext_addr = (u16::from_be_bytes([payload[0], payload[1]]) as u32) << 4;
            }
            0x04 => {
                ext_addr = (u16::from_be_bytes([payload[0], payload[1]]) as u32) << 16;
            }
            _ => {}
        }
    }

    let start = records.iter().map(|(a, _)| *a).min().ok_or(ImageError::Empty)?;
    let end = records
        .iter()
        .map(|(a, d)| *a as u64 + d.len() as u64)
        .max()
        .unwrap_or(start as u64);
    let span = (end - start as u64) as usize;
    if end > flash_size as u64 {
        return Err(ImageError::TooLarge {
            address: start,
            len: span,
            flash_size,
        });
    }

    let mut data = vec![0xFFu8; span];
    for (a, d) in records {
        let off = (a - start) as usize;
        data[off..off + d.len()].copy_from_slice(&d);
    }
    Ok((start, data))
}

/// HEX files linked for XIP carry bus addresses; map them back to flash offsets.
fn map_xip_addr(addr: u32, flash_size: u32) -> u32 {
    if addr >= chip::FLASH_XIP_BASE && addr - chip::FLASH_XIP_BASE < flash_size {
        addr - chip::FLASH_XIP_BASE
    } else {
        addr
    }
}

fn checksum_ihex(bytes: &[u8]) -> u8 {
    let sum: u8 = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    (!sum).wrapping_add(1)
}

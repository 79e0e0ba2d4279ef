//! Cartridge image parsing
//!
//! An iNES file is a 16 byte header, an optional 512 byte trainer, then the
//! PRG-ROM banks (16 KiB units) and CHR-ROM banks (8 KiB units). CHR is kept
//! internally as 4 KiB half-banks because that is the granularity the
//! switching hardware works in.

use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use thiserror::Error;

/// iNES header size
pub const HEADER_SIZE: usize = 16;
/// PRG-ROM bank size (16 KiB)
pub const PRG_BANK_SIZE: usize = 16 * 1024;
/// CHR half-bank size (4 KiB)
pub const CHR_BANK_SIZE: usize = 4 * 1024;
/// Battery-backed save RAM size (8 KiB)
pub const SAVE_RAM_SIZE: usize = 8 * 1024;

/// Nametable mirroring arrangement selected by the header or the mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mirroring {
    Horizontal,
    Vertical,
    FourScreen,
    /// Single-screen, first nametable
    SingleScreen0,
    /// Single-screen, second nametable
    SingleScreen1,
}

/// Cartridge load failures. A failed load leaves no partial state behind.
#[derive(Debug, Error)]
pub enum CartridgeError {
    #[error("not an iNES image (bad magic)")]
    BadMagic,
    #[error("image truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unsupported mapper {id} ({name})")]
    UnsupportedMapper { id: u8, name: &'static str },
}

/// Human-readable name for a mapper number, `""` when undocumented.
pub fn mapper_name(id: u8) -> &'static str {
    match id {
        0 => "NROM",
        1 => "Nintendo MMC1",
        2 => "UxROM",
        3 => "CNROM",
        4 => "Nintendo MMC3",
        5 => "Nintendo MMC5",
        7 => "AxROM",
        9 => "Nintendo MMC2",
        10 => "Nintendo MMC4",
        11 => "Color Dreams",
        18 => "Jaleco SS8806",
        19 => "Namcot 106",
        64 => "Tengen RAMBO-1",
        66 => "GxROM",
        69 => "Sunsoft FME-7",
        71 => "Camerica",
        85 => "Konami VRC7",
        198 => "iNES Mapper #198",
        _ => "",
    }
}

/// Whitelist of mapper numbers this core emulates.
pub fn mapper_supported(id: u8) -> bool {
    matches!(id, 0 | 1 | 2 | 3 | 4 | 7 | 9 | 11 | 18 | 198)
}

/// A parsed, immutable cartridge image.
#[derive(Debug, Clone)]
pub struct Cartridge {
    /// Number of 16 KiB PRG-ROM banks
    prg_count: usize,
    /// Number of 4 KiB CHR half-banks (twice the header's 8 KiB count)
    chr_count: usize,
    prg: Vec<u8>,
    chr: Vec<u8>,
    chr_is_ram: bool,
    mirroring: Mirroring,
    battery: bool,
    trainer: bool,
    mapper_id: u8,
    /// SHA-256 of the whole image, hex encoded; save-file key
    hash: String,
}

impl Cartridge {
    /// Parse an iNES image. The mapper whitelist is not consulted here;
    /// that happens when the mapper is instantiated.
    pub fn from_ines(data: &[u8]) -> Result<Self, CartridgeError> {
        if data.len() < HEADER_SIZE || data[0..4] != [b'N', b'E', b'S', 0x1A] {
            return Err(CartridgeError::BadMagic);
        }
        let header = &data[..HEADER_SIZE];

        let prg_count = header[4] as usize;
        let chr_count = header[5] as usize * 2;
        let four_screen = header[6] & 0x08 != 0;
        let mirroring = if four_screen {
            Mirroring::FourScreen
        } else if header[6] & 0x01 != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };
        let battery = header[6] & 0x02 != 0;
        let trainer = header[6] & 0x04 != 0;

        let mut mapper_id = (header[6] >> 4) | (header[7] & 0xF0);
        // Legacy dumps store junk in bytes 8-15; byte 7 cannot be trusted then.
        if header[8..16].iter().any(|&b| b != 0) {
            mapper_id &= 0x0F;
        }

        let prg_offset = HEADER_SIZE + if trainer { 512 } else { 0 };
        let prg_len = prg_count * PRG_BANK_SIZE;
        let chr_len = chr_count * CHR_BANK_SIZE;
        let expected = prg_offset + prg_len + chr_len;
        if data.len() < expected {
            return Err(CartridgeError::Truncated {
                expected,
                actual: data.len(),
            });
        }

        let prg = data[prg_offset..prg_offset + prg_len].to_vec();
        let chr_is_ram = chr_count == 0;
        let (chr, chr_count) = if chr_is_ram {
            // No CHR-ROM means the board carries 8 KiB of CHR-RAM instead.
            (vec![0u8; 2 * CHR_BANK_SIZE], 2)
        } else {
            let base = prg_offset + prg_len;
            (data[base..base + chr_len].to_vec(), chr_count)
        };

        let mut hasher = Sha256::new();
        hasher.update(data);
        let hash = to_hex(&hasher.finalize());

        log::debug!(
            "cartridge: prg={}K chr={}K mapper={} ({}) mirroring={:?} battery={}",
            prg_count * 16,
            chr_count * 4,
            mapper_id,
            mapper_name(mapper_id),
            mirroring,
            battery,
        );

        Ok(Self {
            prg_count,
            chr_count,
            prg,
            chr,
            chr_is_ram,
            mirroring,
            battery,
            trainer,
            mapper_id,
            hash,
        })
    }

    pub fn prg_bank_count(&self) -> usize {
        self.prg_count
    }

    /// Number of 4 KiB CHR half-banks.
    pub fn chr_bank_count(&self) -> usize {
        self.chr_count
    }

    pub fn prg(&self) -> &[u8] {
        &self.prg
    }

    pub fn chr(&self) -> &[u8] {
        &self.chr
    }

    pub fn chr_mut(&mut self) -> &mut [u8] {
        &mut self.chr
    }

    pub fn chr_is_ram(&self) -> bool {
        self.chr_is_ram
    }

    pub fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    pub fn has_battery(&self) -> bool {
        self.battery
    }

    pub fn has_trainer(&self) -> bool {
        self.trainer
    }

    pub fn mapper_id(&self) -> u8 {
        self.mapper_id
    }

    /// Hex SHA-256 of the image, the save-file key.
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

/// Lowercase hex rendering of a byte slice.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

//! Chip family abstraction for the EZ-USB line.
//!
//! Each family is described by an immutable [`DeviceProfile`]: where its
//! CPU control register lives, which address ranges are on-chip RAM that the
//! silicon itself can write while the CPU is held in reset, and how its boot
//! EEPROM header is laid out.

use std::fmt;
use std::ops::Range;

/// Largest payload the EZ-USB boot EEPROM record format can describe (10 bits).
pub const EEPROM_MAX_RECORD: usize = 1023;

/// Default maximum bytes per control write.
pub const DEFAULT_CHUNK_SIZE: usize = 1023;

/// AN21xx/FX CPU control and status register.
pub const CPUCS_AN21: u32 = 0x7F92;

/// FX2/FX2LP CPU control and status register.
pub const CPUCS_FX2: u32 = 0xE600;

/// Supported microcontroller families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ChipFamily {
    /// Original Anchor Chips AN21xx parts.
    An21,
    /// Cypress EZ-USB FX (AN21 compatible for most purposes).
    #[default]
    Fx,
    /// Cypress EZ-USB FX2 (CY7C68013).
    Fx2,
    /// Cypress EZ-USB FX2LP (CY7C68013A and relatives).
    Fx2Lp,
}

impl ChipFamily {
    /// All families, in token order.
    pub const ALL: [Self; 4] = [Self::An21, Self::Fx, Self::Fx2, Self::Fx2Lp];

    /// Get the chip family from its type token.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "an21" => Some(Self::An21),
            "fx" => Some(Self::Fx),
            "fx2" => Some(Self::Fx2),
            "fx2lp" => Some(Self::Fx2Lp),
            _ => None,
        }
    }

    /// Short type token (`an21`, `fx`, `fx2`, `fx2lp`).
    pub fn token(&self) -> &'static str {
        match self {
            Self::An21 => "an21",
            Self::Fx => "fx",
            Self::Fx2 => "fx2",
            Self::Fx2Lp => "fx2lp",
        }
    }

    /// Get the download profile for this family.
    pub fn profile(&self) -> &'static DeviceProfile {
        match self {
            Self::An21 => &AN21_PROFILE,
            Self::Fx => &FX_PROFILE,
            Self::Fx2 => &FX2_PROFILE,
            Self::Fx2Lp => &FX2LP_PROFILE,
        }
    }
}

impl fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::An21 => write!(f, "AN21"),
            Self::Fx => write!(f, "FX"),
            Self::Fx2 => write!(f, "FX2"),
            Self::Fx2Lp => write!(f, "FX2LP"),
        }
    }
}

/// Download parameters for one microcontroller family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Family this profile describes.
    pub family: ChipFamily,
    /// Maximum bytes per control write (0 = unlimited).
    pub chunk_size: usize,
    /// Address of the CPU control register.
    pub reset_register_address: u32,
    /// Value that holds the CPU in reset.
    pub reset_assert_value: u8,
    /// Value that lets the CPU run.
    pub reset_release_value: u8,
    /// Whether a boot EEPROM can be programmed through a loader.
    pub supports_eeprom: bool,
    /// Whether the EEPROM boot header carries a config byte.
    pub eeprom_config_byte_supported: bool,
    /// First byte of the EEPROM boot header.
    pub eeprom_boot_marker: u8,
    /// Bits of the config byte the part honours.
    pub eeprom_config_mask: u8,
    /// On-chip RAM ranges writable while the CPU is in reset.
    pub internal_ram: &'static [Range<u32>],
}

impl DeviceProfile {
    /// Maximum bytes per write, with 0 meaning no limit.
    pub fn max_chunk(&self) -> usize {
        if self.chunk_size == 0 {
            usize::MAX
        } else {
            self.chunk_size
        }
    }

    /// Whether `[address, address + len)` lies entirely inside on-chip RAM.
    pub fn is_internal(&self, address: u32, len: usize) -> bool {
        let start = u64::from(address);
        let end = start + len as u64;
        self.internal_ram
            .iter()
            .any(|w| u64::from(w.start) <= start && end <= u64::from(w.end))
    }

    /// First RAM window edge strictly after `address`, if any.
    ///
    /// Writes are split at these edges so every transfer is either wholly
    /// on-chip or wholly external.
    pub fn next_window_edge(&self, address: u32) -> Option<u32> {
        self.internal_ram
            .iter()
            .flat_map(|w| [w.start, w.end])
            .filter(|&edge| edge > address)
            .min()
    }

    /// Length of the EEPROM boot header (marker, VID, PID, DID, config).
    pub fn eeprom_header_len(&self) -> usize {
        if self.eeprom_config_byte_supported { 8 } else { 7 }
    }
}

/// AN21xx: 8 KiB parts, only 0x0000-0x1B3F is safe to load.
pub static AN21_PROFILE: DeviceProfile = DeviceProfile {
    family: ChipFamily::An21,
    chunk_size: DEFAULT_CHUNK_SIZE,
    reset_register_address: CPUCS_AN21,
    reset_assert_value: 0x01,
    reset_release_value: 0x00,
    supports_eeprom: true,
    eeprom_config_byte_supported: false,
    eeprom_boot_marker: 0xB2,
    eeprom_config_mask: 0x00,
    internal_ram: &[0x0000..0x1B40],
};

/// FX: same memory map as AN21, adds a config byte.
pub static FX_PROFILE: DeviceProfile = DeviceProfile {
    family: ChipFamily::Fx,
    chunk_size: DEFAULT_CHUNK_SIZE,
    reset_register_address: CPUCS_AN21,
    reset_assert_value: 0x01,
    reset_release_value: 0x00,
    supports_eeprom: true,
    eeprom_config_byte_supported: true,
    eeprom_boot_marker: 0xB6,
    eeprom_config_mask: 0x07,
    internal_ram: &[0x0000..0x1B40],
};

/// FX2: 8 KiB code/data plus 512 bytes of data RAM at 0xE000.
pub static FX2_PROFILE: DeviceProfile = DeviceProfile {
    family: ChipFamily::Fx2,
    chunk_size: DEFAULT_CHUNK_SIZE,
    reset_register_address: CPUCS_FX2,
    reset_assert_value: 0x01,
    reset_release_value: 0x00,
    supports_eeprom: true,
    eeprom_config_byte_supported: true,
    eeprom_boot_marker: 0xC2,
    eeprom_config_mask: 0x4F,
    internal_ram: &[0x0000..0x2000, 0xE000..0xE200],
};

/// FX2LP: 16 KiB code/data plus 512 bytes of data RAM at 0xE000.
pub static FX2LP_PROFILE: DeviceProfile = DeviceProfile {
    family: ChipFamily::Fx2Lp,
    chunk_size: DEFAULT_CHUNK_SIZE,
    reset_register_address: CPUCS_FX2,
    reset_assert_value: 0x01,
    reset_release_value: 0x00,
    supports_eeprom: true,
    eeprom_config_byte_supported: true,
    eeprom_boot_marker: 0xC2,
    eeprom_config_mask: 0x4F,
    internal_ram: &[0x0000..0x4000, 0xE000..0xE200],
};

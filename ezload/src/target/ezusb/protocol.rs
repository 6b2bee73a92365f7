//! EZ-USB vendor request protocol.
//!
//! All requests are vendor OUT control transfers to the device. The target
//! address travels in the setup packet: `wValue` carries the low 16 bits and
//! `wIndex` the high 16 bits.
//!
//! ## Requests
//!
//! | Request | Handled by | Purpose |
//! |---------|------------|---------|
//! | `0xA0`  | silicon    | read/write on-chip RAM and the CPUCS register |
//! | `0xA2`  | loader     | write the boot EEPROM |
//! | `0xA3`  | loader     | write external memory |
//!
//! ## Boot EEPROM image
//!
//! ```text
//! +--------+---------+---------+---------+--------+
//! | marker | VID(le) | PID(le) | DID(le) | config |   7 or 8 bytes
//! +--------+---------+---------+---------+--------+
//! | len(be) | addr(be) | data...                  |   one record per chunk
//! +---------+----------+--------------------------+
//! | 0x80 0x01 | CPUCS(be) | release value         |   final record
//! +-----------+-----------+-----------------------+
//! ```

use crate::error::{Error, Result};
use crate::image::segment::Segment;
use crate::target::chip::{DeviceProfile, EEPROM_MAX_RECORD};
use byteorder::{BigEndian, LittleEndian, WriteBytesExt};

/// Write on-chip RAM (and CPUCS). Implemented in silicon.
pub const RW_INTERNAL: u8 = 0xA0;

/// Write the boot EEPROM. Needs a second-stage loader.
pub const RW_EEPROM: u8 = 0xA2;

/// Write external memory. Needs a second-stage loader.
pub const RW_MEMORY: u8 = 0xA3;

/// Flag in the high length byte marking the last EEPROM record.
pub const EEPROM_LAST_RECORD: u16 = 0x8000;

/// One control write worth of firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// Absolute target address.
    pub address: u32,
    /// Bytes to write.
    pub data: &'a [u8],
    /// Whether the chunk lies inside on-chip RAM.
    pub internal: bool,
}

/// Split segments into chunks of at most `max_len` bytes.
///
/// Chunks are also cut at every RAM window edge of `profile`, so each one is
/// wholly on-chip or wholly external. Order follows the segments, then
/// increasing address within each segment.
pub fn split_segments<'a>(
    segments: &'a [Segment],
    profile: &DeviceProfile,
    max_len: usize,
) -> Vec<Chunk<'a>> {
    let max_len = max_len.max(1);
    let mut chunks = Vec::new();

    for segment in segments {
        let mut address = segment.base_address;
        let mut rest = segment.bytes.as_slice();

        while !rest.is_empty() {
            let mut take = rest.len().min(max_len);
            if let Some(edge) = profile.next_window_edge(address) {
                take = take.min((edge - address) as usize);
            }

            let (head, tail) = rest.split_at(take);
            chunks.push(Chunk {
                address,
                data: head,
                internal: profile.is_internal(address, take),
            });

            address = address.wrapping_add(take as u32);
            rest = tail;
        }
    }

    chunks
}

/// Header of one EEPROM load record.
pub fn eeprom_record_header(len: usize, address: u32, last: bool) -> Result<[u8; 4]> {
    if len > EEPROM_MAX_RECORD || address > u32::from(u16::MAX) {
        return Err(Error::AddressOutOfRange { address, len });
    }

    let mut length = len as u16;
    if last {
        length |= EEPROM_LAST_RECORD;
    }

    let mut header = [0u8; 4];
    let mut cursor = &mut header[..];
    cursor.write_u16::<BigEndian>(length)?;
    cursor.write_u16::<BigEndian>(address as u16)?;
    Ok(header)
}

/// Boot header written at EEPROM offset 0 once all records are in place.
///
/// IDs are stored little-endian. The config byte is masked to the bits the
/// family honours; families without a config byte get a 7-byte header.
pub fn eeprom_boot_header(
    profile: &DeviceProfile,
    vid: u16,
    pid: u16,
    bcd_device: u16,
    config: u8,
) -> Result<Vec<u8>> {
    let mut header = Vec::with_capacity(profile.eeprom_header_len());
    header.push(profile.eeprom_boot_marker);
    header.write_u16::<LittleEndian>(vid)?;
    header.write_u16::<LittleEndian>(pid)?;
    header.write_u16::<LittleEndian>(bcd_device)?;
    if profile.eeprom_config_byte_supported {
        header.push(config & profile.eeprom_config_mask);
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::chip::{ChipFamily, DeviceProfile};

    #[test]
    fn test_split_130_bytes_by_64() {
        let profile = DeviceProfile {
            chunk_size: 64,
            ..*ChipFamily::Fx2.profile()
        };
        let segments = [Segment::new(0x0100, vec![0xAB; 130])];
        let chunks = split_segments(&segments, &profile, profile.max_chunk());

        let sizes: Vec<usize> = chunks.iter().map(|c| c.data.len()).collect();
        assert_eq!(sizes, vec![64, 64, 2]);
        let addrs: Vec<u32> = chunks.iter().map(|c| c.address).collect();
        assert_eq!(addrs, vec![0x0100, 0x0140, 0x0180]);
        assert!(chunks.iter().all(|c| c.internal));
    }

    #[test]
    fn test_split_at_window_edge() {
        let profile = ChipFamily::Fx2.profile();
        let segments = [Segment::new(0x1FF0, vec![0; 0x20])];
        let chunks = split_segments(&segments, profile, 1023);

        assert_eq!(chunks.len(), 2);
        assert_eq!((chunks[0].address, chunks[0].data.len()), (0x1FF0, 0x10));
        assert!(chunks[0].internal);
        assert_eq!((chunks[1].address, chunks[1].data.len()), (0x2000, 0x10));
        assert!(!chunks[1].internal);
    }

    #[test]
    fn test_split_unlimited_chunk() {
        let profile = DeviceProfile {
            chunk_size: 0,
            ..*ChipFamily::Fx2Lp.profile()
        };
        let segments = [Segment::new(0, vec![1; 5000])];
        let chunks = split_segments(&segments, &profile, profile.max_chunk());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data.len(), 5000);
    }

    #[test]
    fn test_eeprom_record_header() {
        assert_eq!(
            eeprom_record_header(0x10, 0x0123, false).unwrap(),
            [0x00, 0x10, 0x01, 0x23]
        );
        assert_eq!(
            eeprom_record_header(1, 0xE600, true).unwrap(),
            [0x80, 0x01, 0xE6, 0x00]
        );
        assert!(eeprom_record_header(1024, 0, false).is_err());
        assert!(eeprom_record_header(1, 0x1_0000, false).is_err());
    }

    #[test]
    fn test_eeprom_boot_header_fx2() {
        let header =
            eeprom_boot_header(ChipFamily::Fx2.profile(), 0x04B4, 0x8613, 0xA001, 0xFF).unwrap();
        assert_eq!(header, vec![0xC2, 0xB4, 0x04, 0x13, 0x86, 0x01, 0xA0, 0x4F]);
    }

    #[test]
    fn test_eeprom_boot_header_an21_has_no_config() {
        let header =
            eeprom_boot_header(ChipFamily::An21.profile(), 0x0547, 0x2131, 0x0001, 0x07).unwrap();
        assert_eq!(header, vec![0xB2, 0x47, 0x05, 0x31, 0x21, 0x01, 0x00]);
    }
}

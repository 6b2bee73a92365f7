//! Intel HEX record parsing.
//!
//! ## Record Layout
//!
//! ```text
//! :LLAAAATT<data...>CC
//!  |  |   | |        |
//!  |  |   | |        +-- checksum (two's complement of the byte sum)
//!  |  |   | +----------- payload, LL bytes
//!  |  |   +------------- record type
//!  |  +----------------- 16-bit address, big-endian
//!  +-------------------- payload byte count
//! ```
//!
//! Every field is written as pairs of hex digits. The checksum covers all
//! preceding bytes of the record, so summing the whole record modulo 256
//! yields zero.

use crate::error::RecordError;
use std::fmt::Write as _;

/// Start code that begins every record.
pub const START_CODE: char = ':';

/// Bytes in a record that are not payload (count, address x2, type, checksum).
const OVERHEAD: usize = 5;

/// Intel HEX record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// `00`: payload bytes at the record address.
    Data,
    /// `01`: end of file.
    EndOfFile,
    /// `02`: extended segment address (payload << 4).
    ExtendedSegmentAddress,
    /// `04`: extended linear address (payload << 16).
    ExtendedLinearAddress,
    /// Any other type (start addresses, vendor records). Ignored.
    Other(u8),
}

impl From<u8> for RecordType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Data,
            0x01 => Self::EndOfFile,
            0x02 => Self::ExtendedSegmentAddress,
            0x04 => Self::ExtendedLinearAddress,
            other => Self::Other(other),
        }
    }
}

impl RecordType {
    /// Get the numeric type tag.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Data => 0x00,
            Self::EndOfFile => 0x01,
            Self::ExtendedSegmentAddress => 0x02,
            Self::ExtendedLinearAddress => 0x04,
            Self::Other(v) => v,
        }
    }
}

/// One parsed line of an Intel HEX file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    /// Record type.
    pub record_type: RecordType,
    /// 16-bit offset from the current base address.
    pub address: u16,
    /// Payload bytes.
    pub payload: Vec<u8>,
    checksum: u8,
}

impl HexRecord {
    /// Build a record with a freshly computed checksum.
    pub fn new(record_type: RecordType, address: u16, payload: Vec<u8>) -> Self {
        let mut record = Self {
            record_type,
            address,
            payload,
            checksum: 0,
        };
        record.checksum = record.compute_checksum();
        record
    }

    /// Data record.
    pub fn data(address: u16, payload: &[u8]) -> Self {
        Self::new(RecordType::Data, address, payload.to_vec())
    }

    /// End-of-file record.
    pub fn end_of_file() -> Self {
        Self::new(RecordType::EndOfFile, 0, Vec::new())
    }

    /// Extended linear address record selecting the upper 16 address bits.
    pub fn extended_linear(upper: u16) -> Self {
        Self::new(
            RecordType::ExtendedLinearAddress,
            0,
            upper.to_be_bytes().to_vec(),
        )
    }

    /// Parse one line of text.
    ///
    /// Trailing whitespace (including `\r`) is ignored. Any structural
    /// problem or checksum mismatch rejects the whole record.
    pub fn parse(line: &str) -> Result<Self, RecordError> {
        let line = line.trim_end();
        let body = line
            .strip_prefix(START_CODE)
            .ok_or(RecordError::MissingStartMarker)?;

        if body.len() % 2 != 0 {
            return Err(RecordError::OddDigitCount);
        }

        let bytes = decode_hex(body)?;
        if bytes.len() < OVERHEAD {
            return Err(RecordError::Truncated);
        }

        let count = usize::from(bytes[0]);
        let expected_len = count + OVERHEAD;
        if bytes.len() < expected_len {
            return Err(RecordError::Truncated);
        }
        if bytes.len() > expected_len {
            return Err(RecordError::TrailingData);
        }

        let actual = bytes[expected_len - 1];
        let expected = checksum(&bytes[..expected_len - 1]);
        if actual != expected {
            return Err(RecordError::ChecksumMismatch { expected, actual });
        }

        let record_type = RecordType::from(bytes[3]);
        let payload = bytes[4..4 + count].to_vec();

        if matches!(
            record_type,
            RecordType::ExtendedSegmentAddress | RecordType::ExtendedLinearAddress
        ) && payload.len() != 2
        {
            return Err(RecordError::BadAddressRecord);
        }

        Ok(Self {
            record_type,
            address: u16::from_be_bytes([bytes[1], bytes[2]]),
            payload,
            checksum: actual,
        })
    }

    /// Whether the stored checksum matches the record contents.
    pub fn checksum_valid(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Base address selected by an extended address record.
    ///
    /// Returns `None` for every other record type.
    pub fn extended_offset(&self) -> Option<u32> {
        let value = match self.payload.as_slice() {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            _ => return None,
        };
        match self.record_type {
            RecordType::ExtendedSegmentAddress => Some(value << 4),
            RecordType::ExtendedLinearAddress => Some(value << 16),
            _ => None,
        }
    }

    /// Format the record as a line of text (without line terminator).
    pub fn to_line(&self) -> String {
        let mut line = String::with_capacity(1 + 2 * (self.payload.len() + OVERHEAD));
        line.push(START_CODE);
        for byte in self.header_bytes().iter().chain(&self.payload) {
            let _ = write!(line, "{byte:02X}");
        }
        let _ = write!(line, "{:02X}", self.checksum);
        line
    }

    fn header_bytes(&self) -> [u8; 4] {
        let [hi, lo] = self.address.to_be_bytes();
        [self.payload.len() as u8, hi, lo, self.record_type.as_u8()]
    }

    fn compute_checksum(&self) -> u8 {
        let header = self.header_bytes();
        let sum = header
            .iter()
            .chain(&self.payload)
            .fold(0u8, |acc, b| acc.wrapping_add(*b));
        sum.wrapping_neg()
    }
}

/// Two's complement of the byte sum, modulo 256.
fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
        .wrapping_neg()
}

fn decode_hex(digits: &str) -> Result<Vec<u8>, RecordError> {
    digits
        .as_bytes()
        .chunks_exact(2)
        .map(|pair| {
            let hi = hex_value(pair[0])?;
            let lo = hex_value(pair[1])?;
            Ok((hi << 4) | lo)
        })
        .collect()
}

fn hex_value(digit: u8) -> Result<u8, RecordError> {
    char::from(digit)
        .to_digit(16)
        .map(|v| v as u8)
        .ok_or(RecordError::InvalidDigit)
}

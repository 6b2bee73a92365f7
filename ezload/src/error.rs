//! Error types for ezload.

use std::io;
use thiserror::Error;

/// Result type for ezload operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ezload operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (firmware files, readers).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// libusb error reported by the native transport.
    #[cfg(feature = "native")]
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// A line of the Intel HEX image could not be parsed.
    #[error("Malformed record on line {line}: {kind}")]
    MalformedRecord {
        /// 1-based line number in the source text.
        line: usize,
        /// What was wrong with the record.
        kind: RecordError,
    },

    /// The image ended without an end-of-file record.
    #[error("Truncated image: no end-of-file record")]
    TruncatedImage,

    /// Two data records cover the same address.
    #[error("Overlapping data at 0x{address:08X}")]
    OverlappingData {
        /// First address written twice.
        address: u32,
    },

    /// No device matched the selection criteria.
    #[error("Device not found")]
    DeviceNotFound,

    /// More than one device matched the selection criteria.
    #[error("Ambiguous device selection: {0}")]
    AmbiguousDevice(String),

    /// The requested operation is not available for this device.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Firmware touches memory that cannot be written in the current pass.
    #[error("Cannot write {len} bytes at 0x{address:08X}: outside writable memory")]
    AddressOutOfRange {
        /// Start address of the offending block.
        address: u32,
        /// Length of the offending block.
        len: usize,
    },

    /// Control transfer failed.
    #[error("Transfer failed: {0}")]
    Transport(String),

    /// The device went away (usually re-enumeration after reset release).
    #[error("Device disconnected")]
    Disconnected,

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether this error means the device dropped off the bus.
    ///
    /// A freshly started firmware commonly re-enumerates with a new
    /// personality, so the final reset-release write may see this.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Disconnected => true,
            #[cfg(feature = "native")]
            Self::Usb(rusb::Error::Io | rusb::Error::NoDevice) => true,
            _ => false,
        }
    }
}

/// Reason an Intel HEX line was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecordError {
    /// Line does not begin with `:`.
    #[error("missing start marker")]
    MissingStartMarker,

    /// Odd number of hex digits after the start marker.
    #[error("odd number of hex digits")]
    OddDigitCount,

    /// Character that is not a hex digit.
    #[error("invalid hex digit")]
    InvalidDigit,

    /// Line is shorter than its byte count requires.
    #[error("truncated record")]
    Truncated,

    /// Line is longer than its byte count allows.
    #[error("trailing data after checksum")]
    TrailingData,

    /// Extended address record without a 2-byte payload.
    #[error("bad extended address record")]
    BadAddressRecord,

    /// Data runs past the end of the 32-bit address space.
    #[error("data extends beyond address 0xFFFFFFFF")]
    AddressOverflow,

    /// Checksum byte does not match the record contents.
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch {
        /// Checksum computed from the record bytes.
        expected: u8,
        /// Checksum stored in the record.
        actual: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        assert!(Error::Disconnected.is_disconnect());
        assert!(!Error::Cancelled.is_disconnect());
        assert!(!Error::Transport("stall".into()).is_disconnect());
    }

    #[cfg(feature = "native")]
    #[test]
    fn test_usb_disconnect_classification() {
        assert!(Error::Usb(rusb::Error::NoDevice).is_disconnect());
        assert!(Error::Usb(rusb::Error::Io).is_disconnect());
        assert!(!Error::Usb(rusb::Error::Pipe).is_disconnect());
    }

    #[test]
    fn test_malformed_record_message() {
        let err = Error::MalformedRecord {
            line: 3,
            kind: RecordError::ChecksumMismatch {
                expected: 0x12,
                actual: 0x13,
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("line 3"));
        assert!(msg.contains("0x12"));
    }
}

//! Firmware image formats.

pub mod ihex;
pub mod segment;

pub use ihex::{HexRecord, RecordType};
pub use segment::{FirmwareImage, Segment};

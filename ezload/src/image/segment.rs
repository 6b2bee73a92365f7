//! Firmware image reassembly.
//!
//! An Intel HEX file is turned into an ordered list of [`Segment`]s: runs of
//! bytes at contiguous absolute addresses. Records are coalesced while their
//! addresses follow on from the previous record; any gap starts a new
//! segment. Segments keep file order.

use crate::error::{Error, RecordError, Result};
use crate::image::ihex::{HexRecord, RecordType};
use log::{debug, trace};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Default payload length for generated data records.
pub const DEFAULT_RECORD_LEN: usize = 16;

/// One past the highest address an Intel HEX file can describe.
const ADDRESS_SPACE_END: u64 = 1 << 32;

/// Contiguous run of firmware bytes at an absolute address.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Segment {
    /// Absolute address of the first byte.
    pub base_address: u32,
    /// Segment contents.
    pub bytes: Vec<u8>,
}

impl Segment {
    /// Create a new segment.
    pub fn new(base_address: u32, bytes: Vec<u8>) -> Self {
        Self {
            base_address,
            bytes,
        }
    }

    /// Number of bytes in the segment.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the segment holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// One past the last address covered (may exceed `u32::MAX`).
    pub fn end(&self) -> u64 {
        u64::from(self.base_address) + self.bytes.len() as u64
    }

    fn overlaps(&self, address: u32, len: usize) -> bool {
        let start = u64::from(address);
        let end = start + len as u64;
        start < self.end() && u64::from(self.base_address) < end
    }
}

/// A parsed firmware image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareImage {
    segments: Vec<Segment>,
}

impl FirmwareImage {
    /// Build an image from already assembled segments.
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    /// Load an Intel HEX file from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading Intel HEX image from {}", path.display());
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Parse Intel HEX text held in memory.
    pub fn parse_str(text: &str) -> Result<Self> {
        Self::from_reader(text.as_bytes())
    }

    /// Parse Intel HEX text from a line-oriented reader.
    ///
    /// Blank lines and lines starting with `#` are skipped, whatever their
    /// encoding. Input after the end-of-file record is not read.
    pub fn from_reader<R: BufRead>(mut reader: R) -> Result<Self> {
        let mut offset: u32 = 0;
        let mut segments: Vec<Segment> = Vec::new();
        let mut current: Option<Segment> = None;
        let mut buf = Vec::new();
        let mut line = 0usize;

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            line += 1;

            let raw = buf.trim_ascii();
            if raw.is_empty() || raw.starts_with(b"#") {
                continue;
            }

            let malformed = |kind: RecordError| Error::MalformedRecord { line, kind };
            let text =
                std::str::from_utf8(raw).map_err(|_| malformed(RecordError::InvalidDigit))?;
            let record = HexRecord::parse(text).map_err(malformed)?;

            match record.record_type {
                RecordType::Data => {
                    if record.payload.is_empty() {
                        continue;
                    }
                    let address = offset + u32::from(record.address);
                    let len = record.payload.len();

                    if u64::from(address) + len as u64 > ADDRESS_SPACE_END {
                        return Err(malformed(RecordError::AddressOverflow));
                    }

                    if segments
                        .iter()
                        .chain(current.as_ref())
                        .any(|s| s.overlaps(address, len))
                    {
                        return Err(Error::OverlappingData { address });
                    }

                    match current.as_mut() {
                        Some(seg) if seg.end() == u64::from(address) => {
                            seg.bytes.extend_from_slice(&record.payload);
                        },
                        _ => {
                            if let Some(seg) = current.take() {
                                segments.push(seg);
                            }
                            current = Some(Segment::new(address, record.payload));
                        },
                    }
                },
                RecordType::EndOfFile => {
                    segments.extend(current.take());
                    let image = Self { segments };
                    debug!(
                        "Parsed {} segment(s), {} bytes",
                        image.segments.len(),
                        image.total_len()
                    );
                    return Ok(image);
                },
                RecordType::ExtendedSegmentAddress | RecordType::ExtendedLinearAddress => {
                    // Validated by the parser, always 2 bytes here
                    offset = record.extended_offset().unwrap_or(0);
                    trace!("Base address now 0x{offset:08X}");
                },
                RecordType::Other(tag) => {
                    trace!("Ignoring record type {tag:02X} on line {line}");
                },
            }
        }

        Err(Error::TruncatedImage)
    }

    /// Segments in file order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Total number of firmware bytes.
    pub fn total_len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    /// Whether the image carries no data at all.
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Segment::is_empty)
    }

    /// Serialize the image back to Intel HEX text.
    ///
    /// Data records carry at most `record_len` bytes (clamped to 1..=255)
    /// and never cross a 64 KiB boundary; extended linear address records
    /// are emitted whenever the upper address half changes.
    pub fn to_ihex(&self, record_len: usize) -> String {
        let record_len = record_len.clamp(1, 255);
        let mut out = String::new();
        let mut upper: u16 = 0;

        for segment in &self.segments {
            let mut address = segment.base_address;
            let mut rest = segment.bytes.as_slice();

            while !rest.is_empty() {
                let seg_upper = (address >> 16) as u16;
                if seg_upper != upper {
                    upper = seg_upper;
                    out.push_str(&HexRecord::extended_linear(upper).to_line());
                    out.push('\n');
                }

                let to_boundary = 0x1_0000 - (address & 0xFFFF) as usize;
                let take = rest.len().min(record_len).min(to_boundary);
                let (head, tail) = rest.split_at(take);

                out.push_str(&HexRecord::data(address as u16, head).to_line());
                out.push('\n');

                address = address.wrapping_add(take as u32);
                rest = tail;
            }
        }

        out.push_str(&HexRecord::end_of_file().to_line());
        out.push('\n');
        out
    }
}

//! # ezload
//!
//! A library for loading firmware into Cypress/Anchor EZ-USB microcontrollers.
//!
//! This crate provides the core functionality for downloading Intel HEX
//! firmware images into EZ-USB devices over their USB control endpoint,
//! including:
//!
//! - Intel HEX record parsing and segment reassembly
//! - Per-family device profiles (reset register, RAM windows, EEPROM format)
//! - Known VID:PID table and device auto-detection
//! - Single-stage RAM loads and two-stage loader + firmware sequencing
//! - Boot EEPROM programming through a second-stage loader
//!
//! ## Supported Chips
//!
//! - AN21xx (original Anchor Chips parts)
//! - FX (updated Cypress AN21 compatible parts)
//! - FX2 (CY7C68013)
//! - FX2LP (CY7C68013A and relatives)
//!
//! ## Features
//!
//! - `native` (default): USB access through `rusb` (libusb)
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use ezload::{ChipFamily, DeviceIdentity, DownloadEngine, DownloadTarget, FirmwareImage};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("firmware.hex")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let mut port = ezload::UsbPort::open(0x04B4, 0x8613)?;
//!         let identity = DeviceIdentity::from(port.info());
//!         let target = DownloadTarget::new(&mut port, *ChipFamily::Fx2Lp.profile(), identity);
//!
//!         let mut engine = DownloadEngine::new(target);
//!         engine.load_ram(&image, &mut |name, current, total| {
//!             println!("Loading {}: {}/{}", name, current, total);
//!         })?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod host;
pub mod image;
pub mod port;
pub mod target;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativeEnumerator, UsbPort};
pub use {
    device::{DeviceSelector, FamilySource, KnownDevice, KnownDeviceTable, ResolvedDevice},
    error::{Error, RecordError, Result},
    host::discover_devices,
    image::{
        ihex::{HexRecord, RecordType},
        segment::{FirmwareImage, Segment},
    },
    port::{ControlPort, DeviceEnumerator, UsbDeviceInfo},
    target::{
        ChipFamily, DeviceProfile,
        ezusb::flasher::{
            Destination, DeviceIdentity, DownloadEngine, DownloadPlan, DownloadState,
            DownloadTarget, RamMode,
        },
    },
};

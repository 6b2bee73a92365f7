//! Port abstraction for USB control transfers.
//!
//! The download engine only needs one capability from the USB host stack:
//! "send a vendor OUT control request with an address and a payload". This
//! module provides the `ControlPort` trait for that capability, separated
//! from device enumeration and from the native implementation.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------+     +--------------------+
//! |   DownloadEngine   |     |   DownloadEngine   |
//! +---------+----------+     +---------+----------+
//!           |                          |
//!           v                          v
//! +---------+----------+     +---------+----------+
//! |  ControlPort trait |     |  ControlPort trait |
//! +---------+----------+     +---------+----------+
//!           |                          |
//!           v                          v
//! +---------+----------+     +---------+----------+
//! |  UsbPort (rusb)    |     |  MockPort (tests)  |
//! +--------------------+     +--------------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use crate::error::Result;

/// Information about an attached USB device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UsbDeviceInfo {
    /// Bus number.
    pub bus: u8,
    /// Device address on the bus.
    pub address: u8,
    /// USB vendor ID.
    pub vid: u16,
    /// USB product ID.
    pub pid: u16,
    /// Device release number (bcdDevice).
    pub bcd_device: u16,
}

impl UsbDeviceInfo {
    /// Create info for a device identified by VID:PID only.
    pub fn new(vid: u16, pid: u16) -> Self {
        Self {
            vid,
            pid,
            ..Default::default()
        }
    }
}

/// Vendor control write capability.
///
/// Implementations block until the transfer completes or fails. A short
/// write must be reported as an error.
pub trait ControlPort {
    /// Issue a vendor OUT control request.
    ///
    /// `address` is split into `wValue` (low 16 bits) and `wIndex`
    /// (high 16 bits).
    fn control_write(&mut self, request: u8, address: u32, data: &[u8]) -> Result<()>;

    /// Human readable name of the endpoint, for log messages.
    fn name(&self) -> &str;
}

impl<P: ControlPort + ?Sized> ControlPort for &mut P {
    fn control_write(&mut self, request: u8, address: u32, data: &[u8]) -> Result<()> {
        (**self).control_write(request, address, data)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Trait for listing attached USB devices.
///
/// This is separated from `ControlPort` because it's a static operation that
/// doesn't require an open device.
pub trait DeviceEnumerator {
    /// List all attached USB devices.
    fn list_devices() -> Result<Vec<UsbDeviceInfo>>;
}

// Re-export the appropriate implementation based on features
#[cfg(feature = "native")]
pub use native::{NativeEnumerator, UsbPort};

//! Native USB implementation using the `rusb` crate.
//!
//! This module provides the control endpoint implementation for native
//! platforms (Linux, macOS, Windows) through libusb.

use {
    crate::{
        error::{Error, Result},
        port::{ControlPort, DeviceEnumerator, UsbDeviceInfo},
    },
    log::{debug, trace, warn},
    rusb::{Context, Device, DeviceHandle, Direction, Recipient, RequestType, UsbContext},
    std::time::Duration,
};

/// Default timeout for a single control transfer.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Interface claimed while loading.
const INTERFACE: u8 = 0;

/// Native USB device handle.
///
/// Opening claims interface 0; dropping releases it and closes the device.
pub struct UsbPort {
    handle: DeviceHandle<Context>,
    info: UsbDeviceInfo,
    name: String,
}

impl UsbPort {
    /// Open the first device with the given VID:PID and claim interface 0.
    pub fn open(vid: u16, pid: u16) -> Result<Self> {
        let context = Context::new()?;
        let mut handle = context
            .open_device_with_vid_pid(vid, pid)
            .ok_or(Error::DeviceNotFound)?;

        let device = handle.device();
        let info = device_info(&device)?;
        let name = format!(
            "{:04x}:{:04x} (bus {:03} addr {:03})",
            info.vid, info.pid, info.bus, info.address
        );

        Self::claim(&mut handle)?;
        debug!("Opened {name}");

        Ok(Self {
            handle,
            info,
            name,
        })
    }

    fn claim(handle: &mut DeviceHandle<Context>) -> Result<()> {
        match handle.claim_interface(INTERFACE) {
            Ok(()) => Ok(()),
            #[cfg(target_os = "linux")]
            Err(e) => {
                // Maybe we need to detach the driver
                debug!("Claim failed ({e}), detaching kernel driver");
                if let Err(e) = handle.detach_kernel_driver(INTERFACE) {
                    trace!("Detach kernel driver: {e}");
                }
                handle.claim_interface(INTERFACE)?;
                Ok(())
            },
            #[cfg(not(target_os = "linux"))]
            Err(e) => Err(e.into()),
        }
    }

    /// Descriptor information of the opened device.
    pub fn info(&self) -> &UsbDeviceInfo {
        &self.info
    }
}

impl Drop for UsbPort {
    fn drop(&mut self) {
        // The device may already have re-enumerated.
        if let Err(e) = self.handle.release_interface(INTERFACE) {
            trace!("Release interface on {}: {e}", self.name);
        }
    }
}

impl ControlPort for UsbPort {
    fn control_write(&mut self, request: u8, address: u32, data: &[u8]) -> Result<()> {
        let request_type =
            rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        trace!(
            "Control write 0x{request:02X} @ 0x{address:08X}, {} bytes",
            data.len()
        );

        let written = self.handle.write_control(
            request_type,
            request,
            (address & 0xFFFF) as u16,
            (address >> 16) as u16,
            data,
            DEFAULT_TIMEOUT,
        )?;

        if written != data.len() {
            warn!(
                "Short write at 0x{address:08X}: {written} of {} bytes",
                data.len()
            );
            return Err(Error::Transport(format!(
                "short write at 0x{address:08X}: {written} of {} bytes",
                data.len()
            )));
        }

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Native USB device enumerator.
pub struct NativeEnumerator;

impl DeviceEnumerator for NativeEnumerator {
    fn list_devices() -> Result<Vec<UsbDeviceInfo>> {
        let context = Context::new()?;
        let mut result = Vec::new();

        for device in context.devices()?.iter() {
            match device_info(&device) {
                Ok(info) => {
                    trace!(
                        "Found USB device {:04X}:{:04X} on bus {} addr {}",
                        info.vid, info.pid, info.bus, info.address
                    );
                    result.push(info);
                },
                Err(e) => debug!("Skipping device without descriptor: {e}"),
            }
        }

        Ok(result)
    }
}

fn device_info<T: UsbContext>(device: &Device<T>) -> Result<UsbDeviceInfo> {
    let descriptor = device.device_descriptor()?;
    Ok(UsbDeviceInfo {
        bus: device.bus_number(),
        address: device.address(),
        vid: descriptor.vendor_id(),
        pid: descriptor.product_id(),
        bcd_device: version_to_bcd(descriptor.device_version()),
    })
}

/// Re-encode a decoded `bcdDevice` the way it sits in the descriptor.
fn version_to_bcd(version: rusb::Version) -> u16 {
    let major = u16::from(version.major());
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | (u16::from(version.minor()) << 4)
        | u16::from(version.sub_minor())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_to_bcd() {
        assert_eq!(version_to_bcd(rusb::Version::from_bcd(0xA001)), 0xA001);
        assert_eq!(version_to_bcd(rusb::Version::from_bcd(0x0100)), 0x0100);
        assert_eq!(version_to_bcd(rusb::Version::from_bcd(0x1234)), 0x1234);
    }
}

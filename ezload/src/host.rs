//! Host-side utilities for USB device discovery.

use crate::device::{self, DeviceSelector, KnownDeviceTable, ResolvedDevice};
use crate::port::UsbDeviceInfo;

/// Discover all attached USB devices.
#[cfg(feature = "native")]
pub fn discover_devices() -> crate::Result<Vec<UsbDeviceInfo>> {
    use crate::port::{DeviceEnumerator, NativeEnumerator};
    NativeEnumerator::list_devices()
}

/// Discover all attached USB devices (unavailable without a USB backend).
#[cfg(not(feature = "native"))]
pub fn discover_devices() -> crate::Result<Vec<UsbDeviceInfo>> {
    Err(crate::Error::UnsupportedOperation(
        "USB enumeration needs the `native` feature".to_string(),
    ))
}

/// Discover attached devices listed in the known device table.
pub fn discover_known_devices(table: &KnownDeviceTable) -> crate::Result<Vec<UsbDeviceInfo>> {
    Ok(device::known_devices(table, &discover_devices()?))
}

/// Resolve a device selection against the attached devices.
///
/// Enumeration is skipped when the selector already names a VID:PID.
pub fn resolve_device(
    table: &KnownDeviceTable,
    selector: DeviceSelector,
) -> crate::Result<ResolvedDevice> {
    let devices = if selector.vid_pid.is_some() {
        Vec::new()
    } else {
        discover_devices()?
    };
    device::resolve(table, selector, &devices)
}

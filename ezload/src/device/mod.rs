//! Device identification.
//!
//! Maps USB VID:PID pairs to EZ-USB families and resolves the caller's
//! (possibly partial) device selection against the attached devices. Nothing
//! here talks to the hardware; enumeration results are passed in.

use crate::error::{Error, Result};
use crate::port::UsbDeviceInfo;
use crate::target::ChipFamily;
use log::{debug, info};

/// Built-in VID:PID pairs of parts that come up in the EZ-USB boot loader.
const KNOWN_USB_DEVICES: &[(u16, u16, ChipFamily, &str)] = &[
    (0x0547, 0x2122, ChipFamily::An21, "Cypress EZ-USB (2122S)"),
    (0x0547, 0x2125, ChipFamily::An21, "Cypress EZ-USB (2121S/2125S)"),
    (0x0547, 0x2126, ChipFamily::An21, "Cypress EZ-USB (2126S)"),
    (0x0547, 0x2131, ChipFamily::An21, "Cypress EZ-USB (2131Q/2131S/2135S)"),
    (0x0547, 0x2136, ChipFamily::An21, "Cypress EZ-USB (2136S)"),
    (0x0547, 0x2225, ChipFamily::An21, "Cypress EZ-USB (2225)"),
    (0x0547, 0x2226, ChipFamily::An21, "Cypress EZ-USB (2226)"),
    (0x0547, 0x2235, ChipFamily::An21, "Cypress EZ-USB (2235)"),
    (0x0547, 0x2236, ChipFamily::An21, "Cypress EZ-USB (2236)"),
    (0x04B4, 0x6473, ChipFamily::Fx, "Cypress EZ-USB FX1"),
    (
        0x04B4,
        0x8613,
        ChipFamily::Fx2Lp,
        "Cypress EZ-USB FX2LP (68013A/68014A/68015A/68016A)",
    ),
];

/// One entry of the known device table.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KnownDevice {
    /// USB vendor ID.
    pub vid: u16,
    /// USB product ID.
    pub pid: u16,
    /// Family the device belongs to.
    pub family: ChipFamily,
    /// Human-readable name.
    pub name: String,
}

impl KnownDevice {
    /// Create a new entry.
    pub fn new(vid: u16, pid: u16, family: ChipFamily, name: impl Into<String>) -> Self {
        Self {
            vid,
            pid,
            family,
            name: name.into(),
        }
    }

    fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// VID:PID to family lookup table.
///
/// `Default` yields the built-in table; callers may add their own entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownDeviceTable {
    entries: Vec<KnownDevice>,
}

impl Default for KnownDeviceTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl KnownDeviceTable {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Table with the built-in entries.
    pub fn builtin() -> Self {
        Self {
            entries: KNOWN_USB_DEVICES
                .iter()
                .map(|&(vid, pid, family, name)| KnownDevice::new(vid, pid, family, name))
                .collect(),
        }
    }

    /// Add an entry, replacing any existing entry for the same VID:PID.
    pub fn add(&mut self, device: KnownDevice) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.matches(device.vid, device.pid))
        {
            Some(existing) => {
                debug!(
                    "Overriding known device {:04X}:{:04X} ({} -> {})",
                    device.vid, device.pid, existing.family, device.family
                );
                *existing = device;
            },
            None => self.entries.push(device),
        }
    }

    /// Find the entry for a VID:PID.
    pub fn lookup(&self, vid: u16, pid: u16) -> Option<&KnownDevice> {
        self.entries.iter().find(|e| e.matches(vid, pid))
    }

    /// All entries.
    pub fn entries(&self) -> &[KnownDevice] {
        &self.entries
    }
}

/// What the caller asked for. Either part may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceSelector {
    /// Requested family.
    pub family: Option<ChipFamily>,
    /// Requested VID:PID.
    pub vid_pid: Option<(u16, u16)>,
}

impl DeviceSelector {
    /// Selector with both parts optional.
    pub fn new(family: Option<ChipFamily>, vid_pid: Option<(u16, u16)>) -> Self {
        Self { family, vid_pid }
    }

    /// True when neither part is set.
    pub fn is_empty(&self) -> bool {
        self.family.is_none() && self.vid_pid.is_none()
    }
}

/// Where the resolved family came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FamilySource {
    /// Given by the caller.
    Explicit,
    /// Found in the known device table.
    Table,
    /// Not known; the AN21-compatible default was used.
    Default,
}

/// Fully resolved device selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedDevice {
    /// USB vendor ID.
    pub vid: u16,
    /// USB product ID.
    pub pid: u16,
    /// Family to drive it as.
    pub family: ChipFamily,
    /// Where `family` came from.
    pub family_source: FamilySource,
}

/// Resolve a selector against the table and the attached devices.
///
/// - nothing given: the first attached device found in the table wins
/// - VID:PID only: family from the table, or [`ChipFamily::Fx`] if unknown
/// - family only: exactly one attached VID:PID of that family must exist,
///   otherwise [`Error::AmbiguousDevice`] or [`Error::DeviceNotFound`]
/// - both: used as-is
pub fn resolve(
    table: &KnownDeviceTable,
    selector: DeviceSelector,
    devices: &[UsbDeviceInfo],
) -> Result<ResolvedDevice> {
    match (selector.family, selector.vid_pid) {
        (Some(family), Some((vid, pid))) => Ok(ResolvedDevice {
            vid,
            pid,
            family,
            family_source: FamilySource::Explicit,
        }),
        (None, Some((vid, pid))) => Ok(match table.lookup(vid, pid) {
            Some(known) => {
                debug!("{vid:04X}:{pid:04X} is a known {} ({})", known.family, known.name);
                ResolvedDevice {
                    vid,
                    pid,
                    family: known.family,
                    family_source: FamilySource::Table,
                }
            },
            None => ResolvedDevice {
                vid,
                pid,
                family: ChipFamily::default(),
                family_source: FamilySource::Default,
            },
        }),
        (Some(family), None) => {
            let mut candidates: Vec<&KnownDevice> = Vec::new();
            for dev in devices {
                let Some(known) = table.lookup(dev.vid, dev.pid) else {
                    continue;
                };
                let duplicate = candidates.iter().any(|c| c.matches(dev.vid, dev.pid));
                if known.family == family && !duplicate {
                    candidates.push(known);
                }
            }

            match candidates.as_slice() {
                [] => Err(Error::DeviceNotFound),
                [only] => {
                    info!("Found {} at {:04X}:{:04X}", only.name, only.vid, only.pid);
                    Ok(ResolvedDevice {
                        vid: only.vid,
                        pid: only.pid,
                        family,
                        family_source: FamilySource::Explicit,
                    })
                },
                many => Err(Error::AmbiguousDevice(format!(
                    "{} attached {family} devices match: {}",
                    many.len(),
                    many.iter()
                        .map(|d| format!("{:04x}:{:04x}", d.vid, d.pid))
                        .collect::<Vec<_>>()
                        .join(", ")
                ))),
            }
        },
        (None, None) => {
            let known = devices
                .iter()
                .find_map(|dev| table.lookup(dev.vid, dev.pid))
                .ok_or(Error::DeviceNotFound)?;
            info!(
                "Auto-detected {} at {:04X}:{:04X}",
                known.name, known.vid, known.pid
            );
            Ok(ResolvedDevice {
                vid: known.vid,
                pid: known.pid,
                family: known.family,
                family_source: FamilySource::Table,
            })
        },
    }
}

/// Keep only the devices listed in the table, in bus order.
pub fn known_devices(table: &KnownDeviceTable, devices: &[UsbDeviceInfo]) -> Vec<UsbDeviceInfo> {
    devices
        .iter()
        .filter(|d| table.lookup(d.vid, d.pid).is_some())
        .cloned()
        .collect()
}

/// Format devices for display, marking the known ones.
pub fn format_device_list(table: &KnownDeviceTable, devices: &[UsbDeviceInfo]) -> Vec<String> {
    devices
        .iter()
        .map(|dev| {
            let base = format!(
                "Bus {:03} Device {:03}: ID {:04x}:{:04x}",
                dev.bus, dev.address, dev.vid, dev.pid
            );
            match table.lookup(dev.vid, dev.pid) {
                Some(known) => format!("{base} [{}] {}", known.family, known.name),
                None => base,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fx2_table() -> KnownDeviceTable {
        let mut table = KnownDeviceTable::new();
        table.add(KnownDevice::new(0x04B4, 0x8613, ChipFamily::Fx2, "FX2"));
        table
    }

    #[test]
    fn test_builtin_lookup() {
        let table = KnownDeviceTable::builtin();
        assert_eq!(table.lookup(0x0547, 0x2131).unwrap().family, ChipFamily::An21);
        assert_eq!(table.lookup(0x04B4, 0x6473).unwrap().family, ChipFamily::Fx);
        assert_eq!(table.lookup(0x04B4, 0x8613).unwrap().family, ChipFamily::Fx2Lp);
        assert!(table.lookup(0x1234, 0x5678).is_none());
        assert_eq!(KnownDeviceTable::default(), table);
    }

    #[test]
    fn test_add_replaces_same_vid_pid() {
        let mut table = KnownDeviceTable::builtin();
        let before = table.entries().len();
        table.add(KnownDevice::new(0x04B4, 0x8613, ChipFamily::Fx2, "custom"));
        assert_eq!(table.entries().len(), before);
        assert_eq!(table.lookup(0x04B4, 0x8613).unwrap().name, "custom");

        table.add(KnownDevice::new(0x1209, 0x0001, ChipFamily::Fx2Lp, "board"));
        assert_eq!(table.entries().len(), before + 1);
    }

    #[test]
    fn test_auto_detect_single_match() {
        let devices = [UsbDeviceInfo::new(0x1D6B, 0x0002), UsbDeviceInfo::new(0x04B4, 0x8613)];
        let resolved = resolve(&fx2_table(), DeviceSelector::default(), &devices).unwrap();
        assert_eq!(
            resolved,
            ResolvedDevice {
                vid: 0x04B4,
                pid: 0x8613,
                family: ChipFamily::Fx2,
                family_source: FamilySource::Table,
            }
        );
    }

    #[test]
    fn test_auto_detect_first_match_wins() {
        let table = KnownDeviceTable::builtin();
        let devices = [UsbDeviceInfo::new(0x0547, 0x2131), UsbDeviceInfo::new(0x04B4, 0x8613)];
        let resolved = resolve(&table, DeviceSelector::default(), &devices).unwrap();
        assert_eq!((resolved.vid, resolved.pid), (0x0547, 0x2131));
        assert_eq!(resolved.family, ChipFamily::An21);
    }

    #[test]
    fn test_auto_detect_nothing_attached() {
        let devices = [UsbDeviceInfo::new(0x1D6B, 0x0002)];
        assert!(matches!(
            resolve(&fx2_table(), DeviceSelector::default(), &devices),
            Err(Error::DeviceNotFound)
        ));
    }

    #[test]
    fn test_family_only_is_ambiguous_with_two_devices() {
        let mut table = fx2_table();
        table.add(KnownDevice::new(0x1209, 0x0001, ChipFamily::Fx2, "other FX2"));
        let devices = [UsbDeviceInfo::new(0x04B4, 0x8613), UsbDeviceInfo::new(0x1209, 0x0001)];

        let err = resolve(&table, DeviceSelector::new(Some(ChipFamily::Fx2), None), &devices)
            .unwrap_err();
        assert!(matches!(err, Error::AmbiguousDevice(_)));
        assert!(err.to_string().contains("04b4:8613"));
    }

    #[test]
    fn test_family_only_same_device_twice_is_not_ambiguous() {
        let devices = [UsbDeviceInfo::new(0x04B4, 0x8613), UsbDeviceInfo::new(0x04B4, 0x8613)];
        let resolved =
            resolve(&fx2_table(), DeviceSelector::new(Some(ChipFamily::Fx2), None), &devices)
                .unwrap();
        assert_eq!((resolved.vid, resolved.pid), (0x04B4, 0x8613));
        assert_eq!(resolved.family_source, FamilySource::Explicit);
    }

    #[test]
    fn test_family_only_no_match() {
        let devices = [UsbDeviceInfo::new(0x04B4, 0x8613)];
        assert!(matches!(
            resolve(&fx2_table(), DeviceSelector::new(Some(ChipFamily::An21), None), &devices),
            Err(Error::DeviceNotFound)
        ));
    }

    #[test]
    fn test_vid_pid_only() {
        let table = KnownDeviceTable::builtin();
        let selector = DeviceSelector::new(None, Some((0x0547, 0x2131)));
        let known = resolve(&table, selector, &[]).unwrap();
        assert_eq!(known.family, ChipFamily::An21);
        assert_eq!(known.family_source, FamilySource::Table);

        let selector = DeviceSelector::new(None, Some((0x1234, 0x5678)));
        let unknown = resolve(&table, selector, &[]).unwrap();
        assert_eq!(unknown.family, ChipFamily::Fx);
        assert_eq!(unknown.family_source, FamilySource::Default);
    }

    #[test]
    fn test_known_devices_filters_unknown() {
        let devices = [
            UsbDeviceInfo::new(0x1D6B, 0x0002),
            UsbDeviceInfo::new(0x04B4, 0x8613),
            UsbDeviceInfo::new(0x046D, 0xC52B),
        ];
        let known = known_devices(&fx2_table(), &devices);
        assert_eq!(known, vec![UsbDeviceInfo::new(0x04B4, 0x8613)]);
        assert!(known_devices(&KnownDeviceTable::new(), &devices).is_empty());
    }

    #[test]
    fn test_both_given_used_as_is() {
        let selector = DeviceSelector::new(Some(ChipFamily::Fx2Lp), Some((0x0547, 0x2131)));
        let resolved = resolve(&KnownDeviceTable::builtin(), selector, &[]).unwrap();
        assert_eq!(resolved.family, ChipFamily::Fx2Lp);
        assert_eq!(resolved.family_source, FamilySource::Explicit);
    }

    #[test]
    fn test_format_device_list() {
        let mut known = UsbDeviceInfo::new(0x04B4, 0x8613);
        known.bus = 1;
        known.address = 7;
        let lines = format_device_list(&fx2_table(), &[known, UsbDeviceInfo::new(0x1D6B, 0x0002)]);
        assert_eq!(lines[0], "Bus 001 Device 007: ID 04b4:8613 [FX2] FX2");
        assert_eq!(lines[1], "Bus 000 Device 000: ID 1d6b:0002");
    }
}

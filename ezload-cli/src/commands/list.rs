//! USB device listing command implementation.

use {
    crate::config::Config,
    anyhow::{Context, Result},
    console::style,
    ezload::{DeviceSelector, KnownDeviceTable, UsbDeviceInfo, device, host},
};

/// JSON view of one attached device.
fn device_json(table: &KnownDeviceTable, dev: &UsbDeviceInfo) -> serde_json::Value {
    let known = table.lookup(dev.vid, dev.pid);
    serde_json::json!({
        "bus": dev.bus,
        "address": dev.address,
        "vid": format!("{:04x}", dev.vid),
        "pid": format!("{:04x}", dev.pid),
        "bcd_device": format!("{:04x}", dev.bcd_device),
        "known": known.is_some(),
        "type": known.map(|k| k.family.token()),
        "name": known.map(|k| k.name.as_str()),
    })
}

/// List devices command implementation.
pub(crate) fn cmd_list_devices(config: &Config, json: bool, known_only: bool) -> Result<()> {
    let table = config.known_device_table()?;
    let devices = if known_only {
        host::discover_known_devices(&table)
    } else {
        host::discover_devices()
    }
    .context("Failed to enumerate USB devices")?;

    if json {
        let list: Vec<serde_json::Value> = devices.iter().map(|d| device_json(&table, d)).collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "devices": list,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("USB Devices").bold().underlined());

    if devices.is_empty() {
        let none = if known_only {
            "No known EZ-USB devices found"
        } else {
            "No USB devices found"
        };
        eprintln!("  {}", style(none).dim());
        return Ok(());
    }

    for (dev, line) in devices.iter().zip(device::format_device_list(&table, &devices)) {
        if table.lookup(dev.vid, dev.pid).is_some() {
            eprintln!("  {} {}", style("•").green(), style(line).yellow());
        } else {
            eprintln!("  {} {}", style("•").dim(), line);
        }
    }

    // Show auto-detection result
    if let Ok(resolved) = device::resolve(&table, DeviceSelector::default(), &devices) {
        eprintln!(
            "\n{} Auto-detected: {} ({})",
            style("→").green().bold(),
            style(format!("{:04x}:{:04x}", resolved.vid, resolved.pid))
                .cyan()
                .bold(),
            resolved.family
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ezload::ChipFamily;

    #[test]
    fn test_device_json_known() {
        let table = KnownDeviceTable::builtin();
        let value = device_json(&table, &UsbDeviceInfo::new(0x0547, 0x2131));
        assert_eq!(value["known"], true);
        assert_eq!(value["type"], ChipFamily::An21.token());
        assert_eq!(value["vid"], "0547");
    }

    #[test]
    fn test_device_json_unknown() {
        let table = KnownDeviceTable::builtin();
        let value = device_json(&table, &UsbDeviceInfo::new(0x1D6B, 0x0002));
        assert_eq!(value["known"], false);
        assert!(value["type"].is_null());
        assert!(value["name"].is_null());
    }
}

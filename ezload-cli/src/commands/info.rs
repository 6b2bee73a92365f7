//! Firmware image info command implementation.

use {
    anyhow::{Context, Result},
    console::style,
    ezload::{
        ChipFamily, FirmwareImage, image::segment::DEFAULT_RECORD_LEN,
        target::ezusb::protocol::split_segments,
    },
    std::path::Path,
};

/// Families whose on-chip RAM holds the whole image, so no loader is needed.
fn fits_on_chip(image: &FirmwareImage) -> Vec<ChipFamily> {
    ChipFamily::ALL
        .into_iter()
        .filter(|family| {
            let profile = family.profile();
            split_segments(image.segments(), profile, profile.max_chunk())
                .iter()
                .all(|c| c.internal)
        })
        .collect()
}

fn load_image(firmware: &Path) -> Result<FirmwareImage> {
    FirmwareImage::from_file(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))
}

/// Info command implementation.
pub(crate) fn cmd_info(firmware: &Path, json: bool, ihex: bool) -> Result<()> {
    let image = load_image(firmware)?;

    if json {
        return print_info_json(&image);
    }
    if ihex {
        print!("{}", image.to_ihex(DEFAULT_RECORD_LEN));
        return Ok(());
    }

    eprintln!("{}", style("Firmware Information").bold().underlined());
    eprintln!("  File: {}", firmware.display());
    eprintln!("  Segments: {}", image.segments().len());
    eprintln!("  Total size: {} bytes", image.total_len());

    eprintln!("\n{}", style("Segments").bold().underlined());
    for (i, segment) in image.segments().iter().enumerate() {
        eprintln!(
            "  [{:2}] {} - {} ({} bytes)",
            i,
            style(format!("0x{:04X}", segment.base_address)).cyan(),
            style(format!("0x{:04X}", segment.end().saturating_sub(1))).cyan(),
            segment.len()
        );
    }

    let fits = fits_on_chip(&image);
    let fits = if fits.is_empty() {
        style("none (needs a second-stage loader)".to_string()).yellow()
    } else {
        style(
            fits.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        )
        .green()
    };
    eprintln!("\n  Fits on-chip RAM of: {fits}");

    Ok(())
}

/// Info command --json output: structured JSON to stdout.
fn print_info_json(image: &FirmwareImage) -> Result<()> {
    let segments: Vec<serde_json::Value> = image
        .segments()
        .iter()
        .map(|s| {
            serde_json::json!({
                "address": format!("0x{:04X}", s.base_address),
                "length": s.len(),
            })
        })
        .collect();

    let fits: Vec<&str> = fits_on_chip(image).iter().map(ChipFamily::token).collect();

    let output = serde_json::json!({
        "ok": true,
        "data": {
            "segment_count": image.segments().len(),
            "total_size": image.total_len(),
            "segments": segments,
            "fits_on_chip": fits,
        }
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

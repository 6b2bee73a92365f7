//! Load command implementation.

use {
    crate::{
        Chip, Cli, CliError, config::Config, parse_config_byte, parse_vid_pid, use_fancy_output,
        was_interrupted,
    },
    anyhow::{Context, Result},
    clap::Args,
    console::style,
    ezload::{
        ChipFamily, Destination, DeviceIdentity, DeviceSelector, DownloadEngine, DownloadTarget,
        FamilySource, FirmwareImage, ResolvedDevice, UsbPort, host,
    },
    indicatif::{ProgressBar, ProgressStyle},
    log::info,
    std::path::{Path, PathBuf},
};

/// Environment variable historically used by hotplug scripts.
const DEVICE_ENV: &str = "DEVICE";

/// Arguments of the `load` command.
#[derive(Debug, Args)]
pub(crate) struct LoadArgs {
    /// Firmware to load (Intel HEX).
    #[arg(short = 'I', long, value_name = "FILE")]
    pub firmware: PathBuf,

    /// Second-stage loader, loaded into on-chip RAM first.
    #[arg(short = 's', long, env = "EZLOAD_LOADER", value_name = "FILE")]
    pub loader: Option<PathBuf>,

    /// Write the boot EEPROM with this config byte (0-255; decimal, 0x hex or 0 octal).
    #[arg(short = 'c', long = "config-byte", value_name = "BYTE", value_parser = parse_config_byte)]
    pub config_byte: Option<u8>,

    /// Microcontroller type.
    #[arg(short = 't', long = "type", env = "EZLOAD_TYPE", value_enum)]
    pub chip: Option<Chip>,

    /// Device to use, as vid:pid in hex (falls back to $DEVICE).
    #[arg(
        short = 'D',
        long,
        env = "EZLOAD_DEVICE",
        value_name = "VID:PID",
        value_parser = parse_vid_pid
    )]
    pub device: Option<(u16, u16)>,
}

/// Device selection from arguments, then environment, then config.
fn device_selector(
    args: &LoadArgs,
    config: &Config,
    device_env: Option<&str>,
) -> Result<DeviceSelector> {
    let family = match args.chip {
        Some(chip) => Some(ChipFamily::from(chip)),
        None => config.family()?,
    };

    let vid_pid = match (args.device, device_env) {
        (Some(device), _) => Some(device),
        (None, Some(env)) => Some(parse_vid_pid(env).map_err(|e| {
            CliError::Usage(format!("${DEVICE_ENV}: {e}"))
        })?),
        (None, None) => config.vid_pid()?,
    };

    Ok(DeviceSelector::new(family, vid_pid))
}

/// EEPROM writes need a loader and a known microcontroller type.
fn check_eeprom_request(
    config_byte: Option<u8>,
    loader: Option<&Path>,
    resolved: Option<&ResolvedDevice>,
) -> Result<(), CliError> {
    if config_byte.is_none() {
        return Ok(());
    }
    if loader.is_none() {
        return Err(CliError::Usage(
            "need a second-stage loader (-s) to write the EEPROM".to_string(),
        ));
    }
    if resolved.is_some_and(|r| r.family_source == FamilySource::Default) {
        return Err(CliError::Usage(
            "must specify the microcontroller type (-t) to write the EEPROM".to_string(),
        ));
    }
    Ok(())
}

fn load_image(path: &Path) -> Result<FirmwareImage> {
    let image = FirmwareImage::from_file(path)
        .with_context(|| format!("Failed to load firmware {}", path.display()))?;
    info!(
        "Loaded {}: {} bytes in {} segment(s)",
        path.display(),
        image.total_len(),
        image.segments().len()
    );
    Ok(image)
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Load command implementation.
pub(crate) fn cmd_load(cli: &Cli, config: &Config, args: &LoadArgs) -> Result<()> {
    let loader_path = args.loader.clone().or_else(|| config.load.loader.clone());
    check_eeprom_request(args.config_byte, loader_path.as_deref(), None)?;

    // Parse everything before touching the device.
    let firmware = load_image(&args.firmware)?;
    let loader = loader_path.as_deref().map(load_image).transpose()?;

    let table = config.known_device_table()?;
    let device_env = std::env::var(DEVICE_ENV).ok();
    let selector = device_selector(args, config, device_env.as_deref())?;
    let resolved = host::resolve_device(&table, selector)?;
    check_eeprom_request(args.config_byte, loader_path.as_deref(), Some(&resolved))?;

    match resolved.family_source {
        FamilySource::Default => info!("microcontroller type: {} (default)", resolved.family),
        _ => info!("microcontroller type: {}", resolved.family),
    }

    let mut port = UsbPort::open(resolved.vid, resolved.pid).with_context(|| {
        format!(
            "Failed to open device {:04x}:{:04x}",
            resolved.vid, resolved.pid
        )
    })?;
    if !cli.quiet {
        eprintln!(
            "{} Using {} ({})",
            style("🔌").cyan(),
            style(format!("{:04x}:{:04x}", resolved.vid, resolved.pid)).cyan(),
            resolved.family
        );
    }

    let identity = DeviceIdentity::from(port.info());
    let target = DownloadTarget::new(&mut port, *resolved.family.profile(), identity);
    let mut engine = DownloadEngine::new(target).with_cancel_check(was_interrupted);

    let pb = progress_bar(cli.quiet);
    let mut current_stage = String::new();
    let mut progress = |stage: &str, current: usize, total: usize| {
        if stage != current_stage {
            current_stage = stage.to_string();
            pb.set_message(format!("Loading {stage}"));
        }
        if total > 0 {
            pb.set_position((current * 100 / total) as u64);
        }
    };

    let result = match &loader {
        Some(loader) => {
            let destination = if args.config_byte.is_some() {
                Destination::Eeprom
            } else {
                Destination::Ram
            };
            engine.load_two_stage(
                loader,
                &firmware,
                destination,
                args.config_byte,
                &mut progress,
            )
        },
        None => engine.load_ram(&firmware, &mut progress),
    };

    match result {
        Ok(()) => pb.finish_with_message("Complete"),
        Err(ezload::Error::Cancelled) => {
            pb.abandon();
            return Err(CliError::Cancelled("Interrupted".to_string()).into());
        },
        Err(e) => {
            pb.abandon();
            return Err(e).context("Firmware download failed");
        },
    }

    if !cli.quiet {
        let what = if args.config_byte.is_some() {
            "EEPROM written"
        } else {
            "Firmware loaded"
        };
        eprintln!("{} {what}", style("✓").green().bold());
    }

    Ok(())
}

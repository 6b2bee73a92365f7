//! ezload CLI - Command-line tool for loading firmware into EZ-USB devices.
//!
//! ## Features
//!
//! - Load Intel HEX firmware into on-chip RAM
//! - Two-stage loads through a second-stage loader (external RAM, EEPROM)
//! - Boot EEPROM programming with a config byte
//! - Auto-detection of attached EZ-USB devices
//! - Shell completion generation
//! - Environment variable and config file defaults

use {
    anyhow::Result,
    clap::{Parser, Subcommand, ValueEnum},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    ezload::ChipFamily,
    log::debug,
    std::{
        path::PathBuf,
        sync::atomic::{AtomicBool, Ordering},
    },
};

mod commands;
mod config;

use commands::load::LoadArgs;
use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if progress bars and colors should be used.
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// CLI-level failures with their own exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid combination of arguments (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Invalid configuration value (exit 3).
    #[error("{0}")]
    Config(String),
    /// Interrupted by the user (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

/// ezload - load firmware into Cypress/Anchor EZ-USB microcontrollers.
///
/// Environment variables:
///   EZLOAD_DEVICE, DEVICE   - Default device as vid:pid (hex)
///   EZLOAD_TYPE             - Default microcontroller type
///   EZLOAD_LOADER           - Default second-stage loader
#[derive(Parser)]
#[command(name = "ezload")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Supported microcontroller types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum Chip {
    /// Original Anchor Chips AN21xx parts.
    An21,
    /// Cypress EZ-USB FX (AN21 compatible, default).
    Fx,
    /// Cypress EZ-USB FX2.
    Fx2,
    /// Cypress EZ-USB FX2LP.
    Fx2lp,
}

impl From<Chip> for ChipFamily {
    fn from(chip: Chip) -> Self {
        match chip {
            Chip::An21 => ChipFamily::An21,
            Chip::Fx => ChipFamily::Fx,
            Chip::Fx2 => ChipFamily::Fx2,
            Chip::Fx2lp => ChipFamily::Fx2Lp,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Load firmware into a device.
    Load(LoadArgs),

    /// Show information about an Intel HEX file.
    Info {
        /// Path to the Intel HEX file.
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,

        /// Write the normalized image as Intel HEX to stdout.
        #[arg(long, conflicts_with = "json")]
        ihex: bool,
    },

    /// List attached USB devices.
    ListDevices {
        /// Output device list as JSON to stdout.
        #[arg(long)]
        json: bool,

        /// Only show devices from the known device table.
        #[arg(long)]
        known: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (auto-detected from $SHELL if not specified).
        #[arg(value_enum)]
        shell: Option<Shell>,
    },
}

/// Parse a "vid:pid" pair in hexadecimal (an optional 0x prefix is accepted).
pub(crate) fn parse_vid_pid(s: &str) -> Result<(u16, u16), String> {
    let Some((vid, pid)) = s.trim().split_once(':') else {
        return Err(format!(
            "Invalid device: '{s}'. Expected \"vid:pid\" in hexadecimal (e.g. 04b4:8613)"
        ));
    };

    let parse = |part: &str| {
        let part = part.trim();
        let digits = part
            .strip_prefix("0x")
            .or_else(|| part.strip_prefix("0X"))
            .unwrap_or(part);
        u16::from_str_radix(digits, 16).map_err(|e| format!("Invalid hex ID '{part}': {e}"))
    };

    Ok((parse(vid)?, parse(pid)?))
}

/// Parse an EEPROM config byte: decimal, `0x` hex or leading-zero octal.
pub(crate) fn parse_config_byte(s: &str) -> Result<u8, String> {
    let t = s.trim();
    let value = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if let Some(oct) = t.strip_prefix('0').filter(|rest| !rest.is_empty()) {
        u32::from_str_radix(oct, 8)
    } else {
        t.parse::<u32>()
    };

    value
        .ok()
        .and_then(|v| u8::try_from(v).ok())
        .ok_or_else(|| format!("illegal config byte: {s} (expected 0-255)"))
}

/// Map an error to the process exit code.
pub(crate) fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return match cli_err {
                CliError::Usage(_) => 2,
                CliError::Config(_) => 3,
                CliError::Cancelled(_) => 130,
            };
        }
        if let Some(lib_err) = cause.downcast_ref::<ezload::Error>() {
            return match lib_err {
                ezload::Error::DeviceNotFound | ezload::Error::AmbiguousDevice(_) => 4,
                ezload::Error::Cancelled => 130,
                _ => 1,
            };
        }
    }
    1
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    debug!(
        "ezload v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Load(args) => commands::load::cmd_load(cli, &config, args),
        Commands::Info {
            firmware,
            json,
            ihex,
        } => commands::info::cmd_info(firmware, *json, *ihex),
        Commands::ListDevices { json, known } => {
            commands::list::cmd_list_devices(&config, *json, *known)
        },
        Commands::Completions { shell } => commands::completions::cmd_completions(*shell),
    }
}

fn main() {
    let cli = Cli::parse();

    STDERR_IS_TTY.store(console::Term::stderr().is_term(), Ordering::Relaxed);
    init_logging(&cli);

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code_for(&err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_load_single_stage() {
        let cli = Cli::try_parse_from(["ezload", "load", "-I", "fw.hex"]).unwrap();
        let Commands::Load(args) = cli.command else {
            panic!("expected load");
        };
        assert_eq!(args.firmware, PathBuf::from("fw.hex"));
        assert!(args.config_byte.is_none());
    }

    #[test]
    fn test_cli_parse_load_all_options() {
        let cli = Cli::try_parse_from([
            "ezload", "-vv", "load", "-I", "fw.hex", "-s", "vend_ax.hex", "-c", "0x41", "-t",
            "fx2lp", "-D", "04b4:8613",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::Load(args) = cli.command else {
            panic!("expected load");
        };
        assert_eq!(args.loader, Some(PathBuf::from("vend_ax.hex")));
        assert_eq!(args.config_byte, Some(0x41));
        assert_eq!(args.chip, Some(Chip::Fx2lp));
        assert_eq!(args.device, Some((0x04B4, 0x8613)));
    }

    #[test]
    fn test_cli_parse_info() {
        let cli = Cli::try_parse_from(["ezload", "info", "fw.hex", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Info { json: true, ihex: false, .. }));
        assert!(Cli::try_parse_from(["ezload", "info", "fw.hex", "--json", "--ihex"]).is_err());
    }

    #[test]
    fn test_cli_parse_list_devices_known() {
        let cli = Cli::try_parse_from(["ezload", "list-devices", "--known", "--json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::ListDevices {
                json: true,
                known: true
            }
        ));
    }

    #[test]
    fn test_cli_invalid_type() {
        assert!(Cli::try_parse_from(["ezload", "load", "-I", "fw.hex", "-t", "fx3"]).is_err());
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["ezload"]).is_err());
    }

    #[test]
    fn test_chip_to_chip_family() {
        assert_eq!(ChipFamily::from(Chip::An21), ChipFamily::An21);
        assert_eq!(ChipFamily::from(Chip::Fx), ChipFamily::Fx);
        assert_eq!(ChipFamily::from(Chip::Fx2), ChipFamily::Fx2);
        assert_eq!(ChipFamily::from(Chip::Fx2lp), ChipFamily::Fx2Lp);
    }

    #[test]
    fn test_parse_vid_pid() {
        assert_eq!(parse_vid_pid("04b4:8613"), Ok((0x04B4, 0x8613)));
        assert_eq!(parse_vid_pid("0x0547:0X2131"), Ok((0x0547, 0x2131)));
        assert_eq!(parse_vid_pid(" 4b4 : 8613 "), Ok((0x04B4, 0x8613)));
        assert!(parse_vid_pid("04b48613").is_err());
        assert!(parse_vid_pid("04b4:xyz").is_err());
        assert!(parse_vid_pid("10000:1").is_err());
    }

    #[test]
    fn test_parse_config_byte_bases() {
        assert_eq!(parse_config_byte("0"), Ok(0));
        assert_eq!(parse_config_byte("65"), Ok(65));
        assert_eq!(parse_config_byte("0x41"), Ok(0x41));
        assert_eq!(parse_config_byte("0101"), Ok(0o101));
        assert_eq!(parse_config_byte("255"), Ok(255));
    }

    #[test]
    fn test_parse_config_byte_out_of_range() {
        assert!(parse_config_byte("256").is_err());
        assert!(parse_config_byte("-1").is_err());
        assert!(parse_config_byte("0x100").is_err());
        assert!(parse_config_byte("09").is_err());
        assert!(parse_config_byte("").is_err());
    }

    #[test]
    fn test_exit_codes() {
        let usage = anyhow::Error::from(CliError::Usage("x".into()));
        let config = anyhow::Error::from(CliError::Config("x".into()));
        let cancelled = anyhow::Error::from(CliError::Cancelled("x".into()));
        assert_eq!(exit_code_for(&usage), 2);
        assert_eq!(exit_code_for(&config), 3);
        assert_eq!(exit_code_for(&cancelled), 130);

        let not_found = anyhow::Error::from(ezload::Error::DeviceNotFound).context("opening");
        assert_eq!(exit_code_for(&not_found), 4);
        let ambiguous = anyhow::Error::from(ezload::Error::AmbiguousDevice("two".into()));
        assert_eq!(exit_code_for(&ambiguous), 4);
        assert_eq!(exit_code_for(&anyhow::Error::from(ezload::Error::Cancelled)), 130);

        let other = anyhow::Error::from(ezload::Error::TruncatedImage);
        assert_eq!(exit_code_for(&other), 1);
        assert_eq!(exit_code_for(&anyhow::anyhow!("plain")), 1);
    }
}

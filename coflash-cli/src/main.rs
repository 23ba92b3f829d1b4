//! coflash CLI - Command-line tool for updating RP2040 coprocessors.
//!
//! ## Features
//!
//! - Update the coprocessor application over its serial bootloader
//! - Query the flash geometry reported by the bootloader
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::{debug, error};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// coflash - Update RP2040 coprocessors over their serial bootloader.
///
/// Environment variables:
///   COFLASH_PORT              - Default serial port
///   COFLASH_BAUD              - Default baud rate (default: 921600)
///   COFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "coflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port to use.
    #[arg(short, long, global = true, env = "COFLASH_PORT")]
    port: Option<String>,

    /// Baud rate for the bootloader link.
    #[arg(short, long, global = true, env = "COFLASH_BAUD")]
    baud: Option<u32>,

    /// Use a specific config file instead of the default search path.
    #[arg(long = "config", global = true, value_name = "FILE")]
    config_path: Option<PathBuf>,

    /// Increase verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Never prompt; fail when the port is ambiguous.
    #[arg(long, global = true, env = "COFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Offer every serial port, not only likely coprocessors.
    #[arg(long, global = true)]
    list_all_ports: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Update the coprocessor with a raw application image.
    Flash {
        /// Path to the `.bin` image.
        image: PathBuf,

        /// Give up after this many SYNC attempts (default: retry forever).
        #[arg(long, value_name = "N")]
        max_sync_attempts: Option<u32>,

        /// Exit with the restart code when the bootloader rejects the seal.
        #[arg(long)]
        restart_on_seal_failure: bool,

        /// Remember the selected port for later runs.
        #[arg(long)]
        remember_port: bool,
    },

    /// Query the flash geometry reported by the bootloader.
    Info {
        /// Print the geometry as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Print the port list as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Target shell.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or ambiguous setup.
    #[error("{0}")]
    Usage(String),
    /// The user aborted a prompt.
    #[error("{0}")]
    Cancelled(String),
    /// The update failed and asked for a host restart.
    #[error("{0}")]
    RestartRequested(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) | Self::Cancelled(_) => 2,
            Self::RestartRequested(_) => 3,
        }
    }
}

/// Map an error chain to a process exit code.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<CliError>())
        .map_or(1, CliError::exit_code)
}

/// Resolve the baud rate: flag or env, then config, then the default.
fn resolve_baud(cli: &Cli, config: &Config) -> u32 {
    cli.baud
        .or(config.connection.baud)
        .unwrap_or(coflash::port::DEFAULT_BAUD)
}

/// Pick the serial port for commands that talk to the device.
fn get_port(cli: &Cli, config: &mut Config, remember: bool) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
    };
    let selected = select_serial_port(&options, config)?;

    if remember && !cli.non_interactive {
        if let Err(e) = ask_remember_port(&selected, config) {
            debug!("Not remembering port: {e}");
        }
    }

    Ok(selected.name)
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            image,
            max_sync_attempts,
            restart_on_seal_failure,
            remember_port,
        } => {
            let options = commands::flash::FlashOptions {
                max_sync_attempts: *max_sync_attempts,
                restart_on_seal_failure: *restart_on_seal_failure,
            };
            // Check the image before touching the port
            let firmware = commands::flash::load_image(image)?;
            let port = get_port(cli, &mut config, *remember_port)?;
            commands::flash::cmd_flash(cli, &config, &port, &firmware, &options)
        },
        Commands::Info { json } => {
            let port = get_port(cli, &mut config, false)?;
            commands::info::cmd_info(cli, &config, &port, *json)
        },
        Commands::ListPorts { json } => commands::info::cmd_list_ports(cli, *json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

fn main() -> ExitCode {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, std::sync::atomic::Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // Help and version go to stdout with 0, parse errors to stderr with 2
        Err(e) => e.exit(),
    };

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

    debug!(
        "coflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = exit_code_for(&err);
            debug!("Exiting with code {code}: {err:?}");
            if code == 3 {
                error!("{err:#}");
            } else {
                eprintln!("{} {err:#}", style("Error:").red().bold());
            }
            ExitCode::from(code)
        },
    }
}

//! Interactive serial port selection.
//!
//! Ports come from, in order: the `--port` flag or `COFLASH_PORT`, the
//! config file, then detection. Detection prefers likely coprocessors
//! (RP2040 native USB and known USB-UART bridges) and prompts when more
//! than one candidate remains.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    coflash::{DetectedPort, detect_ports, device::select_port},
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Offer all ports, including unknown types.
    pub list_all_ports: bool,
    /// Fail instead of prompting when several ports remain.
    pub non_interactive: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<DetectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name, detect_ports()));
    }

    if let Some(port_name) = &config
        .connection
        .serial
    {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name, detect_ports()));
    }

    let candidates = candidate_ports(detect_ports(), options.list_all_ports);

    match candidates
        .len()
        .cmp(&1)
    {
        Ordering::Less => Err(usage_err(
            "No serial ports found. Connect the coprocessor or pass --port",
        )),
        Ordering::Equal => {
            let port = select_port(candidates)?;
            if port.is_likely_coprocessor() || options.non_interactive {
                info!("Auto-selected port: {}", port.describe());
                Ok(port)
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port)
            }
        },
        Ordering::Greater => {
            if options.non_interactive {
                return Err(usage_err(
                    "Found multiple serial ports; pass --port to choose one",
                ));
            }
            ensure_interactive_terminal()?;
            select_port_interactive(candidates)
        },
    }
}

/// Narrow the detected ports to likely coprocessors, unless none match.
fn candidate_ports(ports: Vec<DetectedPort>, list_all: bool) -> Vec<DetectedPort> {
    if list_all {
        return ports;
    }

    let known: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| p.is_likely_coprocessor())
        .cloned()
        .collect();

    if known.is_empty() { ports } else { known }
}

/// Find a port by name, keeping a plain entry for unlisted names.
fn find_port_by_name(name: &str, ports: Vec<DetectedPort>) -> DetectedPort {
    ports
        .into_iter()
        .find(|p| p.name == name || p.name.eq_ignore_ascii_case(name))
        .unwrap_or_else(|| DetectedPort::plain(name))
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs a terminal; pass --port or --non-interactive",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Port selection cancelled".to_string()).into()
            } else {
                usage_err(&format!("Prompt failed: {io_err}"))
            }
        },
    }
}

fn select_port_interactive(mut ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    ports.sort_by_key(|p| !p.is_likely_coprocessor());
    let preferred = select_port(ports.clone())?;
    let default = ports
        .iter()
        .position(|p| p.name == preferred.name)
        .unwrap_or(0);

    let term_width = console::Term::stderr()
        .size()
        .1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let items: Vec<String> = ports
        .iter()
        .map(|port| {
            let label = if port.is_likely_coprocessor() {
                style(port.describe())
                    .bold()
                    .to_string()
            } else {
                port.describe()
            };
            console::truncate_str(&label, max_item_width, "\u{2026}").into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the coprocessor serial port")
        .items(&items)
        .default(default)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .into_iter()
            .nth(index)
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("Port selection cancelled".to_string()).into()),
    }
}

fn confirm_single_port(port: DetectedPort) -> Result<DetectedPort> {
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {}?", port.describe()))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(port)
    } else {
        Err(CliError::Cancelled("Port selection cancelled".to_string()).into())
    }
}

/// Ask whether to remember this port for later runs.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    if config.connection.serial.as_deref() == Some(port.name.as_str()) {
        return Ok(());
    }
    if !std::io::stdin().is_terminal() {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {} for later runs?", port.name))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        config.remember_port(&port.name)?;
    }
    Ok(())
}

//! Serial port selection.
//!
//! An explicit `--port` wins, then the configured port, then discovery. When
//! discovery yields several plausible boards the user picks one; in
//! non-interactive mode that is a usage error.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    std::{cmp::Ordering, io::IsTerminal},
    turbotape::{DetectedPort, discover_ports},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI or environment.
    pub port: Option<String>,
    /// Non-interactive mode (fail if multiple ports).
    pub non_interactive: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Resolve the port name to open.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<String> {
    if let Some(port_name) = &options.port {
        debug!("Using port from command line: {port_name}");
        return Ok(port_name.clone());
    }

    if let Some(port_name) = &config.port.serial {
        debug!("Using port from config: {port_name}");
        return Ok(port_name.clone());
    }

    let ports = discover_ports();
    if ports.is_empty() {
        return Err(turbotape::Error::DeviceNotFound.into());
    }

    let candidates = candidate_ports(ports);

    if options.non_interactive {
        return select_non_interactive_port(candidates);
    }

    match candidates.len().cmp(&1) {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(candidates)
        },
        Ordering::Equal => single(candidates),
        Ordering::Less => Err(turbotape::Error::DeviceNotFound.into()),
    }
}

/// Narrow discovered ports to the most plausible boards.
///
/// Known USB-UART bridges first, then anything named like a USB serial
/// device, then every port.
fn candidate_ports(ports: Vec<DetectedPort>) -> Vec<DetectedPort> {
    let known: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| p.device.is_known())
        .cloned()
        .collect();
    if !known.is_empty() {
        return known;
    }

    let usb: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| p.looks_like_usb())
        .cloned()
        .collect();
    if !usb.is_empty() {
        return usb;
    }

    ports
}

fn single(candidates: Vec<DetectedPort>) -> Result<String> {
    let port = candidates
        .into_iter()
        .next()
        .ok_or(turbotape::Error::DeviceNotFound)?;
    info!("Auto-selected port: {} [{}]", port.name, port.device.name());
    Ok(port.name)
}

fn select_non_interactive_port(candidates: Vec<DetectedPort>) -> Result<String> {
    match candidates.len().cmp(&1) {
        Ordering::Equal => single(candidates),
        Ordering::Greater => Err(usage_err(
            "multiple serial ports found; pass --port in non-interactive mode",
        )),
        Ordering::Less => Err(turbotape::Error::DeviceNotFound.into()),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "multiple serial ports found and no terminal to ask; pass --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("port selection cancelled".to_string()).into()
            } else {
                usage_err("port selection prompt failed")
            }
        },
    }
}

fn select_port_interactive(ports: Vec<DetectedPort>) -> Result<String> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = turbotape::device::format_port_list(&ports)
        .into_iter()
        .map(|label| console::truncate_str(&label, max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the board's serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .into_iter()
            .nth(index)
            .map(|port| port.name)
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("port selection cancelled".to_string()).into()),
    }
}

//! Choosing the serial link to a payload.
//!
//! `--port` wins, then `[link] serial` from the config. Otherwise the USB
//! bridges a payload UART is usually wired through are detected, and bridges
//! the operator confirmed once are remembered by VID/PID under `[link]`.
//! Without a terminal a single candidate is taken and anything else is a
//! usage error that points at `--port` or `--tcp`.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    payloadlink::{DetectedPort, PortKind, list_serial_ports},
    std::io::IsTerminal,
};

/// How to pick the payload's serial link.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Offer every port, not only recognised bridges.
    pub list_all_ports: bool,
    /// Never prompt; more than one candidate is an error.
    pub non_interactive: bool,
    /// Ask before using even a single recognised bridge.
    pub confirm_port: bool,
}

/// The chosen payload link.
pub struct SelectedPort {
    /// Port the payload is reached through.
    pub port: DetectedPort,
    /// Recognised bridge or remembered device.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Shown when nothing on the host looks like a payload link.
const NO_LINK: &str = "No serial link to a payload found; connect its UART bridge or pass --tcp";

fn select_non_interactive_port(
    selection_ports: Vec<DetectedPort>,
    config: &Config,
) -> Result<SelectedPort> {
    let mut ports = selection_ports.into_iter();
    match (ports.next(), ports.next()) {
        (Some(port), None) => Ok(SelectedPort {
            is_known: is_known_device(&port, config),
            port,
        }),
        (Some(_), Some(_)) => Err(usage_err(
            "Several ports could be the payload link; pass --port (or --tcp) to choose",
        )),
        (None, _) => Err(usage_err(NO_LINK)),
    }
}

/// Pick the serial port the payload is attached to.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name));
    }

    if let Some(port_name) = &config.link.serial {
        debug!("Using payload link from config: {port_name}");
        return Ok(find_port_by_name(port_name));
    }

    let ports = list_serial_ports();
    if ports.is_empty() {
        return Err(usage_err(NO_LINK));
    }

    let known_ports: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();

    let selection_ports = if options.list_all_ports || known_ports.is_empty() {
        ports
    } else {
        known_ports
    };

    if options.non_interactive {
        return select_non_interactive_port(selection_ports, config);
    }

    let mut candidates = selection_ports.into_iter();
    match (candidates.next(), candidates.next()) {
        (Some(port), None) => {
            let is_known = is_known_device(&port, config);
            if is_known && !options.confirm_port {
                info!("Payload link: {} [{}]", port.name, port.kind.name());
                Ok(SelectedPort { port, is_known })
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port)
            }
        },
        (Some(first), Some(second)) => {
            ensure_interactive_terminal()?;
            let ports = [first, second]
                .into_iter()
                .chain(candidates)
                .collect();
            select_port_interactive(ports, config)
        },
        (None, _) => Err(usage_err(NO_LINK)),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Choosing the payload link needs a terminal; pass --port or --tcp",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Payload link selection cancelled".into()).into()
            } else {
                usage_err("Payload link prompt failed")
            }
        },
    }
}

/// Find a port by name, falling back to a bare entry for ports the
/// enumerator does not report.
fn find_port_by_name(name: &str) -> SelectedPort {
    let ports = list_serial_ports();

    if let Some(port) = ports
        .iter()
        .find(|p| p.name == name || p.name.eq_ignore_ascii_case(name))
    {
        return SelectedPort {
            port: port.clone(),
            is_known: port.kind.is_known(),
        };
    }

    SelectedPort {
        port: DetectedPort {
            name: name.to_string(),
            kind: PortKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        },
        is_known: false,
    }
}

/// Check if a port matches a known bridge or a remembered device.
fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    if port.kind.is_known() {
        return true;
    }

    if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        return config
            .link
            .usb_device
            .iter()
            .any(|device| device.matches(vid, pid));
    }

    false
}

/// Label shown for a port in the selection list.
fn port_label(port: &DetectedPort, config: &Config) -> String {
    let name = if is_known_device(port, config) {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };

    let device_info = if port.kind.is_known() {
        format!(" [{}]", style(port.kind.name()).yellow())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };

    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!("{name}{device_info}{product}")
}

/// Let the operator pick among several candidate links.
fn select_port_interactive(mut ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} {} ports could be the payload link",
        style("ℹ").blue(),
        ports.len()
    );
    eprintln!(
        "{}",
        style("Recognised UART bridges are shown in bold").dim()
    );

    ports.sort_by_key(|p| !is_known_device(p, config));

    // Keep labels on one line in narrow terminals
    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|port| console::truncate_str(&port_label(port, config), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Which port is the payload attached to?")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ports
                .into_iter()
                .nth(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            let is_known = is_known_device(&port, config);
            Ok(SelectedPort { port, is_known })
        },
        None => Err(CliError::Cancelled("Payload link selection cancelled".into()).into()),
    }
}

/// Confirm a single port that is not a recognised bridge.
fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Reach the payload through {}{product_info}?", port.name))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            port,
            is_known: false,
        })
    } else {
        Err(CliError::Cancelled("Payload link selection cancelled".into()).into())
    }
}

/// Offer to remember an unrecognised bridge as a payload link.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if config
        .link
        .usb_device
        .iter()
        .any(|device| device.matches(vid, pid))
    {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Remember this USB bridge as a payload link?")
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            error!("Failed to remember payload link {vid:04X}:{pid:04X}: {e}");
        }
    }

    Ok(())
}

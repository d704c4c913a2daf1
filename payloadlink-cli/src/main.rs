//! payloadlink CLI - media downloads and point-cloud recording for payload
//! computers.
//!
//! ## Features
//!
//! - Serve a media directory and download it through the transfer dispatcher
//! - Record point clouds over TCP or a serial link to `.ldrt`
//! - Convert `.ldrt` recordings to PCD and inspect either format
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use payloadlink::MountPosition;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Error classes that map to specific exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration (exit 3).
    #[error("{0}")]
    Config(String),
    /// Interrupted by the user (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

/// payloadlink - transfer, download and point-cloud tooling for drone
/// payload computers.
///
/// Environment variables:
///   PAYLOADLINK_PORT              - Default serial port
///   PAYLOADLINK_BAUD              - Default baud rate (default: 921600)
///   PAYLOADLINK_TCP               - Point-cloud endpoint (host:port)
///   PAYLOADLINK_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "payloadlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    payloadlink files --media-dir /media/card\n  \
    payloadlink download --media-dir /media/card --out downloads\n  \
    payloadlink --tcp 192.168.1.10:9000 record --out cloud.ldrt --packets 500\n  \
    payloadlink convert cloud.ldrt cloud.pcd")]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "PAYLOADLINK_PORT")]
    port: Option<String>,

    /// Baud rate for the serial link [default: 921600].
    #[arg(short, long, global = true, env = "PAYLOADLINK_BAUD")]
    baud: Option<u32>,

    /// TCP endpoint (host:port) used instead of a serial port.
    #[arg(long, global = true, env = "PAYLOADLINK_TCP", conflicts_with = "port")]
    tcp: Option<String>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "PAYLOADLINK_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// Offer all ports for selection (including unknown types).
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Show the media file list of a directory source.
    Files {
        /// Directory served as the payload's media storage.
        #[arg(long, value_name = "DIR")]
        media_dir: PathBuf,

        /// Mount position (payload1, payload2, payload3, fpv, extension).
        #[arg(long, value_parser = parse_mount)]
        mount: Option<MountPosition>,

        /// Output the list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Download every file of a directory source.
    Download {
        /// Directory served as the payload's media storage.
        #[arg(long, value_name = "DIR")]
        media_dir: PathBuf,

        /// Destination root (files land under <OUT>/<mount>/).
        #[arg(long, value_name = "DIR")]
        out: Option<PathBuf>,

        /// Mount position (payload1, payload2, payload3, fpv, extension).
        #[arg(long, value_parser = parse_mount)]
        mount: Option<MountPosition>,

        /// Only download the file with this index.
        #[arg(long)]
        index: Option<u32>,

        /// Bytes per transfer slice.
        #[arg(long, value_name = "BYTES")]
        slice: Option<usize>,

        /// Attempts per file before giving up.
        #[arg(long)]
        attempts: Option<u32>,
    },

    /// Record a point-cloud stream to an .ldrt file.
    Record {
        /// Output .ldrt file.
        #[arg(long, value_name = "FILE")]
        out: PathBuf,

        /// Stop after this many packets (runs until Ctrl-C otherwise).
        #[arg(long)]
        packets: Option<u64>,

        /// Channel id sent when opening the stream.
        #[arg(long)]
        channel_id: Option<u16>,
    },

    /// Convert an .ldrt recording to a binary PCD file.
    Convert {
        /// Input .ldrt file.
        input: PathBuf,

        /// Output .pcd file.
        output: PathBuf,
    },

    /// Summarize an .ldrt or .pcd file.
    Inspect {
        /// File to inspect.
        file: PathBuf,

        /// Output the summary as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Parse a mount position name.
fn parse_mount(s: &str) -> Result<MountPosition, String> {
    MountPosition::from_name(s).ok_or_else(|| {
        format!("Invalid mount position: '{s}'. Expected payload1, payload2, payload3, fpv or extension")
    })
}

/// Map an error onto the process exit code.
pub(crate) fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return match cli_err {
                CliError::Usage(_) => 2,
                CliError::Config(_) => 3,
                CliError::Cancelled(_) => 130,
            };
        }
        if let Some(lib_err) = cause.downcast_ref::<payloadlink::Error>() {
            match lib_err {
                payloadlink::Error::Cancelled => return 130,
                payloadlink::Error::Config(_) => return 3,
                _ => {},
            }
        }
    }
    1
}

fn main() {
    let code = match run() {
        Ok(()) => 0,
        Err(err) => {
            let code = exit_code_for(&err);
            if code == 130 {
                eprintln!("{} {err}", style("Interrupted:").yellow().bold());
            } else {
                eprintln!("{} {err:#}", style("Error:").red().bold());
            }
            code
        },
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

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
        "payloadlink v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::Relaxed) {
            // Second Ctrl-C: give up on a clean shutdown.
            std::process::exit(130);
        }
    }) {
        debug!("Failed to install Ctrl-C handler: {e}");
    }
    payloadlink::set_interrupt_checker(was_interrupted);

    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)?
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Files {
            media_dir,
            mount,
            json,
        } => commands::media::cmd_files(&cli, &config, media_dir, *mount, *json),
        Commands::Download {
            media_dir,
            out,
            mount,
            index,
            slice,
            attempts,
        } => commands::media::cmd_download(
            &cli,
            &config,
            &commands::media::DownloadArgs {
                media_dir: media_dir.clone(),
                out: out.clone(),
                mount: *mount,
                index: *index,
                slice: *slice,
                attempts: *attempts,
            },
        ),
        Commands::Record {
            out,
            packets,
            channel_id,
        } => commands::record::cmd_record(&cli, &mut config, out, *packets, *channel_id),
        Commands::Convert { input, output } => commands::inspect::cmd_convert(&cli, input, output),
        Commands::Inspect { file, json } => commands::inspect::cmd_inspect(file, *json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else if let Some(shell) = shell {
                commands::completions::cmd_completions(*shell);
                Ok(())
            } else {
                Err(CliError::Usage(
                    "specify a shell type, e.g.: payloadlink completions bash \
                     (or use --install to auto-detect)"
                        .into(),
                )
                .into())
            }
        },
    }
}

/// Get serial port from CLI args, config or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.is_known && !cli.non_interactive {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}

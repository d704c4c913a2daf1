//! Point-cloud recording command.

use anyhow::{Context, Result};
use console::style;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use log::{debug, warn};
use payloadlink::link::DEFAULT_BAUD;
use payloadlink::{
    Connector, FramedMopChannel, PointCloudReader, PointCloudStream, ReaderSummary, SerialConfig,
    SerialConnector, StreamEvent, TcpConfig, TcpConnector,
};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, get_port, use_fancy_output, was_interrupted};

/// Channel id opened when neither the command line nor the config names one.
pub(crate) const DEFAULT_CHANNEL_ID: u16 = 49152;

const TICK: Duration = Duration::from_millis(200);

/// Where the point cloud comes from.
#[derive(Debug, PartialEq, Eq)]
enum Endpoint {
    Tcp(String),
    Serial,
}

fn resolve_endpoint(cli: &Cli, config: &Config) -> Endpoint {
    match cli.tcp.clone().or_else(|| {
        // An explicit serial port on the command line beats a configured endpoint.
        if cli.port.is_some() {
            None
        } else {
            config.link.tcp.clone()
        }
    }) {
        Some(addr) => Endpoint::Tcp(addr),
        None => Endpoint::Serial,
    }
}

fn spinner(cli: &Cli) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap(),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Record command implementation.
pub(crate) fn cmd_record(
    cli: &Cli,
    config: &mut Config,
    out: &PathBuf,
    packets: Option<u64>,
    channel_id: Option<u16>,
) -> Result<()> {
    let channel_id = channel_id
        .or(config.pointcloud.channel_id)
        .unwrap_or(DEFAULT_CHANNEL_ID);

    match resolve_endpoint(cli, config) {
        Endpoint::Tcp(addr) => {
            let connector = TcpConnector::new(TcpConfig::new(addr));
            record_with(cli, config, connector, out, packets, channel_id)
        },
        Endpoint::Serial => {
            let port = get_port(cli, config)?;
            let baud = cli
                .baud
                .or(config.link.baud)
                .unwrap_or(DEFAULT_BAUD);
            let connector = SerialConnector::new(SerialConfig::new(port, baud));
            record_with(cli, config, connector, out, packets, channel_id)
        },
    }
}

fn record_with<C>(
    cli: &Cli,
    config: &Config,
    connector: C,
    out: &Path,
    packets: Option<u64>,
    channel_id: u16,
) -> Result<()>
where
    C: Connector + Clone + 'static,
{
    let mut reader_config = config.pointcloud.reader_config();
    if let Some(packets) = packets {
        reader_config = reader_config.with_packet_target(packets);
    }

    let file =
        File::create(out).with_context(|| format!("Failed to create {}", out.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} Recording channel {} from {} to {}",
            style("●").red().bold(),
            style(channel_id).cyan(),
            style(connector.describe()).cyan(),
            style(out.display()).yellow()
        );
    }

    let channel = FramedMopChannel::new(connector.clone(), channel_id);
    let control = FramedMopChannel::new(connector, channel_id);
    let reader = PointCloudReader::new(channel, reader_config);
    let stream = PointCloudStream::spawn(reader, BufWriter::new(file), control)?;

    let pb = spinner(cli);
    pb.set_message("connecting...");
    let mut points = 0u64;
    let mut batches = 0u64;

    loop {
        if was_interrupted() {
            debug!("Stopping point-cloud recording on Ctrl-C");
            break;
        }
        match stream.recv_timeout(TICK) {
            Ok(Some(StreamEvent::Connected { attempts })) => {
                pb.set_message(format!("connected (attempt {attempts})"));
            },
            Ok(Some(StreamEvent::Batch { points: n, .. })) => {
                batches += 1;
                points += n as u64;
                pb.set_message(format!("{batches} packets, {points} points"));
            },
            Ok(Some(StreamEvent::Reconnecting { reconnects })) => {
                pb.suspend(|| warn!("Link dropped, reconnecting (#{reconnects})"));
                pb.set_message("reconnecting...");
            },
            Ok(Some(StreamEvent::Finished(_) | StreamEvent::Failed(_)) | None) => break,
            Err(_) => {},
        }
    }
    pb.finish_and_clear();

    let summary = if was_interrupted() {
        stream.stop()
    } else {
        stream.wait()
    }
    .context("Point-cloud recording failed")?;

    if !cli.quiet {
        print_summary(out, &summary);
    }
    Ok(())
}

fn print_summary(out: &Path, summary: &ReaderSummary) {
    eprintln!(
        "{} Recorded {} packets, {} points ({}) to {}",
        style("✓").green().bold(),
        summary.packets,
        summary.points,
        HumanBytes(summary.bytes),
        style(out.display()).yellow()
    );
    if summary.reconnects > 0 {
        eprintln!("  {} reconnects", summary.reconnects);
    }
    if summary.clamped > 0 {
        eprintln!(
            "  {} {} packets claimed more data than they carried",
            style("!").yellow().bold(),
            summary.clamped
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_endpoint_prefers_cli_tcp() {
        let cli = Cli::try_parse_from([
            "payloadlink",
            "--tcp",
            "10.0.0.2:9000",
            "record",
            "--out",
            "a.ldrt",
        ])
        .unwrap();
        let mut config = Config::default();
        config.link.tcp = Some("10.0.0.3:9000".into());
        assert_eq!(
            resolve_endpoint(&cli, &config),
            Endpoint::Tcp("10.0.0.2:9000".into())
        );
    }

    #[test]
    fn test_endpoint_falls_back_to_config_then_serial() {
        let cli = Cli::try_parse_from(["payloadlink", "record", "--out", "a.ldrt"]).unwrap();
        let mut config = Config::default();
        assert_eq!(resolve_endpoint(&cli, &config), Endpoint::Serial);

        config.link.tcp = Some("10.0.0.3:9000".into());
        assert_eq!(
            resolve_endpoint(&cli, &config),
            Endpoint::Tcp("10.0.0.3:9000".into())
        );
    }

    #[test]
    fn test_endpoint_cli_port_beats_config_tcp() {
        let cli = Cli::try_parse_from([
            "payloadlink",
            "--port",
            "/dev/ttyUSB0",
            "record",
            "--out",
            "a.ldrt",
        ])
        .unwrap();
        let mut config = Config::default();
        config.link.tcp = Some("10.0.0.3:9000".into());
        assert_eq!(resolve_endpoint(&cli, &config), Endpoint::Serial);
    }

    #[test]
    fn test_record_over_tcp_to_packet_target() {
        use payloadlink::mop::{FrameKind, write_frame};
        use std::io::Read;
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            // Open frame from the reader.
            let mut open = [0u8; 10];
            sock.read_exact(&mut open).unwrap();
            for i in 0..2u32 {
                let mut datagram = Vec::new();
                datagram.extend_from_slice(&i.to_le_bytes());
                datagram.extend_from_slice(&0u64.to_le_bytes());
                datagram.extend_from_slice(&15u32.to_le_bytes());
                datagram.extend_from_slice(&1.0f32.to_le_bytes());
                datagram.extend_from_slice(&2.0f32.to_le_bytes());
                datagram.extend_from_slice(&3.0f32.to_le_bytes());
                datagram.extend_from_slice(&[10, 20, 30]);
                write_frame(&mut sock, FrameKind::Data, &datagram).unwrap();
            }
            // Keep the socket open until the control connection shows up.
            let _control = listener.accept();
        });

        let cli = Cli::try_parse_from([
            "payloadlink",
            "--quiet",
            "--tcp",
            addr.as_str(),
            "record",
            "--out",
            "x.ldrt",
        ])
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("x.ldrt");

        let connector = TcpConnector::new(TcpConfig::new(addr));
        record_with(&cli, &Config::default(), connector, &out, Some(2), 7).unwrap();
        server.join().unwrap();

        assert_eq!(std::fs::metadata(&out).unwrap().len(), 30);
    }
}

//! Media listing and download commands.

use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use log::{info, warn};
use payloadlink::{
    DirectoryMediaSource, DirectorySourceConfig, DownloadDispatcher, DownloadDriver,
    DownloadSession, MediaFileList, MediaSource, MountPosition,
};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::{Cli, CliError, use_fancy_output, was_interrupted};

const DEFAULT_OUT_DIR: &str = "downloads";

/// Arguments of the `download` command.
pub(crate) struct DownloadArgs {
    pub(crate) media_dir: PathBuf,
    pub(crate) out: Option<PathBuf>,
    pub(crate) mount: Option<MountPosition>,
    pub(crate) index: Option<u32>,
    pub(crate) slice: Option<usize>,
    pub(crate) attempts: Option<u32>,
}

/// Mount from the command line, then the config file, then the default.
fn resolve_mount(arg: Option<MountPosition>, config: &Config) -> Result<MountPosition> {
    if let Some(mount) = arg {
        return Ok(mount);
    }
    match config.download.mount.as_deref() {
        Some(name) => MountPosition::from_name(name).ok_or_else(|| {
            CliError::Config(format!("Invalid mount position in config: '{name}'")).into()
        }),
        None => Ok(MountPosition::default()),
    }
}

fn open_source(media_dir: &Path, slice: Option<usize>) -> Result<DirectoryMediaSource> {
    let mut source_config = DirectorySourceConfig::new(media_dir);
    if let Some(slice) = slice {
        if slice == 0 {
            return Err(CliError::Usage("--slice must be at least 1 byte".into()).into());
        }
        source_config = source_config.with_slice_size(slice);
    }
    DirectoryMediaSource::open(source_config)
        .with_context(|| format!("Cannot serve {}", media_dir.display()))
}

fn print_list(mount: MountPosition, list: &MediaFileList) {
    eprintln!(
        "{} {} ({} files, {})",
        style("Media files on").bold(),
        style(mount).cyan().bold(),
        list.len(),
        HumanBytes(list.total_bytes())
    );
    if list.is_empty() {
        eprintln!("  {}", style("No media files").dim());
        return;
    }
    for entry in list.iter() {
        eprintln!(
            "  {:>5}  {:<32} {:>10}  {}  {}",
            style(entry.index).yellow(),
            entry.name,
            HumanBytes(u64::from(entry.size)).to_string(),
            style(entry.file_type.extension()).dim(),
            entry.create_time
        );
        for sub in &entry.sub_files {
            eprintln!(
                "         {} {:<30} {:>10}",
                style("└").dim(),
                sub.name,
                HumanBytes(u64::from(sub.size)).to_string()
            );
        }
    }
}

/// `files` command implementation.
pub(crate) fn cmd_files(
    cli: &Cli,
    config: &Config,
    media_dir: &PathBuf,
    mount: Option<MountPosition>,
    json: bool,
) -> Result<()> {
    let mount = resolve_mount(mount, config)?;
    let mut source = open_source(media_dir, None)?;
    let list = source
        .download_file_list(mount)
        .context("Failed to read the media file list")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&list.entries)?);
    } else if !cli.quiet {
        print_list(mount, &list);
    }
    Ok(())
}

fn progress_bar(cli: &Cli, total: usize) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total as u64);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb
}

/// `download` command implementation.
pub(crate) fn cmd_download(cli: &Cli, config: &Config, args: &DownloadArgs) -> Result<()> {
    let mount = resolve_mount(args.mount, config)?;
    let slice = args.slice.or(config.download.slice_size);
    let out_dir = args
        .out
        .clone()
        .or_else(|| config.download.out_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUT_DIR));

    let mut source = open_source(&args.media_dir, slice)?;
    let list = source
        .download_file_list(mount)
        .context("Failed to read the media file list")?;

    let driver = DownloadDriver::new(config.retry.policy(args.attempts));
    let session = DownloadSession::new(&out_dir, mount, list.clone());
    let mut dispatcher = DownloadDispatcher::new(session);

    if !cli.quiet {
        eprintln!(
            "{} Downloading from {} to {}",
            style("⇣").cyan().bold(),
            style(args.media_dir.display()).yellow(),
            style(out_dir.join(mount.dir_name()).display()).yellow()
        );
    }

    if let Some(index) = args.index {
        let entry = list
            .get(index)
            .ok_or_else(|| CliError::Usage(format!("No file with index {index} in the list")))?;
        info!("Downloading single file {index} '{}'", entry.name);
        driver
            .download_file_by_index(&mut source, mount, index, &mut dispatcher)
            .with_context(|| format!("Failed to download file {index}"))?;
    } else {
        let pb = progress_bar(cli, 0);
        let report = driver
            .download_all(&mut source, mount, &list, &mut dispatcher, |done, total, outcome| {
                pb.set_length(total as u64);
                pb.set_position(done as u64);
                pb.set_message(outcome.name.clone());
                if let Some(e) = &outcome.error {
                    pb.suspend(|| warn!("{} '{}' failed: {e}", outcome.target, outcome.name));
                }
            });
        pb.finish_and_clear();

        let report = match report {
            Err(payloadlink::Error::Cancelled) if was_interrupted() => {
                let stats = dispatcher.finish();
                return Err(CliError::Cancelled(format!(
                    "Download interrupted after {} files",
                    stats.completed
                ))
                .into());
            },
            other => other.context("Download failed")?,
        };

        let failed: Vec<String> = report
            .failed()
            .map(|o| format!("{} '{}'", o.target, o.name))
            .collect();
        if !failed.is_empty() {
            dispatcher.finish();
            bail!(
                "{} of {} items failed: {}",
                failed.len(),
                report.outcomes.len(),
                failed.join(", ")
            );
        }
    }

    let stats = dispatcher.finish();
    if !cli.quiet {
        eprintln!(
            "{} {} files, {} written",
            style("✓").green().bold(),
            stats.completed,
            HumanBytes(stats.bytes_written)
        );
    }
    Ok(())
}

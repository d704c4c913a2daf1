//! Index-driven media downloads.
//!
//! A download session takes the downloader rights for a mount position,
//! fetches the file list once and then pulls each file by index. Every
//! file (and every sub-file of a composite entry) is retried in place under
//! a [`RetryPolicy`] before the walk moves on to the next slot.

use crate::error::{Error, Result};
use crate::media::{MediaFileList, SubFileType};
use crate::mount::MountPosition;
use crate::retry::{CancelToken, RetryPolicy};
use crate::transfer::TransferSink;
use log::{debug, error, info, warn};
use std::fmt;
use std::ops::{Deref, DerefMut};

/// The payload core's media download surface.
///
/// Implementations push file contents into the supplied sink as transfer
/// events and return once the transfer finished or failed.
pub trait MediaSource {
    /// Take exclusive download rights for a mount position.
    fn obtain_downloader_rights(&mut self, mount: MountPosition) -> Result<()>;

    /// Give the download rights back.
    fn release_downloader_rights(&mut self, mount: MountPosition) -> Result<()>;

    /// Snapshot the media file list.
    fn download_file_list(&mut self, mount: MountPosition) -> Result<MediaFileList>;

    /// Download one file by its list index.
    fn download_file(
        &mut self,
        mount: MountPosition,
        index: u32,
        sink: &mut dyn TransferSink,
    ) -> Result<()>;

    /// Download one sub-file of a composite entry.
    fn download_sub_file(
        &mut self,
        mount: MountPosition,
        index: u32,
        sub_type: SubFileType,
        sink: &mut dyn TransferSink,
    ) -> Result<()>;
}

impl<S: MediaSource + ?Sized> MediaSource for &mut S {
    fn obtain_downloader_rights(&mut self, mount: MountPosition) -> Result<()> {
        (**self).obtain_downloader_rights(mount)
    }

    fn release_downloader_rights(&mut self, mount: MountPosition) -> Result<()> {
        (**self).release_downloader_rights(mount)
    }

    fn download_file_list(&mut self, mount: MountPosition) -> Result<MediaFileList> {
        (**self).download_file_list(mount)
    }

    fn download_file(
        &mut self,
        mount: MountPosition,
        index: u32,
        sink: &mut dyn TransferSink,
    ) -> Result<()> {
        (**self).download_file(mount, index, sink)
    }

    fn download_sub_file(
        &mut self,
        mount: MountPosition,
        index: u32,
        sub_type: SubFileType,
        sink: &mut dyn TransferSink,
    ) -> Result<()> {
        (**self).download_sub_file(mount, index, sub_type, sink)
    }
}

/// Held downloader rights. Released on drop.
pub struct DownloaderRights<'a, S: MediaSource + ?Sized> {
    source: &'a mut S,
    mount: MountPosition,
    released: bool,
}

impl<'a, S: MediaSource + ?Sized> DownloaderRights<'a, S> {
    /// Obtain rights for `mount`.
    pub fn acquire(source: &'a mut S, mount: MountPosition) -> Result<Self> {
        source.obtain_downloader_rights(mount)?;
        debug!("[{mount}] Downloader rights obtained");
        Ok(Self {
            source,
            mount,
            released: false,
        })
    }

    /// Mount position the rights are held for.
    pub fn mount(&self) -> MountPosition {
        self.mount
    }

    /// Release the rights now and report the result.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.source
            .release_downloader_rights(self.mount)
    }
}

impl<S: MediaSource + ?Sized> Deref for DownloaderRights<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.source
    }
}

impl<S: MediaSource + ?Sized> DerefMut for DownloaderRights<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.source
    }
}

impl<S: MediaSource + ?Sized> Drop for DownloaderRights<'_, S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self
            .source
            .release_downloader_rights(self.mount)
        {
            Ok(()) => debug!("[{}] Downloader rights released", self.mount),
            Err(e) => warn!("[{}] Failed to release downloader rights: {e}", self.mount),
        }
    }
}

/// One downloadable item: a file, or one sub-file of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadTarget {
    /// File index in the list.
    pub index: u32,
    /// Sub-file type, for composite entries.
    pub sub_type: Option<SubFileType>,
}

impl DownloadTarget {
    /// A top-level file.
    pub fn file(index: u32) -> Self {
        Self {
            index,
            sub_type: None,
        }
    }

    /// A sub-file of a composite entry.
    pub fn sub_file(index: u32, sub_type: SubFileType) -> Self {
        Self {
            index,
            sub_type: Some(sub_type),
        }
    }
}

impl fmt::Display for DownloadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sub_type {
            Some(sub) => write!(f, "file {} ({})", self.index, sub.extension()),
            None => write!(f, "file {}", self.index),
        }
    }
}

/// Result of one item in a batch.
#[derive(Debug)]
pub struct FileOutcome {
    /// What was downloaded.
    pub target: DownloadTarget,
    /// Entry name from the file list.
    pub name: String,
    /// Attempts made.
    pub attempts: u32,
    /// Final error, if the item failed.
    pub error: Option<Error>,
}

impl FileOutcome {
    /// Whether the item was downloaded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of a batch download.
#[derive(Debug, Default)]
pub struct DownloadReport {
    /// Per-item outcomes in download order.
    pub outcomes: Vec<FileOutcome>,
}

impl DownloadReport {
    /// Number of items downloaded.
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.is_ok())
            .count()
    }

    /// Items that failed.
    pub fn failed(&self) -> impl Iterator<Item = &FileOutcome> {
        self.outcomes
            .iter()
            .filter(|o| !o.is_ok())
    }

    /// Whether every item was downloaded.
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(FileOutcome::is_ok)
    }
}

/// Drives downloads through a [`MediaSource`].
#[derive(Debug, Clone, Default)]
pub struct DownloadDriver {
    policy: RetryPolicy,
    cancel: CancelToken,
}

impl DownloadDriver {
    /// Create a driver with the given per-item retry policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            cancel: CancelToken::new(),
        }
    }

    /// Use an external cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Retry policy applied to each item.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Download a single file, holding the rights for the duration.
    pub fn download_file_by_index<S, K>(
        &self,
        source: &mut S,
        mount: MountPosition,
        index: u32,
        sink: &mut K,
    ) -> Result<()>
    where
        S: MediaSource + ?Sized,
        K: TransferSink,
    {
        let mut rights = DownloaderRights::acquire(source, mount)?;
        let (_, result) = self.fetch(&mut rights, DownloadTarget::file(index), sink);
        result?;
        rights.release()
    }

    /// Download every entry of `list` (and every sub-file of composite
    /// entries), in list order.
    ///
    /// Items that fail are recorded in the report and the walk continues.
    /// Only cancellation aborts the batch. `progress` is called after every
    /// item with `(done, total, outcome)`.
    pub fn download_all<S, K, P>(
        &self,
        source: &mut S,
        mount: MountPosition,
        list: &MediaFileList,
        sink: &mut K,
        mut progress: P,
    ) -> Result<DownloadReport>
    where
        S: MediaSource + ?Sized,
        K: TransferSink,
        P: FnMut(usize, usize, &FileOutcome),
    {
        let targets: Vec<(DownloadTarget, String)> = list
            .iter()
            .flat_map(|entry| {
                let subs = entry
                    .sub_files
                    .iter()
                    .filter(move |_| entry.file_type.is_composite())
                    .map(move |sub| {
                        (
                            DownloadTarget::sub_file(entry.index, sub.sub_type),
                            sub.name.clone(),
                        )
                    });
                std::iter::once((DownloadTarget::file(entry.index), entry.name.clone())).chain(subs)
            })
            .collect();

        let total = targets.len();
        info!("[{mount}] Downloading {total} items ({} files)", list.len());

        let mut rights = DownloaderRights::acquire(source, mount)?;
        let mut report = DownloadReport::default();

        for (target, name) in targets {
            self.cancel.check()?;

            let (attempts, result) = self.fetch(&mut rights, target, sink);
            let error = match result {
                Ok(()) => None,
                Err(Error::Cancelled) => {
                    warn!("[{mount}] Download cancelled at {target}");
                    return Err(Error::Cancelled);
                },
                Err(e) => {
                    error!("[{mount}] Giving up on {target} '{name}': {e}");
                    Some(e)
                },
            };

            let outcome = FileOutcome {
                target,
                name,
                attempts,
                error,
            };
            progress(report.outcomes.len() + 1, total, &outcome);
            report.outcomes.push(outcome);
        }

        if let Err(e) = rights.release() {
            warn!("[{mount}] Failed to release downloader rights after the batch: {e}");
        }
        info!(
            "[{mount}] Download finished: {}/{total} items",
            report.succeeded()
        );
        Ok(report)
    }

    fn fetch<S, K>(
        &self,
        rights: &mut DownloaderRights<'_, S>,
        target: DownloadTarget,
        sink: &mut K,
    ) -> (u32, Result<()>)
    where
        S: MediaSource + ?Sized,
        K: TransferSink,
    {
        let mount = rights.mount();
        let what = format!("[{mount}] download of {target}");
        let mut attempts = 0;

        let result = self
            .policy
            .run(&self.cancel, &what, |attempt| {
                attempts = attempt;
                debug!("[{mount}] Requesting {target} (attempt {attempt})");
                match target.sub_type {
                    Some(sub) => rights.download_sub_file(mount, target.index, sub, &mut *sink),
                    None => rights.download_file(mount, target.index, &mut *sink),
                }
            });
        (attempts, result)
    }
}

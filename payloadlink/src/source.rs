//! A local directory served as a [`MediaSource`].
//!
//! Lets the download driver and dispatcher run end-to-end without a
//! payload attached: regular files in the directory become list entries,
//! and their contents are replayed as sliced transfer events.

use crate::download::MediaSource;
use crate::error::{Error, Result};
use crate::media::{
    CreateTime, MediaFileList, MediaFileListEntry, MediaFileType, NameWidth, SubFileEntry,
    SubFileType,
};
use crate::mount::MountPosition;
use crate::transfer::{MAX_CHUNK_LEN, TransferEventInfo, TransferEventKind, TransferSink};
use chrono::{DateTime, Datelike, Local, Timelike};
use log::{debug, trace, warn};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Default slice size for replayed transfers.
pub const DEFAULT_SLICE_SIZE: usize = 32 * 1024;

/// Directory source configuration.
#[derive(Debug, Clone)]
pub struct DirectorySourceConfig {
    /// Directory to serve.
    pub dir: PathBuf,
    /// Bytes per TRANSFER event.
    pub slice_size: usize,
    /// Index of the first file.
    pub first_index: u32,
    /// Gap between consecutive indices.
    pub index_step: u32,
}

impl DirectorySourceConfig {
    /// Serve `dir` with default slicing and contiguous indices from 0.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            slice_size: DEFAULT_SLICE_SIZE,
            first_index: 0,
            index_step: 1,
        }
    }

    /// Set the slice size (clamped to 1..=65535).
    #[must_use]
    pub fn with_slice_size(mut self, slice_size: usize) -> Self {
        self.slice_size = slice_size.clamp(1, MAX_CHUNK_LEN);
        self
    }

    /// Set the first index.
    #[must_use]
    pub fn with_first_index(mut self, first_index: u32) -> Self {
        self.first_index = first_index;
        self
    }

    /// Set the index step (zero is treated as one).
    #[must_use]
    pub fn with_index_step(mut self, index_step: u32) -> Self {
        self.index_step = index_step.max(1);
        self
    }
}

struct Catalog {
    list: MediaFileList,
    files: HashMap<u32, PathBuf>,
    sub_files: HashMap<(u32, SubFileType), PathBuf>,
}

/// Media source backed by a local directory.
pub struct DirectoryMediaSource {
    config: DirectorySourceConfig,
    rights: HashSet<MountPosition>,
    catalog: Option<Catalog>,
}

impl DirectoryMediaSource {
    /// Open a directory source. Fails if the directory does not exist.
    pub fn open(config: DirectorySourceConfig) -> Result<Self> {
        if !config.dir.is_dir() {
            return Err(Error::NotFound(format!(
                "media directory {} does not exist",
                config.dir.display()
            )));
        }
        Ok(Self {
            config,
            rights: HashSet::new(),
            catalog: None,
        })
    }

    /// Directory being served.
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    fn scan(&self) -> Result<Catalog> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.config.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                !file_name(path).starts_with('.')
            })
            .collect();
        paths.sort();

        // Stems of composite captures, lowercased.
        let composite_stems: HashSet<String> = paths
            .iter()
            .filter(|p| extension(p) == "ldrt")
            .map(|p| stem(p))
            .collect();

        let mut top_level = Vec::new();
        let mut subs: HashMap<String, Vec<(SubFileType, PathBuf)>> = HashMap::new();
        for path in paths {
            let sub_type = SubFileType::from_extension(&extension(&path));
            match sub_type {
                Some(sub_type) if composite_stems.contains(&stem(&path)) => {
                    subs.entry(stem(&path))
                        .or_default()
                        .push((sub_type, path));
                },
                _ => top_level.push(path),
            }
        }

        let mut catalog = Catalog {
            list: MediaFileList::default(),
            files: HashMap::new(),
            sub_files: HashMap::new(),
        };
        let mut index = self.config.first_index;

        for path in top_level {
            let name = file_name(&path);
            if name.len() >= NameWidth::Camera.bytes() {
                warn!("Skipping {}: name too long", path.display());
                continue;
            }
            let metadata = fs::metadata(&path)?;
            let Ok(size) = u32::try_from(metadata.len()) else {
                warn!("Skipping {}: larger than 4 GiB", path.display());
                continue;
            };

            let file_type = MediaFileType::from_extension(&extension(&path));
            let mut entry = MediaFileListEntry::new(name, index, size, file_type);
            if let Ok(modified) = metadata.modified() {
                entry.create_time = create_time(DateTime::<Local>::from(modified));
            }

            if file_type.is_composite() {
                for (sub_type, sub_path) in subs.remove(&stem(&path)).unwrap_or_default() {
                    let sub_size = u32::try_from(fs::metadata(&sub_path)?.len()).unwrap_or(u32::MAX);
                    entry.sub_files.push(SubFileEntry {
                        name: file_name(&sub_path),
                        size: sub_size,
                        sub_type,
                    });
                    catalog.sub_files.insert((index, sub_type), sub_path);
                }
            }

            trace!("Listed {} as index {index}", entry.name);
            catalog.files.insert(index, path);
            catalog.list.entries.push(entry);
            index = index.saturating_add(self.config.index_step);
        }

        debug!(
            "Scanned {}: {} files",
            self.config.dir.display(),
            catalog.list.len()
        );
        Ok(catalog)
    }

    fn require_rights(&self, mount: MountPosition) -> Result<()> {
        if self.rights.contains(&mount) {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "downloader rights for {mount} not held"
            )))
        }
    }

    fn catalog(&mut self) -> Result<&Catalog> {
        if self.catalog.is_none() {
            self.catalog = Some(self.scan()?);
        }
        self.catalog
            .as_ref()
            .ok_or_else(|| Error::InvalidState("file list unavailable".into()))
    }

    fn replay(
        &self,
        path: &Path,
        info: TransferEventInfo,
        sink: &mut dyn TransferSink,
    ) -> Result<()> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        let info = TransferEventInfo {
            file_size: size,
            ..info
        };
        let slice = self.config.slice_size.clamp(1, MAX_CHUNK_LEN);

        if size <= slice as u64 {
            let mut data = Vec::with_capacity(size as usize);
            file.read_to_end(&mut data)?;
            let info = info
                .with_kind(TransferEventKind::StartTransferEnd)
                .with_progress(100);
            return sink.on_event(&info, 0, &data);
        }

        let result = replay_slices(&mut file, size, slice, &info, sink);
        if let Err(e) = &result {
            warn!("Transfer of file {} failed: {e}; sending ABORT", info.file_index);
            let abort = info.clone().with_kind(TransferEventKind::Abort);
            if let Err(abort_err) = sink.on_event(&abort, 0, &[]) {
                warn!("ABORT for file {} failed: {abort_err}", info.file_index);
            }
        }
        result
    }
}

/// Emit START, TRANSFER... and END for a file larger than one slice.
fn replay_slices(
    file: &mut File,
    size: u64,
    slice: usize,
    info: &TransferEventInfo,
    sink: &mut dyn TransferSink,
) -> Result<()> {
    let mut buf = vec![0u8; slice];
    let mut offset = 0u64;
    let mut kind = TransferEventKind::Start;
    loop {
        let n = read_full(file, &mut buf)?;
        let next = offset + n as u64;
        if next >= size || n == 0 {
            kind = TransferEventKind::End;
        }
        let progress = (next.min(size) * 100 / size) as u8;
        sink.on_event(
            &info.clone().with_kind(kind).with_progress(progress),
            offset,
            &buf[..n],
        )?;
        if kind == TransferEventKind::End {
            return Ok(());
        }
        offset = next;
        kind = TransferEventKind::Transfer;
    }
}

impl MediaSource for DirectoryMediaSource {
    fn obtain_downloader_rights(&mut self, mount: MountPosition) -> Result<()> {
        if !self.rights.insert(mount) {
            return Err(Error::Busy(format!("downloader rights for {mount} already held")));
        }
        Ok(())
    }

    fn release_downloader_rights(&mut self, mount: MountPosition) -> Result<()> {
        if !self.rights.remove(&mount) {
            warn!("Releasing downloader rights for {mount} that were not held");
        }
        Ok(())
    }

    fn download_file_list(&mut self, _mount: MountPosition) -> Result<MediaFileList> {
        let catalog = self.scan()?;
        let list = catalog.list.clone();
        self.catalog = Some(catalog);
        Ok(list)
    }

    fn download_file(
        &mut self,
        mount: MountPosition,
        index: u32,
        sink: &mut dyn TransferSink,
    ) -> Result<()> {
        self.require_rights(mount)?;
        let catalog = self.catalog()?;
        let (path, file_type) = catalog
            .files
            .get(&index)
            .zip(catalog.list.get(index))
            .map(|(p, e)| (p.clone(), e.file_type))
            .ok_or_else(|| Error::NotFound(format!("file index {index}")))?;

        let info = TransferEventInfo::new(TransferEventKind::Start, index, 0, file_type);
        self.replay(&path, info, sink)
    }

    fn download_sub_file(
        &mut self,
        mount: MountPosition,
        index: u32,
        sub_type: SubFileType,
        sink: &mut dyn TransferSink,
    ) -> Result<()> {
        self.require_rights(mount)?;
        let catalog = self.catalog()?;
        let (path, file_type) = catalog
            .sub_files
            .get(&(index, sub_type))
            .zip(catalog.list.get(index))
            .map(|(p, e)| (p.clone(), e.file_type))
            .ok_or_else(|| {
                Error::NotFound(format!("{} sub-file of index {index}", sub_type.extension()))
            })?;

        let info = TransferEventInfo::new(TransferEventKind::Start, index, 0, file_type)
            .with_sub_type(Some(sub_type));
        self.replay(&path, info, sink)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn extension(path: &Path) -> String {
    path.extension()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn create_time(time: DateTime<Local>) -> CreateTime {
    CreateTime {
        year: u16::try_from(time.year()).unwrap_or(0),
        month: time.month() as u8,
        day: time.day() as u8,
        hour: time.hour() as u8,
        minute: time.minute() as u8,
        second: time.second() as u8,
    }
}

/// Fill `buf` unless EOF comes first.
fn read_full(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::DownloadDriver;
    use crate::retry::RetryPolicy;
    use crate::transfer::{DownloadDispatcher, DownloadSession};
    use tempfile::tempdir;

    #[derive(Default)]
    struct Events {
        kinds: Vec<(TransferEventKind, u64, usize)>,
    }

    impl TransferSink for Events {
        fn on_event(&mut self, info: &TransferEventInfo, offset: u64, data: &[u8]) -> Result<()> {
            self.kinds.push((info.kind, offset, data.len()));
            Ok(())
        }
    }

    fn populate(dir: &Path) {
        fs::write(dir.join("DJI_0001.JPG"), b"jpeg").unwrap();
        fs::write(dir.join("DJI_0002.MP4"), vec![7u8; 100]).unwrap();
        fs::write(dir.join("SCAN_0003.LDRT"), vec![1u8; 30]).unwrap();
        fs::write(dir.join("SCAN_0003.RTK"), b"rtk").unwrap();
        fs::write(dir.join("SCAN_0003.IMU"), b"imu").unwrap();
        fs::write(dir.join(".hidden"), b"x").unwrap();
    }

    #[test]
    fn test_list_indices_and_sub_files() {
        let dir = tempdir().unwrap();
        populate(dir.path());

        let config = DirectorySourceConfig::new(dir.path())
            .with_first_index(5)
            .with_index_step(2);
        let mut source = DirectoryMediaSource::open(config).unwrap();
        let list = source
            .download_file_list(MountPosition::Payload1)
            .unwrap();

        let indices: Vec<u32> = list.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![5, 7, 9]);
        let scan = list.get(9).unwrap();
        assert_eq!(scan.file_type, MediaFileType::Ldrt);
        let mut subs: Vec<_> = scan.sub_files.iter().map(|s| s.sub_type).collect();
        subs.sort_by_key(SubFileType::as_u8);
        assert_eq!(subs, vec![SubFileType::Rtk, SubFileType::Imu]);
        assert!(scan.create_time.year >= 2000);
    }

    #[test]
    fn test_slicing() {
        let dir = tempdir().unwrap();
        populate(dir.path());

        let mut source =
            DirectoryMediaSource::open(DirectorySourceConfig::new(dir.path()).with_slice_size(40))
                .unwrap();
        source
            .download_file_list(MountPosition::Payload1)
            .unwrap();
        source
            .obtain_downloader_rights(MountPosition::Payload1)
            .unwrap();

        let mut events = Events::default();
        source
            .download_file(MountPosition::Payload1, 1, &mut events)
            .unwrap();
        assert_eq!(
            events.kinds,
            vec![
                (TransferEventKind::Start, 0, 40),
                (TransferEventKind::Transfer, 40, 40),
                (TransferEventKind::End, 80, 20),
            ]
        );

        let mut small = Events::default();
        source
            .download_file(MountPosition::Payload1, 0, &mut small)
            .unwrap();
        assert_eq!(small.kinds, vec![(TransferEventKind::StartTransferEnd, 0, 4)]);
    }

    #[test]
    fn test_rights_required_and_exclusive() {
        let dir = tempdir().unwrap();
        populate(dir.path());
        let mut source = DirectoryMediaSource::open(DirectorySourceConfig::new(dir.path())).unwrap();

        assert!(matches!(
            source.download_file(MountPosition::Payload1, 0, &mut Events::default()),
            Err(Error::InvalidState(_))
        ));
        source
            .obtain_downloader_rights(MountPosition::Payload1)
            .unwrap();
        assert!(matches!(
            source.obtain_downloader_rights(MountPosition::Payload1),
            Err(Error::Busy(_))
        ));
        source
            .release_downloader_rights(MountPosition::Payload1)
            .unwrap();
        source
            .obtain_downloader_rights(MountPosition::Payload1)
            .unwrap();
    }

    #[test]
    fn test_end_to_end_copy() {
        let media = tempdir().unwrap();
        let out = tempdir().unwrap();
        populate(media.path());

        let mut source =
            DirectoryMediaSource::open(DirectorySourceConfig::new(media.path()).with_slice_size(16))
                .unwrap();
        let files = source
            .download_file_list(MountPosition::Payload2)
            .unwrap();
        let mut dispatcher = DownloadDispatcher::new(DownloadSession::new(
            out.path(),
            MountPosition::Payload2,
            files.clone(),
        ));

        let report = DownloadDriver::new(RetryPolicy::no_retry())
            .download_all(&mut source, MountPosition::Payload2, &files, &mut dispatcher, |_, _, _| {})
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.succeeded(), 5);
        let dest = out.path().join("payload2");
        assert_eq!(fs::read(dest.join("DJI_0002.MP4")).unwrap(), vec![7u8; 100]);
        assert_eq!(fs::read(dest.join("SCAN_0003.rtk")).unwrap(), b"rtk");
        assert_eq!(fs::read(dest.join("SCAN_0003.imu")).unwrap(), b"imu");
        assert_eq!(dispatcher.stats().aborted, 0);
    }

    /// Passes events to a dispatcher, failing the `fail_at`-th one.
    struct FailingSink<'a> {
        inner: &'a mut DownloadDispatcher,
        seen: usize,
        fail_at: usize,
    }

    impl TransferSink for FailingSink<'_> {
        fn on_event(&mut self, info: &TransferEventInfo, offset: u64, data: &[u8]) -> Result<()> {
            self.seen += 1;
            if self.seen == self.fail_at {
                return Err(Error::Io(std::io::Error::other("disk full")));
            }
            self.inner.on_event(info, offset, data)
        }
    }

    #[test]
    fn test_sink_failure_aborts_open_transfer() {
        let media = tempdir().unwrap();
        let out = tempdir().unwrap();
        populate(media.path());

        let mut source =
            DirectoryMediaSource::open(DirectorySourceConfig::new(media.path()).with_slice_size(40))
                .unwrap();
        let files = source
            .download_file_list(MountPosition::Payload1)
            .unwrap();
        source
            .obtain_downloader_rights(MountPosition::Payload1)
            .unwrap();
        let mut dispatcher = DownloadDispatcher::new(DownloadSession::new(
            out.path(),
            MountPosition::Payload1,
            files,
        ));

        // START goes through, the first TRANSFER fails.
        let mut sink = FailingSink {
            inner: &mut dispatcher,
            seen: 0,
            fail_at: 2,
        };
        assert!(matches!(
            source.download_file(MountPosition::Payload1, 1, &mut sink),
            Err(Error::Io(_))
        ));

        assert!(!dispatcher.is_open());
        let stats = dispatcher.stats();
        assert_eq!(stats.started, 1);
        assert_eq!(stats.aborted, 1);
        assert_eq!(stats.completed, 0);
        assert!(dispatcher.completed().is_empty());
    }

    #[test]
    fn test_missing_dir() {
        assert!(matches!(
            DirectoryMediaSource::open(DirectorySourceConfig::new("/nonexistent/payloadlink")),
            Err(Error::NotFound(_))
        ));
    }
}

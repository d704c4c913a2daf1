//! Transfer events to files on disk.

use super::{TransferEventInfo, TransferEventKind, TransferSink, check_chunk_len};
use crate::error::{Error, Result};
use crate::media::{MediaFileList, MediaFileListEntry, SubFileType};
use crate::mount::MountPosition;
use log::{debug, info, trace, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Per-session download context: where files go and what they are.
#[derive(Debug, Clone)]
pub struct DownloadSession {
    root: PathBuf,
    mount: MountPosition,
    files: MediaFileList,
}

impl DownloadSession {
    /// Create a session writing below `root`.
    pub fn new(root: impl Into<PathBuf>, mount: MountPosition, files: MediaFileList) -> Self {
        Self {
            root: root.into(),
            mount,
            files,
        }
    }

    /// Root output directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mount position the files come from.
    pub fn mount(&self) -> MountPosition {
        self.mount
    }

    /// File list snapshot.
    pub fn files(&self) -> &MediaFileList {
        &self.files
    }

    fn entry(&self, file_index: u32) -> Result<&MediaFileListEntry> {
        self.files
            .get(file_index)
            .ok_or_else(|| Error::NotFound(format!("file index {file_index} not in file list")))
    }

    /// Destination path for a file or one of its sub-files.
    ///
    /// Layout: `root/<mount>/<name>`; a sub-file takes the parent's stem with
    /// the sub-type's extension.
    pub fn path_for(&self, file_index: u32, sub_type: Option<SubFileType>) -> Result<PathBuf> {
        let entry = self.entry(file_index)?;
        let name = self.unique_name(file_index, sanitize_file_name(&entry.name, file_index));
        let dir = self
            .root
            .join(self.mount.dir_name());

        let Some(sub_type) = sub_type else {
            return Ok(dir.join(name));
        };

        if !entry.file_type.is_composite() || entry.sub_file(sub_type).is_none() {
            return Err(Error::NotFound(format!(
                "file index {file_index} has no {} sub-file",
                sub_type.extension()
            )));
        }
        let stem = Path::new(&name)
            .file_stem()
            .map_or_else(|| name.clone(), |s| s.to_string_lossy().to_string());
        Ok(dir.join(format!("{stem}.{}", sub_type.extension())))
    }

    /// Suffix `name` with the index when an earlier entry of the list
    /// already claims the same file name.
    fn unique_name(&self, file_index: u32, name: String) -> String {
        let taken = self
            .files
            .iter()
            .take_while(|e| e.index != file_index)
            .any(|e| sanitize_file_name(&e.name, e.index) == name);
        if !taken {
            return name;
        }
        let path = Path::new(&name);
        let unique = match (path.file_stem(), path.extension()) {
            (Some(stem), Some(ext)) => format!(
                "{}_{file_index}.{}",
                stem.to_string_lossy(),
                ext.to_string_lossy()
            ),
            _ => format!("{name}_{file_index}"),
        };
        warn!("File {file_index} '{name}' clashes with an earlier entry; writing {unique}");
        unique
    }
}

/// Keep only a plain file name: no directories, no parent references.
fn sanitize_file_name(name: &str, file_index: u32) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '\\' || c == '\0' { '_' } else { c })
        .collect();
    match Path::new(&cleaned).file_name() {
        Some(n) if n != ".." => n.to_string_lossy().to_string(),
        _ => format!("file_{file_index}"),
    }
}

/// Transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Handles opened (START and START_TRANSFER_END).
    pub started: u64,
    /// Handles closed by END or START_TRANSFER_END.
    pub completed: u64,
    /// Handles closed by ABORT, a superseding START or `finish`.
    pub aborted: u64,
    /// Payload bytes written, replays included.
    pub bytes_written: u64,
}

struct OpenTransfer {
    file_index: u32,
    sub_type: Option<SubFileType>,
    path: PathBuf,
    file: File,
}

impl OpenTransfer {
    fn matches(&self, info: &TransferEventInfo) -> bool {
        self.file_index == info.file_index && self.sub_type == info.sub_type
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn finish(mut self) -> Result<PathBuf> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(self.path)
    }
}

/// Writes transfer events into files laid out by a [`DownloadSession`].
///
/// At most one destination is open at a time. A START that arrives while a
/// destination is still open closes that one first and counts it as aborted.
pub struct DownloadDispatcher {
    session: DownloadSession,
    open: Option<OpenTransfer>,
    stats: TransferStats,
    completed: Vec<PathBuf>,
    last_progress: Option<u8>,
}

impl DownloadDispatcher {
    /// Create a dispatcher for a session.
    pub fn new(session: DownloadSession) -> Self {
        Self {
            session,
            open: None,
            stats: TransferStats::default(),
            completed: Vec::new(),
            last_progress: None,
        }
    }

    /// The session this dispatcher writes for.
    pub fn session(&self) -> &DownloadSession {
        &self.session
    }

    /// Counters so far.
    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    /// Paths of files closed by END or START_TRANSFER_END, in order.
    pub fn completed(&self) -> &[PathBuf] {
        &self.completed
    }

    /// Last progress value reported by the core. Display only.
    pub fn last_progress(&self) -> Option<u8> {
        self.last_progress
    }

    /// Whether a destination is currently open.
    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Close any open destination (counted as aborted) and return the counters.
    pub fn finish(mut self) -> TransferStats {
        if let Some(open) = self.open.take() {
            warn!(
                "Closing unfinished transfer of file {} ({})",
                open.file_index,
                open.path.display()
            );
            self.stats.aborted += 1;
        }
        self.stats
    }

    fn open_destination(&mut self, info: &TransferEventInfo) -> Result<OpenTransfer> {
        if let Some(previous) = self.open.take() {
            warn!(
                "START for file {} while file {} is still open; closing {}",
                info.file_index,
                previous.file_index,
                previous.path.display()
            );
            self.stats.aborted += 1;
        }

        let path = self
            .session
            .path_for(info.file_index, info.sub_type)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        debug!(
            "[{}] Opened {} for file {} ({} bytes)",
            self.session.mount,
            path.display(),
            info.file_index,
            info.file_size
        );
        self.stats.started += 1;

        Ok(OpenTransfer {
            file_index: info.file_index,
            sub_type: info.sub_type,
            path,
            file,
        })
    }

    fn current(&mut self, info: &TransferEventInfo) -> Result<&mut OpenTransfer> {
        match self.open.as_mut() {
            Some(open) if open.matches(info) => Ok(open),
            Some(open) => Err(Error::InvalidState(format!(
                "{:?} for file {} while file {} is open",
                info.kind, info.file_index, open.file_index
            ))),
            None => Err(Error::InvalidState(format!(
                "{:?} for file {} without a START",
                info.kind, info.file_index
            ))),
        }
    }

    fn complete(&mut self, open: OpenTransfer) -> Result<()> {
        let path = open.finish()?;
        info!(
            "[{}] Downloaded {}",
            self.session.mount,
            path.display()
        );
        self.stats.completed += 1;
        self.completed.push(path);
        Ok(())
    }
}

impl TransferSink for DownloadDispatcher {
    fn on_event(&mut self, info: &TransferEventInfo, offset: u64, data: &[u8]) -> Result<()> {
        check_chunk_len(data)?;
        self.last_progress = Some(info.progress_percent);
        trace!(
            "{:?} file {} offset {offset} len {} ({}%)",
            info.kind,
            info.file_index,
            data.len(),
            info.progress_percent
        );

        match info.kind {
            TransferEventKind::Start => {
                let mut open = self.open_destination(info)?;
                open.write_at(0, data)?;
                self.stats.bytes_written += data.len() as u64;
                self.open = Some(open);
            },
            TransferEventKind::Transfer => {
                self.current(info)?
                    .write_at(offset, data)?;
                self.stats.bytes_written += data.len() as u64;
            },
            TransferEventKind::End => {
                self.current(info)?
                    .write_at(offset, data)?;
                self.stats.bytes_written += data.len() as u64;
                if let Some(open) = self.open.take() {
                    self.complete(open)?;
                }
            },
            TransferEventKind::Abort => match self.open.take() {
                Some(open) => {
                    if !open.matches(info) {
                        warn!(
                            "ABORT for file {} closes open file {}",
                            info.file_index, open.file_index
                        );
                    }
                    warn!(
                        "[{}] Transfer of file {} aborted; partial data left in {}",
                        self.session.mount,
                        open.file_index,
                        open.path.display()
                    );
                    self.stats.aborted += 1;
                },
                None => debug!("ABORT for file {} with nothing open", info.file_index),
            },
            TransferEventKind::StartTransferEnd => {
                let mut open = self.open_destination(info)?;
                open.write_at(0, data)?;
                self.stats.bytes_written += data.len() as u64;
                self.complete(open)?;
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaFileType, SubFileEntry};
    use tempfile::tempdir;

    fn files() -> MediaFileList {
        let mut scan = MediaFileListEntry::new("SCAN_0009.LDRT", 9, 64, MediaFileType::Ldrt);
        scan.sub_files.push(SubFileEntry {
            name: "SCAN_0009.RTK".into(),
            size: 8,
            sub_type: SubFileType::Rtk,
        });
        MediaFileList::new(vec![
            MediaFileListEntry::new("DJI_0005.JPG", 5, 10, MediaFileType::Jpeg),
            MediaFileListEntry::new("DJI_0007.MP4", 7, 12, MediaFileType::Mp4),
            scan,
        ])
    }

    fn event(kind: TransferEventKind, index: u32) -> TransferEventInfo {
        TransferEventInfo::new(kind, index, 10, MediaFileType::Jpeg)
    }

    #[test]
    fn test_start_transfer_end_writes_file() {
        let dir = tempdir().unwrap();
        let mut d = DownloadDispatcher::new(DownloadSession::new(
            dir.path(),
            MountPosition::Payload1,
            files(),
        ));

        d.on_event(&event(TransferEventKind::Start, 5), 0, b"hello")
            .unwrap();
        d.on_event(&event(TransferEventKind::Transfer, 5), 5, b" wor")
            .unwrap();
        d.on_event(&event(TransferEventKind::End, 5), 9, b"ld")
            .unwrap();

        let path = dir.path().join("payload1").join("DJI_0005.JPG");
        assert_eq!(fs::read(&path).unwrap(), b"hello world");
        assert_eq!(d.completed(), &[path]);
        assert!(!d.is_open());
        assert_eq!(d.stats().completed, 1);
    }

    #[test]
    fn test_replayed_offset_overwrites() {
        let dir = tempdir().unwrap();
        let mut d = DownloadDispatcher::new(DownloadSession::new(
            dir.path(),
            MountPosition::Payload2,
            files(),
        ));

        d.on_event(&event(TransferEventKind::Start, 7), 0, b"AAAA")
            .unwrap();
        for _ in 0..3 {
            d.on_event(&event(TransferEventKind::Transfer, 7), 4, b"BBBB")
                .unwrap();
        }
        d.on_event(&event(TransferEventKind::End, 7), 8, b"CCCC")
            .unwrap();

        let data = fs::read(dir.path().join("payload2").join("DJI_0007.MP4")).unwrap();
        assert_eq!(data, b"AAAABBBBCCCC");
    }

    #[test]
    fn test_out_of_order_chunks_land_at_offset() {
        let dir = tempdir().unwrap();
        let mut d = DownloadDispatcher::new(DownloadSession::new(
            dir.path(),
            MountPosition::Payload1,
            files(),
        ));

        d.on_event(&event(TransferEventKind::Start, 5), 0, b"01")
            .unwrap();
        d.on_event(&event(TransferEventKind::Transfer, 5), 6, b"67")
            .unwrap();
        d.on_event(&event(TransferEventKind::Transfer, 5), 2, b"2345")
            .unwrap();
        d.on_event(&event(TransferEventKind::End, 5), 8, &[])
            .unwrap();

        let data = fs::read(dir.path().join("payload1").join("DJI_0005.JPG")).unwrap();
        assert_eq!(data, b"01234567");
    }

    #[test]
    fn test_second_start_closes_first_handle() {
        let dir = tempdir().unwrap();
        let mut d = DownloadDispatcher::new(DownloadSession::new(
            dir.path(),
            MountPosition::Payload1,
            files(),
        ));

        d.on_event(&event(TransferEventKind::Start, 5), 0, b"partial")
            .unwrap();
        d.on_event(&event(TransferEventKind::Start, 7), 0, b"next")
            .unwrap();

        let stats = d.stats();
        assert_eq!(stats.started, 2);
        assert_eq!(stats.aborted, 1);

        // The old file's events are now rejected.
        assert!(matches!(
            d.on_event(&event(TransferEventKind::Transfer, 5), 7, b"x"),
            Err(Error::InvalidState(_))
        ));

        d.on_event(&event(TransferEventKind::End, 7), 4, &[])
            .unwrap();
        let stats = d.finish();
        assert_eq!(stats.started, stats.completed + stats.aborted);
    }

    #[test]
    fn test_transfer_without_start_is_rejected() {
        let dir = tempdir().unwrap();
        let mut d = DownloadDispatcher::new(DownloadSession::new(
            dir.path(),
            MountPosition::Payload1,
            files(),
        ));
        assert!(matches!(
            d.on_event(&event(TransferEventKind::Transfer, 5), 0, b"x"),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_abort_leaves_partial_file() {
        let dir = tempdir().unwrap();
        let mut d = DownloadDispatcher::new(DownloadSession::new(
            dir.path(),
            MountPosition::Payload1,
            files(),
        ));

        d.on_event(&event(TransferEventKind::Start, 5), 0, b"part")
            .unwrap();
        d.on_event(&event(TransferEventKind::Abort, 5), 0, &[])
            .unwrap();

        assert!(!d.is_open());
        assert_eq!(d.stats().aborted, 1);
        assert!(d.completed().is_empty());
        let data = fs::read(dir.path().join("payload1").join("DJI_0005.JPG")).unwrap();
        assert_eq!(data, b"part");
    }

    #[test]
    fn test_single_shot_and_sub_file_paths() {
        let dir = tempdir().unwrap();
        let mut d = DownloadDispatcher::new(DownloadSession::new(
            dir.path(),
            MountPosition::Payload3,
            files(),
        ));

        let info = TransferEventInfo::new(TransferEventKind::StartTransferEnd, 9, 8, MediaFileType::Ldrt)
            .with_sub_type(Some(SubFileType::Rtk));
        d.on_event(&info, 0, b"rtk-data").unwrap();

        let path = dir.path().join("payload3").join("SCAN_0009.rtk");
        assert_eq!(fs::read(&path).unwrap(), b"rtk-data");
        assert_eq!(d.stats().completed, 1);

        let missing = info.with_sub_type(Some(SubFileType::Imu));
        assert!(matches!(d.on_event(&missing, 0, b"x"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_unknown_index_and_oversized_chunk() {
        let dir = tempdir().unwrap();
        let mut d = DownloadDispatcher::new(DownloadSession::new(
            dir.path(),
            MountPosition::Payload1,
            files(),
        ));
        assert!(matches!(
            d.on_event(&event(TransferEventKind::Start, 42), 0, b"x"),
            Err(Error::NotFound(_))
        ));
        let big = vec![0u8; crate::transfer::MAX_CHUNK_LEN + 1];
        assert!(matches!(
            d.on_event(&event(TransferEventKind::Start, 5), 0, &big),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_clashing_names_get_index_suffix() {
        let dir = tempdir().unwrap();
        let files = MediaFileList::new(vec![
            MediaFileListEntry::new("a/DJI_0001.JPG", 1, 3, MediaFileType::Jpeg),
            MediaFileListEntry::new("b/DJI_0001.JPG", 2, 3, MediaFileType::Jpeg),
            MediaFileListEntry::new("..", 3, 3, MediaFileType::Jpeg),
            MediaFileListEntry::new("file_3", 4, 3, MediaFileType::Jpeg),
        ]);
        let session = DownloadSession::new(dir.path(), MountPosition::Payload1, files);
        let base = dir.path().join("payload1");

        assert_eq!(session.path_for(1, None).unwrap(), base.join("DJI_0001.JPG"));
        assert_eq!(session.path_for(2, None).unwrap(), base.join("DJI_0001_2.JPG"));
        assert_eq!(session.path_for(3, None).unwrap(), base.join("file_3"));
        assert_eq!(session.path_for(4, None).unwrap(), base.join("file_3_4"));

        let mut d = DownloadDispatcher::new(session);
        for (index, data) in [(1, b"one"), (2, b"two")] {
            d.on_event(&event(TransferEventKind::StartTransferEnd, index), 0, data)
                .unwrap();
        }
        assert_eq!(fs::read(base.join("DJI_0001.JPG")).unwrap(), b"one");
        assert_eq!(fs::read(base.join("DJI_0001_2.JPG")).unwrap(), b"two");
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd", 1), "passwd");
        assert_eq!(sanitize_file_name("..", 3), "file_3");
        assert_eq!(sanitize_file_name("a\\b.jpg", 1), "a_b.jpg");
        assert_eq!(sanitize_file_name("", 4), "file_4");
    }
}

//! Raw H.264 liveview dumps.

use crate::error::{Error, Result};
use crate::mount::MountPosition;
use chrono::Local;
use log::{debug, info};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Camera stream on a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CameraSource {
    /// Main / default lens.
    #[default]
    Default,
    /// Wide-angle lens.
    Wide,
    /// Zoom lens.
    Zoom,
    /// Infrared lens.
    Infrared,
}

impl CameraSource {
    /// All sources.
    pub const ALL: [Self; 4] = [Self::Default, Self::Wide, Self::Zoom, Self::Infrared];

    /// Parse a user-facing name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "default" | "main" => Some(Self::Default),
            "wide" => Some(Self::Wide),
            "zoom" => Some(Self::Zoom),
            "ir" | "infrared" => Some(Self::Infrared),
            _ => None,
        }
    }
}

impl fmt::Display for CameraSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Default => "default",
            Self::Wide => "wide",
            Self::Zoom => "zoom",
            Self::Infrared => "ir",
        };
        write!(f, "{name}")
    }
}

struct Dump {
    path: PathBuf,
    file: BufWriter<File>,
    bytes: u64,
}

/// Writes liveview streams verbatim, one file per mount and source.
pub struct H264Recorder {
    dir: PathBuf,
    dumps: HashMap<(MountPosition, CameraSource), Dump>,
    order: Vec<(MountPosition, CameraSource)>,
}

impl H264Recorder {
    /// Recorder writing under `dir` (created on first write).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            dumps: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append a chunk of the `(mount, source)` stream.
    pub fn write(&mut self, mount: MountPosition, source: CameraSource, data: &[u8]) -> Result<()> {
        let key = (mount, source);
        if !self.dumps.contains_key(&key) {
            let dump = self.open(mount, source)?;
            info!("Recording {mount} {source} liveview to {}", dump.path.display());
            self.dumps.insert(key, dump);
            self.order.push(key);
        }
        let dump = self
            .dumps
            .get_mut(&key)
            .ok_or_else(|| Error::InvalidState(format!("no dump open for {mount} {source}")))?;
        dump.file.write_all(data)?;
        dump.bytes += data.len() as u64;
        Ok(())
    }

    /// Bytes written so far for a stream.
    pub fn bytes_written(&self, mount: MountPosition, source: CameraSource) -> u64 {
        self.dumps
            .get(&(mount, source))
            .map_or(0, |d| d.bytes)
    }

    /// Flush every file and return the paths in the order they were opened.
    pub fn finish(mut self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(self.order.len());
        for key in &self.order {
            if let Some(mut dump) = self.dumps.remove(key) {
                dump.file.flush()?;
                dump.file.get_ref().sync_all()?;
                debug!("{}: {} bytes", dump.path.display(), dump.bytes);
                paths.push(dump.path);
            }
        }
        Ok(paths)
    }

    fn open(&self, mount: MountPosition, source: CameraSource) -> Result<Dump> {
        fs::create_dir_all(&self.dir)?;
        let stem = format!(
            "{}_{}_{}",
            mount.dir_name(),
            source,
            Local::now().format("%Y%m%d_%H%M%S")
        );

        // Same stream restarted within one second: add a suffix.
        for n in 0u32..100 {
            let name = if n == 0 {
                format!("{stem}.h264")
            } else {
                format!("{stem}_{n}.h264")
            };
            let path = self.dir.join(name);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    return Ok(Dump {
                        path,
                        file: BufWriter::new(file),
                        bytes: 0,
                    });
                },
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {},
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Busy(format!("too many dumps named {stem}")))
    }
}

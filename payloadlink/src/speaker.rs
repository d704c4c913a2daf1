//! Speaker payload: upload state machine and playback state.
//!
//! The operator pushes either TTS text or an Opus audio file to the payload
//! as a START / TRANSFER / END sequence. On END the content is handed to a
//! [`SpeakerBackend`] for playback.
//!
//! ```text
//!            Start                 End (tts)
//!   Idle ───────────> Transmitting ──────────> InTtsConversion ──> Playing
//!    ^                    │    │   End (opus)                        │
//!    │ Abort / stop()     │    └─────────────────────────────────────┘
//!    └────────────────────┘          bad data / backend failure ──> Error
//! ```

use crate::error::{Error, Result};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// Largest upload accepted.
pub const MAX_UPLOAD_SIZE: u64 = 32 * 1024 * 1024;

/// What the speaker is set up to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SpeakerWorkMode {
    /// Text-to-speech.
    #[default]
    Tts,
    /// Recorded voice / audio file.
    Voice,
}

/// Playback repetition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SpeakerPlayMode {
    /// Play once.
    #[default]
    SinglePlay,
    /// Repeat until stopped.
    LoopPlay,
}

/// Speaker system state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SpeakerSystemState {
    /// Nothing happening.
    #[default]
    Idle,
    /// Receiving an upload.
    Transmitting,
    /// Playing content.
    Playing,
    /// Last operation failed.
    Error,
    /// Converting text to speech.
    InTtsConversion,
}

/// File currently loaded for playback.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PlayingFile {
    /// Content identifier (hex digest of the uploaded bytes).
    pub uuid: String,
    /// File name from the upload.
    pub name: String,
}

/// Full speaker state as reported to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpeakerState {
    /// Work mode.
    pub work_mode: SpeakerWorkMode,
    /// Play mode.
    pub play_mode: SpeakerPlayMode,
    /// Volume 0..=100.
    pub volume: u8,
    /// System state.
    pub system_state: SpeakerSystemState,
    /// Loaded file.
    pub current_file: Option<PlayingFile>,
}

impl Default for SpeakerState {
    fn default() -> Self {
        Self {
            work_mode: SpeakerWorkMode::default(),
            play_mode: SpeakerPlayMode::default(),
            volume: 50,
            system_state: SpeakerSystemState::Idle,
            current_file: None,
        }
    }
}

/// Kind of uploaded content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    /// UTF-8 text for TTS.
    Tts,
    /// Opus-encoded audio.
    OpusAudio,
}

/// One upload event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeakerUpload<'a> {
    /// Upload begins.
    Start {
        /// Content kind.
        content: UploadKind,
        /// Name to store the content under.
        file_name: String,
        /// Total bytes that will follow.
        file_size: u64,
    },
    /// Next chunk.
    Transfer(&'a [u8]),
    /// Upload complete.
    End,
    /// Upload abandoned.
    Abort,
}

/// Audio output used by [`Speaker`].
pub trait SpeakerBackend {
    /// Speak `text`.
    fn play_tts(&mut self, text: &str) -> Result<()>;

    /// Play an audio file.
    fn play_audio(&mut self, path: &Path) -> Result<()>;

    /// Stop playback.
    fn stop(&mut self) -> Result<()>;

    /// Apply a volume 0..=100.
    fn set_volume(&mut self, volume: u8) -> Result<()>;
}

struct PendingUpload {
    content: UploadKind,
    file_name: String,
    file_size: u64,
    data: Vec<u8>,
}

#[derive(Clone)]
enum Content {
    Text(String),
    Audio(PathBuf),
}

/// Speaker state machine.
pub struct Speaker<B: SpeakerBackend> {
    backend: B,
    audio_dir: PathBuf,
    state: SpeakerState,
    upload: Option<PendingUpload>,
    last: Option<Content>,
}

impl<B: SpeakerBackend> Speaker<B> {
    /// Speaker storing received audio under `audio_dir`.
    pub fn new(backend: B, audio_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            audio_dir: audio_dir.into(),
            state: SpeakerState::default(),
            upload: None,
            last: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> &SpeakerState {
        &self.state
    }

    /// Backend, for inspection.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Feed one upload event.
    pub fn handle(&mut self, event: SpeakerUpload<'_>) -> Result<()> {
        match event {
            SpeakerUpload::Start {
                content,
                file_name,
                file_size,
            } => self.start(content, &file_name, file_size),
            SpeakerUpload::Transfer(chunk) => self.transfer(chunk),
            SpeakerUpload::End => self.end(),
            SpeakerUpload::Abort => {
                if self.upload.take().is_some() {
                    info!("Speaker upload aborted");
                }
                self.state.system_state = SpeakerSystemState::Idle;
                Ok(())
            },
        }
    }

    fn start(&mut self, content: UploadKind, file_name: &str, file_size: u64) -> Result<()> {
        if file_size > MAX_UPLOAD_SIZE {
            return Err(Error::InvalidParameter(format!(
                "upload of {file_size} bytes exceeds {MAX_UPLOAD_SIZE}"
            )));
        }
        let file_name = Path::new(file_name)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .filter(|n| n != "..")
            .ok_or_else(|| Error::InvalidParameter(format!("bad upload name '{file_name}'")))?;

        if let Some(previous) = self.upload.take() {
            warn!(
                "New upload '{file_name}' replaces unfinished upload '{}'",
                previous.file_name
            );
        }
        debug!("Speaker upload '{file_name}' ({content:?}, {file_size} bytes)");

        self.state.work_mode = match content {
            UploadKind::Tts => SpeakerWorkMode::Tts,
            UploadKind::OpusAudio => SpeakerWorkMode::Voice,
        };
        self.state.system_state = SpeakerSystemState::Transmitting;
        self.upload = Some(PendingUpload {
            content,
            file_name,
            file_size,
            data: Vec::with_capacity(file_size as usize),
        });
        Ok(())
    }

    fn transfer(&mut self, chunk: &[u8]) -> Result<()> {
        let Some(upload) = self.upload.as_mut() else {
            return Err(Error::InvalidState("speaker data without an upload in progress".into()));
        };
        let total = upload.data.len() as u64 + chunk.len() as u64;
        if total > upload.file_size {
            let declared = upload.file_size;
            self.fail();
            return Err(Error::InvalidParameter(format!(
                "upload exceeds its declared {declared} bytes"
            )));
        }
        upload.data.extend_from_slice(chunk);
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        let upload = self
            .upload
            .take()
            .ok_or_else(|| Error::InvalidState("speaker END without an upload in progress".into()))?;
        if upload.data.len() as u64 != upload.file_size {
            self.fail();
            return Err(Error::InvalidParameter(format!(
                "upload '{}' incomplete: {} of {} bytes",
                upload.file_name,
                upload.data.len(),
                upload.file_size
            )));
        }

        let uuid = format!("{:016x}", content_digest(&upload.data));
        let content = match upload.content {
            UploadKind::Tts => match String::from_utf8(upload.data) {
                Ok(text) => Content::Text(text),
                Err(_) => {
                    self.fail();
                    return Err(Error::InvalidParameter("TTS text is not valid UTF-8".into()));
                },
            },
            UploadKind::OpusAudio => {
                let path = self.audio_dir.join(&upload.file_name);
                if let Err(e) = fs::create_dir_all(&self.audio_dir).and_then(|()| fs::write(&path, &upload.data)) {
                    self.fail();
                    return Err(e.into());
                }
                Content::Audio(path)
            },
        };

        self.state.current_file = Some(PlayingFile {
            uuid,
            name: upload.file_name,
        });
        self.last = Some(content.clone());
        self.play_content(&content)
    }

    fn play_content(&mut self, content: &Content) -> Result<()> {
        let result = match content {
            Content::Text(text) => {
                self.state.system_state = SpeakerSystemState::InTtsConversion;
                self.backend.play_tts(text)
            },
            Content::Audio(path) => self.backend.play_audio(path),
        };
        match result {
            Ok(()) => {
                self.state.system_state = SpeakerSystemState::Playing;
                Ok(())
            },
            Err(e) => {
                warn!("Speaker playback failed: {e}");
                self.fail();
                Err(e)
            },
        }
    }

    fn fail(&mut self) {
        self.upload = None;
        self.state.system_state = SpeakerSystemState::Error;
    }

    /// Replay the last uploaded content.
    pub fn play(&mut self) -> Result<()> {
        let content = self
            .last
            .clone()
            .ok_or_else(|| Error::NotFound("nothing uploaded to play".into()))?;
        self.play_content(&content)
    }

    /// Stop playback and drop any unfinished upload.
    pub fn stop(&mut self) -> Result<()> {
        self.backend.stop()?;
        if let Some(upload) = self.upload.take() {
            info!(
                "Speaker upload '{}' dropped on stop after {} of {} bytes",
                upload.file_name,
                upload.data.len(),
                upload.file_size
            );
        }
        self.state.system_state = SpeakerSystemState::Idle;
        Ok(())
    }

    /// The backend reports the end of the content.
    pub fn playback_finished(&mut self) {
        if self.state.system_state != SpeakerSystemState::Playing {
            return;
        }
        if self.state.play_mode == SpeakerPlayMode::SinglePlay {
            self.state.system_state = SpeakerSystemState::Idle;
        }
    }

    /// Set the volume (0..=100).
    pub fn set_volume(&mut self, volume: u8) -> Result<()> {
        if volume > 100 {
            return Err(Error::InvalidParameter(format!("volume {volume} out of range 0..=100")));
        }
        self.backend.set_volume(volume)?;
        self.state.volume = volume;
        Ok(())
    }

    /// Set the work mode.
    pub fn set_work_mode(&mut self, mode: SpeakerWorkMode) {
        self.state.work_mode = mode;
    }

    /// Set the play mode.
    pub fn set_play_mode(&mut self, mode: SpeakerPlayMode) {
        self.state.play_mode = mode;
    }
}

/// FNV-1a over the uploaded bytes.
fn content_digest(data: &[u8]) -> u64 {
    data.iter().fold(0xcbf2_9ce4_8422_2325, |hash, &byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

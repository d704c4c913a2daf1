//! Media file list model.
//!
//! A file list is a snapshot of the payload's storage taken by a single
//! "download file list" call. Later per-index downloads refer back to it by
//! `index`, which stays stable for the session.
//!
//! ## Wire layout
//!
//! All integers little-endian, names NUL-padded to the [`NameWidth`]:
//!
//! ```text
//! list:      count u16 | entry[count]
//! entry:     name[W] | size u32 | index u32
//!            | sec u8 | min u8 | hour u8 | day u8 | month u8 | year u16
//!            | type u8 | attribute u32 | sub_count u16 | sub_entry[sub_count]
//! sub_entry: name[W] | size u32 | sub_type u8
//! ```

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Read, Write};

/// Width of the fixed name buffer in a file list record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameWidth {
    /// Camera manager lists (256 bytes).
    Camera,
    /// Short widget file names (32 bytes).
    WidgetShort,
    /// Long widget file names (128 bytes).
    WidgetLong,
}

impl NameWidth {
    /// Number of bytes reserved for a name.
    #[must_use]
    pub fn bytes(&self) -> usize {
        match self {
            Self::Camera => 256,
            Self::WidgetShort => 32,
            Self::WidgetLong => 128,
        }
    }
}

/// Media file type of a list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum MediaFileType {
    /// JPEG photo.
    Jpeg,
    /// DNG raw photo.
    Dng,
    /// QuickTime video.
    Mov,
    /// MP4 video.
    Mp4,
    /// TIFF photo.
    Tiff,
    /// Composite lidar capture with sub-files.
    Ldrt,
    /// Lidar report.
    Rpt,
    /// Anything else.
    Unknown(u8),
}

impl MediaFileType {
    /// Decode the on-wire type byte.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Jpeg,
            1 => Self::Dng,
            2 => Self::Mov,
            3 => Self::Mp4,
            5 => Self::Tiff,
            24 => Self::Ldrt,
            25 => Self::Rpt,
            other => Self::Unknown(other),
        }
    }

    /// On-wire type byte.
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Jpeg => 0,
            Self::Dng => 1,
            Self::Mov => 2,
            Self::Mp4 => 3,
            Self::Tiff => 5,
            Self::Ldrt => 24,
            Self::Rpt => 25,
            Self::Unknown(v) => *v,
        }
    }

    /// Guess the type from a file extension (case-insensitive).
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Self::Jpeg,
            "dng" => Self::Dng,
            "mov" => Self::Mov,
            "mp4" => Self::Mp4,
            "tif" | "tiff" => Self::Tiff,
            "ldrt" => Self::Ldrt,
            "rpt" => Self::Rpt,
            _ => Self::Unknown(0xFF),
        }
    }

    /// Canonical file extension.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Dng => "dng",
            Self::Mov => "mov",
            Self::Mp4 => "mp4",
            Self::Tiff => "tiff",
            Self::Ldrt => "ldrt",
            Self::Rpt => "rpt",
            Self::Unknown(_) => "bin",
        }
    }

    /// Whether entries of this type carry a sub-file list.
    pub fn is_composite(&self) -> bool {
        matches!(self, Self::Ldrt)
    }

    fn is_photo(&self) -> bool {
        matches!(self, Self::Jpeg | Self::Dng | Self::Tiff)
    }

    fn is_video(&self) -> bool {
        matches!(self, Self::Mov | Self::Mp4)
    }
}

impl fmt::Display for MediaFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(v) => write!(f, "Unknown({v})"),
            other => write!(f, "{}", other.extension().to_uppercase()),
        }
    }
}

/// Secondary file type inside a composite (LDRT) entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum SubFileType {
    /// Raw lidar returns.
    Ldr,
    /// RTK positioning log.
    Rtk,
    /// IMU log.
    Imu,
    /// Signal quality log.
    Sig,
    /// Calibration data.
    Clc,
    /// Calibration index.
    Cli,
    /// RTK base station log.
    Rtb,
    /// RTK lock log.
    Rtl,
    /// RTK status log.
    Rts,
    /// Anything else.
    Unknown(u8),
}

impl SubFileType {
    /// Decode the on-wire sub-type byte.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ldr,
            1 => Self::Rtk,
            2 => Self::Imu,
            3 => Self::Sig,
            4 => Self::Clc,
            5 => Self::Cli,
            6 => Self::Rtb,
            7 => Self::Rtl,
            8 => Self::Rts,
            other => Self::Unknown(other),
        }
    }

    /// On-wire sub-type byte.
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Ldr => 0,
            Self::Rtk => 1,
            Self::Imu => 2,
            Self::Sig => 3,
            Self::Clc => 4,
            Self::Cli => 5,
            Self::Rtb => 6,
            Self::Rtl => 7,
            Self::Rts => 8,
            Self::Unknown(v) => *v,
        }
    }

    /// File extension for this sub-type.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Ldr => "ldr",
            Self::Rtk => "rtk",
            Self::Imu => "imu",
            Self::Sig => "sig",
            Self::Clc => "clc",
            Self::Cli => "cli",
            Self::Rtb => "rtb",
            Self::Rtl => "rtl",
            Self::Rts => "rts",
            Self::Unknown(_) => "sub",
        }
    }

    /// Known sub-type for a file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        (0..=8)
            .map(Self::from_u8)
            .find(|t| t.extension() == ext)
    }
}

/// Creation time recorded by the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CreateTime {
    /// Year (e.g. 2024).
    pub year: u16,
    /// Month 1-12.
    pub month: u8,
    /// Day 1-31.
    pub day: u8,
    /// Hour 0-23.
    pub hour: u8,
    /// Minute 0-59.
    pub minute: u8,
    /// Second 0-59.
    pub second: u8,
}

impl fmt::Display for CreateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// Per-type attribute word, discriminated by the entry's file type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum MediaFileAttribute {
    /// Photo attributes.
    Photo {
        /// Aspect ratio code (0 = 4:3, 1 = 16:9, ...).
        ratio: u8,
        /// Rotation in quarter turns.
        rotation: u8,
    },
    /// Video attributes.
    Video {
        /// Duration in seconds.
        duration_secs: u16,
        /// Frame rate code.
        frame_rate: u8,
        /// Rotation in quarter turns.
        rotation: u8,
        /// Resolution code.
        resolution: u8,
    },
    /// Type carries no attributes.
    #[default]
    None,
}

impl MediaFileAttribute {
    /// Decode the attribute bitfield for a given file type.
    pub fn decode(file_type: MediaFileType, raw: u32) -> Self {
        if file_type.is_photo() {
            Self::Photo {
                ratio: ((raw >> 22) & 0xFF) as u8,
                rotation: ((raw >> 30) & 0x03) as u8,
            }
        } else if file_type.is_video() {
            Self::Video {
                duration_secs: (raw & 0xFFFF) as u16,
                frame_rate: ((raw >> 16) & 0x3F) as u8,
                rotation: ((raw >> 22) & 0x03) as u8,
                resolution: ((raw >> 24) & 0xFF) as u8,
            }
        } else {
            Self::None
        }
    }

    /// Encode to the attribute bitfield.
    pub fn encode(&self) -> u32 {
        match *self {
            Self::Photo { ratio, rotation } => {
                (u32::from(ratio) << 22) | (u32::from(rotation & 0x03) << 30)
            },
            Self::Video {
                duration_secs,
                frame_rate,
                rotation,
                resolution,
            } => {
                u32::from(duration_secs)
                    | (u32::from(frame_rate & 0x3F) << 16)
                    | (u32::from(rotation & 0x03) << 22)
                    | (u32::from(resolution) << 24)
            },
            Self::None => 0,
        }
    }
}

/// One secondary file of a composite entry.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SubFileEntry {
    /// Sub-file name.
    pub name: String,
    /// Size in bytes.
    pub size: u32,
    /// Sub-file type.
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub sub_type: SubFileType,
}

/// One entry of a media file list.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MediaFileListEntry {
    /// File name as stored on the payload.
    pub name: String,
    /// Size in bytes.
    pub size: u32,
    /// Session-stable file index.
    pub index: u32,
    /// Creation time.
    #[cfg_attr(feature = "serde", serde(rename = "created"))]
    pub create_time: CreateTime,
    /// File type.
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub file_type: MediaFileType,
    /// Type-specific attributes.
    pub attribute: MediaFileAttribute,
    /// Sub-files (composite types only).
    pub sub_files: Vec<SubFileEntry>,
}

impl MediaFileListEntry {
    /// Entry with zeroed attributes and no sub-files.
    pub fn new(name: impl Into<String>, index: u32, size: u32, file_type: MediaFileType) -> Self {
        Self {
            name: name.into(),
            size,
            index,
            create_time: CreateTime::default(),
            file_type,
            attribute: MediaFileAttribute::decode(file_type, 0),
            sub_files: Vec::new(),
        }
    }

    /// Look up a sub-file by type.
    pub fn sub_file(&self, sub_type: SubFileType) -> Option<&SubFileEntry> {
        self.sub_files
            .iter()
            .find(|s| s.sub_type == sub_type)
    }

    /// Read one entry.
    pub fn read_from<R: Read>(reader: &mut R, width: NameWidth) -> Result<Self> {
        let name = read_name(reader, width)?;
        let size = reader.read_u32::<LittleEndian>()?;
        let index = reader.read_u32::<LittleEndian>()?;

        let second = reader.read_u8()?;
        let minute = reader.read_u8()?;
        let hour = reader.read_u8()?;
        let day = reader.read_u8()?;
        let month = reader.read_u8()?;
        let year = reader.read_u16::<LittleEndian>()?;

        let file_type = MediaFileType::from_u8(reader.read_u8()?);
        let attribute = MediaFileAttribute::decode(file_type, reader.read_u32::<LittleEndian>()?);

        let sub_count = reader.read_u16::<LittleEndian>()?;
        if sub_count > 0 && !file_type.is_composite() {
            return Err(Error::InvalidFileList(format!(
                "entry {index} ({file_type}) declares {sub_count} sub-files"
            )));
        }

        let mut sub_files = Vec::with_capacity(usize::from(sub_count));
        for _ in 0..sub_count {
            let name = read_name(reader, width)?;
            let size = reader.read_u32::<LittleEndian>()?;
            let sub_type = SubFileType::from_u8(reader.read_u8()?);
            sub_files.push(SubFileEntry {
                name,
                size,
                sub_type,
            });
        }

        Ok(Self {
            name,
            size,
            index,
            create_time: CreateTime {
                year,
                month,
                day,
                hour,
                minute,
                second,
            },
            file_type,
            attribute,
            sub_files,
        })
    }

    /// Write one entry.
    pub fn write_to<W: Write>(&self, writer: &mut W, width: NameWidth) -> Result<()> {
        if !self.sub_files.is_empty() && !self.file_type.is_composite() {
            return Err(Error::InvalidParameter(format!(
                "{} is not a composite type and cannot carry sub-files",
                self.file_type
            )));
        }
        let sub_count = u16::try_from(self.sub_files.len())
            .map_err(|_| Error::InvalidParameter("too many sub-files".into()))?;

        write_name(writer, &self.name, width)?;
        writer.write_u32::<LittleEndian>(self.size)?;
        writer.write_u32::<LittleEndian>(self.index)?;

        let t = &self.create_time;
        writer.write_all(&[t.second, t.minute, t.hour, t.day, t.month])?;
        writer.write_u16::<LittleEndian>(t.year)?;

        writer.write_u8(self.file_type.as_u8())?;
        writer.write_u32::<LittleEndian>(self.attribute.encode())?;

        writer.write_u16::<LittleEndian>(sub_count)?;
        for sub in &self.sub_files {
            write_name(writer, &sub.name, width)?;
            writer.write_u32::<LittleEndian>(sub.size)?;
            writer.write_u8(sub.sub_type.as_u8())?;
        }
        Ok(())
    }
}

/// Snapshot of a payload's media files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MediaFileList {
    /// Entries in enumeration order.
    pub entries: Vec<MediaFileListEntry>,
}

impl MediaFileList {
    /// Build a list from entries.
    pub fn new(entries: Vec<MediaFileListEntry>) -> Self {
        Self { entries }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find an entry by file index.
    pub fn get(&self, index: u32) -> Option<&MediaFileListEntry> {
        self.entries
            .iter()
            .find(|e| e.index == index)
    }

    /// Iterate over entries.
    pub fn iter(&self) -> std::slice::Iter<'_, MediaFileListEntry> {
        self.entries.iter()
    }

    /// Total number of bytes across entries and their sub-files.
    pub fn total_bytes(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| {
                u64::from(e.size)
                    + e.sub_files
                        .iter()
                        .map(|s| u64::from(s.size))
                        .sum::<u64>()
            })
            .sum()
    }

    /// Read a full list.
    pub fn read_from<R: Read>(reader: &mut R, width: NameWidth) -> Result<Self> {
        let count = reader.read_u16::<LittleEndian>()?;
        let mut entries = Vec::with_capacity(usize::from(count));
        for i in 0..count {
            let entry = MediaFileListEntry::read_from(reader, width).map_err(|e| match e {
                Error::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                    Error::InvalidFileList(format!("list truncated at entry {i} of {count}"))
                },
                other => other,
            })?;
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    /// Write a full list.
    pub fn write_to<W: Write>(&self, writer: &mut W, width: NameWidth) -> Result<()> {
        let count = u16::try_from(self.entries.len())
            .map_err(|_| Error::InvalidParameter("too many entries for one list".into()))?;
        writer.write_u16::<LittleEndian>(count)?;
        for entry in &self.entries {
            entry.write_to(writer, width)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a MediaFileList {
    type Item = &'a MediaFileListEntry;
    type IntoIter = std::slice::Iter<'a, MediaFileListEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

fn read_name<R: Read>(reader: &mut R, width: NameWidth) -> Result<String> {
    let mut buf = vec![0u8; width.bytes()];
    reader.read_exact(&mut buf)?;
    let end = buf
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).to_string())
}

fn write_name<W: Write>(writer: &mut W, name: &str, width: NameWidth) -> Result<()> {
    let bytes = name.as_bytes();
    // One byte stays reserved for the terminating NUL.
    if bytes.len() >= width.bytes() {
        return Err(Error::InvalidParameter(format!(
            "name '{name}' does not fit in {} bytes",
            width.bytes()
        )));
    }
    let mut buf = vec![0u8; width.bytes()];
    buf[..bytes.len()].copy_from_slice(bytes);
    writer.write_all(&buf)?;
    Ok(())
}

//! Binary PCD (Point Cloud Data v0.7) output.
//!
//! The writer emits an ASCII header with zero-padded `WIDTH`/`POINTS`
//! counters, appends 14-byte records and seeks back on [`PcdWriter::finish`]
//! to fill in the real count.

use super::PointXyzRgb;
use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{BufRead, Read, Seek, SeekFrom, Write};

const COUNTER_WIDTH: usize = 10;
const MAX_HEADER_LINES: usize = 32;

/// One PCD record: `x y z` as f32, `intensity` and `label` as u8.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PcdPoint {
    /// X in metres.
    pub x: f32,
    /// Y in metres.
    pub y: f32,
    /// Z in metres.
    pub z: f32,
    /// Reflectivity / intensity.
    pub intensity: u8,
    /// Classification label.
    pub label: u8,
}

impl PcdPoint {
    /// Record size on disk.
    pub const SIZE: usize = 14;

    /// Read one record.
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            x: reader.read_f32::<LittleEndian>()?,
            y: reader.read_f32::<LittleEndian>()?,
            z: reader.read_f32::<LittleEndian>()?,
            intensity: reader.read_u8()?,
            label: reader.read_u8()?,
        })
    }

    /// Write one record.
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_f32::<LittleEndian>(self.x)?;
        writer.write_f32::<LittleEndian>(self.y)?;
        writer.write_f32::<LittleEndian>(self.z)?;
        writer.write_u8(self.intensity)?;
        writer.write_u8(self.label)?;
        Ok(())
    }
}

impl From<PointXyzRgb> for PcdPoint {
    /// Intensity is the Rec.601 luma of the colour.
    fn from(p: PointXyzRgb) -> Self {
        let luma = (299 * u32::from(p.r) + 587 * u32::from(p.g) + 114 * u32::from(p.b) + 500) / 1000;
        Self {
            x: p.x,
            y: p.y,
            z: p.z,
            intensity: luma.min(255) as u8,
            label: 0,
        }
    }
}

/// Parsed PCD header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PcdHeader {
    /// `VERSION` value.
    pub version: String,
    /// Field names.
    pub fields: Vec<String>,
    /// Byte size per field.
    pub sizes: Vec<u32>,
    /// Type letter per field (`F`, `U`, `I`).
    pub types: Vec<String>,
    /// Element count per field.
    pub counts: Vec<u32>,
    /// `WIDTH`.
    pub width: u64,
    /// `HEIGHT`.
    pub height: u64,
    /// `VIEWPOINT` as written.
    pub viewpoint: String,
    /// `POINTS`.
    pub points: u64,
    /// `DATA` encoding (`ascii`, `binary`, ...).
    pub data: String,
}

impl PcdHeader {
    /// Bytes per point implied by the field layout.
    pub fn point_size(&self) -> u64 {
        self.sizes
            .iter()
            .zip(self.counts.iter().chain(std::iter::repeat(&1)))
            .map(|(size, count)| u64::from(*size) * u64::from(*count))
            .sum()
    }

    /// Whether the layout matches what [`PcdWriter`] produces.
    pub fn is_xyz_intensity_label(&self) -> bool {
        self.fields == ["x", "y", "z", "intensity", "label"]
            && self.sizes == [4, 4, 4, 1, 1]
            && self.data == "binary"
    }

    /// Read a header, leaving `reader` at the first data byte.
    pub fn read_from<R: BufRead + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut header = Self::default();
        let mut line = String::new();

        for _ in 0..MAX_HEADER_LINES {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Err(Error::Protocol("PCD header ended before DATA".into()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let mut parts = trimmed.split_whitespace();
            let key = parts.next().unwrap_or_default().to_ascii_uppercase();
            let values: Vec<&str> = parts.collect();
            match key.as_str() {
                "VERSION" => header.version = values.join(" "),
                "FIELDS" => header.fields = values.iter().map(ToString::to_string).collect(),
                "SIZE" => header.sizes = parse_list(&key, &values)?,
                "TYPE" => header.types = values.iter().map(ToString::to_string).collect(),
                "COUNT" => header.counts = parse_list(&key, &values)?,
                "WIDTH" => header.width = parse_one(&key, &values)?,
                "HEIGHT" => header.height = parse_one(&key, &values)?,
                "VIEWPOINT" => header.viewpoint = values.join(" "),
                "POINTS" => header.points = parse_one(&key, &values)?,
                "DATA" => {
                    header.data = values.join(" ");
                    return Ok(header);
                },
                other => {
                    return Err(Error::Protocol(format!("unknown PCD header key '{other}'")));
                },
            }
        }
        Err(Error::Protocol("PCD header too long".into()))
    }
}

fn parse_list(key: &str, values: &[&str]) -> Result<Vec<u32>> {
    values
        .iter()
        .map(|v| {
            v.parse()
                .map_err(|_| Error::Protocol(format!("bad {key} value '{v}'")))
        })
        .collect()
}

fn parse_one(key: &str, values: &[&str]) -> Result<u64> {
    match values {
        [v] => v
            .parse()
            .map_err(|_| Error::Protocol(format!("bad {key} value '{v}'"))),
        _ => Err(Error::Protocol(format!("{key} expects one value"))),
    }
}

/// Streaming binary PCD writer.
pub struct PcdWriter<W: Write + Seek> {
    inner: W,
    points: u64,
    width_pos: u64,
    points_pos: u64,
}

impl<W: Write + Seek> PcdWriter<W> {
    /// Write the header and prepare for records.
    pub fn new(mut inner: W) -> Result<Self> {
        let start = inner.stream_position()?;
        let zero = format!("{:0width$}", 0, width = COUNTER_WIDTH);

        let before_width = "# .PCD v0.7 - Point Cloud Data file format\n\
             VERSION 0.7\n\
             FIELDS x y z intensity label\n\
             SIZE 4 4 4 1 1\n\
             TYPE F F F U U\n\
             COUNT 1 1 1 1 1\n\
             WIDTH ";
        let before_points = "\nHEIGHT 1\nVIEWPOINT 0 0 0 1 0 0 0\nPOINTS ";

        let width_pos = start + before_width.len() as u64;
        let points_pos = width_pos + (COUNTER_WIDTH + before_points.len()) as u64;

        write!(inner, "{before_width}{zero}{before_points}{zero}\nDATA binary\n")?;

        Ok(Self {
            inner,
            points: 0,
            width_pos,
            points_pos,
        })
    }

    /// Append one record.
    pub fn write_point(&mut self, point: &PcdPoint) -> Result<()> {
        point.write_to(&mut self.inner)?;
        self.points += 1;
        Ok(())
    }

    /// Records written so far.
    pub fn points(&self) -> u64 {
        self.points
    }

    /// Patch the counters, flush and return the inner writer positioned at
    /// the end.
    pub fn finish(mut self) -> Result<W> {
        if self.points >= 10u64.pow(COUNTER_WIDTH as u32) {
            return Err(Error::InvalidParameter(format!(
                "{} points do not fit the PCD counter",
                self.points
            )));
        }
        let count = format!("{:0width$}", self.points, width = COUNTER_WIDTH);
        let end = self.inner.stream_position()?;

        self.inner.seek(SeekFrom::Start(self.width_pos))?;
        self.inner.write_all(count.as_bytes())?;
        self.inner.seek(SeekFrom::Start(self.points_pos))?;
        self.inner.write_all(count.as_bytes())?;
        self.inner.seek(SeekFrom::Start(end))?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor};

    #[test]
    fn test_header_counters_patched() {
        let mut writer = PcdWriter::new(Cursor::new(Vec::new())).unwrap();
        for i in 0..3 {
            writer
                .write_point(&PcdPoint {
                    x: i as f32,
                    y: 0.0,
                    z: 1.0,
                    intensity: 10,
                    label: 0,
                })
                .unwrap();
        }
        let bytes = writer.finish().unwrap().into_inner();

        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("WIDTH 0000000003\n"));
        assert!(text.contains("POINTS 0000000003\n"));

        let mut reader = BufReader::new(bytes.as_slice());
        let header = PcdHeader::read_from(&mut reader).unwrap();
        assert!(header.is_xyz_intensity_label());
        assert_eq!(header.width, 3);
        assert_eq!(header.height, 1);
        assert_eq!(header.points, 3);
        assert_eq!(header.point_size(), PcdPoint::SIZE as u64);
        assert_eq!(header.types, ["F", "F", "F", "U", "U"]);

        let first = PcdPoint::read_from(&mut reader).unwrap();
        let second = PcdPoint::read_from(&mut reader).unwrap();
        assert_eq!(first.z, 1.0);
        assert_eq!(second.x, 1.0);
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest.len(), PcdPoint::SIZE);
    }

    #[test]
    fn test_empty_cloud() {
        let bytes = PcdWriter::new(Cursor::new(Vec::new()))
            .unwrap()
            .finish()
            .unwrap()
            .into_inner();
        let header = PcdHeader::read_from(&mut BufReader::new(bytes.as_slice())).unwrap();
        assert_eq!(header.points, 0);
        assert_eq!(header.data, "binary");
    }

    #[test]
    fn test_intensity_from_rgb() {
        let white = PointXyzRgb {
            r: 255,
            g: 255,
            b: 255,
            ..PointXyzRgb::default()
        };
        assert_eq!(PcdPoint::from(white).intensity, 255);

        let green = PointXyzRgb {
            g: 100,
            ..PointXyzRgb::default()
        };
        assert_eq!(PcdPoint::from(green).intensity, 59);
        assert_eq!(PcdPoint::from(green).label, 0);
    }

    #[test]
    fn test_header_errors() {
        let mut truncated = BufReader::new(&b"VERSION 0.7\nFIELDS x\n"[..]);
        assert!(matches!(
            PcdHeader::read_from(&mut truncated),
            Err(Error::Protocol(_))
        ));
        let mut bad = BufReader::new(&b"WIDTH abc\nDATA binary\n"[..]);
        assert!(PcdHeader::read_from(&mut bad).is_err());
    }
}

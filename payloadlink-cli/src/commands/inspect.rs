//! Point-cloud file conversion and inspection.

use anyhow::{Context, Result};
use console::style;
use log::warn;
use payloadlink::PcdHeader;
use payloadlink::pointcloud::ldrt::{self, LdrtStats};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Seek};
use std::path::{Path, PathBuf};

use crate::Cli;

/// `convert` command implementation.
pub(crate) fn cmd_convert(cli: &Cli, input: &PathBuf, output: &PathBuf) -> Result<()> {
    let reader = BufReader::new(
        File::open(input).with_context(|| format!("Failed to open {}", input.display()))?,
    );
    let writer = BufWriter::new(
        File::create(output).with_context(|| format!("Failed to create {}", output.display()))?,
    );

    let summary = payloadlink::convert_ldrt_to_pcd(reader, writer)
        .with_context(|| format!("Failed to convert {}", input.display()))?;

    if summary.trailing_bytes > 0 {
        warn!(
            "{} ends with {} bytes of an incomplete record",
            input.display(),
            summary.trailing_bytes
        );
    }
    if !cli.quiet {
        eprintln!(
            "{} Wrote {} points to {}",
            style("✓").green().bold(),
            summary.points,
            style(output.display()).yellow()
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Ldrt,
    Pcd,
}

/// Pick the format from the extension, falling back to the first bytes.
fn detect_format(path: &Path, reader: &mut impl BufRead) -> Result<Format> {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("pcd") => return Ok(Format::Pcd),
        Some("ldrt") => return Ok(Format::Ldrt),
        _ => {},
    }
    let head = reader.fill_buf()?;
    if head.starts_with(b"#") || head.starts_with(b"VERSION") {
        Ok(Format::Pcd)
    } else {
        Ok(Format::Ldrt)
    }
}

struct PcdSummary {
    header: PcdHeader,
    data_bytes: u64,
}

impl PcdSummary {
    fn expected_bytes(&self) -> Option<u64> {
        (self.header.data == "binary").then(|| self.header.points * self.header.point_size())
    }
}

fn inspect_pcd(reader: &mut BufReader<File>) -> Result<PcdSummary> {
    let header = PcdHeader::read_from(reader)?;
    let data_start = reader.stream_position()?;
    let total = reader.get_ref().metadata()?.len();
    Ok(PcdSummary {
        header,
        data_bytes: total.saturating_sub(data_start),
    })
}

fn bounds_json(stats: &LdrtStats) -> serde_json::Value {
    match stats.bounds {
        Some((min, max)) => serde_json::json!({ "min": min, "max": max }),
        None => serde_json::Value::Null,
    }
}

fn print_ldrt(path: &Path, stats: &LdrtStats) {
    eprintln!("{} {}", style("LDRT").cyan().bold(), style(path.display()).yellow());
    eprintln!("  points:   {}", stats.points);
    if let Some((min, max)) = stats.bounds {
        eprintln!(
            "  bounds:   [{:.3}, {:.3}, {:.3}] .. [{:.3}, {:.3}, {:.3}]",
            min[0], min[1], min[2], max[0], max[1], max[2]
        );
    }
    if stats.trailing_bytes > 0 {
        eprintln!(
            "  {} {} trailing bytes",
            style("!").yellow().bold(),
            stats.trailing_bytes
        );
    }
}

fn print_pcd(path: &Path, summary: &PcdSummary) {
    let header = &summary.header;
    eprintln!("{} {}", style("PCD").cyan().bold(), style(path.display()).yellow());
    eprintln!("  version:  {}", header.version);
    eprintln!("  fields:   {}", header.fields.join(" "));
    eprintln!("  size:     {} x {}", header.width, header.height);
    eprintln!("  points:   {}", header.points);
    eprintln!("  data:     {}", header.data);
    match summary.expected_bytes() {
        Some(expected) if expected != summary.data_bytes => eprintln!(
            "  {} expected {expected} data bytes, found {}",
            style("!").yellow().bold(),
            summary.data_bytes
        ),
        _ => {},
    }
}

/// `inspect` command implementation.
pub(crate) fn cmd_inspect(file: &PathBuf, json: bool) -> Result<()> {
    let mut reader = BufReader::new(
        File::open(file).with_context(|| format!("Failed to open {}", file.display()))?,
    );

    match detect_format(file, &mut reader)? {
        Format::Ldrt => {
            let stats = ldrt::scan(reader)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            if json {
                let value = serde_json::json!({
                    "format": "ldrt",
                    "points": stats.points,
                    "bounds": bounds_json(&stats),
                    "trailing_bytes": stats.trailing_bytes,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                print_ldrt(file, &stats);
            }
        },
        Format::Pcd => {
            let summary = inspect_pcd(&mut reader)
                .with_context(|| format!("Failed to read PCD header of {}", file.display()))?;
            if json {
                let header = &summary.header;
                let value = serde_json::json!({
                    "format": "pcd",
                    "version": header.version,
                    "fields": header.fields,
                    "width": header.width,
                    "height": header.height,
                    "points": header.points,
                    "data": header.data,
                    "point_size": header.point_size(),
                    "data_bytes": summary.data_bytes,
                    "xyz_intensity_label": header.is_xyz_intensity_label(),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                print_pcd(file, &summary);
            }
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use payloadlink::PointXyzRgb;
    use std::io::Cursor;

    fn write_ldrt(path: &Path, points: &[[f32; 3]]) {
        let mut bytes = Vec::new();
        for p in points {
            let point = PointXyzRgb {
                x: p[0],
                y: p[1],
                z: p[2],
                r: 200,
                g: 100,
                b: 50,
            };
            bytes.extend_from_slice(&point.encode());
        }
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_detect_format_by_extension_and_content() {
        let mut empty = Cursor::new(Vec::new());
        assert_eq!(detect_format(Path::new("a.PCD"), &mut empty).unwrap(), Format::Pcd);
        assert_eq!(detect_format(Path::new("a.ldrt"), &mut empty).unwrap(), Format::Ldrt);

        let mut pcd = Cursor::new(b"# .PCD v0.7\nVERSION 0.7\n".to_vec());
        assert_eq!(detect_format(Path::new("cloud"), &mut pcd).unwrap(), Format::Pcd);
        let mut raw = Cursor::new(vec![0u8; 15]);
        assert_eq!(detect_format(Path::new("cloud"), &mut raw).unwrap(), Format::Ldrt);
    }

    #[test]
    fn test_convert_then_inspect_pcd() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("scan.ldrt");
        let output = dir.path().join("scan.pcd");
        write_ldrt(&input, &[[1.0, 2.0, 3.0], [-1.0, 0.5, 4.0], [0.0, 0.0, 0.0]]);

        let cli = <Cli as clap::Parser>::try_parse_from(["payloadlink", "-q", "convert", "a", "b"])
            .unwrap();
        cmd_convert(&cli, &input, &output).unwrap();

        let mut reader = BufReader::new(File::open(&output).unwrap());
        let summary = inspect_pcd(&mut reader).unwrap();
        assert_eq!(summary.header.points, 3);
        assert!(summary.header.is_xyz_intensity_label());
        assert_eq!(summary.expected_bytes(), Some(summary.data_bytes));
        assert_eq!(summary.data_bytes, 3 * 14);
    }

    #[test]
    fn test_inspect_ldrt_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("scan.ldrt");
        write_ldrt(&input, &[[1.0, 2.0, 3.0]]);
        cmd_inspect(&input, true).unwrap();

        assert!(cmd_inspect(&dir.path().join("missing.ldrt"), false).is_err());
    }
}

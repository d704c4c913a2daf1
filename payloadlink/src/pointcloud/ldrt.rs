//! `.ldrt` record streams: packed [`PointXyzRgb`] records, nothing else.

use super::PointXyzRgb;
use crate::error::Result;
use std::io::{self, Read};

/// Iterates the records of an `.ldrt` stream.
///
/// A trailing partial record (from a recording cut mid-write) is not an
/// error; its length is available from [`trailing_bytes`](Self::trailing_bytes)
/// once iteration ends.
pub struct LdrtReader<R> {
    inner: R,
    trailing: usize,
    done: bool,
}

impl<R: Read> LdrtReader<R> {
    /// Wrap a reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            trailing: 0,
            done: false,
        }
    }

    /// Bytes of an incomplete final record.
    pub fn trailing_bytes(&self) -> usize {
        self.trailing
    }

    fn read_record(&mut self) -> io::Result<Option<PointXyzRgb>> {
        let mut buf = [0u8; PointXyzRgb::SIZE];
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e),
            }
        }
        if filled < buf.len() {
            self.trailing = filled;
            return Ok(None);
        }
        Ok(Some(PointXyzRgb::decode(&buf)))
    }
}

impl<R: Read> Iterator for LdrtReader<R> {
    type Item = Result<PointXyzRgb>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(point)) => Some(Ok(point)),
            Ok(None) => {
                self.done = true;
                None
            },
            Err(e) => {
                self.done = true;
                Some(Err(e.into()))
            },
        }
    }
}

/// Summary statistics of an `.ldrt` stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LdrtStats {
    /// Number of records.
    pub points: u64,
    /// Axis-aligned bounds `(min, max)` as `[x, y, z]`; `None` when empty.
    pub bounds: Option<([f32; 3], [f32; 3])>,
    /// Bytes of an incomplete final record.
    pub trailing_bytes: usize,
}

/// Scan a whole stream.
pub fn scan<R: Read>(input: R) -> Result<LdrtStats> {
    let mut reader = LdrtReader::new(input);
    let mut points = 0u64;
    let mut bounds: Option<([f32; 3], [f32; 3])> = None;

    for point in reader.by_ref() {
        let p = point?;
        let xyz = [p.x, p.y, p.z];
        points += 1;
        bounds = Some(match bounds {
            None => (xyz, xyz),
            Some((mut lo, mut hi)) => {
                for ((l, h), v) in lo.iter_mut().zip(hi.iter_mut()).zip(xyz) {
                    *l = l.min(v);
                    *h = h.max(v);
                }
                (lo, hi)
            },
        });
    }

    Ok(LdrtStats {
        points,
        bounds,
        trailing_bytes: reader.trailing_bytes(),
    })
}

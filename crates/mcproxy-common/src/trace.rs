//! Binary `.mcs` trace-file format: one file per session, each record a
//! captured frame with direction and arrival timestamp, written immediately
//! after the frame is decrypted but before it's forwarded (§6).
//!
//! Record layout, all integers big-endian:
//! `[direction:i32][sec:i32][usec:i32][framelen:i32][frame_bytes...]`

use crate::packet::Direction;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

fn direction_tag(direction: Direction) -> i32 {
    match direction {
        Direction::ClientToServer => 0,
        Direction::ServerToClient => 1,
    }
}

fn tag_direction(tag: i32) -> io::Result<Direction> {
    match tag {
        0 => Ok(Direction::ClientToServer),
        1 => Ok(Direction::ServerToClient),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown direction tag {other}"),
        )),
    }
}

/// Builds a trace file path `saved/YYYYMMDD_HHMMSS.mcs` for a session
/// starting now.
pub fn trace_file_path(trace_dir: &Path, started_at: chrono::DateTime<chrono::Local>) -> PathBuf {
    trace_dir.join(format!("{}.mcs", started_at.format("%Y%m%d_%H%M%S")))
}

/// Appends frame records to a session's trace file.
pub struct TraceWriter {
    file: BufWriter<File>,
}

impl TraceWriter {
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            file: BufWriter::new(File::create(path)?),
        })
    }

    /// Appends one record for `frame`, stamped with the current wall-clock
    /// time.
    pub fn write_frame(&mut self, direction: Direction, frame: &[u8]) -> io::Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.write_frame_at(direction, now.as_secs() as i32, now.subsec_micros() as i32, frame)
    }

    fn write_frame_at(
        &mut self,
        direction: Direction,
        sec: i32,
        usec: i32,
        frame: &[u8],
    ) -> io::Result<()> {
        self.file.write_all(&direction_tag(direction).to_be_bytes())?;
        self.file.write_all(&sec.to_be_bytes())?;
        self.file.write_all(&usec.to_be_bytes())?;
        self.file.write_all(&(frame.len() as i32).to_be_bytes())?;
        self.file.write_all(frame)?;
        self.file.flush()
    }
}

/// One decoded trace record.
#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub direction: Direction,
    pub sec: i32,
    pub usec: i32,
    pub frame: Vec<u8>,
}

/// Reads `.mcs` records sequentially off a file.
pub struct TraceReader {
    file: BufReader<File>,
}

impl TraceReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: BufReader::new(File::open(path)?),
        })
    }

    /// Reads the next record, or `None` at EOF.
    pub fn next_record(&mut self) -> io::Result<Option<TraceRecord>> {
        let mut header = [0u8; 16];
        match self.file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let direction = tag_direction(i32::from_be_bytes(header[0..4].try_into().unwrap()))?;
        let sec = i32::from_be_bytes(header[4..8].try_into().unwrap());
        let usec = i32::from_be_bytes(header[8..12].try_into().unwrap());
        let framelen = i32::from_be_bytes(header[12..16].try_into().unwrap());
        if framelen < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "negative frame length in trace record",
            ));
        }

        let mut frame = vec![0u8; framelen as usize];
        self.file.read_exact(&mut frame)?;

        Ok(Some(TraceRecord {
            direction,
            sec,
            usec,
            frame,
        }))
    }
}

impl Iterator for TraceReader {
    type Item = io::Result<TraceRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_write_then_read_roundtrip() {
        let tmp = NamedTempFile::new().unwrap();
        let mut writer = TraceWriter::create(tmp.path()).unwrap();
        writer
            .write_frame_at(Direction::ClientToServer, 1000, 500, b"hello")
            .unwrap();
        writer
            .write_frame_at(Direction::ServerToClient, 1001, 0, b"world!")
            .unwrap();
        drop(writer);

        let mut reader = TraceReader::open(tmp.path()).unwrap();
        let r1 = reader.next_record().unwrap().unwrap();
        assert_eq!(r1.direction, Direction::ClientToServer);
        assert_eq!(r1.sec, 1000);
        assert_eq!(r1.usec, 500);
        assert_eq!(r1.frame, b"hello");

        let r2 = reader.next_record().unwrap().unwrap();
        assert_eq!(r2.direction, Direction::ServerToClient);
        assert_eq!(r2.frame, b"world!");

        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_records_appended_in_arrival_order() {
        let tmp = NamedTempFile::new().unwrap();
        let mut writer = TraceWriter::create(tmp.path()).unwrap();
        for i in 0..5u8 {
            writer
                .write_frame_at(Direction::ClientToServer, i as i32, 0, &[i])
                .unwrap();
        }
        drop(writer);

        let reader = TraceReader::open(tmp.path()).unwrap();
        let frames: Vec<_> = reader.map(|r| r.unwrap().frame[0]).collect();
        assert_eq!(frames, vec![0, 1, 2, 3, 4]);
    }
}

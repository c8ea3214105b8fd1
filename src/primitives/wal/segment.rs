//! On-disk layout of a single WAL segment file.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::primitives::io::FileIo;
use crate::types::checksum::{crc32_of, frame_crc32};
use crate::types::{Result, Seq, TaskError};

const SEGMENT_MAGIC: [u8; 4] = *b"TVWL";
const SEGMENT_FORMAT_VERSION: u16 = 1;
pub(crate) const SEGMENT_HEADER_LEN: usize = 32;
pub(crate) const FRAME_HEADER_LEN: usize = 20;
/// Frames larger than this are treated as garbage rather than allocated.
const MAX_FRAME_PAYLOAD: u32 = 64 * 1024 * 1024;

/// Identifier of a segment file; increases with every rotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(pub u64);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

/// `<primary>-wal.<id>`
pub(crate) fn segment_path(primary: &Path, id: SegmentId) -> PathBuf {
    let mut name = primary.as_os_str().to_owned();
    name.push(format!("-wal.{id}"));
    PathBuf::from(name)
}

/// Parses the segment id out of a file name produced by [`segment_path`].
pub(crate) fn parse_segment_name(primary_file_name: &str, candidate: &str) -> Option<SegmentId> {
    let rest = candidate.strip_prefix(primary_file_name)?.strip_prefix("-wal.")?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok().map(SegmentId)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SegmentHeader {
    pub id: SegmentId,
    pub first_seq: Seq,
}

impl SegmentHeader {
    pub fn encode(&self) -> [u8; SEGMENT_HEADER_LEN] {
        let mut buf = [0u8; SEGMENT_HEADER_LEN];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC);
        buf[4..6].copy_from_slice(&SEGMENT_FORMAT_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.id.0.to_be_bytes());
        buf[16..24].copy_from_slice(&self.first_seq.0.to_be_bytes());
        let crc = crc32_of(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < SEGMENT_HEADER_LEN {
            return Err(TaskError::Corruption("wal segment header truncated".into()));
        }
        if src[0..4] != SEGMENT_MAGIC {
            return Err(TaskError::Corruption("wal segment magic mismatch".into()));
        }
        let version = u16::from_be_bytes([src[4], src[5]]);
        if version != SEGMENT_FORMAT_VERSION {
            return Err(TaskError::Corruption(format!(
                "unsupported wal segment version {version}"
            )));
        }
        let stored_crc = be_u32(&src[28..32]);
        if crc32_of(&[&src[..28]]) != stored_crc {
            return Err(TaskError::Corruption("wal segment header crc mismatch".into()));
        }
        Ok(Self {
            id: SegmentId(be_u64(&src[8..16])),
            first_seq: Seq(be_u64(&src[16..24])),
        })
    }
}

/// Encodes one frame: `[len][seq][payload crc][header crc][payload]`.
pub(crate) fn encode_frame(seq: Seq, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&seq.0.to_be_bytes());
    buf.extend_from_slice(&frame_crc32(seq.0, payload).to_be_bytes());
    let header_crc = crc32_of(&[&buf[..16]]);
    buf.extend_from_slice(&header_crc.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// A decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RawFrame {
    pub seq: Seq,
    pub payload: Vec<u8>,
}

/// Sequential reader over a segment's frames.
///
/// A frame cut short at the end of the file is a torn write and ends iteration; a
/// complete frame that fails its checksum is corruption.
pub(crate) struct SegmentReader {
    io: Arc<dyn FileIo>,
    header: SegmentHeader,
    offset: u64,
    end: u64,
    valid_up_to: u64,
    last_seq: Option<Seq>,
    torn: bool,
}

impl SegmentReader {
    pub fn open(io: Arc<dyn FileIo>) -> Result<Self> {
        let end = io.len()?;
        let mut header_buf = [0u8; SEGMENT_HEADER_LEN];
        if end < SEGMENT_HEADER_LEN as u64 {
            return Err(TaskError::Corruption("wal segment shorter than header".into()));
        }
        io.read_at(0, &mut header_buf)?;
        let header = SegmentHeader::decode(&header_buf)?;
        Ok(Self {
            io,
            header,
            offset: SEGMENT_HEADER_LEN as u64,
            end,
            valid_up_to: SEGMENT_HEADER_LEN as u64,
            last_seq: None,
            torn: false,
        })
    }

    pub fn header(&self) -> SegmentHeader {
        self.header
    }

    /// Offset just past the last intact frame.
    pub fn valid_up_to(&self) -> u64 {
        self.valid_up_to
    }

    /// True if iteration stopped at a torn tail rather than a clean end.
    pub fn torn(&self) -> bool {
        self.torn
    }

    pub fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        if self.offset >= self.end {
            return Ok(None);
        }
        if self.offset + FRAME_HEADER_LEN as u64 > self.end {
            return Ok(self.stop_torn());
        }
        let mut header = [0u8; FRAME_HEADER_LEN];
        self.read_exact_or_torn(self.offset, &mut header)?;
        if header.iter().all(|b| *b == 0) {
            return Ok(self.stop_torn());
        }
        if crc32_of(&[&header[..16]]) != be_u32(&header[16..20]) {
            return Err(TaskError::Corruption(format!(
                "wal frame header crc mismatch at offset {}",
                self.offset
            )));
        }
        let len = be_u32(&header[0..4]);
        let seq = Seq(be_u64(&header[4..12]));
        let payload_crc = be_u32(&header[12..16]);
        if len > MAX_FRAME_PAYLOAD {
            return Err(TaskError::Corruption(format!("wal frame length {len} out of range")));
        }
        let frame_end = self.offset + FRAME_HEADER_LEN as u64 + u64::from(len);
        if frame_end > self.end {
            return Ok(self.stop_torn());
        }
        let mut payload = vec![0u8; len as usize];
        self.read_exact_or_torn(self.offset + FRAME_HEADER_LEN as u64, &mut payload)?;
        if frame_crc32(seq.0, &payload) != payload_crc {
            if frame_end == self.end {
                return Ok(self.stop_torn());
            }
            return Err(TaskError::Corruption(format!(
                "wal frame {seq} payload crc mismatch"
            )));
        }
        if let Some(prev) = self.last_seq {
            if seq <= prev {
                return Err(TaskError::Corruption(format!(
                    "wal sequence went backwards: {seq} after {prev}"
                )));
            }
        }
        self.last_seq = Some(seq);
        self.offset = frame_end;
        self.valid_up_to = frame_end;
        Ok(Some(RawFrame { seq, payload }))
    }

    fn stop_torn(&mut self) -> Option<RawFrame> {
        self.torn = true;
        self.offset = self.end;
        None
    }

    fn read_exact_or_torn(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        match self.io.read_at(off, dst) {
            Err(TaskError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => Err(
                TaskError::Corruption(format!("wal segment shrank while reading at {off}")),
            ),
            other => other,
        }
    }
}

fn be_u32(src: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&src[..4]);
    u32::from_be_bytes(bytes)
}

fn be_u64(src: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&src[..8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::StdFileIo;
    use tempfile::tempdir;

    fn write_segment(io: &Arc<dyn FileIo>, frames: &[(u64, &[u8])]) -> u64 {
        let header = SegmentHeader {
            id: SegmentId(1),
            first_seq: Seq(frames[0].0),
        };
        io.write_at(0, &header.encode()).unwrap();
        let mut off = SEGMENT_HEADER_LEN as u64;
        for (seq, payload) in frames {
            let frame = encode_frame(Seq(*seq), payload);
            io.write_at(off, &frame).unwrap();
            off += frame.len() as u64;
        }
        off
    }

    #[test]
    fn frames_roundtrip_in_order() -> Result<()> {
        let dir = tempdir().unwrap();
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(dir.path().join("seg"))?);
        let end = write_segment(&io, &[(1, b"alpha"), (2, b"beta")]);
        let mut reader = SegmentReader::open(Arc::clone(&io))?;
        assert_eq!(reader.header().first_seq, Seq(1));
        assert_eq!(reader.next_frame()?.unwrap().payload, b"alpha");
        assert_eq!(reader.next_frame()?.unwrap().seq, Seq(2));
        assert!(reader.next_frame()?.is_none());
        assert!(!reader.torn());
        assert_eq!(reader.valid_up_to(), end);
        Ok(())
    }

    #[test]
    fn truncated_tail_is_torn_not_corrupt() -> Result<()> {
        let dir = tempdir().unwrap();
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(dir.path().join("seg"))?);
        let end = write_segment(&io, &[(1, b"alpha"), (2, b"beta-gamma")]);
        io.truncate(end - 3)?;
        let mut reader = SegmentReader::open(Arc::clone(&io))?;
        assert!(reader.next_frame()?.is_some());
        assert!(reader.next_frame()?.is_none());
        assert!(reader.torn());
        let first_frame_end = SEGMENT_HEADER_LEN as u64 + FRAME_HEADER_LEN as u64 + 5;
        assert_eq!(reader.valid_up_to(), first_frame_end);
        Ok(())
    }

    #[test]
    fn flipped_byte_in_middle_frame_is_corruption() -> Result<()> {
        let dir = tempdir().unwrap();
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(dir.path().join("seg"))?);
        write_segment(&io, &[(1, b"alpha"), (2, b"beta")]);
        let payload_off = SEGMENT_HEADER_LEN as u64 + FRAME_HEADER_LEN as u64;
        io.write_at(payload_off, b"X")?;
        let mut reader = SegmentReader::open(io)?;
        assert!(matches!(reader.next_frame(), Err(TaskError::Corruption(_))));
        Ok(())
    }

    #[test]
    fn segment_names_parse_back() {
        let path = segment_path(Path::new("/data/tasks.db"), SegmentId(12));
        assert_eq!(path, PathBuf::from("/data/tasks.db-wal.000012"));
        assert_eq!(
            parse_segment_name("tasks.db", "tasks.db-wal.000012"),
            Some(SegmentId(12))
        );
        assert_eq!(parse_segment_name("tasks.db", "tasks.db-shm"), None);
        assert_eq!(parse_segment_name("tasks.db", "tasks.db-wal.12.tmp"), None);
    }
}

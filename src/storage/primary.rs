//! The primary file: a checksummed snapshot of the task table.
//!
//! Layout: a 32-byte header followed by a JSON array of tasks.
//!
//! ```text
//! [0..4)   magic "TVDB"
//! [4..6)   format version
//! [6..8)   reserved, zero
//! [8..16)  applied WAL sequence
//! [16..24) payload length
//! [24..28) payload crc32
//! [28..32) header crc32
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::model::Task;
use crate::primitives::io::{atomic_replace, FileIo, IoFactory};
use crate::primitives::wal::{CheckpointTarget, RecordBody, WalRecord};
use crate::types::checksum::crc32_of;
use crate::types::{Result, Seq, TaskError};

const PRIMARY_MAGIC: [u8; 4] = *b"TVDB";
const PRIMARY_FORMAT_VERSION: u16 = 1;
/// Size of the fixed header.
pub const PRIMARY_HEADER_LEN: usize = 32;

/// Decoded contents of the primary file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PrimaryImage {
    /// Highest WAL sequence reflected in `tasks`.
    pub applied_seq: Seq,
    /// Tasks keyed by path.
    pub tasks: BTreeMap<String, Task>,
}

impl PrimaryImage {
    /// Serializes header and payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let tasks: Vec<&Task> = self.tasks.values().collect();
        let payload = serde_json::to_vec(&tasks)?;
        let mut out = Vec::with_capacity(PRIMARY_HEADER_LEN + payload.len());
        out.extend_from_slice(&PRIMARY_MAGIC);
        out.extend_from_slice(&PRIMARY_FORMAT_VERSION.to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.applied_seq.0.to_be_bytes());
        out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        out.extend_from_slice(&crc32_of(&[&payload]).to_be_bytes());
        let header_crc = crc32_of(&[&out[..28]]);
        out.extend_from_slice(&header_crc.to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Parses a primary file. Zero bytes is a fresh, empty store.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        if bytes.len() < PRIMARY_HEADER_LEN {
            return Err(TaskError::Corruption(format!(
                "primary file is {} bytes, shorter than its header",
                bytes.len()
            )));
        }
        let header = &bytes[..PRIMARY_HEADER_LEN];
        if header[0..4] != PRIMARY_MAGIC {
            return Err(TaskError::Corruption("primary file magic mismatch".into()));
        }
        let version = u16::from_be_bytes([header[4], header[5]]);
        if version != PRIMARY_FORMAT_VERSION {
            return Err(TaskError::Corruption(format!(
                "unsupported primary file version {version}"
            )));
        }
        if crc32_of(&[&header[..28]]) != read_u32(&header[28..32]) {
            return Err(TaskError::Corruption("primary header crc mismatch".into()));
        }
        let applied_seq = Seq(read_u64(&header[8..16]));
        let payload_len = read_u64(&header[16..24]);
        let payload = &bytes[PRIMARY_HEADER_LEN..];
        if payload.len() as u64 != payload_len {
            return Err(TaskError::Corruption(format!(
                "primary payload is {} bytes, header says {payload_len}",
                payload.len()
            )));
        }
        if crc32_of(&[payload]) != read_u32(&header[24..28]) {
            return Err(TaskError::Corruption("primary payload crc mismatch".into()));
        }
        let list: Vec<Task> = serde_json::from_slice(payload)
            .map_err(|err| TaskError::Corruption(format!("primary payload: {err}")))?;
        let mut tasks = BTreeMap::new();
        for task in list {
            let path = task.path.clone();
            if tasks.insert(path.clone(), task).is_some() {
                return Err(TaskError::Corruption(format!(
                    "primary file lists {path} twice"
                )));
            }
        }
        Ok(Self { applied_seq, tasks })
    }

    /// Reads the image through an open handle.
    pub fn load(io: &dyn FileIo) -> Result<Self> {
        Self::decode(&io.read_all()?)
    }

    /// Atomically replaces the file at `path` with this image.
    pub fn write(&self, path: &Path) -> Result<()> {
        atomic_replace(path, &self.encode()?)
    }

    /// Applies one committed record. Records at or below `applied_seq` are ignored, so
    /// replaying the same log twice has no further effect. Returns whether it applied.
    pub fn apply(&mut self, seq: Seq, record: &WalRecord) -> bool {
        if seq <= self.applied_seq {
            return false;
        }
        apply_record(&mut self.tasks, record);
        true
    }
}

/// Applies a data record to a task table. Markers are ignored.
pub fn apply_record(tasks: &mut BTreeMap<String, Task>, record: &WalRecord) {
    match &record.body {
        RecordBody::Create { task } | RecordBody::Update { task } => {
            tasks.insert(task.path.clone(), task.clone());
        }
        RecordBody::Delete { path } => {
            tasks.remove(path);
        }
        RecordBody::Commit | RecordBody::Abort => {}
    }
}

/// Checkpoint destination that rewrites the primary file.
pub struct ImageCheckpoint {
    path: PathBuf,
    io: Arc<dyn IoFactory>,
    image: PrimaryImage,
}

impl ImageCheckpoint {
    /// Wraps the image currently on disk at `path`.
    pub fn new(path: &Path, image: PrimaryImage, io: Arc<dyn IoFactory>) -> Self {
        Self {
            path: path.to_path_buf(),
            io,
            image,
        }
    }

    /// The image as it stands after the applied records.
    pub fn image(&self) -> &PrimaryImage {
        &self.image
    }
}

impl CheckpointTarget for ImageCheckpoint {
    fn applied_seq(&self) -> Seq {
        self.image.applied_seq
    }

    fn apply(&mut self, seq: Seq, record: &WalRecord) -> Result<()> {
        self.image.apply(seq, record);
        Ok(())
    }

    fn persist(&mut self, upto: Seq) -> Result<()> {
        self.image.applied_seq = self.image.applied_seq.max(upto);
        self.image.write(&self.path)?;
        debug!(
            path = %self.path.display(),
            applied_seq = self.image.applied_seq.0,
            tasks = self.image.tasks.len(),
            "checkpoint.primary.written"
        );
        Ok(())
    }

    fn verify(&self, applied: &[(Seq, WalRecord)]) -> Result<()> {
        let handle = self.io.open(&self.path)?;
        let on_disk = PrimaryImage::load(handle.as_ref())?;
        if on_disk.applied_seq != self.image.applied_seq {
            return Err(TaskError::Corruption(format!(
                "primary file applied sequence is {}, expected {}",
                on_disk.applied_seq, self.image.applied_seq
            )));
        }
        let mut expected: BTreeMap<&str, Option<&Task>> = BTreeMap::new();
        for (_, record) in applied {
            match &record.body {
                RecordBody::Create { task } | RecordBody::Update { task } => {
                    expected.insert(&task.path, Some(task));
                }
                RecordBody::Delete { path } => {
                    expected.insert(path, None);
                }
                RecordBody::Commit | RecordBody::Abort => {}
            }
        }
        for (path, want) in expected {
            if on_disk.tasks.get(path) != want {
                return Err(TaskError::Corruption(format!(
                    "checkpointed state of {path} does not match the log"
                )));
            }
        }
        Ok(())
    }
}

fn read_u32(src: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&src[..4]);
    u32::from_be_bytes(buf)
}

fn read_u64(src: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&src[..8]);
    u64::from_be_bytes(buf)
}

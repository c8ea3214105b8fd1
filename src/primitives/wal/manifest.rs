//! Segment bookkeeping persisted next to the primary file as `<primary>-shm`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::segment::SegmentId;
use crate::primitives::io::atomic_replace;
use crate::types::{Result, Seq, TaskError};

const MANIFEST_VERSION: u32 = 1;

/// Lifecycle of a segment. States only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    /// Receiving appends.
    Open,
    /// Closed for appends, awaiting checkpoint.
    Sealed,
    /// Contents are in the primary file.
    Checkpointed,
    /// File deleted.
    Reclaimed,
}

impl SegmentState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(self, next: SegmentState) -> bool {
        matches!(
            (self, next),
            (SegmentState::Open, SegmentState::Sealed)
                | (SegmentState::Sealed, SegmentState::Checkpointed)
                | (SegmentState::Checkpointed, SegmentState::Reclaimed)
        )
    }
}

/// Bookkeeping for one segment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentMeta {
    /// Segment id.
    pub id: SegmentId,
    /// Current state.
    pub state: SegmentState,
    /// First sequence number the segment may hold.
    pub first_seq: Seq,
    /// Highest sequence number written, if any.
    pub last_seq: Option<Seq>,
    /// File size including the header.
    pub bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct Manifest {
    pub version: u32,
    /// Every record at or below this sequence is in the primary file.
    pub checkpoint_seq: Seq,
    pub next_segment_id: u64,
    pub segments: Vec<SegmentMeta>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            checkpoint_seq: Seq(0),
            next_segment_id: 1,
            segments: Vec::new(),
        }
    }
}

impl Manifest {
    pub fn path_for(primary: &Path) -> PathBuf {
        let mut name = primary.as_os_str().to_owned();
        name.push("-shm");
        PathBuf::from(name)
    }

    /// Loads the manifest. A missing or unreadable file yields `None`; segments on disk
    /// are authoritative so the caller rebuilds from a directory scan.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice::<Manifest>(&bytes) {
            Ok(manifest) if manifest.version == MANIFEST_VERSION => Ok(Some(manifest)),
            Ok(manifest) => {
                warn!(
                    path = %path.display(),
                    version = manifest.version,
                    "wal.manifest.version_mismatch"
                );
                Ok(None)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "wal.manifest.unreadable");
                Ok(None)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        atomic_replace(path, &bytes)
    }

    pub fn segment(&self, id: SegmentId) -> Option<&SegmentMeta> {
        self.segments.iter().find(|meta| meta.id == id)
    }

    pub fn segment_mut(&mut self, id: SegmentId) -> Option<&mut SegmentMeta> {
        self.segments.iter_mut().find(|meta| meta.id == id)
    }

    /// Moves segment `id` to `next`, rejecting backwards or skipping transitions.
    pub fn advance(&mut self, id: SegmentId, next: SegmentState) -> Result<()> {
        let meta = self
            .segment_mut(id)
            .ok_or_else(|| TaskError::System(format!("wal segment {id} not in manifest")))?;
        if !meta.state.can_advance_to(next) {
            return Err(TaskError::System(format!(
                "wal segment {id} cannot move from {:?} to {next:?}",
                meta.state
            )));
        }
        meta.state = next;
        Ok(())
    }

    pub fn live_bytes(&self) -> u64 {
        self.segments
            .iter()
            .filter(|meta| meta.state != SegmentState::Reclaimed)
            .map(|meta| meta.bytes)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn meta(id: u64, state: SegmentState) -> SegmentMeta {
        SegmentMeta {
            id: SegmentId(id),
            state,
            first_seq: Seq(1),
            last_seq: None,
            bytes: 32,
        }
    }

    #[test]
    fn states_only_move_forward() {
        let mut manifest = Manifest::default();
        manifest.segments.push(meta(1, SegmentState::Open));
        manifest.advance(SegmentId(1), SegmentState::Sealed).unwrap();
        assert!(manifest.advance(SegmentId(1), SegmentState::Open).is_err());
        assert!(manifest.advance(SegmentId(1), SegmentState::Reclaimed).is_err());
        manifest
            .advance(SegmentId(1), SegmentState::Checkpointed)
            .unwrap();
        manifest.advance(SegmentId(1), SegmentState::Reclaimed).unwrap();
        assert!(manifest.advance(SegmentId(9), SegmentState::Sealed).is_err());
    }

    #[test]
    fn save_and_load() {
        let dir = tempdir().unwrap();
        let path = Manifest::path_for(&dir.path().join("tasks.db"));
        assert!(path.ends_with("tasks.db-shm"));
        assert_eq!(Manifest::load(&path).unwrap(), None);

        let mut manifest = Manifest::default();
        manifest.segments.push(meta(3, SegmentState::Sealed));
        manifest.checkpoint_seq = Seq(41);
        manifest.save(&path).unwrap();
        assert_eq!(Manifest::load(&path).unwrap(), Some(manifest));
    }

    #[test]
    fn garbage_manifest_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.db-shm");
        fs::write(&path, b"{not json").unwrap();
        assert_eq!(Manifest::load(&path).unwrap(), None);
    }
}

#![forbid(unsafe_code)]

//! Segmented write-ahead log for task mutations.
//!
//! Records are appended to the open segment and grouped by transaction. A transaction's
//! records only take effect once its commit marker is durable. Checkpoints seal the open
//! segment, fold committed records from sealed segments into the primary file through a
//! [`CheckpointTarget`] and then reclaim those segments.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::primitives::io::{FileIo, IoFactory};
use crate::primitives::retry::{with_retry, RetryPolicy};
use crate::types::{Result, Seq, TaskError, TxId};

mod manifest;
mod record;
mod segment;

pub use manifest::{SegmentMeta, SegmentState};
pub use record::{RecordBody, WalRecord};
pub use segment::SegmentId;

use manifest::Manifest;
use segment::{
    encode_frame, parse_segment_name, segment_path, SegmentHeader, SegmentReader,
    SEGMENT_HEADER_LEN,
};

/// When commit markers are forced to stable storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// fsync the open segment after every commit marker.
    #[default]
    Full,
    /// Leave flushing to the OS. Committed transactions may be lost on power failure.
    Off,
}

/// Tunables for the WAL manager.
#[derive(Clone, Debug)]
pub struct WalOptions {
    /// Rotate to a new segment once the open one would exceed this size.
    pub segment_max_bytes: u64,
    /// Request a checkpoint once live segments exceed this size.
    pub checkpoint_bytes: u64,
    /// Request a checkpoint when this much time passed since the last one.
    pub checkpoint_interval: Option<Duration>,
    /// Durability of commit markers.
    pub sync_mode: SyncMode,
    /// Backoff for transient append and sync failures.
    pub retry: RetryPolicy,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            segment_max_bytes: 4 * 1024 * 1024,
            checkpoint_bytes: 16 * 1024 * 1024,
            checkpoint_interval: Some(Duration::from_secs(300)),
            sync_mode: SyncMode::Full,
            retry: RetryPolicy::default(),
        }
    }
}

/// Counters accumulated since the manager was opened.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WalStats {
    /// Records appended.
    pub records_appended: u64,
    /// Frame bytes appended.
    pub bytes_appended: u64,
    /// fsync calls on segment files.
    pub syncs: u64,
    /// Segment rotations.
    pub rotations: u64,
    /// Completed checkpoints.
    pub checkpoints: u64,
    /// Segment files deleted after checkpoint.
    pub segments_reclaimed: u64,
    /// Torn tails truncated during recovery.
    pub torn_tails_truncated: u64,
}

/// Point-in-time view of the log used by health checks and admin commands.
#[derive(Clone, Debug)]
pub struct WalStatus {
    /// Segments not yet reclaimed.
    pub segments: Vec<SegmentMeta>,
    /// Bytes held by live segments.
    pub size_bytes: u64,
    /// Sequence number the next record receives.
    pub next_seq: Seq,
    /// Highest sequence folded into the primary file.
    pub checkpoint_seq: Seq,
    /// Transactions with records but no marker yet.
    pub inflight: usize,
    /// Corruption that stopped appends.
    pub halted: Option<String>,
    /// Time since the last checkpoint or since open.
    pub since_checkpoint: Duration,
    /// Counters.
    pub stats: WalStats,
}

/// Destination of a checkpoint, normally the primary file image.
pub trait CheckpointTarget {
    /// Highest sequence already reflected in the target.
    fn applied_seq(&self) -> Seq;
    /// Applies one committed record. Must tolerate records it already contains.
    fn apply(&mut self, seq: Seq, record: &WalRecord) -> Result<()>;
    /// Durably writes the target, recording `upto` as its applied sequence.
    fn persist(&mut self, upto: Seq) -> Result<()>;
    /// Re-reads the persisted target and checks every applied record took effect.
    fn verify(&self, applied: &[(Seq, WalRecord)]) -> Result<()>;
}

/// Result of [`WalManager::checkpoint`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckpointOutcome {
    /// Segments checkpointed and reclaimed.
    pub segments: usize,
    /// Records applied to the target.
    pub records_applied: usize,
    /// Records skipped because the target already had them.
    pub records_skipped: usize,
    /// New checkpoint sequence.
    pub checkpoint_seq: Seq,
}

/// Result of [`WalManager::replay_committed`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Records handed to the callback.
    pub applied: usize,
    /// Committed records at or below the floor.
    pub skipped: usize,
    /// Transactions with a commit marker.
    pub committed: usize,
    /// Transactions with an abort marker.
    pub aborted: usize,
    /// Transactions without any marker, in id order.
    pub orphans: Vec<TxId>,
    /// Highest transaction id seen.
    pub max_tx_id: TxId,
}

struct OpenSegment {
    id: SegmentId,
    io: Arc<dyn FileIo>,
    append_offset: u64,
    /// Offset of the most recent frame, where a retracted commit marker is cut off.
    last_frame_offset: u64,
    dirty: bool,
}

struct WalState {
    manifest: Manifest,
    open: Option<OpenSegment>,
    next_seq: Seq,
    /// First sequence written by each transaction still lacking a marker.
    inflight: BTreeMap<TxId, Seq>,
    /// Set when corruption is detected; appends fail until the store is reopened.
    halted: Option<String>,
    /// First segment that failed validation during recovery.
    corrupt_segment: Option<SegmentId>,
    last_checkpoint: Instant,
    records_since_checkpoint: u64,
    stats: WalStats,
}

struct SegmentScan {
    header: SegmentHeader,
    entries: Vec<(Seq, WalRecord)>,
    valid_up_to: u64,
    torn: bool,
    corruption: Option<TaskError>,
}

/// Owns the segment files of one primary file.
pub struct WalManager {
    primary: PathBuf,
    manifest_path: PathBuf,
    io: Arc<dyn IoFactory>,
    options: WalOptions,
    state: Mutex<WalState>,
}

impl WalManager {
    /// Opens the log for `primary`, validating every segment on disk.
    ///
    /// Torn tails are truncated. Corruption does not fail the open; the manager comes up
    /// halted so the caller can still read what precedes the damage. `floor` is the
    /// applied sequence of the primary file; new records are numbered above it.
    pub fn open(
        primary: &Path,
        options: WalOptions,
        io: Arc<dyn IoFactory>,
        floor: Seq,
    ) -> Result<Self> {
        if options.segment_max_bytes <= SEGMENT_HEADER_LEN as u64 {
            return Err(TaskError::Config(format!(
                "segment_max_bytes must exceed {SEGMENT_HEADER_LEN}"
            )));
        }
        let manifest_path = Manifest::path_for(primary);
        let stored = Manifest::load(&manifest_path)?;
        let mut manifest = stored.clone().unwrap_or_default();
        let on_disk = list_segments(primary)?;

        let mut stats = WalStats::default();
        let mut segments = Vec::with_capacity(on_disk.len());
        let mut halted = None;
        let mut corrupt_segment = None;
        let mut max_seq = manifest.checkpoint_seq.max(floor);
        let mut max_id = 0u64;

        for id in on_disk {
            max_id = max_id.max(id.0);
            let path = segment_path(primary, id);
            let known = manifest.segment(id).map(|meta| meta.state);
            if matches!(
                known,
                Some(SegmentState::Checkpointed) | Some(SegmentState::Reclaimed)
            ) {
                debug!(segment = %id, "wal.recover.remove_checkpointed");
                fs::remove_file(&path)?;
                continue;
            }
            if corrupt_segment.is_some() {
                segments.push(unreadable_meta(id, &path));
                continue;
            }
            let handle = io.open(&path)?;
            let scan = match scan_segment(Arc::clone(&handle)) {
                Ok(scan) => scan,
                Err(err) => {
                    error!(segment = %id, error = %err, "wal.recover.bad_header");
                    halted = Some(err.to_string());
                    corrupt_segment = Some(id);
                    segments.push(unreadable_meta(id, &path));
                    continue;
                }
            };
            if scan.header.id != id {
                let msg = format!("wal segment file {id} carries id {}", scan.header.id);
                error!(segment = %id, "wal.recover.id_mismatch");
                halted = Some(msg);
                corrupt_segment = Some(id);
                segments.push(unreadable_meta(id, &path));
                continue;
            }
            if let Some(err) = &scan.corruption {
                error!(segment = %id, error = %err, "wal.recover.corruption");
                halted = Some(err.to_string());
                corrupt_segment = Some(id);
            } else if scan.torn {
                warn!(
                    segment = %id,
                    valid_up_to = scan.valid_up_to,
                    "wal.recover.truncate_torn_tail"
                );
                handle.truncate(scan.valid_up_to)?;
                handle.sync_all()?;
                stats.torn_tails_truncated += 1;
            }
            let last_seq = scan.entries.last().map(|(seq, _)| *seq);
            if let Some(seq) = last_seq {
                max_seq = max_seq.max(seq);
            }
            segments.push(SegmentMeta {
                id,
                state: SegmentState::Sealed,
                first_seq: scan.header.first_seq,
                last_seq,
                bytes: scan.valid_up_to,
            });
        }

        manifest.segments = segments;
        manifest.next_segment_id = manifest.next_segment_id.max(max_id + 1);
        if stored.as_ref() != Some(&manifest) {
            manifest.save(&manifest_path)?;
        }

        info!(
            primary = %primary.display(),
            segments = manifest.segments.len(),
            next_seq = max_seq.0 + 1,
            halted = halted.is_some(),
            "wal.open"
        );

        Ok(Self {
            primary: primary.to_path_buf(),
            manifest_path,
            io,
            options,
            state: Mutex::new(WalState {
                manifest,
                open: None,
                next_seq: max_seq.next(),
                inflight: BTreeMap::new(),
                halted,
                corrupt_segment,
                last_checkpoint: Instant::now(),
                records_since_checkpoint: 0,
                stats,
            }),
        })
    }

    /// Options the manager was opened with.
    pub fn options(&self) -> &WalOptions {
        &self.options
    }

    /// Feeds every committed record above `floor` to `apply`, in log order.
    ///
    /// Records of aborted transactions and of transactions with no marker are skipped;
    /// the latter are reported as orphans so the caller can close them with
    /// [`WalManager::abort_tx`].
    pub fn replay_committed<F>(&self, floor: Seq, mut apply: F) -> Result<ReplaySummary>
    where
        F: FnMut(Seq, &WalRecord) -> Result<()>,
    {
        let (ids, corrupt) = {
            let state = self.state.lock();
            let ids: Vec<SegmentId> = state
                .manifest
                .segments
                .iter()
                .filter(|meta| meta.state == SegmentState::Sealed)
                .map(|meta| meta.id)
                .collect();
            (ids, state.corrupt_segment)
        };
        let mut summary = ReplaySummary::default();
        let mut pending: BTreeMap<TxId, Vec<(Seq, WalRecord)>> = BTreeMap::new();
        for id in ids {
            if corrupt.is_some_and(|bad| id > bad) {
                break;
            }
            let scan = self.read_segment(id)?;
            for (seq, record) in scan.entries {
                summary.max_tx_id = summary.max_tx_id.max(record.tx_id);
                match record.body {
                    RecordBody::Commit => {
                        summary.committed += 1;
                        for (seq, record) in pending.remove(&record.tx_id).unwrap_or_default() {
                            if seq <= floor {
                                summary.skipped += 1;
                                continue;
                            }
                            apply(seq, &record)?;
                            summary.applied += 1;
                        }
                    }
                    RecordBody::Abort => {
                        summary.aborted += 1;
                        pending.remove(&record.tx_id);
                    }
                    _ => pending.entry(record.tx_id).or_default().push((seq, record)),
                }
            }
        }
        summary.orphans = pending.into_keys().collect();
        debug!(
            applied = summary.applied,
            skipped = summary.skipped,
            orphans = summary.orphans.len(),
            "wal.replay"
        );
        Ok(summary)
    }

    /// Appends one record for `tx_id` and returns its sequence number.
    ///
    /// The first record of a transaction pins its segment against reclamation until a
    /// marker is written.
    pub fn append(&self, tx_id: TxId, body: RecordBody) -> Result<Seq> {
        let mut state = self.state.lock();
        let seq = self.append_locked(&mut state, WalRecord { tx_id, body })?;
        Ok(seq)
    }

    /// Writes the commit marker for `tx_id` and, under [`SyncMode::Full`], syncs it.
    ///
    /// Once this returns the transaction survives a crash.
    pub fn commit_tx(&self, tx_id: TxId) -> Result<Seq> {
        let mut state = self.state.lock();
        let seq = self.append_locked(
            &mut state,
            WalRecord {
                tx_id,
                body: RecordBody::Commit,
            },
        )?;
        if self.options.sync_mode == SyncMode::Full {
            if let Err(err) = self.sync_locked(&mut state) {
                // The caller sees a failed commit, so the marker must not survive
                // into recovery. After a failed fsync the page cache state is unknown.
                self.retract_marker_locked(&mut state, seq);
                halt_locked(&mut state, format!("commit sync failed: {err}"));
                return Err(err);
            }
        }
        state.inflight.remove(&tx_id);
        Ok(seq)
    }

    /// Writes the abort marker for `tx_id` and releases its pin.
    ///
    /// The pin is released even if the marker cannot be written: recovery treats a
    /// transaction without a marker as aborted.
    pub fn abort_tx(&self, tx_id: TxId) -> Result<Seq> {
        let mut state = self.state.lock();
        state.inflight.remove(&tx_id);
        self.append_locked(
            &mut state,
            WalRecord {
                tx_id,
                body: RecordBody::Abort,
            },
        )
    }

    /// Forces the open segment to stable storage.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.sync_locked(&mut state)
    }

    /// Bytes held by live segments.
    pub fn size(&self) -> u64 {
        self.state.lock().manifest.live_bytes()
    }

    /// True once the size or interval threshold is crossed and there is work to fold.
    pub fn should_checkpoint(&self) -> bool {
        let state = self.state.lock();
        if state.halted.is_some() {
            return false;
        }
        let has_work = state.records_since_checkpoint > 0
            || state
                .manifest
                .segments
                .iter()
                .any(|meta| meta.state == SegmentState::Sealed && meta.last_seq.is_some());
        if !has_work {
            return false;
        }
        if state.manifest.live_bytes() >= self.options.checkpoint_bytes {
            return true;
        }
        self.options
            .checkpoint_interval
            .is_some_and(|interval| state.last_checkpoint.elapsed() >= interval)
    }

    /// Lowest sequence still needed by an in-flight transaction.
    pub fn pinned_seq(&self) -> Option<Seq> {
        self.state.lock().inflight.values().min().copied()
    }

    /// Snapshot of the log's bookkeeping.
    pub fn status(&self) -> WalStatus {
        let state = self.state.lock();
        WalStatus {
            segments: state.manifest.segments.clone(),
            size_bytes: state.manifest.live_bytes(),
            next_seq: state.next_seq,
            checkpoint_seq: state.manifest.checkpoint_seq,
            inflight: state.inflight.len(),
            halted: state.halted.clone(),
            since_checkpoint: state.last_checkpoint.elapsed(),
            stats: state.stats.clone(),
        }
    }

    /// Corruption message if appends are halted.
    pub fn halted(&self) -> Option<String> {
        self.state.lock().halted.clone()
    }

    /// Folds committed records from sealed segments into `target` and reclaims them.
    ///
    /// Segments holding records of in-flight transactions are left alone. If applying,
    /// persisting or verifying fails, no segment changes state and the next checkpoint
    /// retries the same work.
    pub fn checkpoint(&self, target: &mut dyn CheckpointTarget) -> Result<CheckpointOutcome> {
        let candidates = {
            let mut state = self.state.lock();
            if let Some(reason) = &state.halted {
                return Err(TaskError::Corruption(reason.clone()));
            }
            self.seal_open_locked(&mut state)?;
            let pin = state.inflight.values().min().copied();
            let mut candidates = Vec::new();
            for meta in &state.manifest.segments {
                if meta.state != SegmentState::Sealed {
                    continue;
                }
                if let (Some(pin), Some(last)) = (pin, meta.last_seq) {
                    if last >= pin {
                        break;
                    }
                }
                candidates.push(meta.id);
            }
            candidates
        };
        if candidates.is_empty() {
            return Ok(CheckpointOutcome {
                checkpoint_seq: self.state.lock().manifest.checkpoint_seq,
                ..CheckpointOutcome::default()
            });
        }

        let floor = target.applied_seq();
        let mut pending: BTreeMap<TxId, Vec<(Seq, WalRecord)>> = BTreeMap::new();
        let mut ready: Vec<(Seq, WalRecord)> = Vec::new();
        let mut applied: Vec<(Seq, WalRecord)> = Vec::new();
        let mut complete = 0usize;
        let mut upto = floor;
        let mut span_end = floor;
        let mut skipped = 0usize;
        for (idx, id) in candidates.iter().enumerate() {
            let scan = self.read_segment(*id)?;
            if let Some(err) = scan.corruption {
                self.halt(err.to_string());
                return Err(err);
            }
            for (seq, record) in scan.entries {
                span_end = span_end.max(seq);
                match record.body {
                    RecordBody::Commit => {
                        ready.extend(pending.remove(&record.tx_id).unwrap_or_default());
                    }
                    RecordBody::Abort => {
                        pending.remove(&record.tx_id);
                    }
                    _ => pending.entry(record.tx_id).or_default().push((seq, record)),
                }
            }
            if pending.is_empty() {
                for (seq, record) in ready.drain(..) {
                    if seq <= floor {
                        skipped += 1;
                        continue;
                    }
                    target.apply(seq, &record)?;
                    applied.push((seq, record));
                }
                complete = idx + 1;
                upto = span_end;
            }
        }
        if complete == 0 {
            debug!(candidates = candidates.len(), "wal.checkpoint.no_complete_prefix");
            return Ok(CheckpointOutcome {
                checkpoint_seq: self.state.lock().manifest.checkpoint_seq,
                ..CheckpointOutcome::default()
            });
        }

        target.persist(upto)?;
        target.verify(&applied)?;

        let done = &candidates[..complete];
        let mut state = self.state.lock();
        for id in done {
            state.manifest.advance(*id, SegmentState::Checkpointed)?;
        }
        state.manifest.checkpoint_seq = state.manifest.checkpoint_seq.max(upto);
        state.manifest.save(&self.manifest_path)?;
        for id in done {
            let path = segment_path(&self.primary, *id);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(segment = %id, error = %err, "wal.reclaim.remove_failed");
                    continue;
                }
            }
            state.manifest.advance(*id, SegmentState::Reclaimed)?;
            state.stats.segments_reclaimed += 1;
        }
        state
            .manifest
            .segments
            .retain(|meta| meta.state != SegmentState::Reclaimed);
        state.manifest.save(&self.manifest_path)?;
        state.stats.checkpoints += 1;
        state.last_checkpoint = Instant::now();
        state.records_since_checkpoint = 0;
        let outcome = CheckpointOutcome {
            segments: done.len(),
            records_applied: applied.len(),
            records_skipped: skipped,
            checkpoint_seq: state.manifest.checkpoint_seq,
        };
        info!(
            segments = outcome.segments,
            applied = outcome.records_applied,
            checkpoint_seq = outcome.checkpoint_seq.0,
            "wal.checkpoint"
        );
        Ok(outcome)
    }

    /// Re-reads every live segment and describes the damage found. A torn tail on the
    /// open segment is not damage.
    pub fn verify_segments(&self) -> Vec<String> {
        let ids: Vec<SegmentId> = {
            let state = self.state.lock();
            state.manifest.segments.iter().map(|meta| meta.id).collect()
        };
        let mut issues = Vec::new();
        for id in ids {
            match self.read_segment(id) {
                Ok(scan) => {
                    if scan.header.id != id {
                        issues.push(format!("wal segment {id} carries id {}", scan.header.id));
                    }
                    if let Some(err) = scan.corruption {
                        issues.push(format!("wal segment {id}: {err}"));
                    }
                }
                Err(err) => issues.push(format!("wal segment {id} unreadable: {err}")),
            }
        }
        issues
    }

    /// Syncs the open segment. Appends after close are still accepted.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.halted.is_some() {
            return Ok(());
        }
        self.sync_locked(&mut state)
    }

    fn append_locked(&self, state: &mut WalState, record: WalRecord) -> Result<Seq> {
        if let Some(reason) = &state.halted {
            return Err(TaskError::Corruption(reason.clone()));
        }
        let seq = state.next_seq;
        let payload = serde_json::to_vec(&record)?;
        let frame = encode_frame(seq, &payload);
        self.ensure_capacity(state, seq, frame.len() as u64)?;
        let (io, offset, id) = match &state.open {
            Some(open) => (Arc::clone(&open.io), open.append_offset, open.id),
            None => return Err(TaskError::System("wal has no open segment".into())),
        };
        let written = with_retry(&self.options.retry, "wal.append", || {
            io.write_at(offset, &frame)
        });
        if let Err(err) = written {
            if matches!(err, TaskError::Corruption(_)) {
                halt_locked(state, err.to_string());
            }
            return Err(err);
        }
        let end = offset + frame.len() as u64;
        if let Some(open) = state.open.as_mut() {
            open.append_offset = end;
            open.last_frame_offset = offset;
            open.dirty = true;
        }
        if let Some(meta) = state.manifest.segment_mut(id) {
            meta.last_seq = Some(seq);
            meta.bytes = end;
        }
        if !record.is_marker() {
            state.inflight.entry(record.tx_id).or_insert(seq);
        }
        state.next_seq = seq.next();
        state.records_since_checkpoint += 1;
        state.stats.records_appended += 1;
        state.stats.bytes_appended += frame.len() as u64;
        debug!(
            seq = seq.0,
            tx_id = record.tx_id,
            kind = record.kind_name(),
            segment = %id,
            "wal.append"
        );
        Ok(seq)
    }

    /// Makes sure an open segment exists with room for `frame_len` more bytes.
    fn ensure_capacity(&self, state: &mut WalState, seq: Seq, frame_len: u64) -> Result<()> {
        if let Some(open) = &state.open {
            let has_frames = open.append_offset > SEGMENT_HEADER_LEN as u64;
            if !has_frames || open.append_offset + frame_len <= self.options.segment_max_bytes {
                return Ok(());
            }
            self.seal_open_locked(state)?;
            state.stats.rotations += 1;
        }
        let id = SegmentId(state.manifest.next_segment_id);
        let path = segment_path(&self.primary, id);
        let io = self.io.open(&path)?;
        let header = SegmentHeader { id, first_seq: seq };
        with_retry(&self.options.retry, "wal.segment_create", || {
            io.truncate(0)?;
            io.write_at(0, &header.encode())
        })?;
        state.manifest.next_segment_id += 1;
        state.manifest.segments.push(SegmentMeta {
            id,
            state: SegmentState::Open,
            first_seq: seq,
            last_seq: None,
            bytes: SEGMENT_HEADER_LEN as u64,
        });
        state.manifest.save(&self.manifest_path)?;
        state.open = Some(OpenSegment {
            id,
            io,
            append_offset: SEGMENT_HEADER_LEN as u64,
            last_frame_offset: SEGMENT_HEADER_LEN as u64,
            dirty: true,
        });
        debug!(segment = %id, first_seq = seq.0, "wal.segment.open");
        Ok(())
    }

    /// Seals the open segment if it holds frames. An empty open segment stays open.
    fn seal_open_locked(&self, state: &mut WalState) -> Result<()> {
        let Some(open) = &state.open else {
            return Ok(());
        };
        if open.append_offset <= SEGMENT_HEADER_LEN as u64 {
            return Ok(());
        }
        self.sync_locked(state)?;
        let Some(open) = state.open.take() else {
            return Ok(());
        };
        state.manifest.advance(open.id, SegmentState::Sealed)?;
        state.manifest.save(&self.manifest_path)?;
        debug!(segment = %open.id, bytes = open.append_offset, "wal.segment.sealed");
        Ok(())
    }

    fn sync_locked(&self, state: &mut WalState) -> Result<()> {
        let Some(open) = state.open.as_mut() else {
            return Ok(());
        };
        if !open.dirty {
            return Ok(());
        }
        let io = Arc::clone(&open.io);
        with_retry(&self.options.retry, "wal.sync", || io.sync_all())?;
        open.dirty = false;
        state.stats.syncs += 1;
        Ok(())
    }

    fn read_segment(&self, id: SegmentId) -> Result<SegmentScan> {
        let handle = self.io.open(&segment_path(&self.primary, id))?;
        scan_segment(handle)
    }

    /// Cuts the commit marker `seq` off the open segment. Without the marker, recovery
    /// treats the transaction's records as orphans and aborts them.
    fn retract_marker_locked(&self, state: &mut WalState, seq: Seq) {
        let Some(open) = state.open.as_mut() else {
            return;
        };
        let cut = open.last_frame_offset;
        if let Err(err) = open.io.truncate(cut) {
            error!(seq = seq.0, segment = %open.id, error = %err, "wal.commit.retract_failed");
            return;
        }
        if let Err(err) = open.io.sync_all() {
            warn!(seq = seq.0, segment = %open.id, error = %err, "wal.commit.retract_unsynced");
        }
        open.append_offset = cut;
        let id = open.id;
        if let Some(meta) = state.manifest.segment_mut(id) {
            meta.bytes = cut;
            meta.last_seq = (seq > meta.first_seq).then(|| Seq(seq.0 - 1));
        }
        warn!(seq = seq.0, segment = %id, offset = cut, "wal.commit.retracted");
    }

    fn halt(&self, reason: String) {
        let mut state = self.state.lock();
        halt_locked(&mut state, reason);
    }
}

fn halt_locked(state: &mut WalState, reason: String) {
    if state.halted.is_none() {
        error!(reason = %reason, "wal.halted");
        state.halted = Some(reason);
    }
}

/// Reads every intact frame of a segment. Corruption inside the segment is returned in
/// the scan rather than as an error so callers can keep the frames before it.
fn scan_segment(io: Arc<dyn FileIo>) -> Result<SegmentScan> {
    let mut reader = SegmentReader::open(io)?;
    let mut entries = Vec::new();
    let mut corruption = None;
    loop {
        match reader.next_frame() {
            Ok(Some(frame)) => match serde_json::from_slice::<WalRecord>(&frame.payload) {
                Ok(record) => entries.push((frame.seq, record)),
                Err(err) => {
                    corruption = Some(TaskError::Corruption(format!(
                        "wal record {} does not decode: {err}",
                        frame.seq
                    )));
                    break;
                }
            },
            Ok(None) => break,
            Err(err @ TaskError::Corruption(_)) => {
                corruption = Some(err);
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(SegmentScan {
        header: reader.header(),
        entries,
        valid_up_to: reader.valid_up_to(),
        torn: reader.torn(),
        corruption,
    })
}

fn unreadable_meta(id: SegmentId, path: &Path) -> SegmentMeta {
    SegmentMeta {
        id,
        state: SegmentState::Sealed,
        first_seq: Seq(0),
        last_seq: None,
        bytes: fs::metadata(path).map(|m| m.len()).unwrap_or(0),
    }
}

/// Segment ids present next to `primary`, ascending.
fn list_segments(primary: &Path) -> Result<Vec<SegmentId>> {
    let file_name = primary
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| TaskError::Config(format!("{} has no file name", primary.display())))?;
    let dir = match primary.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut ids = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(id) = parse_segment_name(file_name, name) {
                ids.push(id);
            }
        }
    }
    ids.sort();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewTask, Task};
    use crate::primitives::io::StdIoFactory;
    use tempfile::{tempdir, TempDir};

    fn task(path: &str) -> Task {
        NewTask::new(path).into_task(1)
    }

    fn options() -> WalOptions {
        WalOptions {
            segment_max_bytes: 64 * 1024,
            checkpoint_bytes: 1024 * 1024,
            checkpoint_interval: None,
            sync_mode: SyncMode::Full,
            retry: RetryPolicy::none(),
        }
    }

    fn open(dir: &TempDir, options: WalOptions) -> WalManager {
        WalManager::open(
            &dir.path().join("tasks.db"),
            options,
            Arc::new(StdIoFactory),
            Seq(0),
        )
        .unwrap()
    }

    fn committed(wal: &WalManager, floor: Seq) -> (Vec<(Seq, WalRecord)>, ReplaySummary) {
        let mut seen = Vec::new();
        let summary = wal
            .replay_committed(floor, |seq, record| {
                seen.push((seq, record.clone()));
                Ok(())
            })
            .unwrap();
        (seen, summary)
    }

    /// Applies records into a vector; persist records the sequence.
    #[derive(Default)]
    struct VecTarget {
        applied_seq: Seq,
        records: Vec<(Seq, WalRecord)>,
        persisted: Option<Seq>,
        fail_verify: bool,
    }

    impl CheckpointTarget for VecTarget {
        fn applied_seq(&self) -> Seq {
            self.applied_seq
        }
        fn apply(&mut self, seq: Seq, record: &WalRecord) -> Result<()> {
            self.records.push((seq, record.clone()));
            Ok(())
        }
        fn persist(&mut self, upto: Seq) -> Result<()> {
            self.persisted = Some(upto);
            self.applied_seq = upto;
            Ok(())
        }
        fn verify(&self, applied: &[(Seq, WalRecord)]) -> Result<()> {
            if self.fail_verify {
                return Err(TaskError::Corruption("verify failed".into()));
            }
            assert!(applied.len() <= self.records.len());
            Ok(())
        }
    }

    #[test]
    fn only_committed_transactions_replay() {
        let dir = tempdir().unwrap();
        {
            let wal = open(&dir, options());
            wal.append(1, RecordBody::Create { task: task("a") }).unwrap();
            wal.commit_tx(1).unwrap();
            wal.append(2, RecordBody::Create { task: task("b") }).unwrap();
            wal.abort_tx(2).unwrap();
            wal.append(3, RecordBody::Create { task: task("c") }).unwrap();
            wal.sync().unwrap();
        }
        let wal = open(&dir, options());
        let (seen, summary) = committed(&wal, Seq(0));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1.path(), Some("a"));
        assert_eq!(summary.committed, 1);
        assert_eq!(summary.aborted, 1);
        assert_eq!(summary.orphans, vec![3]);
        assert_eq!(summary.max_tx_id, 3);
        assert_eq!(wal.status().next_seq, Seq(6));
    }

    #[test]
    fn replay_skips_records_at_or_below_floor() {
        let dir = tempdir().unwrap();
        {
            let wal = open(&dir, options());
            wal.append(1, RecordBody::Create { task: task("a") }).unwrap();
            wal.commit_tx(1).unwrap();
            wal.append(2, RecordBody::Create { task: task("b") }).unwrap();
            wal.commit_tx(2).unwrap();
        }
        let wal = open(&dir, options());
        let (seen, summary) = committed(&wal, Seq(2));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, Seq(3));
        assert_eq!(summary.skipped, 1);
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("tasks.db");
        {
            let wal = open(&dir, options());
            wal.append(1, RecordBody::Create { task: task("a") }).unwrap();
            wal.commit_tx(1).unwrap();
            wal.append(2, RecordBody::Create { task: task("b") }).unwrap();
            wal.commit_tx(2).unwrap();
        }
        let seg = segment_path(&primary, SegmentId(1));
        let len = fs::metadata(&seg).unwrap().len();
        let file = fs::OpenOptions::new().write(true).open(&seg).unwrap();
        file.set_len(len - 4).unwrap();
        drop(file);

        let wal = open(&dir, options());
        assert_eq!(wal.status().stats.torn_tails_truncated, 1);
        assert!(wal.halted().is_none());
        let (seen, summary) = committed(&wal, Seq(0));
        assert_eq!(seen.len(), 1);
        assert_eq!(summary.orphans, vec![2]);
        wal.abort_tx(2).unwrap();
        wal.append(3, RecordBody::Delete { path: "a".into() }).unwrap();
        wal.commit_tx(3).unwrap();
    }

    #[test]
    fn corruption_halts_appends() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("tasks.db");
        {
            let wal = open(&dir, options());
            wal.append(1, RecordBody::Create { task: task("a") }).unwrap();
            wal.commit_tx(1).unwrap();
            wal.append(2, RecordBody::Create { task: task("b") }).unwrap();
            wal.commit_tx(2).unwrap();
        }
        let seg = segment_path(&primary, SegmentId(1));
        let mut bytes = fs::read(&seg).unwrap();
        bytes[SEGMENT_HEADER_LEN + segment::FRAME_HEADER_LEN + 2] ^= 0xFF;
        fs::write(&seg, &bytes).unwrap();

        let wal = open(&dir, options());
        assert!(wal.halted().is_some());
        let err = wal
            .append(3, RecordBody::Delete { path: "a".into() })
            .unwrap_err();
        assert!(matches!(err, TaskError::Corruption(_)));
        assert!(!wal.should_checkpoint());
    }

    #[test]
    fn rotation_creates_new_segments() {
        let dir = tempdir().unwrap();
        let wal = open(
            &dir,
            WalOptions {
                segment_max_bytes: 300,
                ..options()
            },
        );
        for tx in 1..=6 {
            wal.append(tx, RecordBody::Create {
                task: task(&format!("t{tx}")),
            })
            .unwrap();
            wal.commit_tx(tx).unwrap();
        }
        let status = wal.status();
        assert!(status.stats.rotations >= 2, "{:?}", status.stats);
        assert!(status.segments.len() >= 3);
        assert_eq!(
            status
                .segments
                .iter()
                .filter(|m| m.state == SegmentState::Open)
                .count(),
            1
        );
        let (seen, _) = committed(&wal, Seq(0));
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn checkpoint_reclaims_sealed_segments() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("tasks.db");
        let wal = open(&dir, options());
        wal.append(1, RecordBody::Create { task: task("a") }).unwrap();
        wal.append(1, RecordBody::Create { task: task("b") }).unwrap();
        wal.commit_tx(1).unwrap();
        wal.append(2, RecordBody::Create { task: task("c") }).unwrap();
        wal.abort_tx(2).unwrap();

        let mut target = VecTarget::default();
        let outcome = wal.checkpoint(&mut target).unwrap();
        assert_eq!(outcome.segments, 1);
        assert_eq!(outcome.records_applied, 2);
        assert_eq!(outcome.checkpoint_seq, Seq(5));
        assert_eq!(target.persisted, Some(Seq(5)));
        assert!(!segment_path(&primary, SegmentId(1)).exists());
        assert!(wal.status().segments.is_empty());
        assert_eq!(wal.size(), 0);

        let again = wal.checkpoint(&mut target).unwrap();
        assert_eq!(again.segments, 0);
    }

    #[test]
    fn inflight_transaction_pins_its_segment() {
        let dir = tempdir().unwrap();
        let wal = open(&dir, options());
        wal.append(1, RecordBody::Create { task: task("a") }).unwrap();
        wal.commit_tx(1).unwrap();
        wal.append(2, RecordBody::Create { task: task("b") }).unwrap();
        assert_eq!(wal.pinned_seq(), Some(Seq(3)));

        let mut target = VecTarget::default();
        let outcome = wal.checkpoint(&mut target).unwrap();
        assert_eq!(outcome.segments, 0);
        assert!(target.records.is_empty());

        wal.commit_tx(2).unwrap();
        assert_eq!(wal.pinned_seq(), None);
        let outcome = wal.checkpoint(&mut target).unwrap();
        assert_eq!(outcome.segments, 2);
        assert_eq!(outcome.records_applied, 2);
    }

    #[test]
    fn failed_verify_leaves_segments_sealed() {
        let dir = tempdir().unwrap();
        let wal = open(&dir, options());
        wal.append(1, RecordBody::Create { task: task("a") }).unwrap();
        wal.commit_tx(1).unwrap();
        let mut target = VecTarget {
            fail_verify: true,
            ..VecTarget::default()
        };
        assert!(wal.checkpoint(&mut target).is_err());
        let status = wal.status();
        assert_eq!(status.segments.len(), 1);
        assert_eq!(status.segments[0].state, SegmentState::Sealed);

        target.fail_verify = false;
        target.applied_seq = Seq(0);
        let outcome = wal.checkpoint(&mut target).unwrap();
        assert_eq!(outcome.segments, 1);
    }

    #[test]
    fn checkpointed_segments_left_on_disk_are_removed_at_open() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("tasks.db");
        {
            let wal = open(&dir, options());
            wal.append(1, RecordBody::Create { task: task("a") }).unwrap();
            wal.commit_tx(1).unwrap();
            wal.sync().unwrap();
        }
        let manifest_path = Manifest::path_for(&primary);
        let mut manifest = Manifest::load(&manifest_path).unwrap().unwrap();
        manifest.segments[0].state = SegmentState::Checkpointed;
        manifest.checkpoint_seq = Seq(2);
        manifest.save(&manifest_path).unwrap();

        let wal = open(&dir, options());
        assert!(!segment_path(&primary, SegmentId(1)).exists());
        assert_eq!(wal.status().next_seq, Seq(3));
        let (seen, _) = committed(&wal, Seq(0));
        assert!(seen.is_empty());
    }

    #[test]
    fn size_threshold_requests_checkpoint() {
        let dir = tempdir().unwrap();
        let wal = open(
            &dir,
            WalOptions {
                checkpoint_bytes: 200,
                ..options()
            },
        );
        assert!(!wal.should_checkpoint());
        wal.append(1, RecordBody::Create { task: task("a") }).unwrap();
        wal.commit_tx(1).unwrap();
        wal.append(2, RecordBody::Create { task: task("b") }).unwrap();
        wal.commit_tx(2).unwrap();
        assert!(wal.should_checkpoint());
    }
}

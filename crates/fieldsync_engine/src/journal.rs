//! Durable operation journal.
//!
//! Every record mutation is appended as a frame before the caller is
//! acknowledged, so pending work survives a process restart. The
//! durability boundary of `submit` is the `append` of its record.

use crate::error::{SyncError, SyncResult};
use crate::queue::Escalation;
use fieldsync_protocol::{DeviceId, OperationId, OperationRecord, OperationStatus};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Default journal file name inside a store directory.
pub const JOURNAL_FILE_NAME: &str = "operations.journal";

/// One durably recorded queue event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalFrame {
    /// A record entered the queue.
    Enqueued(OperationRecord),
    /// A record's status or retry count changed.
    StatusChanged {
        /// The affected operation.
        id: OperationId,
        /// New status.
        status: OperationStatus,
        /// Retry count at the time of the change.
        retry_count: u32,
    },
    /// A conflict was escalated to manual review.
    Escalated(Escalation),
    /// Lower bound on a device's next sequence number, written during
    /// compaction so dropping settled records never reuses their ids.
    SequenceFloor {
        /// The device the floor applies to.
        device_id: DeviceId,
        /// The device's next sequence number at compaction time.
        next_sequence: u64,
    },
}

/// Everything a journal replay reconstructs.
#[derive(Debug, Default)]
pub struct JournalContents {
    /// Records in first-enqueued order, with their latest status.
    pub records: Vec<OperationRecord>,
    /// Escalations in detection order.
    pub escalations: Vec<Escalation>,
    /// Per-device sequence floors from past compactions.
    pub sequence_floors: HashMap<DeviceId, u64>,
}

/// Durable store of operation records.
///
/// Implementations append frames in call order; `load` replays them
/// back into records (last status update wins).
pub trait Journal: Send + Sync {
    /// Appends a freshly enqueued record. Must be durable before
    /// returning.
    fn append(&self, record: &OperationRecord) -> SyncResult<()>;

    /// Appends a status change for an existing record.
    fn update(&self, id: &OperationId, status: OperationStatus, retry_count: u32)
        -> SyncResult<()>;

    /// Appends a manual-review escalation.
    fn escalate(&self, escalation: &Escalation) -> SyncResult<()>;

    /// Replaces the journal contents wholesale. Used by compaction;
    /// callers must hold all relevant queue locks or be otherwise
    /// quiescent.
    fn rewrite(&self, frames: &[JournalFrame]) -> SyncResult<()>;

    /// Replays all frames into records and escalations.
    fn load(&self) -> SyncResult<JournalContents>;
}

/// Folds frames into records.
///
/// Duplicate enqueues and updates for unknown ids are corruption
/// scoped to that record: they are logged and skipped, and never
/// affect the rest of the journal.
fn replay(frames: impl IntoIterator<Item = JournalFrame>) -> JournalContents {
    let mut order: Vec<OperationId> = Vec::new();
    let mut records: HashMap<OperationId, OperationRecord> = HashMap::new();
    let mut escalations = Vec::new();
    let mut sequence_floors: HashMap<DeviceId, u64> = HashMap::new();

    for frame in frames {
        match frame {
            JournalFrame::Enqueued(record) => {
                if records.contains_key(&record.id) {
                    tracing::warn!(id = %record.id, "duplicate enqueue frame, keeping first");
                    continue;
                }
                order.push(record.id.clone());
                records.insert(record.id.clone(), record);
            }
            JournalFrame::StatusChanged {
                id,
                status,
                retry_count,
            } => match records.get_mut(&id) {
                Some(record) => {
                    record.status = status;
                    record.retry_count = retry_count;
                }
                None => {
                    tracing::warn!(id = %id, "status frame for unknown record, skipping");
                }
            },
            JournalFrame::Escalated(escalation) => escalations.push(escalation),
            JournalFrame::SequenceFloor {
                device_id,
                next_sequence,
            } => {
                let floor = sequence_floors.entry(device_id).or_default();
                *floor = (*floor).max(next_sequence);
            }
        }
    }

    JournalContents {
        records: order
            .into_iter()
            .filter_map(|id| records.remove(&id))
            .collect(),
        escalations,
        sequence_floors,
    }
}

/// An in-memory journal for tests and ephemeral queues.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    frames: Mutex<Vec<JournalFrame>>,
}

impl MemoryJournal {
    /// Creates an empty in-memory journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all frames, for inspection in tests.
    pub fn frames(&self) -> Vec<JournalFrame> {
        self.frames.lock().clone()
    }
}

impl Journal for MemoryJournal {
    fn append(&self, record: &OperationRecord) -> SyncResult<()> {
        self.frames
            .lock()
            .push(JournalFrame::Enqueued(record.clone()));
        Ok(())
    }

    fn update(
        &self,
        id: &OperationId,
        status: OperationStatus,
        retry_count: u32,
    ) -> SyncResult<()> {
        self.frames.lock().push(JournalFrame::StatusChanged {
            id: id.clone(),
            status,
            retry_count,
        });
        Ok(())
    }

    fn escalate(&self, escalation: &Escalation) -> SyncResult<()> {
        self.frames
            .lock()
            .push(JournalFrame::Escalated(escalation.clone()));
        Ok(())
    }

    fn rewrite(&self, frames: &[JournalFrame]) -> SyncResult<()> {
        *self.frames.lock() = frames.to_vec();
        Ok(())
    }

    fn load(&self) -> SyncResult<JournalContents> {
        Ok(replay(self.frames.lock().clone()))
    }
}

/// A file-backed journal of length-prefixed CBOR frames.
///
/// The file is held under an exclusive advisory lock for the lifetime
/// of the journal. `append`/`update` call `sync_data` before
/// returning, so an acknowledged frame is on disk. Replay tolerates a
/// truncated final frame from a crash mid-write: the partial tail is
/// discarded.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileJournal {
    /// Opens or creates a journal file, creating parent directories
    /// if needed.
    pub fn open(path: &Path) -> SyncResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        file.try_lock_exclusive().map_err(|_| SyncError::JournalLocked {
            path: path.display().to_string(),
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Returns the path to the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_frame(&self, frame: &JournalFrame) -> SyncResult<()> {
        let mut body = Vec::new();
        ciborium::ser::into_writer(frame, &mut body)
            .map_err(|e| SyncError::Codec(e.to_string()))?;

        let mut file = self.file.lock();
        file.write_all(&(body.len() as u32).to_le_bytes())?;
        file.write_all(&body)?;
        file.sync_data()?;
        Ok(())
    }

    /// Reads all complete frames from the file.
    pub fn read_frames(&self) -> SyncResult<Vec<JournalFrame>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut frames = Vec::new();
        let mut offset = 0usize;
        while offset + 4 <= bytes.len() {
            let len =
                u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
                    as usize;
            let start = offset + 4;
            if start + len > bytes.len() {
                tracing::warn!(
                    path = %self.path.display(),
                    offset,
                    "truncated journal tail, discarding partial frame"
                );
                break;
            }
            match ciborium::de::from_reader::<JournalFrame, _>(&bytes[start..start + len]) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        offset,
                        error = %e,
                        "undecodable journal frame, discarding tail"
                    );
                    break;
                }
            }
            offset = start + len;
        }
        if offset + 4 > bytes.len() && offset < bytes.len() {
            tracing::warn!(path = %self.path.display(), offset, "discarding partial length prefix");
        }

        Ok(frames)
    }
}

impl Journal for FileJournal {
    fn append(&self, record: &OperationRecord) -> SyncResult<()> {
        self.write_frame(&JournalFrame::Enqueued(record.clone()))
    }

    fn update(
        &self,
        id: &OperationId,
        status: OperationStatus,
        retry_count: u32,
    ) -> SyncResult<()> {
        self.write_frame(&JournalFrame::StatusChanged {
            id: id.clone(),
            status,
            retry_count,
        })
    }

    fn escalate(&self, escalation: &Escalation) -> SyncResult<()> {
        self.write_frame(&JournalFrame::Escalated(escalation.clone()))
    }

    /// Writes the replacement to a sibling temp file, fsyncs it, then
    /// renames it over the journal. A crash mid-rewrite leaves either
    /// the old contents or the new, never a mix.
    fn rewrite(&self, frames: &[JournalFrame]) -> SyncResult<()> {
        let mut buf = Vec::new();
        for frame in frames {
            let mut body = Vec::new();
            ciborium::ser::into_writer(frame, &mut body)
                .map_err(|e| SyncError::Codec(e.to_string()))?;
            buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
            buf.extend_from_slice(&body);
        }

        let tmp = self.path.with_extension("compact");
        {
            let mut tmp_file = File::create(&tmp)?;
            tmp_file.write_all(&buf)?;
            tmp_file.sync_data()?;
        }

        let mut file = self.file.lock();
        std::fs::rename(&tmp, &self.path)?;
        let replacement = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)?;
        replacement
            .try_lock_exclusive()
            .map_err(|_| SyncError::JournalLocked {
                path: self.path.display().to_string(),
            })?;
        *file = replacement;
        Ok(())
    }

    fn load(&self) -> SyncResult<JournalContents> {
        Ok(replay(self.read_frames()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_protocol::{DeviceId, OperationType, Payload, Timestamp};

    fn make_record(device: &str, sequence: u64) -> OperationRecord {
        OperationRecord::new(
            OperationId::new(DeviceId::new(device), sequence),
            OperationType::CreateVisit,
            Payload::new(),
            Timestamp::from_millis(1_000 + sequence),
        )
    }

    #[test]
    fn memory_journal_replay() {
        let journal = MemoryJournal::new();

        let r1 = make_record("TECH-1", 1);
        let r2 = make_record("TECH-1", 2);
        journal.append(&r1).unwrap();
        journal.append(&r2).unwrap();
        journal
            .update(&r1.id, OperationStatus::Succeeded, 0)
            .unwrap();

        let records = journal.load().unwrap().records;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, OperationStatus::Succeeded);
        assert_eq!(records[1].status, OperationStatus::Pending);
    }

    #[test]
    fn replay_last_update_wins() {
        let journal = MemoryJournal::new();
        let r = make_record("TECH-1", 1);

        journal.append(&r).unwrap();
        journal.update(&r.id, OperationStatus::InFlight, 0).unwrap();
        journal.update(&r.id, OperationStatus::Pending, 1).unwrap();
        journal.update(&r.id, OperationStatus::Failed, 4).unwrap();

        let records = journal.load().unwrap().records;
        assert_eq!(records[0].status, OperationStatus::Failed);
        assert_eq!(records[0].retry_count, 4);
    }

    #[test]
    fn replay_skips_duplicate_enqueue() {
        let r = make_record("TECH-1", 1);
        let mut duplicate = r.clone();
        duplicate.payload.insert("x".into(), serde_json::json!(1));

        let records = replay(vec![
            JournalFrame::Enqueued(r.clone()),
            JournalFrame::Enqueued(duplicate),
        ])
        .records;
        assert_eq!(records.len(), 1);
        assert!(records[0].payload.is_empty());
    }

    #[test]
    fn replay_skips_update_for_unknown_record() {
        let r = make_record("TECH-1", 1);
        let records = replay(vec![JournalFrame::StatusChanged {
            id: r.id,
            status: OperationStatus::Succeeded,
            retry_count: 0,
        }])
        .records;
        assert!(records.is_empty());
    }

    #[test]
    fn file_journal_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE_NAME);

        let r1 = make_record("TECH-7", 1);
        let r2 = make_record("ADMIN-1", 1);
        {
            let journal = FileJournal::open(&path).unwrap();
            journal.append(&r1).unwrap();
            journal.append(&r2).unwrap();
            journal
                .update(&r1.id, OperationStatus::Succeeded, 0)
                .unwrap();
        }

        let journal = FileJournal::open(&path).unwrap();
        let records = journal.load().unwrap().records;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, r1.id);
        assert_eq!(records[0].status, OperationStatus::Succeeded);
        assert_eq!(records[1].id, r2.id);
        assert_eq!(records[1].status, OperationStatus::Pending);
    }

    #[test]
    fn file_journal_discards_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE_NAME);

        let r = make_record("TECH-7", 1);
        {
            let journal = FileJournal::open(&path).unwrap();
            journal.append(&r).unwrap();
        }

        // Simulate a crash mid-write: a length prefix promising more
        // bytes than exist.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u32.to_le_bytes()).unwrap();
            file.write_all(&[0xAB, 0xCD]).unwrap();
        }

        let journal = FileJournal::open(&path).unwrap();
        let records = journal.load().unwrap().records;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, r.id);
    }

    #[test]
    fn file_journal_persists_escalations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE_NAME);

        let local = make_record("TECH-7", 1);
        let remote = make_record("SERVER", 1);
        let escalation = Escalation {
            operation_id: local.id.clone(),
            local,
            remote,
            detected_at: Timestamp::from_millis(5_000),
        };

        {
            let journal = FileJournal::open(&path).unwrap();
            journal.escalate(&escalation).unwrap();
        }

        let journal = FileJournal::open(&path).unwrap();
        let contents = journal.load().unwrap();
        assert_eq!(contents.escalations, vec![escalation]);
    }

    #[test]
    fn file_journal_rewrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE_NAME);
        let device = DeviceId::new("TECH-7");

        let r1 = make_record("TECH-7", 1);
        let r2 = make_record("TECH-7", 2);
        let journal = FileJournal::open(&path).unwrap();
        journal.append(&r1).unwrap();
        journal.append(&r2).unwrap();

        journal
            .rewrite(&[
                JournalFrame::SequenceFloor {
                    device_id: device.clone(),
                    next_sequence: 3,
                },
                JournalFrame::Enqueued(r2.clone()),
            ])
            .unwrap();

        // The live handle sees the new contents and appends still
        // land in the replacement file.
        journal
            .update(&r2.id, OperationStatus::Succeeded, 0)
            .unwrap();
        let contents = journal.load().unwrap();
        assert_eq!(contents.records.len(), 1);
        assert_eq!(contents.records[0].id, r2.id);
        assert_eq!(contents.records[0].status, OperationStatus::Succeeded);
        assert_eq!(contents.sequence_floors.get(&device), Some(&3));

        drop(journal);
        let reopened = FileJournal::open(&path).unwrap();
        assert_eq!(reopened.load().unwrap().records.len(), 1);
    }

    #[test]
    fn file_journal_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE_NAME);

        let _held = FileJournal::open(&path).unwrap();
        let second = FileJournal::open(&path);
        assert!(matches!(second, Err(SyncError::JournalLocked { .. })));
    }
}

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{DocId, Document, SeqNo};

/// Frames larger than this are never written; seeing one during replay
/// means the length header is garbage.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalRecord {
    pub seq: SeqNo,
    pub op: WalOp,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalOp {
    Put(Document),
    Delete(DocId),
}

impl WalOp {
    pub fn doc_id(&self) -> &DocId {
        match self {
            WalOp::Put(doc) => &doc.id,
            WalOp::Delete(id) => id,
        }
    }
}

/// Result of scanning the log on shard open.
#[derive(Debug)]
pub struct ReplayOutcome {
    /// Records with seq > the requested checkpoint, in seq order.
    pub records: Vec<WalRecord>,
    /// A torn trailing record was detected and dropped.
    pub truncated_tail: bool,
    /// One past the highest seq seen in the log (or `from + 1` if empty).
    pub next_seq: SeqNo,
}

/// Per-shard append-only record log. One file per generation, named by the
/// seq of its first record; a new generation starts on every open and on
/// every truncate, so fully-checkpointed generations can be deleted whole.
///
/// Records are framed as `[len u32][crc32 u32][bincode payload]`.
pub struct Wal {
    dir: PathBuf,
    file: File,
    active_start: SeqNo,
    active_records: u64,
    next_seq: SeqNo,
}

impl Wal {
    /// Open the log for appending. `next_seq` is the first seq this Wal
    /// will hand out, normally `ReplayOutcome::next_seq` from a prior
    /// [`Wal::replay`].
    pub fn open(dir: &Path, next_seq: SeqNo) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(generation_path(dir, next_seq))?;
        Ok(Wal {
            dir: dir.to_path_buf(),
            file,
            active_start: next_seq,
            active_records: 0,
            next_seq,
        })
    }

    /// Append one operation, returning its assigned seq. Durability is the
    /// caller's problem: call [`Wal::sync`] per its sync policy.
    pub fn append(&mut self, op: WalOp) -> Result<SeqNo> {
        let seq = self.next_seq;
        let record = WalRecord {
            seq,
            op,
            timestamp: Utc::now(),
        };

        let payload = bincode::serialize(&record)?;
        let crc = crc32fast::hash(&payload);

        self.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.write_all(&payload)?;

        self.next_seq += 1;
        self.active_records += 1;
        Ok(seq)
    }

    /// Force everything appended so far to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Discard generations whose records are all ≤ `up_to`. Rotates the
    /// active generation first so it can be reclaimed by a later call.
    pub fn truncate(&mut self, up_to: SeqNo) -> Result<()> {
        if self.active_records > 0 {
            self.sync()?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(generation_path(&self.dir, self.next_seq))?;
            self.file = file;
            self.active_start = self.next_seq;
            self.active_records = 0;
        }

        let starts = generation_starts(&self.dir)?;
        for (i, &start) in starts.iter().enumerate() {
            if start == self.active_start {
                continue;
            }
            // A generation's records end where the next one begins.
            let end = starts
                .get(i + 1)
                .copied()
                .unwrap_or(self.active_start);
            if end <= up_to + 1 {
                fs::remove_file(generation_path(&self.dir, start))?;
            }
        }
        Ok(())
    }

    /// Scan every generation in order and return the records past
    /// `from`. A torn trailing record is dropped and flagged; a corrupt
    /// record with valid data after it is `CorruptLog`.
    pub fn replay(dir: &Path, from: SeqNo) -> Result<ReplayOutcome> {
        let mut records = Vec::new();
        let mut truncated_tail = false;
        let mut next_seq = from + 1;

        if !dir.exists() {
            return Ok(ReplayOutcome {
                records,
                truncated_tail,
                next_seq,
            });
        }

        let starts = generation_starts(dir)?;
        for (i, &start) in starts.iter().enumerate() {
            let last_file = i + 1 == starts.len();
            let data = fs::read(generation_path(dir, start))?;
            let scan = scan_frames(&data, last_file)?;
            truncated_tail |= scan.truncated_tail;
            for record in scan.records {
                if record.seq >= next_seq {
                    if record.seq > next_seq {
                        return Err(Error::new(
                            ErrorKind::CorruptLog,
                            format!(
                                "gap in log: expected seq {}, found {}",
                                next_seq, record.seq
                            ),
                        ));
                    }
                    next_seq = record.seq + 1;
                    if record.seq > from {
                        records.push(record);
                    }
                }
            }
        }

        Ok(ReplayOutcome {
            records,
            truncated_tail,
            next_seq,
        })
    }
}

struct FrameScan {
    records: Vec<WalRecord>,
    truncated_tail: bool,
}

fn scan_frames(data: &[u8], allow_torn_tail: bool) -> Result<FrameScan> {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while pos < data.len() {
        let header_end = pos + 8;
        if header_end > data.len() {
            return torn_or_corrupt(allow_torn_tail, records, "torn frame header");
        }
        let len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(data[pos + 4..header_end].try_into().unwrap());

        if len > MAX_RECORD_LEN || header_end + len > data.len() {
            return torn_or_corrupt(allow_torn_tail, records, "torn frame body");
        }

        let payload = &data[header_end..header_end + len];
        let at_eof = header_end + len == data.len();

        if crc32fast::hash(payload) != crc {
            if allow_torn_tail && at_eof {
                return Ok(FrameScan {
                    records,
                    truncated_tail: true,
                });
            }
            return Err(Error::new(
                ErrorKind::CorruptLog,
                "checksum mismatch on interior record",
            ));
        }

        match bincode::deserialize::<WalRecord>(payload) {
            Ok(record) => records.push(record),
            Err(_) if allow_torn_tail && at_eof => {
                return Ok(FrameScan {
                    records,
                    truncated_tail: true,
                });
            }
            Err(_) => {
                return Err(Error::new(
                    ErrorKind::CorruptLog,
                    "undecodable interior record",
                ));
            }
        }
        pos = header_end + len;
    }

    Ok(FrameScan {
        records,
        truncated_tail: false,
    })
}

fn torn_or_corrupt(
    allow: bool,
    records: Vec<WalRecord>,
    context: &str,
) -> Result<FrameScan> {
    if allow {
        Ok(FrameScan {
            records,
            truncated_tail: true,
        })
    } else {
        Err(Error::new(ErrorKind::CorruptLog, context.to_string()))
    }
}

fn generation_path(dir: &Path, start: SeqNo) -> PathBuf {
    dir.join(format!("wal_{:016}.log", start))
}

/// Starting seqs of every generation file, ascending.
fn generation_starts(dir: &Path) -> Result<Vec<SeqNo>> {
    let mut starts = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if let Some(stem) = name.strip_prefix("wal_").and_then(|n| n.strip_suffix(".log")) {
            if let Ok(start) = stem.parse::<SeqNo>() {
                starts.push(start);
            }
        }
    }
    starts.sort_unstable();
    Ok(starts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FieldValue;
    use tempfile::tempdir;

    fn put(id: &str) -> WalOp {
        WalOp::Put(
            Document::new(id).with_field("body", FieldValue::Text(format!("doc {}", id))),
        )
    }

    #[test]
    fn append_then_replay_round_trips() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("wal");
        {
            let mut wal = Wal::open(&dir, 1).unwrap();
            for i in 1..=5 {
                let seq = wal.append(put(&format!("d{}", i))).unwrap();
                assert_eq!(seq, i);
            }
            wal.sync().unwrap();
        }

        let outcome = Wal::replay(&dir, 0).unwrap();
        assert_eq!(outcome.records.len(), 5);
        assert!(!outcome.truncated_tail);
        assert_eq!(outcome.next_seq, 6);
        let seqs: Vec<_> = outcome.records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn replay_skips_checkpointed_records() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("wal");
        let mut wal = Wal::open(&dir, 1).unwrap();
        for i in 1..=10 {
            wal.append(put(&format!("d{}", i))).unwrap();
        }
        wal.sync().unwrap();

        let outcome = Wal::replay(&dir, 7).unwrap();
        let seqs: Vec<_> = outcome.records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
    }

    #[test]
    fn torn_tail_is_dropped_with_warning() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("wal");
        let path = {
            let mut wal = Wal::open(&dir, 1).unwrap();
            wal.append(put("a")).unwrap();
            wal.append(put("b")).unwrap();
            wal.sync().unwrap();
            generation_path(&dir, 1)
        };

        // Simulate a crash mid-append: a frame header with no body.
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(&1234u32.to_le_bytes()).unwrap();
        file.write_all(&0u32.to_le_bytes()).unwrap();
        drop(file);

        let outcome = Wal::replay(&dir, 0).unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert!(outcome.truncated_tail);
        assert_eq!(outcome.next_seq, 3);
    }

    #[test]
    fn interior_corruption_is_fatal() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("wal");
        let path = {
            let mut wal = Wal::open(&dir, 1).unwrap();
            for i in 1..=3 {
                wal.append(put(&format!("d{}", i))).unwrap();
            }
            wal.sync().unwrap();
            generation_path(&dir, 1)
        };

        // Flip a byte in the first record's payload.
        let mut data = fs::read(&path).unwrap();
        data[10] ^= 0xff;
        fs::write(&path, data).unwrap();

        let err = Wal::replay(&dir, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptLog);
    }

    #[test]
    fn truncate_removes_covered_generations() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("wal");
        let mut wal = Wal::open(&dir, 1).unwrap();
        for i in 1..=4 {
            wal.append(put(&format!("d{}", i))).unwrap();
        }
        wal.sync().unwrap();

        // Everything ≤ 4 is checkpointed; the rotated generation goes away
        // on the next truncate.
        wal.truncate(4).unwrap();
        wal.append(put("e")).unwrap();
        wal.sync().unwrap();
        wal.truncate(4).unwrap();

        let outcome = Wal::replay(&dir, 4).unwrap();
        let seqs: Vec<_> = outcome.records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![5]);
        assert_eq!(outcome.next_seq, 6);
    }

    #[test]
    fn reopen_continues_sequence() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("wal");
        {
            let mut wal = Wal::open(&dir, 1).unwrap();
            wal.append(put("a")).unwrap();
            wal.sync().unwrap();
        }
        let outcome = Wal::replay(&dir, 0).unwrap();
        let mut wal = Wal::open(&dir, outcome.next_seq).unwrap();
        assert_eq!(wal.append(put("b")).unwrap(), 2);
        wal.sync().unwrap();

        let outcome = Wal::replay(&dir, 0).unwrap();
        assert_eq!(outcome.records.len(), 2);
    }
}

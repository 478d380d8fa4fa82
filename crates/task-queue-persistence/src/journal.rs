//! Append-only task journal.
//!
//! Every lifecycle change of a task is written as one JSON line carrying the
//! full task record. Replaying the file and keeping the last record per task
//! id gives back the state at the time of the crash. The journal is rewritten
//! from a snapshot on `compact`.

use crate::{PersistenceError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use task_queue_core::{Task, TaskId};
use tracing::{debug, info, warn};

const JOURNAL_FILE: &str = "tasks.journal";

/// Journal entry types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEntry {
    /// Latest state of a task
    Upsert { task: Task },

    /// Task dropped by retention cleanup
    Purged { task_id: TaskId },
}

/// One line of the journal file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub entry: JournalEntry,
}

struct JournalWriter {
    file: BufWriter<File>,
    next_seq: u64,
    appends_since_compaction: u64,
}

/// Durable log of task state
pub struct Journal {
    path: PathBuf,
    writer: Mutex<JournalWriter>,
}

impl Journal {
    /// Create or open the journal inside `data_dir`
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(data_dir.as_ref())?;
        let path = data_dir.as_ref().join(JOURNAL_FILE);

        let next_seq = match Self::read_records(&path) {
            Ok((records, valid_len)) => {
                // Cut a torn tail so new lines do not land after garbage
                let file_len = fs::metadata(&path)?.len();
                if valid_len < file_len {
                    warn!(
                        "Truncating journal {:?} from {} to {} bytes",
                        path, file_len, valid_len
                    );
                    OpenOptions::new().write(true).open(&path)?.set_len(valid_len)?;
                }
                records.last().map(|r| r.seq + 1).unwrap_or(0)
            }
            Err(PersistenceError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("Opened task journal at {:?} (next seq {})", path, next_seq);

        Ok(Journal {
            path,
            writer: Mutex::new(JournalWriter {
                file: BufWriter::new(file),
                next_seq,
                appends_since_compaction: 0,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry and flush it to the OS
    pub fn append(&self, entry: JournalEntry) -> Result<u64> {
        let mut writer = self.writer.lock();
        let seq = writer.next_seq;
        let record = JournalRecord {
            seq,
            timestamp: Utc::now(),
            entry,
        };

        serde_json::to_writer(&mut writer.file, &record)?;
        writer.file.write_all(b"\n")?;
        writer.file.flush()?;

        writer.next_seq += 1;
        writer.appends_since_compaction += 1;
        Ok(seq)
    }

    /// Record the current state of a task
    pub fn record(&self, task: &Task) -> Result<u64> {
        self.append(JournalEntry::Upsert { task: task.clone() })
    }

    /// Appends since open or the last compaction
    pub fn appends_since_compaction(&self) -> u64 {
        self.writer.lock().appends_since_compaction
    }

    /// Read every record in order
    pub fn replay(&self) -> Result<Vec<JournalRecord>> {
        // Make sure buffered lines are visible to the reader
        self.writer.lock().file.flush()?;
        Ok(Self::read_records(&self.path)?.0)
    }

    /// Last known state of every task that was not purged, in admission order
    pub fn recover(&self) -> Result<Vec<Task>> {
        let mut tasks: HashMap<TaskId, Task> = HashMap::new();
        for record in self.replay()? {
            match record.entry {
                JournalEntry::Upsert { task } => {
                    tasks.insert(task.id, task);
                }
                JournalEntry::Purged { task_id } => {
                    tasks.remove(&task_id);
                }
            }
        }

        let mut tasks: Vec<Task> = tasks.into_values().collect();
        tasks.sort_by_key(|t| t.sequence);
        debug!("Recovered {} tasks from journal", tasks.len());
        Ok(tasks)
    }

    /// Replace the journal with one record per task
    pub fn compact(&self, tasks: &[Task]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.file.flush()?;

        let tmp_path = self.path.with_extension("journal.tmp");
        let mut seq = 0;
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for task in tasks {
                let record = JournalRecord {
                    seq,
                    timestamp: Utc::now(),
                    entry: JournalEntry::Upsert { task: task.clone() },
                };
                serde_json::to_writer(&mut tmp, &record)?;
                tmp.write_all(b"\n")?;
                seq += 1;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        writer.file = BufWriter::new(file);
        writer.next_seq = seq;
        writer.appends_since_compaction = 0;

        info!("Compacted task journal to {} records", seq);
        Ok(())
    }

    /// Sync journal to disk
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.file.flush()?;
        writer.file.get_ref().sync_data()?;
        Ok(())
    }

    /// Parse the file; also returns the byte length covered by valid records.
    fn read_records(path: &Path) -> Result<(Vec<JournalRecord>, u64)> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        let mut valid_len = 0u64;
        let mut offset = 0u64;
        let mut line = String::new();

        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                break;
            }
            offset += read as u64;
            let complete = line.ends_with('\n');

            if line.trim().is_empty() {
                if complete {
                    valid_len = offset;
                }
                continue;
            }
            match serde_json::from_str::<JournalRecord>(line.trim_end()) {
                Ok(record) if complete => {
                    records.push(record);
                    valid_len = offset;
                }
                // A torn final line is what a crash mid-append leaves behind
                Ok(_) => warn!("Ignoring unterminated journal tail"),
                Err(e) if !complete => warn!("Ignoring truncated journal tail: {}", e),
                Err(e) => {
                    return Err(PersistenceError::JournalError(format!(
                        "corrupt record after seq {}: {}",
                        records.last().map(|r| r.seq).unwrap_or(0),
                        e
                    )))
                }
            }
        }

        Ok((records, valid_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use task_queue_core::TaskStatus;
    use tempfile::TempDir;

    fn task(sequence: u64) -> Task {
        Task::builder("test", json!({"n": sequence}))
            .sequence(sequence)
            .build()
            .unwrap()
    }

    #[test]
    fn test_append_and_replay() {
        let temp_dir = TempDir::new().unwrap();
        let journal = Journal::open(temp_dir.path()).unwrap();

        let t = task(0);
        assert_eq!(journal.record(&t).unwrap(), 0);
        assert_eq!(journal.record(&t).unwrap(), 1);

        let records = journal.replay().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].seq, 1);
        assert_eq!(journal.appends_since_compaction(), 2);
    }

    #[test]
    fn test_recover_keeps_last_state() {
        let temp_dir = TempDir::new().unwrap();

        let mut first = task(0);
        let second = task(1);
        let purged = task(2);
        {
            let journal = Journal::open(temp_dir.path()).unwrap();
            journal.record(&first).unwrap();
            journal.record(&second).unwrap();
            journal.record(&purged).unwrap();
            first.claim("worker-1".into()).unwrap();
            journal.record(&first).unwrap();
            journal
                .append(JournalEntry::Purged { task_id: purged.id })
                .unwrap();
        }

        // Reopen and verify
        let journal = Journal::open(temp_dir.path()).unwrap();
        let tasks = journal.recover().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, first.id);
        assert_eq!(tasks[0].status, TaskStatus::Running);
        assert_eq!(tasks[1].id, second.id);
        assert_eq!(journal.record(&second).unwrap(), 5);
    }

    #[test]
    fn test_truncated_tail_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let t = task(0);
        {
            let journal = Journal::open(temp_dir.path()).unwrap();
            journal.record(&t).unwrap();
        }
        let path = temp_dir.path().join(JOURNAL_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"seq\":1,\"timest").unwrap();
        drop(file);

        let journal = Journal::open(temp_dir.path()).unwrap();
        let tasks = journal.recover().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, t.id);

        // Appending after the repair keeps the file readable
        assert_eq!(journal.record(&t).unwrap(), 1);
        assert_eq!(journal.replay().unwrap().len(), 2);
    }

    #[test]
    fn test_compact() {
        let temp_dir = TempDir::new().unwrap();
        let journal = Journal::open(temp_dir.path()).unwrap();

        let t = task(0);
        for _ in 0..5 {
            journal.record(&t).unwrap();
        }
        journal.compact(std::slice::from_ref(&t)).unwrap();

        assert_eq!(journal.appends_since_compaction(), 0);
        assert_eq!(journal.replay().unwrap().len(), 1);
        assert_eq!(journal.record(&t).unwrap(), 1);
        assert_eq!(journal.recover().unwrap().len(), 1);
    }
}

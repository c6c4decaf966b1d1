//! Crash-resumable transfer journal.
//!
//! A memory-mapped file of identical 528-byte records: 8 bytes of source
//! fingerprint, 8 bytes of last-successful offset, 512 bytes of NUL-padded
//! target name. Fingerprint 0 marks a free slot. After a crash, every
//! non-empty slot names a transfer that was in flight and should be retried.

use std::collections::HashMap;

use crate::errors::CopyError;

pub const RECORD_SIZE: usize = 528;
const NAME_SIZE: usize = 512;
/// Growth step: as many whole records as fit in one mebibyte, keeping the
/// file length divisible by the record size.
const GROWTH_RECORDS: usize = (1024 * 1024) / RECORD_SIZE;

/// Default journal file name, created in the state directory.
pub const JOURNAL_FILENAME: &str = "fastcopy.journal";

/// One live record surfaced by [`Journal::resume`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub fingerprint: u64,
    /// Advisory: last offset known durably written for this source.
    pub last_offset: i64,
    pub target_name: String,
}

/// 64-bit fingerprint of a source URI, never 0 (0 marks a free slot).
pub fn fingerprint(source: &str) -> u64 {
    let digest = blake3::hash(source.as_bytes());
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest.as_bytes()[..8]);
    let value = u64::from_le_bytes(first);
    if value == 0 {
        1
    } else {
        value
    }
}

struct Inner {
    file: std::fs::File,
    map: memmap2::MmapMut,
    /// fingerprint -> slot index
    slots: HashMap<u64, usize>,
    free: Vec<usize>,
}

/// The journal. All public operations serialize on one lock; record writes
/// are therefore never observed half-done.
pub struct Journal {
    inner: std::sync::Mutex<Inner>,
    path: std::path::PathBuf,
}

impl Journal {
    /// Open (or create) the journal at `path` and index its live records.
    pub fn open(path: &std::path::Path) -> Result<Self, CopyError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(CopyError::Io)?;
        let mut len = file.metadata().map_err(CopyError::Io)?.len();
        if len % RECORD_SIZE as u64 != 0 {
            // torn tail from a crash mid-growth; drop the partial record
            len -= len % RECORD_SIZE as u64;
            file.set_len(len).map_err(CopyError::Io)?;
        }
        if len == 0 {
            len = (GROWTH_RECORDS * RECORD_SIZE) as u64;
            file.set_len(len).map_err(CopyError::Io)?;
        }
        let map = unsafe { memmap2::MmapMut::map_mut(&file) }.map_err(CopyError::Io)?;
        let record_count = len as usize / RECORD_SIZE;
        let mut slots = HashMap::new();
        let mut free = Vec::new();
        for index in 0..record_count {
            let record = &map[index * RECORD_SIZE..(index + 1) * RECORD_SIZE];
            let fp = u64::from_le_bytes(record[0..8].try_into().unwrap());
            if fp == 0 {
                free.push(index);
            } else if let Some(stale) = slots.insert(fp, index) {
                // duplicate fingerprint cannot happen through this API;
                // keep the later slot
                free.push(stale);
            }
        }
        tracing::debug!(
            "journal opened: {:?}, {} live, {} free",
            path,
            slots.len(),
            free.len()
        );
        Ok(Self {
            inner: std::sync::Mutex::new(Inner {
                file,
                map,
                slots,
                free,
            }),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// All records that were in flight when the journal was last written.
    pub fn resume(&self) -> Vec<JournalEntry> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<JournalEntry> = inner
            .slots
            .values()
            .map(|&index| read_record(&inner.map, index))
            .collect();
        entries.sort_by_key(|entry| entry.fingerprint);
        entries
    }

    /// Upsert the record for `source`: creates the slot on first call,
    /// afterwards only ever moves the offset forward.
    pub fn update(&self, source: &str, target_name: &str, offset: u64) -> Result<(), CopyError> {
        let fp = fingerprint(source);
        let mut inner = self.inner.lock().unwrap();
        let index = match inner.slots.get(&fp) {
            Some(&index) => index,
            None => {
                let index = match inner.free.pop() {
                    Some(index) => index,
                    None => grow(&mut inner)?,
                };
                inner.slots.insert(fp, index);
                index
            }
        };
        let record = &mut inner.map[index * RECORD_SIZE..(index + 1) * RECORD_SIZE];
        let existing = i64::from_le_bytes(record[8..16].try_into().unwrap());
        let offset = (offset as i64).max(existing);
        record[0..8].copy_from_slice(&fp.to_le_bytes());
        record[8..16].copy_from_slice(&offset.to_le_bytes());
        let mut name = [0u8; NAME_SIZE];
        let bytes = truncate_utf8(target_name, NAME_SIZE);
        name[..bytes.len()].copy_from_slice(bytes);
        record[16..].copy_from_slice(&name);
        Ok(())
    }

    /// Clear the record for `source`; a no-op if none exists.
    pub fn complete(&self, source: &str) -> Result<(), CopyError> {
        let fp = fingerprint(source);
        let mut inner = self.inner.lock().unwrap();
        if let Some(index) = inner.slots.remove(&fp) {
            inner.map[index * RECORD_SIZE..(index + 1) * RECORD_SIZE].fill(0);
            inner.free.push(index);
        }
        Ok(())
    }

    /// Durably write all pending records.
    pub fn flush(&self) -> Result<(), CopyError> {
        let inner = self.inner.lock().unwrap();
        inner.map.flush().map_err(CopyError::Io)
    }

    /// Number of live records (test and summary introspection).
    pub fn live_records(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        // disposal errors are swallowed after a best-effort flush
        if let Ok(inner) = self.inner.lock() {
            let _ = inner.map.flush();
        }
    }
}

fn read_record(map: &memmap2::MmapMut, index: usize) -> JournalEntry {
    let record = &map[index * RECORD_SIZE..(index + 1) * RECORD_SIZE];
    let fingerprint = u64::from_le_bytes(record[0..8].try_into().unwrap());
    let last_offset = i64::from_le_bytes(record[8..16].try_into().unwrap());
    let name_end = record[16..]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(NAME_SIZE);
    let target_name = String::from_utf8_lossy(&record[16..16 + name_end]).into_owned();
    JournalEntry {
        fingerprint,
        last_offset,
        target_name,
    }
}

/// Extend the file by one growth step, remap, and return the first new slot;
/// the rest of the new range joins the free list.
fn grow(inner: &mut Inner) -> Result<usize, CopyError> {
    let old_records = inner.map.len() / RECORD_SIZE;
    let new_len = ((old_records + GROWTH_RECORDS) * RECORD_SIZE) as u64;
    inner.map.flush().map_err(CopyError::Io)?;
    inner.file.set_len(new_len).map_err(CopyError::Io)?;
    inner.map = unsafe { memmap2::MmapMut::map_mut(&inner.file) }.map_err(CopyError::Io)?;
    let first_new = old_records;
    inner
        .free
        .extend((first_new + 1..old_records + GROWTH_RECORDS).rev());
    Ok(first_new)
}

fn truncate_utf8(value: &str, limit: usize) -> &[u8] {
    if value.len() <= limit {
        return value.as_bytes();
    }
    let mut end = limit;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn journal_in(dir: &tempfile::TempDir) -> Journal {
        Journal::open(&dir.path().join(JOURNAL_FILENAME)).unwrap()
    }

    fn file_len(journal: &Journal) -> u64 {
        std::fs::metadata(journal.path()).unwrap().len()
    }

    #[test]
    fn fingerprints_are_stable_and_nonzero() {
        let a = fingerprint("/tmp/a.bin");
        assert_eq!(a, fingerprint("/tmp/a.bin"));
        assert_ne!(a, 0);
        assert_ne!(a, fingerprint("/tmp/b.bin"));
    }

    #[test]
    fn update_then_complete_leaves_nothing_to_resume() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(&dir);
        journal.update("/src/a", "/dst/a", 4096).unwrap();
        assert_eq!(journal.resume().len(), 1);
        journal.complete("/src/a").unwrap();
        assert!(journal.resume().is_empty());
    }

    #[test]
    fn offsets_never_move_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(&dir);
        journal.update("/src/a", "/dst/a", 1000).unwrap();
        journal.update("/src/a", "/dst/a", 500).unwrap();
        let entries = journal.resume();
        assert_eq!(entries[0].last_offset, 1000);
        journal.update("/src/a", "/dst/a", 2000).unwrap();
        assert_eq!(journal.resume()[0].last_offset, 2000);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let journal = journal_in(&dir);
            journal.update("/src/big.bin", "/dst/big.bin", 200 << 20).unwrap();
            journal.flush().unwrap();
        }
        let reopened = journal_in(&dir);
        let entries = reopened.resume();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fingerprint, fingerprint("/src/big.bin"));
        assert_eq!(entries[0].last_offset, 200 << 20);
        assert_eq!(entries[0].target_name, "/dst/big.bin");
    }

    #[test]
    fn file_length_is_always_a_record_multiple() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(&dir);
        assert_eq!(file_len(&journal) % RECORD_SIZE as u64, 0);
        for i in 0..100 {
            journal
                .update(&format!("/src/{i}"), &format!("/dst/{i}"), i)
                .unwrap();
            assert_eq!(file_len(&journal) % RECORD_SIZE as u64, 0);
        }
    }

    #[test]
    fn grows_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(&dir);
        let initial_len = file_len(&journal);
        let capacity = initial_len as usize / RECORD_SIZE;
        for i in 0..capacity + 10 {
            journal
                .update(&format!("/src/file-{i}"), "/dst", 0)
                .unwrap();
        }
        assert_eq!(journal.live_records(), capacity + 10);
        let grown_len = file_len(&journal);
        assert!(grown_len > initial_len);
        assert_eq!(grown_len % RECORD_SIZE as u64, 0);
    }

    #[test]
    fn long_target_names_are_truncated_not_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(&dir);
        let long_name = "x".repeat(600);
        journal.update("/src/a", &long_name, 0).unwrap();
        let entries = journal.resume();
        assert_eq!(entries[0].target_name.len(), 512);
    }

    #[test]
    fn torn_tail_is_discarded_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILENAME);
        {
            let journal = Journal::open(&path).unwrap();
            journal.update("/src/a", "/dst/a", 77).unwrap();
            journal.flush().unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len + 100).unwrap();
        drop(file);
        let journal = Journal::open(&path).unwrap();
        assert_eq!(file_len(&journal) % RECORD_SIZE as u64, 0);
        assert_eq!(journal.resume().len(), 1);
    }
}

//! Append-only journal backing the scalar key-value store.
//!
//! Every put or remove is appended as a checksummed record and fsynced before
//! the in-memory index changes. On open the journal is replayed up to the
//! first unreadable record; a torn tail left by a crash is cut off by
//! rewriting the journal from the recovered index. A write that fails part
//! way through is truncated away before the next append.
//!
//! # File Format
//! ```text
//! [MAGIC "GKJR": 4 bytes][VERSION: 1 byte]
//! [RECORD]*
//!
//! RECORD = [kind: 1 byte][key len: 1 byte][key: UTF-8]
//!          [value: 8 bytes LE, puts only][crc32 of the preceding bytes: 4 bytes LE]
//! ```

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Read, Result as IoResult, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::storage::traits::{KeyValueStore, StorageError};

const MAGIC: [u8; 4] = *b"GKJR";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: u64 = 5;

const KIND_FLOAT: u8 = 1;
const KIND_INT: u8 = 2;
const KIND_REMOVE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Scalar {
    Float(f64),
    Int(i64),
}

#[derive(Debug, Clone)]
enum JournalOp {
    Put { key: String, value: Scalar },
    Remove { key: String },
}

impl JournalOp {
    fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Remove { key } => key,
        }
    }

    fn encode(&self) -> IoResult<Vec<u8>> {
        let key = self.key().as_bytes();
        let key_len = u8::try_from(key.len())
            .map_err(|_| IoError::new(ErrorKind::InvalidInput, format!("journal key longer than 255 bytes: {}", self.key())))?;

        let mut out = Vec::with_capacity(2 + key.len() + 8 + 4);
        let value = match self {
            Self::Put { value: Scalar::Float(v), .. } => {
                out.push(KIND_FLOAT);
                Some(v.to_le_bytes())
            }
            Self::Put { value: Scalar::Int(v), .. } => {
                out.push(KIND_INT);
                Some(v.to_le_bytes())
            }
            Self::Remove { .. } => {
                out.push(KIND_REMOVE);
                None
            }
        };
        out.push(key_len);
        out.extend_from_slice(key);
        if let Some(bytes) = value {
            out.extend_from_slice(&bytes);
        }
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    /// Reads one record. `Ok(None)` means a clean end of file.
    ///
    /// # Errors
    /// - `UnexpectedEof` if the record is truncated
    /// - `InvalidData` on an unknown kind, a bad key or a checksum mismatch
    fn decode(reader: &mut impl Read) -> IoResult<Option<Self>> {
        let mut kind = [0u8; 1];
        if reader.read(&mut kind)? == 0 {
            return Ok(None);
        }
        if !matches!(kind[0], KIND_FLOAT | KIND_INT | KIND_REMOVE) {
            return Err(IoError::new(ErrorKind::InvalidData, format!("unknown record kind {}", kind[0])));
        }

        let mut key_len = [0u8; 1];
        reader.read_exact(&mut key_len)?;
        let mut key = vec![0u8; usize::from(key_len[0])];
        reader.read_exact(&mut key)?;
        let mut value = [0u8; 8];
        if kind[0] != KIND_REMOVE {
            reader.read_exact(&mut value)?;
        }
        let mut crc = [0u8; 4];
        reader.read_exact(&mut crc)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&kind);
        hasher.update(&key_len);
        hasher.update(&key);
        if kind[0] != KIND_REMOVE {
            hasher.update(&value);
        }
        let computed = hasher.finalize();
        let stored = u32::from_le_bytes(crc);
        if stored != computed {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!("CRC mismatch: stored={stored:08x}, computed={computed:08x}"),
            ));
        }

        let key = String::from_utf8(key).map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
        Ok(Some(match kind[0] {
            KIND_FLOAT => Self::Put { key, value: Scalar::Float(f64::from_le_bytes(value)) },
            KIND_INT => Self::Put { key, value: Scalar::Int(i64::from_le_bytes(value)) },
            _ => Self::Remove { key },
        }))
    }
}

fn read_header(reader: &mut impl Read) -> IoResult<()> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header)?;
    if header[..4] != MAGIC {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("not a scalar journal: magic {:?}", &header[..4]),
        ));
    }
    if header[4] != FORMAT_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported journal version {} (expected {FORMAT_VERSION})", header[4]),
        ));
    }
    Ok(())
}

struct JournalState {
    file: File,
    index: HashMap<String, Scalar>,
    /// Length of the file up to the last complete record.
    size_bytes: u64,
    /// A failed write could not be truncated away.
    needs_rewrite: bool,
}

/// Durable `KeyValueStore` over an append-only journal.
pub struct ScalarJournal {
    path: PathBuf,
    state: Mutex<JournalState>,
    sync_on_write: bool,
    max_size_bytes: u64,
}

impl std::fmt::Debug for ScalarJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalarJournal")
            .field("path", &self.path)
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

fn lock_err() -> StorageError {
    StorageError::BackendError("poisoned lock: scalar journal".to_string())
}

impl ScalarJournal {
    /// Opens or creates a journal, replaying existing records.
    ///
    /// # Errors
    ///
    /// Returns IO failures, or `InvalidData` if the header is not a journal header.
    pub fn open(path: &Path, sync_on_write: bool, max_size_bytes: u64) -> IoResult<Self> {
        let exists = path.exists() && fs::metadata(path)?.len() >= HEADER_LEN;

        let (index, clean) = if exists {
            Self::replay(path)?
        } else {
            Self::rewrite(path, &HashMap::new(), sync_on_write)?;
            (HashMap::new(), true)
        };

        if !clean {
            warn!(path = %path.display(), recovered_keys = index.len(), "Journal had a torn tail; rewriting");
            Self::rewrite(path, &index, sync_on_write)?;
        }

        let file = OpenOptions::new().append(true).open(path)?;
        let size_bytes = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(JournalState {
                file,
                index,
                size_bytes,
                needs_rewrite: false,
            }),
            sync_on_write,
            max_size_bytes,
        })
    }

    /// Current journal size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.state.lock().map(|s| s.size_bytes).unwrap_or(0)
    }

    fn replay(path: &Path) -> IoResult<(HashMap<String, Scalar>, bool)> {
        let mut reader = BufReader::new(File::open(path)?);
        read_header(&mut reader)?;

        let mut index = HashMap::new();
        let mut records = 0usize;
        let clean = loop {
            match JournalOp::decode(&mut reader) {
                Ok(Some(op)) => {
                    records += 1;
                    apply(&mut index, op);
                }
                Ok(None) => break true,
                Err(e) => {
                    if e.kind() != ErrorKind::UnexpectedEof {
                        warn!(path = %path.display(), after_records = records, error = %e, "Journal corruption detected");
                    }
                    break false;
                }
            }
        };

        debug!(path = %path.display(), records, keys = index.len(), "Replayed scalar journal");
        Ok((index, clean))
    }

    /// Writes a fresh journal containing one put per key, then swaps it in.
    fn rewrite(path: &Path, index: &HashMap<String, Scalar>, sync_on_write: bool) -> IoResult<()> {
        let tmp = path.with_extension("journal.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            out.write_all(&MAGIC)?;
            out.write_all(&[FORMAT_VERSION])?;
            for (key, value) in index {
                let op = JournalOp::Put {
                    key: key.clone(),
                    value: *value,
                };
                out.write_all(&op.encode()?)?;
            }
            out.flush()?;
            if sync_on_write {
                out.get_ref().sync_all()?;
            }
        }
        fs::rename(&tmp, path)
    }

    fn append(&self, op: JournalOp) -> Result<(), StorageError> {
        let mut state = self.state.lock().map_err(|_| lock_err())?;
        if state.needs_rewrite {
            self.compact(&mut state)?;
        }

        let frame = op.encode()?;
        let mut written = state.file.write_all(&frame);
        if written.is_ok() && self.sync_on_write {
            written = state.file.sync_data();
        }
        if let Err(e) = written {
            self.discard_tail(&mut state);
            return Err(e.into());
        }

        state.size_bytes += frame.len() as u64;
        apply(&mut state.index, op);

        if state.size_bytes > self.max_size_bytes {
            self.compact(&mut state)?;
        }
        Ok(())
    }

    /// Cuts the file back to the last complete record.
    fn discard_tail(&self, state: &mut JournalState) {
        match state.file.set_len(state.size_bytes) {
            Ok(()) => debug!(path = %self.path.display(), size_bytes = state.size_bytes, "Dropped partial journal record"),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Could not truncate partial record; rewriting on next append");
                state.needs_rewrite = true;
            }
        }
    }

    fn compact(&self, state: &mut JournalState) -> Result<(), StorageError> {
        Self::rewrite(&self.path, &state.index, self.sync_on_write)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        state.size_bytes = file.metadata()?.len();
        state.file = file;
        state.needs_rewrite = false;
        debug!(path = %self.path.display(), size_bytes = state.size_bytes, "Compacted scalar journal");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Scalar>, StorageError> {
        let state = self.state.lock().map_err(|_| lock_err())?;
        Ok(state.index.get(key).copied())
    }
}

fn apply(index: &mut HashMap<String, Scalar>, op: JournalOp) {
    match op {
        JournalOp::Put { key, value } => {
            index.insert(key, value);
        }
        JournalOp::Remove { key } => {
            index.remove(&key);
        }
    }
}

impl KeyValueStore for ScalarJournal {
    fn get_f64(&self, key: &str) -> Result<Option<f64>, StorageError> {
        Ok(match self.get(key)? {
            Some(Scalar::Float(v)) => Some(v),
            _ => None,
        })
    }

    fn put_f64(&self, key: &str, value: f64) -> Result<(), StorageError> {
        self.append(JournalOp::Put {
            key: key.to_string(),
            value: Scalar::Float(value),
        })
    }

    fn get_i64(&self, key: &str) -> Result<Option<i64>, StorageError> {
        Ok(match self.get(key)? {
            Some(Scalar::Int(v)) => Some(v),
            _ => None,
        })
    }

    fn put_i64(&self, key: &str, value: i64) -> Result<(), StorageError> {
        self.append(JournalOp::Put {
            key: key.to_string(),
            value: Scalar::Int(value),
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        if self.get(key)?.is_none() {
            return Ok(());
        }
        self.append(JournalOp::Remove { key: key.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn append_garbage(path: &Path, bytes: &[u8]) {
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(bytes).unwrap();
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("values.journal");
        {
            let journal = ScalarJournal::open(&path, true, 1024 * 1024).unwrap();
            journal.put_f64("last_fix.latitude", 35.681).unwrap();
            journal.put_i64("last_fix.at_epoch_ms", 1_700_000_000_000).unwrap();
            journal.put_f64("scratch", 1.0).unwrap();
            journal.remove("scratch").unwrap();
        }

        let journal = ScalarJournal::open(&path, true, 1024 * 1024).unwrap();
        assert_eq!(journal.get_f64("last_fix.latitude").unwrap(), Some(35.681));
        assert_eq!(journal.get_i64("last_fix.at_epoch_ms").unwrap(), Some(1_700_000_000_000));
        assert_eq!(journal.get_f64("scratch").unwrap(), None);
    }

    #[test]
    fn test_records_are_fixed_size_per_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("values.journal");
        let journal = ScalarJournal::open(&path, false, 1024 * 1024).unwrap();
        assert_eq!(journal.size_bytes(), HEADER_LEN);

        journal.put_i64("n", 7).unwrap();
        // kind + key len + "n" + value + crc
        assert_eq!(journal.size_bytes(), HEADER_LEN + 1 + 1 + 1 + 8 + 4);
        journal.remove("n").unwrap();
        assert_eq!(journal.size_bytes(), HEADER_LEN + 15 + 1 + 1 + 1 + 4);
    }

    #[test]
    fn test_overlong_key_is_rejected() {
        let dir = tempdir().unwrap();
        let journal = ScalarJournal::open(&dir.path().join("values.journal"), false, 1024 * 1024).unwrap();
        assert!(journal.put_f64(&"k".repeat(300), 1.0).is_err());
        assert_eq!(journal.size_bytes(), HEADER_LEN);
    }

    #[test]
    fn test_compaction_keeps_latest_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("values.journal");
        let journal = ScalarJournal::open(&path, false, 512).unwrap();
        for i in 0..200 {
            journal.put_i64("counter", i).unwrap();
        }
        assert!(journal.size_bytes() < 1024, "journal was not compacted: {}", journal.size_bytes());
        assert_eq!(journal.get_i64("counter").unwrap(), Some(199));
        drop(journal);

        let journal = ScalarJournal::open(&path, false, 512).unwrap();
        assert_eq!(journal.get_i64("counter").unwrap(), Some(199));
    }

    #[test]
    fn test_torn_tail_is_dropped_and_appends_still_work() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("values.journal");
        {
            let journal = ScalarJournal::open(&path, true, 1024 * 1024).unwrap();
            journal.put_f64("a", 1.0).unwrap();
            journal.put_f64("b", 2.0).unwrap();
        }

        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();
        drop(file);

        {
            let journal = ScalarJournal::open(&path, true, 1024 * 1024).unwrap();
            assert_eq!(journal.get_f64("a").unwrap(), Some(1.0));
            assert_eq!(journal.get_f64("b").unwrap(), None);
            journal.put_f64("c", 3.0).unwrap();
        }

        let journal = ScalarJournal::open(&path, true, 1024 * 1024).unwrap();
        assert_eq!(journal.get_f64("a").unwrap(), Some(1.0));
        assert_eq!(journal.get_f64("c").unwrap(), Some(3.0));
    }

    #[test]
    fn test_flipped_bit_drops_the_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("values.journal");
        {
            let journal = ScalarJournal::open(&path, true, 1024 * 1024).unwrap();
            journal.put_i64("a", 1).unwrap();
            journal.put_i64("b", 2).unwrap();
        }

        let mut bytes = fs::read(&path).unwrap();
        let value_byte = bytes.len() - 4 - 8;
        bytes[value_byte] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let journal = ScalarJournal::open(&path, true, 1024 * 1024).unwrap();
        assert_eq!(journal.get_i64("a").unwrap(), Some(1));
        assert_eq!(journal.get_i64("b").unwrap(), None);
    }

    #[test]
    fn test_foreign_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("values.journal");
        fs::write(&path, b"NOPE\x01").unwrap();

        let err = ScalarJournal::open(&path, true, 1024 * 1024).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_partial_write_is_truncated_before_next_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("values.journal");
        {
            let journal = ScalarJournal::open(&path, true, 1024 * 1024).unwrap();
            journal.put_f64("a", 1.0).unwrap();

            // A write that failed after its first bytes reached the file.
            append_garbage(&path, &[KIND_FLOAT, 9, b'l', b'a']);
            let mut state = journal.state.lock().unwrap();
            journal.discard_tail(&mut state);
            assert!(!state.needs_rewrite);
            drop(state);

            journal.put_f64("b", 2.0).unwrap();
            assert_eq!(fs::metadata(&path).unwrap().len(), journal.size_bytes());
        }

        let journal = ScalarJournal::open(&path, true, 1024 * 1024).unwrap();
        assert_eq!(journal.get_f64("a").unwrap(), Some(1.0));
        assert_eq!(journal.get_f64("b").unwrap(), Some(2.0));
    }

    #[test]
    fn test_untruncatable_tail_is_rewritten_before_next_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("values.journal");
        {
            let journal = ScalarJournal::open(&path, true, 1024 * 1024).unwrap();
            journal.put_i64("a", 1).unwrap();

            append_garbage(&path, &[KIND_INT, 4]);
            journal.state.lock().unwrap().needs_rewrite = true;

            journal.put_i64("b", 2).unwrap();
            assert!(!journal.state.lock().unwrap().needs_rewrite);
        }

        let journal = ScalarJournal::open(&path, true, 1024 * 1024).unwrap();
        assert_eq!(journal.get_i64("a").unwrap(), Some(1));
        assert_eq!(journal.get_i64("b").unwrap(), Some(2));
    }
}

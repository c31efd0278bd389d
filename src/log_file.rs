//! Single-file append-only log.
//!
//! A [`LogFile`] is one file of a log directory: either the writable head
//! file or a rotated read-only file. Records are stored back to back using
//! the frame from [`record`](crate::record); the file keeps cached stats
//! (byte size, record count, oldest and newest record) recovered by a scan
//! at open and maintained on append.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ChangelogError;
use crate::parser::RecordParser;
use crate::record::{encode_record, read_record, Record};

/// A single log file, with cached stats.
pub struct LogFile<P: RecordParser> {
    parser: Arc<P>,
    path: PathBuf,
    appendable: bool,
    /// Inclusive key bounds of a rotated file; `None` for the head.
    bounds: Option<(P::Key, P::Key)>,
    inner: Mutex<LogFileInner<P::Key>>,
}

struct LogFileInner<K> {
    /// Write handle; present for the head, absent for read-only files.
    writer: Option<File>,
    size: u64,
    count: u64,
    oldest: Option<Record<K>>,
    newest: Option<Record<K>>,
    sync_pending: bool,
}

/// Stats recovered by scanning a file at open time.
struct ScanResult<K> {
    /// Byte offset just past the last complete record.
    valid_size: u64,
    count: u64,
    oldest: Option<Record<K>>,
    newest: Option<Record<K>>,
}

impl<P: RecordParser> LogFile<P> {
    /// Opens or creates the appendable head file.
    ///
    /// The file is scanned to recover its stats; a partial record at the
    /// tail (interrupted write) is truncated away.
    pub fn open_appendable(path: impl Into<PathBuf>, parser: Arc<P>) -> Result<Self, ChangelogError> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let file_len = file.metadata()?.len();
        let scan = scan_records(parser.as_ref(), &mut file)?;
        if scan.valid_size < file_len {
            tracing::warn!(
                path = %path.display(),
                truncated = file_len - scan.valid_size,
                "truncating partial record at tail of head log file"
            );
            file.set_len(scan.valid_size)?;
        }
        Ok(Self {
            parser,
            path,
            appendable: true,
            bounds: None,
            inner: Mutex::new(LogFileInner {
                writer: Some(file),
                size: scan.valid_size,
                count: scan.count,
                oldest: scan.oldest,
                newest: scan.newest,
                sync_pending: false,
            }),
        })
    }

    /// Opens a rotated file read-only.
    ///
    /// `bounds` is the inclusive key range of the file, taken from its name
    /// at startup or from the live records at rotation time.
    pub fn open_read_only(
        path: impl Into<PathBuf>,
        parser: Arc<P>,
        bounds: (P::Key, P::Key),
    ) -> Result<Self, ChangelogError> {
        let path = path.into();
        let mut file = File::open(&path)?;
        let scan = scan_records(parser.as_ref(), &mut file)?;
        Ok(Self {
            parser,
            path,
            appendable: false,
            bounds: Some(bounds),
            inner: Mutex::new(LogFileInner {
                writer: None,
                size: scan.valid_size,
                count: scan.count,
                oldest: scan.oldest,
                newest: scan.newest,
                sync_pending: false,
            }),
        })
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns whether this file is the writable head.
    pub fn is_head(&self) -> bool {
        self.appendable
    }

    /// Returns the highest key of a rotated file, `None` for the head.
    pub(crate) fn high_bound(&self) -> Option<&P::Key> {
        self.bounds.as_ref().map(|(_, high)| high)
    }

    /// Appends a record at the end of the file.
    pub fn append(&self, record: &Record<P::Key>) -> Result<(), ChangelogError> {
        debug_assert!(self.appendable, "append on a read-only log file");
        let encoded = encode_record(self.parser.as_ref(), record)?;
        let inner = &mut *self.inner.lock();
        let writer = match &mut inner.writer {
            Some(writer) => writer,
            // A failed rotation leaves the head closed for writing.
            slot @ None => slot.insert(
                OpenOptions::new().read(true).write(true).open(&self.path)?,
            ),
        };
        writer.seek(SeekFrom::End(0))?;
        writer.write_all(&encoded)?;
        inner.size += encoded.len() as u64;
        inner.count += 1;
        if inner.oldest.is_none() {
            inner.oldest = Some(record.clone());
        }
        inner.newest = Some(record.clone());
        inner.sync_pending = true;
        Ok(())
    }

    /// Forces appended records to durable storage.
    pub fn sync_to_file_system(&self) -> Result<(), ChangelogError> {
        let mut inner = self.inner.lock();
        if inner.sync_pending {
            if let Some(writer) = inner.writer.as_ref() {
                writer.sync_data()?;
            }
            inner.sync_pending = false;
        }
        Ok(())
    }

    /// Returns the size of the file in bytes.
    pub fn size_in_bytes(&self) -> u64 {
        self.inner.lock().size
    }

    /// Returns the number of records in the file.
    pub fn number_of_records(&self) -> u64 {
        self.inner.lock().count
    }

    /// Returns the first record of the file, if any.
    pub fn oldest_record(&self) -> Option<Record<P::Key>> {
        self.inner.lock().oldest.clone()
    }

    /// Returns the last record of the file, if any.
    pub fn newest_record(&self) -> Option<Record<P::Key>> {
        self.inner.lock().newest.clone()
    }

    /// Returns a cursor positioned on the first record of the file.
    pub fn cursor(&self) -> Result<LogFileCursor<P>, ChangelogError> {
        let mut cursor = LogFileCursor {
            parser: self.parser.clone(),
            file: File::open(&self.path)?,
            position: 0,
            current: None,
        };
        cursor.next()?;
        Ok(cursor)
    }

    /// Returns a cursor initialised to the provided state.
    ///
    /// Used when rotating the head: the bytes of the file are unchanged by
    /// the rename, so a cursor on the rotated file at the same byte offset
    /// with the same current record continues the traversal seamlessly.
    pub fn cursor_initialised_to(
        &self,
        record: Option<Record<P::Key>>,
        position: u64,
    ) -> Result<LogFileCursor<P>, ChangelogError> {
        Ok(LogFileCursor {
            parser: self.parser.clone(),
            file: File::open(&self.path)?,
            position,
            current: record,
        })
    }

    /// Closes the write handle. Pending data is synced best-effort.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.sync_pending {
            if let Some(writer) = inner.writer.as_ref() {
                if let Err(e) = writer.sync_data() {
                    tracing::warn!(path = %self.path.display(), error = %e, "sync on close failed");
                }
            }
            inner.sync_pending = false;
        }
        inner.writer = None;
    }

    /// Deletes the underlying file.
    pub fn delete(&self) -> Result<(), ChangelogError> {
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

fn scan_records<P: RecordParser>(
    parser: &P,
    file: &mut File,
) -> Result<ScanResult<P::Key>, ChangelogError> {
    let mut result = ScanResult {
        valid_size: 0,
        count: 0,
        oldest: None,
        newest: None,
    };
    while let Some((record, size)) = read_record(parser, file, result.valid_size)? {
        result.valid_size += size;
        result.count += 1;
        if result.oldest.is_none() {
            result.oldest = Some(record.clone());
        }
        result.newest = Some(record);
    }
    Ok(result)
}

/// Forward cursor over a single log file.
///
/// The cursor owns its own read handle; `position` is the byte offset at
/// which the next read occurs, just past the current record.
pub struct LogFileCursor<P: RecordParser> {
    parser: Arc<P>,
    file: File,
    position: u64,
    current: Option<Record<P::Key>>,
}

impl<P: RecordParser> LogFileCursor<P> {
    /// Returns the record the cursor points to, if any.
    pub fn record(&self) -> Option<&Record<P::Key>> {
        self.current.as_ref()
    }

    /// Returns the byte offset of the next read.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub(crate) fn state(&self) -> (u64, Option<Record<P::Key>>) {
        (self.position, self.current.clone())
    }

    /// Advances to the next record. Returns false at end of file, leaving
    /// the position unchanged so records appended later can still be read.
    pub fn next(&mut self) -> Result<bool, ChangelogError> {
        match read_record(self.parser.as_ref(), &mut self.file, self.position)? {
            Some((record, size)) => {
                self.position += size;
                self.current = Some(record);
                Ok(true)
            }
            None => {
                self.current = None;
                Ok(false)
            }
        }
    }

    /// Positions the cursor by scanning from the start of the file.
    ///
    /// With `find_nearest` false, stops on the record whose key equals `key`
    /// and returns whether it was found. With `find_nearest` true, stops on
    /// the first record whose key is strictly greater than `key`; reaching
    /// the end of the file still returns true, with no current record — the
    /// sought position then lies at the start of the next file in the chain.
    pub fn position_to(&mut self, key: &P::Key, find_nearest: bool) -> Result<bool, ChangelogError> {
        self.position = 0;
        self.current = None;
        while self.next()? {
            if let Some(record) = &self.current {
                if find_nearest {
                    if record.key > *key {
                        return Ok(true);
                    }
                } else if record.key == *key {
                    return Ok(true);
                } else if record.key > *key {
                    return Ok(false);
                }
            }
        }
        Ok(find_nearest)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use tempfile::TempDir;

    use super::*;
    use crate::testutil::{record, U64Parser};

    fn head(dir: &TempDir) -> LogFile<U64Parser> {
        LogFile::open_appendable(dir.path().join("head.log"), Arc::new(U64Parser)).unwrap()
    }

    #[test]
    fn test_append_updates_stats() {
        let dir = TempDir::new().unwrap();
        let file = head(&dir);

        file.append(&record(1, "one")).unwrap();
        file.append(&record(2, "two")).unwrap();

        assert_eq!(file.number_of_records(), 2);
        assert!(file.size_in_bytes() > 0);
        assert_eq!(file.oldest_record().unwrap().key, 1);
        assert_eq!(file.newest_record().unwrap().key, 2);
    }

    #[test]
    fn test_reopen_recovers_stats() {
        let dir = TempDir::new().unwrap();
        let size = {
            let file = head(&dir);
            for i in 1..=5 {
                file.append(&record(i, "value")).unwrap();
            }
            file.sync_to_file_system().unwrap();
            file.size_in_bytes()
        };

        let file = head(&dir);
        assert_eq!(file.number_of_records(), 5);
        assert_eq!(file.size_in_bytes(), size);
        assert_eq!(file.oldest_record().unwrap().key, 1);
        assert_eq!(file.newest_record().unwrap().key, 5);
    }

    #[test]
    fn test_partial_tail_is_truncated_on_open() {
        let dir = TempDir::new().unwrap();
        let size = {
            let file = head(&dir);
            file.append(&record(1, "one")).unwrap();
            file.append(&record(2, "two")).unwrap();
            file.sync_to_file_system().unwrap();
            file.size_in_bytes()
        };

        // Simulate an interrupted write.
        let mut raw = OpenOptions::new()
            .append(true)
            .open(dir.path().join("head.log"))
            .unwrap();
        raw.write_all(b"CLOG\x00\x00\x00\x08").unwrap();
        drop(raw);

        let file = head(&dir);
        assert_eq!(file.number_of_records(), 2);
        assert_eq!(file.size_in_bytes(), size);
    }

    #[test]
    fn test_cursor_traverses_in_order() {
        let dir = TempDir::new().unwrap();
        let file = head(&dir);
        for i in 1..=4 {
            file.append(&record(i, "v")).unwrap();
        }

        let mut cursor = file.cursor().unwrap();
        let mut keys = vec![cursor.record().unwrap().key];
        while cursor.next().unwrap() {
            keys.push(cursor.record().unwrap().key);
        }
        assert_eq!(keys, vec![1, 2, 3, 4]);
        assert!(cursor.record().is_none());
    }

    #[test]
    fn test_cursor_on_empty_file() {
        let dir = TempDir::new().unwrap();
        let file = head(&dir);
        let mut cursor = file.cursor().unwrap();
        assert!(cursor.record().is_none());
        assert!(!cursor.next().unwrap());
    }

    #[test]
    fn test_cursor_sees_records_appended_after_exhaustion() {
        let dir = TempDir::new().unwrap();
        let file = head(&dir);
        file.append(&record(1, "one")).unwrap();

        let mut cursor = file.cursor().unwrap();
        assert!(!cursor.next().unwrap());

        file.append(&record(2, "two")).unwrap();
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.record().unwrap().key, 2);
    }

    #[test]
    fn test_position_to_exact() {
        let dir = TempDir::new().unwrap();
        let file = head(&dir);
        for i in [1u64, 2, 5, 6] {
            file.append(&record(i, "v")).unwrap();
        }

        let mut cursor = file.cursor().unwrap();
        assert!(cursor.position_to(&5, false).unwrap());
        assert_eq!(cursor.record().unwrap().key, 5);

        assert!(!cursor.position_to(&3, false).unwrap());
    }

    #[test]
    fn test_position_to_nearest() {
        let dir = TempDir::new().unwrap();
        let file = head(&dir);
        for i in [1u64, 2, 5, 6] {
            file.append(&record(i, "v")).unwrap();
        }

        let mut cursor = file.cursor().unwrap();
        assert!(cursor.position_to(&3, true).unwrap());
        assert_eq!(cursor.record().unwrap().key, 5);

        // Past the last key: reported found, with no record.
        assert!(cursor.position_to(&6, true).unwrap());
        assert!(cursor.record().is_none());
    }

    #[test]
    fn test_cursor_initialised_to_resumes() {
        let dir = TempDir::new().unwrap();
        let file = head(&dir);
        for i in 1..=3 {
            file.append(&record(i, "v")).unwrap();
        }

        let mut cursor = file.cursor().unwrap();
        assert!(cursor.next().unwrap());
        let (position, current) = cursor.state();
        assert_eq!(current.as_ref().unwrap().key, 2);

        let mut resumed = file.cursor_initialised_to(current, position).unwrap();
        assert_eq!(resumed.record().unwrap().key, 2);
        assert!(resumed.next().unwrap());
        assert_eq!(resumed.record().unwrap().key, 3);
        assert!(!resumed.next().unwrap());
    }

    #[test]
    fn test_delete_removes_file() {
        let dir = TempDir::new().unwrap();
        let file = head(&dir);
        file.append(&record(1, "v")).unwrap();
        file.close();
        file.delete().unwrap();
        assert!(!dir.path().join("head.log").exists());
    }
}

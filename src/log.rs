//! Multi-file log management: inventory, append, rotation, purge, clear.
//!
//! A [`Log`] manages one directory of log files. Appends go to the writable
//! head file (`head.log`); once the head exceeds the size limit it is
//! rotated: closed, renamed to `<lowkey>_<highkey>.log`, reopened read-only,
//! and a fresh empty head is created. The rotated file name is the
//! authoritative index of the key range it contains.
//!
//! The inventory maps each file to its partition key: the highest key of a
//! rotated file, or the parser's maximum-key sentinel for the head. Finding
//! the file that should contain a key is a ceiling lookup; the head is
//! always the last entry.
//!
//! All mutating operations take the exclusive lock, all read and cursor
//! operations take the shared lock, and a closed log turns every operation
//! into a no-op.

use std::any::Any;
use std::collections::BTreeMap;
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::cursor::{position_inner, CursorInner, CursorState, LogCursor};
use crate::error::ChangelogError;
use crate::log_file::LogFile;
use crate::parser::{check_encoded_key, RecordParser};
use crate::record::Record;
use crate::registry::{self, RegisteredLog};
use crate::{HEAD_LOG_FILE_NAME, LOG_FILE_NAME_SEPARATOR, LOG_FILE_SUFFIX};

/// A multi-file append-only keyed log.
///
/// Obtained with [`Log::open`]; the same directory always yields the same
/// underlying instance, shared through a process-wide registry with
/// reference counting. The instance is really closed when the last handle
/// is dropped (or explicitly [`close`](Log::close)d).
///
/// Records must be appended in ascending key order. Appends are buffered by
/// the operating system; call [`sync_to_file_system`](Log::sync_to_file_system)
/// to make them durable.
pub struct Log<P: RecordParser> {
    shared: Arc<LogShared<P>>,
}

impl<P: RecordParser> Log<P> {
    /// Opens the log stored in `path`, creating the directory and an empty
    /// head file as needed.
    ///
    /// If the log is already open in this process, the existing instance is
    /// returned and `size_limit` is ignored (first opener wins); opening
    /// with a different parser *type* is rejected. The head is rotated once
    /// its size exceeds `size_limit` bytes; a single record larger than the
    /// limit is still accepted.
    pub fn open(
        path: impl AsRef<Path>,
        parser: P,
        size_limit: u64,
    ) -> Result<Self, ChangelogError> {
        let shared = registry::global().open(path.as_ref(), parser, size_limit)?;
        Ok(Self { shared })
    }

    /// Returns the directory of this log.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Appends a record at the end of the log, rotating the head first if
    /// it has exceeded the size limit.
    pub fn append(&self, record: Record<P::Key>) -> Result<(), ChangelogError> {
        let mut state = self.shared.state.write();
        if state.closed {
            return Ok(());
        }
        let head = state.head();
        let head = if head.size_in_bytes() > self.shared.size_limit {
            tracing::info!(
                path = %self.shared.path.display(),
                size = head.size_in_bytes(),
                "rotating head log file"
            );
            self.shared.rotate(&mut state)?;
            state.head()
        } else {
            head
        };
        head.append(&record)
    }

    /// Forces all appended records to durable storage. Only records written
    /// before a successful return are guaranteed durable.
    pub fn sync_to_file_system(&self) -> Result<(), ChangelogError> {
        let state = self.shared.state.write();
        if state.closed {
            return Ok(());
        }
        state.head().sync_to_file_system()
    }

    /// Returns a cursor positioned on the first record of the log.
    pub fn cursor(&self) -> Result<LogCursor<P>, ChangelogError> {
        self.new_cursor(None, false)
    }

    /// Returns a cursor positioned on the record with the provided key, or
    /// an empty cursor if no such record exists.
    pub fn cursor_at(&self, key: &P::Key) -> Result<LogCursor<P>, ChangelogError> {
        self.new_cursor(Some(key), false)
    }

    /// Returns a cursor positioned on the lowest key strictly greater than
    /// the provided key. The cursor is returned even when no such record
    /// exists yet; it will observe records appended later.
    pub fn nearest_cursor(&self, key: &P::Key) -> Result<LogCursor<P>, ChangelogError> {
        self.new_cursor(Some(key), true)
    }

    fn new_cursor(
        &self,
        key: Option<&P::Key>,
        find_nearest: bool,
    ) -> Result<LogCursor<P>, ChangelogError> {
        let state = self.shared.state.read();
        if state.closed {
            return Ok(LogCursor::empty());
        }
        let file = state.find_log_file_for(key);
        let file_cursor = file.cursor()?;
        let mut inner = CursorInner {
            file,
            file_cursor,
            valid: true,
        };
        let found = position_inner(&state, &mut inner, key, find_nearest)?;
        if found || find_nearest {
            let inner = Arc::new(Mutex::new(inner));
            self.shared.register_cursor(&inner);
            Ok(LogCursor::from_parts(self.shared.clone(), inner))
        } else {
            Ok(LogCursor::empty())
        }
    }

    /// Returns the oldest record of the log, or `None` if the log is empty.
    pub fn oldest_record(&self) -> Option<Record<P::Key>> {
        let state = self.shared.state.read();
        if state.closed {
            return None;
        }
        state.oldest_file().and_then(|file| file.oldest_record())
    }

    /// Returns the newest record of the log, or `None` if the head file is
    /// empty.
    pub fn newest_record(&self) -> Option<Record<P::Key>> {
        let state = self.shared.state.read();
        if state.closed {
            return None;
        }
        state.head().newest_record()
    }

    /// Returns the total number of records in the log.
    pub fn number_of_records(&self) -> u64 {
        let state = self.shared.state.read();
        if state.closed {
            return 0;
        }
        state.files.values().map(|file| file.number_of_records()).sum()
    }

    /// Deletes every file whose partition key is strictly less than `key`.
    ///
    /// Purging is whole-file: records of a surviving file are never removed
    /// even if their keys are below `key`, and the head is never purged.
    /// Cursors positioned in a purged file are invalidated. Files that
    /// cannot be deleted are collected into a single error; the ones that
    /// were deleted stay deleted.
    ///
    /// Returns the oldest record remaining after the purge, or `None` if
    /// nothing was below the boundary.
    pub fn purge_up_to(&self, key: &P::Key) -> Result<Option<Record<P::Key>>, ChangelogError> {
        let mut state = self.shared.state.write();
        if state.closed {
            return Ok(None);
        }
        let partition_keys: Vec<P::Key> = state
            .files
            .range::<P::Key, _>(..key)
            .map(|(k, _)| k.clone())
            .collect();
        if partition_keys.is_empty() {
            return Ok(None);
        }
        let mut undeletable = Vec::new();
        for partition_key in partition_keys {
            let Some(file) = state.files.get(&partition_key).cloned() else {
                continue;
            };
            file.close();
            match file.delete() {
                Ok(()) => {
                    tracing::info!(file = %file.path().display(), "purged log file");
                    state.files.remove(&partition_key);
                    self.shared.invalidate_cursors_on(&file);
                }
                Err(_) => undeletable.push(file.path().to_path_buf()),
            }
        }
        if !undeletable.is_empty() {
            return Err(ChangelogError::UndeletableFiles { files: undeletable });
        }
        Ok(state.oldest_file().and_then(|file| file.oldest_record()))
    }

    /// Discards every record of the log and reopens a fresh empty head.
    ///
    /// Open cursors are invalidated (with a warning); failing to reopen the
    /// head leaves the log closed.
    pub fn clear(&self) -> Result<(), ChangelogError> {
        let mut state = self.shared.state.write();
        if state.closed {
            return Ok(());
        }
        let live_cursors = self.shared.live_cursor_count();
        if live_cursors > 0 {
            tracing::warn!(
                path = %self.shared.path.display(),
                cursors = live_cursors,
                "clearing log with open cursors"
            );
            self.shared.invalidate_all_cursors();
        }

        let files: Vec<(P::Key, Arc<LogFile<P>>)> = state
            .files
            .iter()
            .map(|(key, file)| (key.clone(), file.clone()))
            .collect();
        let mut undeletable = Vec::new();
        for (partition_key, file) in files {
            file.close();
            match file.delete() {
                Ok(()) => {
                    state.files.remove(&partition_key);
                }
                Err(_) => undeletable.push(file.path().to_path_buf()),
            }
        }

        // The log must come back with a usable head even after a failed
        // deletion; losing the head is fatal.
        let head_path = self.shared.path.join(HEAD_LOG_FILE_NAME);
        match LogFile::open_appendable(head_path, self.shared.parser.clone()) {
            Ok(head) => {
                state
                    .files
                    .insert(self.shared.parser.max_key(), Arc::new(head));
            }
            Err(e) => {
                state.closed = true;
                return Err(e);
            }
        }

        if !undeletable.is_empty() {
            return Err(ChangelogError::UndeletableFiles { files: undeletable });
        }
        Ok(())
    }

    /// Releases this handle. The log is really closed when the last handle
    /// is released; dropping the handle is equivalent.
    pub fn close(self) {}
}

impl<P: RecordParser> Drop for Log<P> {
    fn drop(&mut self) {
        registry::global().release(&self.shared.path);
    }
}

/// State shared between the log handles, the registry and the cursors.
pub(crate) struct LogShared<P: RecordParser> {
    pub(crate) path: PathBuf,
    pub(crate) parser: Arc<P>,
    pub(crate) size_limit: u64,
    pub(crate) state: RwLock<LogState<P>>,
    /// Live cursors, updated on rotation and invalidated on clear/purge.
    cursors: Mutex<Vec<Weak<Mutex<CursorInner<P>>>>>,
}

/// The file inventory and closed flag, guarded by the log's lock.
pub(crate) struct LogState<P: RecordParser> {
    /// Files ordered by partition key; the head is indexed under the
    /// parser's maximum-key sentinel and is always the last entry.
    pub(crate) files: BTreeMap<P::Key, Arc<LogFile<P>>>,
    pub(crate) closed: bool,
}

impl<P: RecordParser> LogState<P> {
    pub(crate) fn head(&self) -> Arc<LogFile<P>> {
        self.files
            .values()
            .next_back()
            .cloned()
            .expect("an open log always has a head file")
    }

    pub(crate) fn oldest_file(&self) -> Option<Arc<LogFile<P>>> {
        self.files.values().next().cloned()
    }

    /// Returns the file that should contain `key`: a ceiling lookup over
    /// the partition keys, or the oldest file when `key` is `None`.
    pub(crate) fn find_log_file_for(&self, key: Option<&P::Key>) -> Arc<LogFile<P>> {
        match key {
            None => self.head_or_oldest(),
            Some(key) => self
                .files
                .range::<P::Key, _>((Bound::Included(key), Bound::Unbounded))
                .next()
                .map(|(_, file)| file.clone())
                .expect("the head is indexed under the maximum key"),
        }
    }

    fn head_or_oldest(&self) -> Arc<LogFile<P>> {
        self.oldest_file()
            .expect("an open log always has a head file")
    }

    /// Returns the file just after `file` in key order, or `None` if `file`
    /// is the head.
    pub(crate) fn next_log_file(&self, file: &Arc<LogFile<P>>) -> Option<Arc<LogFile<P>>> {
        if file.is_head() {
            return None;
        }
        let high = file.high_bound()?;
        self.files
            .range::<P::Key, _>((Bound::Excluded(high), Bound::Unbounded))
            .next()
            .map(|(_, next)| next.clone())
    }
}

impl<P: RecordParser> LogShared<P> {
    /// Opens the log directory: creates it if missing, opens or creates the
    /// head, and recovers every rotated file from its range-encoded name.
    pub(crate) fn open_dir(
        path: &Path,
        parser: P,
        size_limit: u64,
    ) -> Result<Self, ChangelogError> {
        Self::init(path, Arc::new(parser), size_limit).map_err(|source| ChangelogError::Init {
            path: path.to_path_buf(),
            source: Box::new(source),
        })
    }

    fn init(path: &Path, parser: Arc<P>, size_limit: u64) -> Result<Self, ChangelogError> {
        fs::create_dir_all(path)?;

        let mut files = BTreeMap::new();
        let head = LogFile::open_appendable(path.join(HEAD_LOG_FILE_NAME), parser.clone())?;
        files.insert(parser.max_key(), Arc::new(head));

        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == HEAD_LOG_FILE_NAME || !name.ends_with(LOG_FILE_SUFFIX) {
                continue;
            }
            if !entry.file_type()?.is_file() {
                continue;
            }
            let (low, high) = parse_file_name_bounds(parser.as_ref(), &name)?;
            let file = LogFile::open_read_only(entry.path(), parser.clone(), (low, high.clone()))?;
            files.insert(high, Arc::new(file));
        }

        tracing::info!(
            path = %path.display(),
            files = files.len(),
            "log opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            parser,
            size_limit,
            state: RwLock::new(LogState {
                files,
                closed: false,
            }),
            cursors: Mutex::new(Vec::new()),
        })
    }

    /// Rotates the head: closes it, renames it to its range-encoded name,
    /// reopens it read-only, creates a fresh head, and re-attaches live
    /// cursors that were reading the old head.
    fn rotate(&self, state: &mut LogState<P>) -> Result<(), ChangelogError> {
        let old_head = state.head();
        let oldest = old_head
            .oldest_record()
            .ok_or(ChangelogError::RotationOnEmptyHead)?;
        let newest = old_head
            .newest_record()
            .ok_or(ChangelogError::RotationOnEmptyHead)?;

        let low = self.parser.encode_key_to_string(&oldest.key);
        check_encoded_key(&low)?;
        let high = self.parser.encode_key_to_string(&newest.key);
        check_encoded_key(&high)?;
        let rotated_path = self.path.join(format!(
            "{}{}{}{}",
            low, LOG_FILE_NAME_SEPARATOR, high, LOG_FILE_SUFFIX
        ));

        let head_path = self.path.join(HEAD_LOG_FILE_NAME);
        old_head.close();
        fs::rename(&head_path, &rotated_path).map_err(|source| ChangelogError::Rotation {
            to: rotated_path.clone(),
            source,
        })?;

        let rotated = Arc::new(LogFile::open_read_only(
            &rotated_path,
            self.parser.clone(),
            (oldest.key.clone(), newest.key.clone()),
        )?);
        state.files.remove(&self.parser.max_key());
        state.files.insert(newest.key.clone(), rotated.clone());

        let new_head = LogFile::open_appendable(head_path, self.parser.clone())?;
        state.files.insert(self.parser.max_key(), Arc::new(new_head));

        self.reattach_cursors(&old_head, &rotated)
    }

    /// Re-attaches every live cursor reading the old head to the rotated
    /// file, at the same byte offset with the same current record. The
    /// rename preserved the bytes, so the traversal continues seamlessly.
    fn reattach_cursors(
        &self,
        old_head: &Arc<LogFile<P>>,
        rotated: &Arc<LogFile<P>>,
    ) -> Result<(), ChangelogError> {
        let mut cursors = self.cursors.lock();
        cursors.retain(|weak| weak.strong_count() > 0);
        for weak in cursors.iter() {
            if let Some(cursor) = weak.upgrade() {
                let mut inner = cursor.lock();
                if inner.valid && Arc::ptr_eq(&inner.file, old_head) {
                    let captured = inner.capture_state();
                    inner.reinitialize_to(CursorState {
                        file: rotated.clone(),
                        position: captured.position,
                        record: captured.record,
                    })?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn register_cursor(&self, inner: &Arc<Mutex<CursorInner<P>>>) {
        let mut cursors = self.cursors.lock();
        cursors.retain(|weak| weak.strong_count() > 0);
        cursors.push(Arc::downgrade(inner));
    }

    pub(crate) fn deregister_cursor(&self, inner: &Arc<Mutex<CursorInner<P>>>) {
        self.cursors.lock().retain(|weak| match weak.upgrade() {
            Some(other) => !Arc::ptr_eq(&other, inner),
            None => false,
        });
    }

    fn live_cursor_count(&self) -> usize {
        self.cursors
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    fn invalidate_all_cursors(&self) {
        for weak in self.cursors.lock().iter() {
            if let Some(cursor) = weak.upgrade() {
                cursor.lock().valid = false;
            }
        }
    }

    fn invalidate_cursors_on(&self, file: &Arc<LogFile<P>>) {
        for weak in self.cursors.lock().iter() {
            if let Some(cursor) = weak.upgrade() {
                let mut inner = cursor.lock();
                if inner.valid && Arc::ptr_eq(&inner.file, file) {
                    tracing::warn!(
                        file = %file.path().display(),
                        "invalidating cursor positioned in a purged log file"
                    );
                    inner.valid = false;
                }
            }
        }
    }

    /// Really closes the log: called by the registry on the last release.
    pub(crate) fn do_close(&self) {
        let mut state = self.state.write();
        if state.closed {
            return;
        }
        let live_cursors = self.live_cursor_count();
        if live_cursors > 0 {
            tracing::warn!(
                path = %self.path.display(),
                cursors = live_cursors,
                "closing log with open cursors"
            );
        }
        for file in state.files.values() {
            file.close();
        }
        state.closed = true;
    }
}

impl<P: RecordParser> RegisteredLog for LogShared<P> {
    fn close_now(&self) {
        self.do_close();
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn parse_file_name_bounds<P: RecordParser>(
    parser: &P,
    name: &str,
) -> Result<(P::Key, P::Key), ChangelogError> {
    let stem = name
        .strip_suffix(LOG_FILE_SUFFIX)
        .ok_or_else(|| ChangelogError::InvalidLogFileName {
            name: name.to_string(),
        })?;
    let (low, high) =
        stem.split_once(LOG_FILE_NAME_SEPARATOR)
            .ok_or_else(|| ChangelogError::InvalidLogFileName {
                name: name.to_string(),
            })?;
    Ok((
        parser.decode_key_from_string(low)?,
        parser.decode_key_from_string(high)?,
    ))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;
    use crate::testutil::{record, U64Parser};

    /// 26-byte value giving a 50-byte record frame with u64 keys.
    const VALUE_50: &str = "abcdefghijklmnopqrstuvwxyz";

    fn open_log(dir: &Path, size_limit: u64) -> Log<U64Parser> {
        Log::open(dir, U64Parser, size_limit).unwrap()
    }

    fn collect_keys(mut cursor: LogCursor<U64Parser>) -> Vec<u64> {
        let mut keys = Vec::new();
        if let Some(first) = cursor.record() {
            keys.push(first.key);
        }
        while cursor.next().unwrap() {
            keys.push(cursor.record().unwrap().key);
        }
        keys
    }

    fn log_file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_append_and_traverse_without_rotation() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), 1024 * 1024);

        for i in 1..=100u64 {
            log.append(record(i, &format!("v{}", i))).unwrap();
        }

        let keys = collect_keys(log.cursor().unwrap());
        assert_eq!(keys, (1..=100).collect::<Vec<u64>>());
        assert_eq!(log_file_names(dir.path()), vec!["head.log"]);
    }

    #[test]
    fn test_cursor_initially_points_to_first_record() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), 1024);
        log.append(record(7, "first")).unwrap();

        let cursor = log.cursor().unwrap();
        assert_eq!(cursor.record().unwrap().key, 7);
    }

    #[test]
    fn test_rotation_on_size_threshold() {
        let dir = TempDir::new().unwrap();
        // Each record is 50 bytes: the head rotates on the 11th append.
        let log = open_log(dir.path(), 499);

        for i in 1..=11u64 {
            log.append(record(i, VALUE_50)).unwrap();
        }

        let names = log_file_names(dir.path());
        assert!(names.contains(&"00000000000000000001_00000000000000000010.log".to_string()));
        assert!(names.contains(&"head.log".to_string()));

        let keys = collect_keys(log.cursor().unwrap());
        assert_eq!(keys, (1..=11).collect::<Vec<u64>>());
    }

    #[test]
    fn test_traversal_order_preserved_across_rotations() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), 499);

        for i in 1..=25u64 {
            log.append(record(i, VALUE_50)).unwrap();
        }

        // Two rotations: 1..=10, 11..=20, head 21..=25.
        let names = log_file_names(dir.path());
        assert_eq!(names.len(), 3);
        assert_eq!(log.number_of_records(), 25);
        assert_eq!(collect_keys(log.cursor().unwrap()), (1..=25).collect::<Vec<u64>>());
        assert_eq!(log.oldest_record().unwrap().key, 1);
        assert_eq!(log.newest_record().unwrap().key, 25);
    }

    #[test]
    fn test_record_larger_than_size_limit_is_accepted() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), 10);

        log.append(record(1, VALUE_50)).unwrap();
        log.append(record(2, VALUE_50)).unwrap();

        // The oversized head rotated before the second append.
        let names = log_file_names(dir.path());
        assert!(names.contains(&"00000000000000000001_00000000000000000001.log".to_string()));
        assert_eq!(collect_keys(log.cursor().unwrap()), vec![1, 2]);
    }

    #[test]
    fn test_cursor_survives_rotation() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), 200);

        for i in 1..=3u64 {
            log.append(record(i, "v")).unwrap();
        }

        let mut cursor = log.cursor().unwrap();
        assert!(cursor.position_to(Some(&2), false).unwrap());
        assert_eq!(cursor.record().unwrap().key, 2);

        // Appending past the limit rotates the head under the cursor.
        for i in 4..=10u64 {
            log.append(record(i, "v")).unwrap();
        }
        assert!(log_file_names(dir.path()).len() > 1);

        let mut keys = Vec::new();
        while cursor.next().unwrap() {
            keys.push(cursor.record().unwrap().key);
        }
        assert_eq!(keys, (3..=10).collect::<Vec<u64>>());
    }

    #[test]
    fn test_purge_deletes_whole_files_below_boundary() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), 499);

        // Files: 1..=10, 11..=20, head 21..=25.
        for i in 1..=25u64 {
            log.append(record(i, VALUE_50)).unwrap();
        }

        let oldest = log.purge_up_to(&15).unwrap();
        assert_eq!(oldest.unwrap().key, 11);

        // Partition key 10 < 15: deleted. Partition key 20 >= 15: kept,
        // although it contains keys below the boundary.
        let names = log_file_names(dir.path());
        assert!(!names.contains(&"00000000000000000001_00000000000000000010.log".to_string()));
        assert!(names.contains(&"00000000000000000011_00000000000000000020.log".to_string()));

        assert_eq!(collect_keys(log.cursor().unwrap()), (11..=25).collect::<Vec<u64>>());
    }

    #[test]
    fn test_purge_with_nothing_below_boundary() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), 1024);
        log.append(record(5, "v")).unwrap();

        assert!(log.purge_up_to(&3).unwrap().is_none());
        assert_eq!(log.number_of_records(), 1);
    }

    #[test]
    fn test_purge_never_touches_the_head() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), 499);

        for i in 1..=25u64 {
            log.append(record(i, VALUE_50)).unwrap();
        }

        let oldest = log.purge_up_to(&u64::MAX).unwrap();
        assert_eq!(oldest.unwrap().key, 21);
        assert_eq!(log_file_names(dir.path()), vec!["head.log"]);
        assert_eq!(collect_keys(log.cursor().unwrap()), (21..=25).collect::<Vec<u64>>());
    }

    #[test]
    fn test_purge_invalidates_cursor_in_purged_file() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), 499);

        for i in 1..=25u64 {
            log.append(record(i, VALUE_50)).unwrap();
        }

        let mut cursor = log.cursor_at(&5).unwrap();
        assert_eq!(cursor.record().unwrap().key, 5);

        log.purge_up_to(&15).unwrap();
        assert!(!cursor.next().unwrap());
        assert!(cursor.record().is_none());
    }

    #[test]
    fn test_nearest_cursor_across_a_gap() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), 1024);
        for i in [1u64, 2, 5, 6] {
            log.append(record(i, "v")).unwrap();
        }

        let cursor = log.nearest_cursor(&3).unwrap();
        assert_eq!(cursor.record().unwrap().key, 5);

        let exact = log.cursor_at(&3).unwrap();
        assert!(exact.record().is_none());
    }

    #[test]
    fn test_nearest_cursor_crosses_file_boundary() {
        let dir = TempDir::new().unwrap();
        // 50-byte records, limit 99: keys 1,2 rotate out when 5 is appended.
        let log = open_log(dir.path(), 99);
        for i in [1u64, 2, 5, 6] {
            log.append(record(i, VALUE_50)).unwrap();
        }
        assert!(log_file_names(dir.path()).len() > 1);

        // The nearest key after 2 is the first record of the next file.
        let cursor = log.nearest_cursor(&2).unwrap();
        assert_eq!(cursor.record().unwrap().key, 5);

        let cursor = log.nearest_cursor(&3).unwrap();
        assert_eq!(cursor.record().unwrap().key, 5);
    }

    #[test]
    fn test_nearest_cursor_past_the_end_sees_later_appends() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), 1024);
        log.append(record(1, "v")).unwrap();

        let mut cursor = log.nearest_cursor(&1).unwrap();
        assert!(cursor.record().is_none());
        assert!(!cursor.next().unwrap());

        log.append(record(2, "v")).unwrap();
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.record().unwrap().key, 2);
    }

    #[test]
    fn test_exact_cursor_finds_key_in_rotated_file() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), 499);
        for i in 1..=25u64 {
            log.append(record(i, VALUE_50)).unwrap();
        }

        let cursor = log.cursor_at(&7).unwrap();
        assert_eq!(cursor.record().unwrap().key, 7);

        let cursor = log.cursor_at(&21).unwrap();
        assert_eq!(cursor.record().unwrap().key, 21);
    }

    #[test]
    fn test_empty_log() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), 1024);

        assert!(log.oldest_record().is_none());
        assert!(log.newest_record().is_none());
        assert_eq!(log.number_of_records(), 0);

        let mut cursor = log.cursor().unwrap();
        assert!(cursor.record().is_none());
        assert!(!cursor.next().unwrap());
    }

    #[test]
    fn test_clear_resets_the_log() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), 499);
        for i in 1..=25u64 {
            log.append(record(i, VALUE_50)).unwrap();
        }

        log.clear().unwrap();

        assert_eq!(log.number_of_records(), 0);
        assert_eq!(log_file_names(dir.path()), vec!["head.log"]);

        // The log stays usable.
        log.append(record(30, "fresh")).unwrap();
        assert_eq!(collect_keys(log.cursor().unwrap()), vec![30]);
    }

    #[test]
    fn test_clear_invalidates_open_cursors() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), 1024);
        for i in 1..=5u64 {
            log.append(record(i, "v")).unwrap();
        }

        let mut cursor = log.cursor().unwrap();
        assert_eq!(cursor.record().unwrap().key, 1);

        log.clear().unwrap();

        assert!(cursor.record().is_none());
        assert!(!cursor.next().unwrap());
        assert!(!cursor.position_to(Some(&1), true).unwrap());
    }

    #[test]
    fn test_reopen_recovers_rotated_files_from_names() {
        let dir = TempDir::new().unwrap();
        {
            let log = open_log(dir.path(), 499);
            for i in 1..=25u64 {
                log.append(record(i, VALUE_50)).unwrap();
            }
            log.sync_to_file_system().unwrap();
        }

        let log = open_log(dir.path(), 499);
        assert_eq!(log.number_of_records(), 25);
        assert_eq!(collect_keys(log.cursor().unwrap()), (1..=25).collect::<Vec<u64>>());
        assert_eq!(log.oldest_record().unwrap().key, 1);
        assert_eq!(log.newest_record().unwrap().key, 25);
    }

    #[test]
    fn test_reference_counting_shares_one_instance() {
        let dir = TempDir::new().unwrap();
        let first = open_log(dir.path(), 1024);
        let second = open_log(dir.path(), 1024);
        let third = open_log(dir.path(), 1024);

        first.append(record(1, "v")).unwrap();

        // All handles observe the same instance.
        assert_eq!(second.number_of_records(), 1);
        assert_eq!(third.number_of_records(), 1);

        first.close();
        second.close();

        // The remaining handle still works.
        third.append(record(2, "v")).unwrap();
        assert_eq!(collect_keys(third.cursor().unwrap()), vec![1, 2]);
        third.close();

        // A new open after the last release constructs a fresh instance
        // over the same files.
        let reopened = open_log(dir.path(), 1024);
        assert_eq!(collect_keys(reopened.cursor().unwrap()), vec![1, 2]);
    }

    #[test]
    fn test_cursor_outliving_every_handle_returns_nothing() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), 1024);
        log.append(record(1, "v")).unwrap();

        let mut cursor = log.cursor().unwrap();
        log.close();

        assert!(!cursor.next().unwrap());
        assert!(!cursor.position_to(Some(&1), false).unwrap());
    }

    #[test]
    fn test_open_with_different_parser_type_is_rejected() {
        #[derive(Debug)]
        struct OtherParser;

        impl RecordParser for OtherParser {
            type Key = i64;

            fn encode_key(&self, key: &i64) -> bytes::Bytes {
                bytes::Bytes::copy_from_slice(&key.to_be_bytes())
            }

            fn decode_key(&self, bytes: &[u8]) -> Result<i64, ChangelogError> {
                let raw: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| ChangelogError::InvalidKeyBytes { len: bytes.len() })?;
                Ok(i64::from_be_bytes(raw))
            }

            fn encode_key_to_string(&self, key: &i64) -> String {
                format!("{:020}", key)
            }

            fn decode_key_from_string(&self, s: &str) -> Result<i64, ChangelogError> {
                s.parse()
                    .map_err(|_| ChangelogError::InvalidKeyString { value: s.to_string() })
            }

            fn max_key(&self) -> i64 {
                i64::MAX
            }
        }

        let dir = TempDir::new().unwrap();
        let _log = open_log(dir.path(), 1024);

        let result = Log::open(dir.path(), OtherParser, 1024);
        assert!(matches!(
            result,
            Err(ChangelogError::ParserMismatch { .. })
        ));
    }

    #[test]
    fn test_reposition_cursor_forward_and_backward() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), 499);
        for i in 1..=25u64 {
            log.append(record(i, VALUE_50)).unwrap();
        }

        let mut cursor = log.cursor().unwrap();
        assert!(cursor.position_to(Some(&23), false).unwrap());
        assert_eq!(cursor.record().unwrap().key, 23);

        // Back into a rotated file.
        assert!(cursor.position_to(Some(&4), false).unwrap());
        assert_eq!(cursor.record().unwrap().key, 4);

        let mut keys = vec![4];
        while cursor.next().unwrap() {
            keys.push(cursor.record().unwrap().key);
        }
        assert_eq!(keys, (4..=25).collect::<Vec<u64>>());
    }
}

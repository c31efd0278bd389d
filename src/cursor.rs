//! Cursors over a multi-file log.
//!
//! A [`LogCursor`] walks the key-ordered file chain of a
//! [`Log`](crate::Log), crossing file boundaries transparently. Cursor
//! operations run under the log's shared lock, so a cursor never observes a
//! half-rotated log; conversely, rotation (under the exclusive lock) sees a
//! stable set of registered cursors and re-attaches the ones reading the
//! head to the freshly rotated file.
//!
//! A cursor is owned by a single reader; it is not meant to be shared
//! between threads.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ChangelogError;
use crate::log::{LogShared, LogState};
use crate::log_file::{LogFile, LogFileCursor};
use crate::parser::RecordParser;
use crate::record::Record;

/// The position of a cursor within the log: current file, byte offset of
/// the next read, and the record the cursor points to.
///
/// Captured when rotating the head: the rename preserves the file bytes, so
/// the same state applied to the rotated file continues the traversal.
pub(crate) struct CursorState<P: RecordParser> {
    pub(crate) file: Arc<LogFile<P>>,
    pub(crate) position: u64,
    pub(crate) record: Option<Record<P::Key>>,
}

/// Cursor state shared between a [`LogCursor`] handle and its log, so that
/// rotation and invalidation can reach live cursors.
pub(crate) struct CursorInner<P: RecordParser> {
    pub(crate) file: Arc<LogFile<P>>,
    pub(crate) file_cursor: LogFileCursor<P>,
    /// Cleared when the file chain under the cursor is destroyed (clear, or
    /// purge of the cursor's file); every later operation returns nothing.
    pub(crate) valid: bool,
}

impl<P: RecordParser> CursorInner<P> {
    /// Moves the cursor to the first record of `file`.
    fn switch_to(&mut self, file: Arc<LogFile<P>>) -> Result<(), ChangelogError> {
        self.file_cursor = file.cursor()?;
        self.file = file;
        Ok(())
    }

    /// Advances within the current file, or steps into the next file of the
    /// chain positioned on its first record.
    pub(crate) fn advance(&mut self, state: &LogState<P>) -> Result<bool, ChangelogError> {
        if self.file_cursor.next()? {
            return Ok(true);
        }
        match state.next_log_file(&self.file) {
            Some(next) => {
                self.switch_to(next)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) fn capture_state(&self) -> CursorState<P> {
        let (position, record) = self.file_cursor.state();
        CursorState {
            file: self.file.clone(),
            position,
            record,
        }
    }

    pub(crate) fn reinitialize_to(&mut self, state: CursorState<P>) -> Result<(), ChangelogError> {
        self.file_cursor = state.file.cursor_initialised_to(state.record, state.position)?;
        self.file = state.file;
        Ok(())
    }
}

/// Positions a cursor on `key` (or on the first record when `key` is
/// `None`) by a ceiling lookup over the file inventory followed by a scan
/// of the containing file.
///
/// When the file scan reports the position found but yields no record, the
/// sought key lives at the start of the next file; the cursor steps across
/// the boundary and reports the result of that step.
pub(crate) fn position_inner<P: RecordParser>(
    state: &LogState<P>,
    inner: &mut CursorInner<P>,
    key: Option<&P::Key>,
    find_nearest: bool,
) -> Result<bool, ChangelogError> {
    let target = state.find_log_file_for(key);
    if !Arc::ptr_eq(&target, &inner.file) {
        inner.switch_to(target)?;
    }
    match key {
        Some(key) => {
            let mut found = inner.file_cursor.position_to(key, find_nearest)?;
            if found && inner.file_cursor.record().is_none() {
                found = inner.advance(state)?;
            }
            Ok(found)
        }
        None => Ok(true),
    }
}

/// Forward, repositionable cursor over the records of a log.
///
/// The cursor initially points to a record: [`record`](LogCursor::record)
/// returns the first available record before any call to
/// [`next`](LogCursor::next).
///
/// A cursor obtained from a closed log, or from an exact-match positioning
/// that found nothing, is empty: `record()` returns `None` and every other
/// operation reports `false`.
pub struct LogCursor<P: RecordParser> {
    active: Option<ActiveCursor<P>>,
}

struct ActiveCursor<P: RecordParser> {
    shared: Arc<LogShared<P>>,
    inner: Arc<Mutex<CursorInner<P>>>,
}

impl<P: RecordParser> LogCursor<P> {
    pub(crate) fn empty() -> Self {
        Self { active: None }
    }

    pub(crate) fn from_parts(shared: Arc<LogShared<P>>, inner: Arc<Mutex<CursorInner<P>>>) -> Self {
        Self {
            active: Some(ActiveCursor { shared, inner }),
        }
    }

    /// Returns the record the cursor points to, if any.
    pub fn record(&self) -> Option<Record<P::Key>> {
        let active = self.active.as_ref()?;
        let inner = active.inner.lock();
        if !inner.valid {
            return None;
        }
        inner.file_cursor.record().cloned()
    }

    /// Advances to the next record in key order, crossing file boundaries.
    pub fn next(&mut self) -> Result<bool, ChangelogError> {
        let Some(active) = self.active.as_ref() else {
            return Ok(false);
        };
        let state = active.shared.state.read();
        let mut inner = active.inner.lock();
        if state.closed || !inner.valid {
            return Ok(false);
        }
        inner.advance(&state)
    }

    /// Repositions the cursor to `key`, or to the first record when `key`
    /// is `None`.
    ///
    /// With `find_nearest` true the cursor lands on the lowest key strictly
    /// greater than `key`. Returns whether a position was found; on failure
    /// the cursor position is unspecified.
    pub fn position_to(
        &mut self,
        key: Option<&P::Key>,
        find_nearest: bool,
    ) -> Result<bool, ChangelogError> {
        let Some(active) = self.active.as_ref() else {
            return Ok(false);
        };
        let state = active.shared.state.read();
        let mut inner = active.inner.lock();
        if state.closed || !inner.valid {
            return Ok(false);
        }
        position_inner(&state, &mut inner, key, find_nearest)
    }

    /// Closes the cursor and deregisters it from the log.
    pub fn close(&mut self) {
        if let Some(active) = self.active.take() {
            active.shared.deregister_cursor(&active.inner);
        }
    }
}

impl<P: RecordParser> Drop for LogCursor<P> {
    fn drop(&mut self) {
        self.close();
    }
}

//! Process-wide log registry.
//!
//! The registry guarantees one [`Log`](crate::Log) instance per directory
//! path: opening an already-open path returns the cached instance with its
//! reference count incremented, and each release decrements it. The real
//! close happens on the transition to zero, when the entry is also removed.
//!
//! Open and release for the same path are serialized by a single
//! process-wide lock, so concurrent opens cannot create duplicate instances
//! and concurrent releases cannot double-close. The lock is only held for
//! registry bookkeeping, never across ordinary log operations.

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::ChangelogError;
use crate::log::LogShared;
use crate::parser::RecordParser;

/// A type-erased log instance held by the registry.
///
/// Logs are generic over their parser; the registry recovers the concrete
/// type with an `Any` downcast when a path is re-opened.
pub(crate) trait RegisteredLog: Send + Sync {
    fn close_now(&self);
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct RegistryEntry {
    refcount: usize,
    log: Arc<dyn RegisteredLog>,
}

pub(crate) struct LogRegistry {
    entries: Mutex<HashMap<PathBuf, RegistryEntry>>,
}

static REGISTRY: OnceLock<LogRegistry> = OnceLock::new();

/// Returns the process-wide registry.
pub(crate) fn global() -> &'static LogRegistry {
    REGISTRY.get_or_init(|| LogRegistry {
        entries: Mutex::new(HashMap::new()),
    })
}

impl LogRegistry {
    /// Returns the log open on `path`, constructing it on first open.
    ///
    /// An existing instance must have been opened with the same parser
    /// type; its parser value and size limit are kept as-is (first opener
    /// wins).
    pub(crate) fn open<P: RecordParser>(
        &self,
        path: &Path,
        parser: P,
        size_limit: u64,
    ) -> Result<Arc<LogShared<P>>, ChangelogError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(path) {
            let shared = entry
                .log
                .clone()
                .as_any()
                .downcast::<LogShared<P>>()
                .map_err(|_| ChangelogError::ParserMismatch {
                    path: path.to_path_buf(),
                })?;
            entry.refcount += 1;
            return Ok(shared);
        }

        let shared = Arc::new(LogShared::open_dir(path, parser, size_limit)?);
        entries.insert(
            path.to_path_buf(),
            RegistryEntry {
                refcount: 1,
                log: shared.clone(),
            },
        );
        Ok(shared)
    }

    /// Releases one reference to the log open on `path`, closing it for
    /// real when this was the last one.
    pub(crate) fn release(&self, path: &Path) {
        let mut entries = self.entries.lock();
        match entries.get_mut(path) {
            None => {
                // Should never happen: every handle was created by open.
                tracing::error!(
                    path = %path.display(),
                    "released a log that is not registered"
                );
            }
            Some(entry) if entry.refcount > 1 => entry.refcount -= 1,
            Some(_) => {
                if let Some(entry) = entries.remove(path) {
                    entry.log.close_now();
                }
            }
        }
    }
}

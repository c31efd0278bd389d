//! # changelog
//!
//! Multi-file append-only keyed log for a directory replication server.
//!
//! A log lives in a directory and stores an ordered stream of `(key, value)`
//! records across a chain of files:
//! - one writable head file, always named `head.log`, which receives appends;
//! - zero or more immutable rotated files named `<lowkey>_<highkey>.log`,
//!   where the key strings come from the [`RecordParser`].
//!
//! The head is rotated to a read-only file once it exceeds a size limit.
//! Records must be appended in ascending key order; readers traverse the
//! whole chain in key order through a [`LogCursor`], which survives head
//! rotation without losing its position. Old files can be removed wholesale
//! with [`Log::purge_up_to`].
//!
//! Appends are not durable until [`Log::sync_to_file_system`] returns.
//!
//! Opening the same directory twice yields the same [`Log`] instance; the
//! instance is shared through a process-wide registry and closed when the
//! last handle is dropped.

pub mod cursor;
pub mod error;
pub mod log;
pub mod log_file;
pub mod parser;
pub mod record;
mod registry;

pub use cursor::LogCursor;
pub use error::ChangelogError;
pub use log::Log;
pub use log_file::{LogFile, LogFileCursor};
pub use parser::RecordParser;
pub use record::Record;

/// Name of the writable head file of a log directory.
pub const HEAD_LOG_FILE_NAME: &str = "head.log";

/// Extension shared by the head file and all rotated files.
pub const LOG_FILE_SUFFIX: &str = ".log";

/// Separator between the low and high key in a rotated file name.
pub(crate) const LOG_FILE_NAME_SEPARATOR: char = '_';

/// Record header size in bytes: magic, key length, value length, crc32c.
pub const RECORD_HEADER_SIZE: usize = 16;

/// Maximum size of a record key or value (16 MiB).
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

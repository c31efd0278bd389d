//! Record type and on-disk framing.
//!
//! Each record is stored with the following frame:
//!
//! ```text
//! +----------+------------+------------+----------+-----------+-------------+
//! | magic    | key length | val length | crc32c   | key bytes | value bytes |
//! | 4 bytes  | 4 bytes    | 4 bytes    | 4 bytes  |           |             |
//! +----------+------------+------------+----------+-----------+-------------+
//! ```
//!
//! All integers are big-endian. The checksum covers the key bytes followed
//! by the value bytes. Key bytes are produced by the [`RecordParser`].

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ChangelogError;
use crate::parser::RecordParser;
use crate::{MAX_RECORD_SIZE, RECORD_HEADER_SIZE};

/// Magic bytes marking the start of a record frame.
pub const RECORD_MAGIC: [u8; 4] = *b"CLOG";

/// A keyed record. Values are opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<K> {
    /// Record key; keys are appended in ascending order.
    pub key: K,
    /// Record value.
    pub value: Bytes,
}

impl<K> Record<K> {
    /// Creates a new record.
    pub fn new(key: K, value: Bytes) -> Self {
        Self { key, value }
    }
}

/// Encodes a record into its on-disk frame.
pub(crate) fn encode_record<P: RecordParser>(
    parser: &P,
    record: &Record<P::Key>,
) -> Result<BytesMut, ChangelogError> {
    let key_bytes = parser.encode_key(&record.key);
    if key_bytes.len() > MAX_RECORD_SIZE {
        return Err(ChangelogError::RecordTooLarge {
            size: key_bytes.len(),
            max: MAX_RECORD_SIZE,
        });
    }
    if record.value.len() > MAX_RECORD_SIZE {
        return Err(ChangelogError::RecordTooLarge {
            size: record.value.len(),
            max: MAX_RECORD_SIZE,
        });
    }

    let mut crc = crc32c::crc32c(&key_bytes);
    crc = crc32c::crc32c_append(crc, &record.value);

    let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + key_bytes.len() + record.value.len());
    buf.put_slice(&RECORD_MAGIC);
    buf.put_u32(key_bytes.len() as u32);
    buf.put_u32(record.value.len() as u32);
    buf.put_u32(crc);
    buf.put_slice(&key_bytes);
    buf.put_slice(&record.value);
    Ok(buf)
}

/// Reads the record frame stored at `offset`, returning the record and its
/// size on disk.
///
/// Returns `Ok(None)` at end of data: nothing left to read, an all-zero
/// header (EOF padding), or an incomplete frame (a partial write at the tail
/// of the file).
pub(crate) fn read_record<P: RecordParser>(
    parser: &P,
    file: &mut File,
    offset: u64,
) -> Result<Option<(Record<P::Key>, u64)>, ChangelogError> {
    file.seek(SeekFrom::Start(offset))?;

    let mut header = [0u8; RECORD_HEADER_SIZE];
    if !read_full(file, &mut header)? {
        return Ok(None);
    }

    let magic: [u8; 4] = header[0..4].try_into().unwrap();
    if magic != RECORD_MAGIC {
        if magic == [0, 0, 0, 0] {
            // EOF padding
            return Ok(None);
        }
        return Err(ChangelogError::InvalidHeader {
            offset,
            reason: format!("invalid magic: {:?}", magic),
        });
    }

    let key_len = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
    let value_len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
    let crc_expected = u32::from_be_bytes(header[12..16].try_into().unwrap());

    if key_len > MAX_RECORD_SIZE {
        return Err(ChangelogError::RecordTooLarge {
            size: key_len,
            max: MAX_RECORD_SIZE,
        });
    }
    if value_len > MAX_RECORD_SIZE {
        return Err(ChangelogError::RecordTooLarge {
            size: value_len,
            max: MAX_RECORD_SIZE,
        });
    }

    let mut payload = vec![0u8; key_len + value_len];
    if !read_full(file, &mut payload)? {
        // Incomplete frame: partial write at the tail.
        return Ok(None);
    }

    let crc_actual = crc32c::crc32c(&payload);
    if crc_actual != crc_expected {
        return Err(ChangelogError::CorruptedRecord {
            offset,
            expected: crc_expected,
            actual: crc_actual,
        });
    }

    let key = parser.decode_key(&payload[..key_len])?;
    let value = Bytes::copy_from_slice(&payload[key_len..]);
    let disk_size = (RECORD_HEADER_SIZE + key_len + value_len) as u64;
    Ok(Some((Record { key, value }, disk_size)))
}

/// Fills `buf` from the file. Returns false if end of file was reached
/// before the buffer was full.
fn read_full(file: &mut File, buf: &mut [u8]) -> Result<bool, ChangelogError> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

//! Record key parsing and encoding.

use std::fmt;

use bytes::Bytes;

use crate::error::ChangelogError;

/// Key-specific behavior of a log: byte codec, string codec for file names,
/// and the maximum-key sentinel.
///
/// A log stores records in ascending key order and names its rotated files
/// after the key range they contain, so all key knowledge is concentrated
/// here. Implementations must uphold two contracts:
///
/// - `decode_key_from_string(encode_key_to_string(k)) == k`, and the string
///   encoding must collate like the key order over the expected key
///   universe. The encoding must not contain `'_'` or `'.'`, which are
///   reserved by the rotated-file naming scheme; this is verified when a
///   rotation name is generated.
/// - `max_key()` is strictly greater than any key that will ever be
///   appended. It indexes the head file in the log's inventory and is never
///   written to disk.
pub trait RecordParser: Send + Sync + 'static {
    /// Record key type. Keys are totally ordered.
    type Key: Ord + Clone + Send + Sync + fmt::Debug + 'static;

    /// Encodes a key to its on-disk byte representation.
    fn encode_key(&self, key: &Self::Key) -> Bytes;

    /// Decodes a key from the exact byte slice produced by [`encode_key`].
    ///
    /// [`encode_key`]: RecordParser::encode_key
    fn decode_key(&self, bytes: &[u8]) -> Result<Self::Key, ChangelogError>;

    /// Encodes a key to the string form used in rotated file names.
    fn encode_key_to_string(&self, key: &Self::Key) -> String;

    /// Decodes a key from its file-name string form.
    fn decode_key_from_string(&self, s: &str) -> Result<Self::Key, ChangelogError>;

    /// Returns the sentinel key, strictly greater than any appendable key.
    fn max_key(&self) -> Self::Key;
}

/// Checks that an encoded key string is usable in a rotated file name.
pub(crate) fn check_encoded_key(encoded: &str) -> Result<(), ChangelogError> {
    if encoded.contains('_') || encoded.contains('.') {
        return Err(ChangelogError::InvalidKeyEncoding {
            encoded: encoded.to_string(),
        });
    }
    Ok(())
}

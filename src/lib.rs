//! Immutable, content-addressed object shards with O(1) lookups.
//!
//! A shard is a single file holding a fixed set of binary objects, each stored
//! under a fixed-width key (typically a digest of the object). Shards are
//! written once: objects are streamed into an append-only object log, and on
//! [`Shard::finalize`] a minimal perfect hash function is built over the keys,
//! the index is laid out in hash-bucket order and a header describing every
//! section is written at offset zero. Readers then answer each lookup with one
//! hash evaluation, one key comparison and one positioned read.
//!
//! The file layout is:
//!
//! ```text
//! [0 .. 72)                             ShardHeader (magic, version, sections)
//! [objects_position .. +objects_size)   object log (concatenated payloads)
//! [index_position .. +index_size)       index rows (key, offset, size) in bucket order
//! [hash_position .. +hash_size)         hash config + serialized perfect hash
//! ```
//!
//! ```
//! use mphshard::Shard;
//!
//! # fn main() -> mphshard::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let path = dir.path().join("fruits.shard");
//!
//! let mut shard = Shard::create(&path)?;
//! shard.prepare(2)?;
//! shard.write_object(&[b'a'; 32], b"apple")?;
//! shard.write_object(&[b'b'; 32], b"banana")?;
//! shard.finalize()?;
//!
//! let shard = Shard::open(&path)?;
//! assert_eq!(shard.read_object(&[b'b'; 32])?, Some(b"banana".to_vec()));
//! assert_eq!(shard.find(&[b'c'; 32])?, None);
//! # Ok(())
//! # }
//! ```
const MAGIC_NUMBER: u64 = u64::from_be_bytes(*b"MPHSHARD");

/// Newest on-disk format version this crate reads and the one it writes.
pub const FORMAT_VERSION: u32 = 1;

mod error;
pub use error::{Result, ShardError};

mod hasher;
pub use hasher::{
    BBHashFunction, BBHashLoader, PerfectHashFunction, ShardHashConfig, ShardHashLoader,
};

mod meta;
pub use meta::{ShardHeader, ShardInfo, ShardLocation};

mod reader;
pub use reader::ShardReader;

mod writer;
pub use writer::{ShardWriter, ShardWriterWrapper};

mod object_log;
pub use object_log::{ObjectLog, ObjectLogView};

mod index;
pub use index::{IndexEntry, IndexStaging, IndexTable, entry_size};

mod builder;
pub use builder::{ShardBuilder, ShardOptions};

mod shard;
pub use shard::{ReadOnlyShard, Shard, ShardIter, ShardState};

#[cfg(test)]
pub(crate) mod tests {
    use std::io::{Error, ErrorKind};
    use std::sync::Mutex;

    use crate::{ShardReader, ShardWriter};

    /// In-memory shard storage with an optional size limit.
    #[derive(Debug, Default)]
    pub struct MemoryFile {
        data: Mutex<Vec<u8>>,
        limit: Option<u64>,
    }

    impl MemoryFile {
        pub fn with_limit(limit: u64) -> Self {
            Self {
                data: Mutex::new(Vec::new()),
                limit: Some(limit),
            }
        }

        pub fn bytes(&self) -> Vec<u8> {
            self.data.lock().unwrap().clone()
        }

        pub fn from_bytes(data: Vec<u8>) -> Self {
            Self {
                data: Mutex::new(data),
                limit: None,
            }
        }
    }

    impl ShardReader for MemoryFile {
        fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> std::io::Result<R>
        where
            F: FnOnce(&[u8]) -> std::io::Result<R>,
        {
            let data = self.data.lock().unwrap();
            let end = offset.checked_add(length).filter(|&end| end <= data.len() as u64);
            match end {
                Some(end) => f(&data[offset as usize..end as usize]),
                None => Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    "Failed to read enough bytes",
                )),
            }
        }

        fn stored_length(&self) -> std::io::Result<u64> {
            Ok(self.data.lock().unwrap().len() as u64)
        }
    }

    impl ShardWriter for MemoryFile {
        fn write_all_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
            let end = offset as usize + buf.len();
            if let Some(limit) = self.limit {
                if end as u64 > limit {
                    return Err(Error::new(ErrorKind::WriteZero, "Write exceeds limit"));
                }
            }
            let mut data = self.data.lock().unwrap();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[offset as usize..end].copy_from_slice(buf);
            Ok(())
        }
    }
}

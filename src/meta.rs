use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{FORMAT_VERSION, MAGIC_NUMBER, Result, ShardError};

/// Fixed-size header stored at offset zero of every shard file.
///
/// The header is written last during [`finalize`](crate::Shard::finalize),
/// once the position and size of every section is known.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShardHeader {
    /// On-disk format version.
    pub version: u32,
    /// Width in bytes of every key stored in the shard.
    pub key_width: u32,
    /// Number of live objects, equal to the number of index rows.
    pub objects_count: u64,
    /// Absolute offset of the object log section.
    pub objects_position: u64,
    /// Length in bytes of the object log section.
    pub objects_size: u64,
    /// Absolute offset of the index table section.
    pub index_position: u64,
    /// Length in bytes of the index table section.
    pub index_size: u64,
    /// Absolute offset of the serialized hash function.
    pub hash_position: u64,
    /// Length in bytes of the serialized hash function.
    pub hash_size: u64,
}

impl ShardHeader {
    pub const SIZE: usize = 72;

    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut data = [0u8; Self::SIZE];
        data[0..8].copy_from_slice(&MAGIC_NUMBER.to_be_bytes());
        data[8..12].copy_from_slice(&self.version.to_be_bytes());
        data[12..16].copy_from_slice(&self.key_width.to_be_bytes());
        let fields = [
            self.objects_count,
            self.objects_position,
            self.objects_size,
            self.index_position,
            self.index_size,
            self.hash_position,
            self.hash_size,
        ];
        for (i, field) in fields.iter().enumerate() {
            let start = 16 + i * 8;
            data[start..start + 8].copy_from_slice(&field.to_be_bytes());
        }
        data
    }

    /// Parses a header, checking only the magic number.
    ///
    /// Structural checks against the file happen in [`validate`](Self::validate).
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ShardError::corrupt(format!(
                "header truncated to {} bytes",
                data.len()
            )));
        }
        let u64_at = |start: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[start..start + 8]);
            u64::from_be_bytes(bytes)
        };
        let u32_at = |start: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&data[start..start + 4]);
            u32::from_be_bytes(bytes)
        };

        let magic_number = u64_at(0);
        if magic_number != MAGIC_NUMBER {
            return Err(ShardError::corrupt(format!(
                "invalid magic number: {:#018x}",
                magic_number
            )));
        }

        Ok(ShardHeader {
            version: u32_at(8),
            key_width: u32_at(12),
            objects_count: u64_at(16),
            objects_position: u64_at(24),
            objects_size: u64_at(32),
            index_position: u64_at(40),
            index_size: u64_at(48),
            hash_position: u64_at(56),
            hash_size: u64_at(64),
        })
    }

    /// Checks the header against the length of the file it was read from.
    pub fn validate(&self, file_length: u64) -> Result<()> {
        if self.version == 0 || self.version > FORMAT_VERSION {
            return Err(ShardError::corrupt(format!(
                "unsupported format version {}",
                self.version
            )));
        }
        if self.key_width == 0 {
            return Err(ShardError::corrupt("key width is zero"));
        }

        let expected_index_size = self
            .objects_count
            .checked_mul(crate::index::entry_size(self.key_width as usize) as u64)
            .ok_or_else(|| ShardError::corrupt("objects count overflows index size"))?;
        if expected_index_size != self.index_size {
            return Err(ShardError::corrupt(format!(
                "index size {} does not match {} objects",
                self.index_size, self.objects_count
            )));
        }

        let mut sections = [
            ("header", 0..Self::SIZE as u64),
            ("objects", section(self.objects_position, self.objects_size)?),
            ("index", section(self.index_position, self.index_size)?),
            ("hash", section(self.hash_position, self.hash_size)?),
        ];
        for (name, range) in sections.iter() {
            if range.end > file_length {
                return Err(ShardError::corrupt(format!(
                    "{} section {:?} exceeds file length {}",
                    name, range, file_length
                )));
            }
        }
        sections.sort_by_key(|(_, range)| (range.start, range.end));
        for pair in sections.windows(2) {
            let (prev_name, prev) = &pair[0];
            let (next_name, next) = &pair[1];
            if prev.end > next.start {
                return Err(ShardError::corrupt(format!(
                    "{} section overlaps {} section",
                    prev_name, next_name
                )));
            }
        }
        Ok(())
    }
}

fn section(position: u64, size: u64) -> Result<Range<u64>> {
    let end = position
        .checked_add(size)
        .ok_or_else(|| ShardError::corrupt("section range overflows"))?;
    Ok(position..end)
}

/// Location of an object inside the object log section.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardLocation {
    /// Offset relative to the start of the object log.
    pub offset: u64,
    /// Payload length in bytes.
    pub size: u64,
}

/// Summary returned by [`Shard::finalize`](crate::Shard::finalize) and
/// [`Shard::info`](crate::Shard::info).
#[derive(Debug, Serialize, Default, Clone, PartialEq)]
pub struct ShardInfo {
    /// Header describing the section layout.
    pub header: ShardHeader,
    /// Final size of the shard file in bytes.
    pub file_length: u64,
    /// Hash function configuration recorded in the file.
    pub hash_config: crate::ShardHashConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ShardHeader {
        ShardHeader {
            version: FORMAT_VERSION,
            key_width: 32,
            objects_count: 2,
            objects_position: ShardHeader::SIZE as u64,
            objects_size: 10,
            index_position: ShardHeader::SIZE as u64 + 10,
            index_size: 2 * 48,
            hash_position: ShardHeader::SIZE as u64 + 10 + 96,
            hash_size: 20,
        }
    }

    #[test]
    fn test_header_layout() {
        let header = sample();
        let data = header.serialize();
        assert_eq!(&data[..8], b"MPHSHARD");
        assert_eq!(ShardHeader::deserialize(&data).unwrap(), header);

        let file_length = header.hash_position + header.hash_size;
        header.validate(file_length).unwrap();
        header.validate(file_length - 1).unwrap_err();
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut data = sample().serialize();
        data[..8].copy_from_slice(b"SHARDV0!");
        assert!(matches!(
            ShardHeader::deserialize(&data),
            Err(ShardError::Corrupt(_))
        ));
        ShardHeader::deserialize(&data[..10]).unwrap_err();
    }

    #[test]
    fn test_header_rejects_inconsistent_sections() {
        let file_length = 1 << 20;

        let mut header = sample();
        header.version = FORMAT_VERSION + 1;
        header.validate(file_length).unwrap_err();

        let mut header = sample();
        header.key_width = 0;
        header.validate(file_length).unwrap_err();

        let mut header = sample();
        header.index_size += 1;
        header.validate(file_length).unwrap_err();

        let mut header = sample();
        header.index_position -= 1;
        header.validate(file_length).unwrap_err();

        let mut header = sample();
        header.objects_position = 0;
        header.validate(file_length).unwrap_err();

        let mut header = sample();
        header.hash_position = u64::MAX;
        header.validate(file_length).unwrap_err();

        let mut header = sample();
        header.objects_count = u64::MAX;
        header.validate(file_length).unwrap_err();
    }
}

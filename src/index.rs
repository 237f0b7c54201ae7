use std::io::Write;

use crate::{PerfectHashFunction, Result, ShardError, ShardLocation};

/// Serialized size of one index row for keys of `key_width` bytes.
pub const fn entry_size(key_width: usize) -> usize {
    key_width + 2 * std::mem::size_of::<u64>()
}

/// One row of the index table: a key and where its payload lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Box<[u8]>,
    pub location: ShardLocation,
}

impl IndexEntry {
    fn write_to(&self, writer: &mut impl Write) -> std::io::Result<()> {
        writer.write_all(&self.key)?;
        writer.write_all(&self.location.offset.to_be_bytes())?;
        writer.write_all(&self.location.size.to_be_bytes())
    }

    fn parse(row: &[u8], key_width: usize) -> Self {
        let mut offset = [0u8; 8];
        let mut size = [0u8; 8];
        offset.copy_from_slice(&row[key_width..key_width + 8]);
        size.copy_from_slice(&row[key_width + 8..key_width + 16]);
        IndexEntry {
            key: row[..key_width].into(),
            location: ShardLocation {
                offset: u64::from_be_bytes(offset),
                size: u64::from_be_bytes(size),
            },
        }
    }
}

/// Insertion-ordered index rows of a shard that is still being written.
///
/// Deleted rows are kept as tombstones so that positions stay stable; they
/// still count against the capacity given to [`new`](Self::new).
#[derive(Debug)]
pub struct IndexStaging {
    capacity: u64,
    entries: Vec<Option<IndexEntry>>,
    positions: foldhash::HashMap<Box<[u8]>, usize>,
}

impl IndexStaging {
    pub fn new(capacity: u64) -> Self {
        let reserve = capacity.min(1 << 20) as usize;
        Self {
            capacity,
            entries: Vec::with_capacity(reserve),
            positions: foldhash::HashMap::with_capacity_and_hasher(reserve, Default::default()),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of rows staged so far, tombstones included.
    pub fn written(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Number of rows that will reach the finalized index.
    pub fn live(&self) -> u64 {
        self.positions.len() as u64
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.positions.contains_key(key)
    }

    /// Fails if `key` is live or the capacity is used up, without staging anything.
    pub fn check(&self, key: &[u8]) -> Result<()> {
        if self.positions.contains_key(key) {
            return Err(ShardError::DuplicateKey);
        }
        if self.written() >= self.capacity {
            return Err(ShardError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub fn stage(&mut self, key: &[u8], location: ShardLocation) -> Result<()> {
        self.check(key)?;
        let key: Box<[u8]> = key.into();
        self.positions.insert(key.clone(), self.entries.len());
        self.entries.push(Some(IndexEntry { key, location }));
        Ok(())
    }

    /// Tombstones the live row for `key` and returns the location it pointed at.
    pub fn remove(&mut self, key: &[u8]) -> Result<ShardLocation> {
        let position = self.positions.remove(key).ok_or(ShardError::KeyNotFound)?;
        self.entries[position]
            .take()
            .map(|entry| entry.location)
            .ok_or_else(|| ShardError::corrupt("staged position points at a tombstone"))
    }

    /// Live keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.iter().flatten().map(|entry| &*entry.key)
    }

    /// Permutes the live rows so that row `i` holds the key `function` maps to `i`.
    ///
    /// Fails with [`ShardError::HashConstruction`] if `function` sends a key
    /// out of range, sends two keys to one bucket, or leaves a bucket empty.
    pub fn reorder<P: PerfectHashFunction + ?Sized>(self, function: &P) -> Result<IndexTable> {
        let count = self.live();
        if function.len() != count {
            return Err(ShardError::HashConstruction(format!(
                "hash function covers {} keys, index has {}",
                function.len(),
                count
            )));
        }

        let mut slots: Vec<Option<IndexEntry>> = vec![None; count as usize];
        for entry in self.entries.into_iter().flatten() {
            let bucket = function.index(&entry.key);
            let slot = slots.get_mut(bucket as usize).filter(|_| bucket < count).ok_or_else(|| {
                ShardError::HashConstruction(format!(
                    "bucket {} outside [0, {})",
                    bucket, count
                ))
            })?;
            if slot.is_some() {
                return Err(ShardError::HashConstruction(format!(
                    "bucket {} assigned twice",
                    bucket
                )));
            }
            *slot = Some(entry);
        }

        let entries = slots
            .into_iter()
            .enumerate()
            .map(|(bucket, slot)| {
                slot.ok_or_else(|| {
                    ShardError::HashConstruction(format!("bucket {} left empty", bucket))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(IndexTable { entries })
    }
}

/// Index rows in bucket order, as stored in a finalized shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexTable {
    entries: Vec<IndexEntry>,
}

impl IndexTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, bucket: usize) -> Option<&IndexEntry> {
        self.entries.get(bucket)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, IndexEntry> {
        self.entries.iter()
    }

    /// Finds the row for `key`, verifying the stored key byte for byte.
    ///
    /// A perfect hash function cannot tell that a key is unknown, so the
    /// bucket it returns for a foreign key must never be trusted on its own.
    pub fn lookup<P: PerfectHashFunction + ?Sized>(
        &self,
        function: &P,
        key: &[u8],
    ) -> Option<&IndexEntry> {
        let bucket = function.index(key);
        if bucket >= self.entries.len() as u64 {
            return None;
        }
        let entry = &self.entries[bucket as usize];
        (&*entry.key == key).then_some(entry)
    }

    /// Checks that every row sits in the bucket its key hashes to.
    pub fn verify<P: PerfectHashFunction + ?Sized>(&self, function: &P) -> Result<()> {
        for (bucket, entry) in self.entries.iter().enumerate() {
            let expected = function.index(&entry.key);
            if expected != bucket as u64 {
                return Err(ShardError::corrupt(format!(
                    "index row {} holds a key hashing to bucket {}",
                    bucket, expected
                )));
            }
        }
        Ok(())
    }

    pub fn write_to(&self, writer: &mut impl Write) -> std::io::Result<()> {
        for entry in &self.entries {
            entry.write_to(writer)?;
        }
        Ok(())
    }

    /// Parses `count` rows of `key_width`-byte keys from an index section.
    pub fn parse(data: &[u8], key_width: usize, count: u64) -> Result<Self> {
        let row = entry_size(key_width);
        if (data.len() as u64) != count.saturating_mul(row as u64) {
            return Err(ShardError::corrupt(format!(
                "index section of {} bytes cannot hold {} rows",
                data.len(),
                count
            )));
        }
        let entries = data
            .chunks_exact(row)
            .map(|chunk| IndexEntry::parse(chunk, key_width))
            .collect();
        Ok(IndexTable { entries })
    }
}

impl<'a> IntoIterator for &'a IndexTable {
    type Item = &'a IndexEntry;
    type IntoIter = std::slice::Iter<'a, IndexEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Maps each key to the value of its first byte.
    struct FirstByte(u64);

    impl PerfectHashFunction for FirstByte {
        fn len(&self) -> u64 {
            self.0
        }

        fn index(&self, key: &[u8]) -> u64 {
            key[0] as u64
        }

        fn to_bytes(&self) -> Result<Vec<u8>> {
            Ok(self.0.to_be_bytes().to_vec())
        }
    }

    fn location(offset: u64, size: u64) -> ShardLocation {
        ShardLocation { offset, size }
    }

    #[test]
    fn test_stage_rejects_duplicates_and_overflow() {
        let mut staging = IndexStaging::new(2);
        staging.stage(&[1; 4], location(0, 1)).unwrap();
        assert!(matches!(
            staging.stage(&[1; 4], location(1, 1)),
            Err(ShardError::DuplicateKey)
        ));
        staging.stage(&[0; 4], location(1, 1)).unwrap();
        assert!(matches!(
            staging.stage(&[2; 4], location(2, 1)),
            Err(ShardError::CapacityExceeded { capacity: 2 })
        ));
        assert_eq!(staging.written(), 2);
        assert_eq!(staging.live(), 2);
    }

    #[test]
    fn test_remove_leaves_tombstone() {
        let mut staging = IndexStaging::new(3);
        staging.stage(&[0; 4], location(0, 1)).unwrap();
        staging.stage(&[1; 4], location(1, 2)).unwrap();
        assert_eq!(staging.remove(&[0; 4]).unwrap(), location(0, 1));
        assert!(matches!(
            staging.remove(&[0; 4]),
            Err(ShardError::KeyNotFound)
        ));
        assert!(!staging.contains(&[0; 4]));
        assert_eq!(staging.written(), 2);
        assert_eq!(staging.live(), 1);

        // A removed key may be written again while capacity remains.
        staging.stage(&[0; 4], location(3, 1)).unwrap();
        assert_eq!(staging.keys().collect::<Vec<_>>(), vec![&[1u8; 4][..], &[0u8; 4][..]]);

        let table = staging.reorder(&FirstByte(2)).unwrap();
        assert_eq!(table.get(0).unwrap().location, location(3, 1));
        assert_eq!(table.get(1).unwrap().location, location(1, 2));
        assert!(table.get(2).is_none());
    }

    #[test]
    fn test_reorder_rejects_bad_functions() {
        let staged = || {
            let mut staging = IndexStaging::new(2);
            staging.stage(&[0; 4], location(0, 1)).unwrap();
            staging.stage(&[5; 4], location(1, 1)).unwrap();
            staging
        };
        // Key 5 maps outside [0, 2).
        assert!(matches!(
            staged().reorder(&FirstByte(2)),
            Err(ShardError::HashConstruction(_))
        ));
        // Length does not match the staged rows.
        assert!(matches!(
            staged().reorder(&FirstByte(3)),
            Err(ShardError::HashConstruction(_))
        ));

        let mut staging = IndexStaging::new(2);
        staging.stage(&[1, 0], location(0, 1)).unwrap();
        staging.stage(&[1, 1], location(1, 1)).unwrap();
        assert!(matches!(
            staging.reorder(&FirstByte(2)),
            Err(ShardError::HashConstruction(_))
        ));
    }

    #[test]
    fn test_lookup_verifies_key() {
        let mut staging = IndexStaging::new(2);
        staging.stage(&[1, 7], location(0, 3)).unwrap();
        staging.stage(&[0, 7], location(3, 4)).unwrap();
        let table = staging.reorder(&FirstByte(2)).unwrap();
        table.verify(&FirstByte(2)).unwrap();

        let function = FirstByte(2);
        assert_eq!(
            table.lookup(&function, &[1, 7]).unwrap().location,
            location(0, 3)
        );
        // Same bucket, different key.
        assert!(table.lookup(&function, &[1, 8]).is_none());
        // Bucket out of range.
        assert!(table.lookup(&function, &[9, 7]).is_none());
    }

    #[test]
    fn test_write_and_parse() {
        let mut staging = IndexStaging::new(2);
        staging.stage(&[0, 1, 2], location(0, 3)).unwrap();
        staging.stage(&[1, 1, 2], location(3, 4)).unwrap();
        let table = staging.reorder(&FirstByte(2)).unwrap();

        let mut data = Vec::new();
        table.write_to(&mut data).unwrap();
        assert_eq!(data.len(), 2 * entry_size(3));
        assert_eq!(IndexTable::parse(&data, 3, 2).unwrap(), table);
        IndexTable::parse(&data, 3, 3).unwrap_err();
        IndexTable::parse(&data[1..], 3, 2).unwrap_err();

        let mut swapped = table.entries.clone();
        swapped.swap(0, 1);
        let swapped = IndexTable { entries: swapped };
        swapped.verify(&FirstByte(2)).unwrap_err();
    }
}

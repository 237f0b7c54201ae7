use std::fs::File;
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::index::{IndexStaging, IndexTable, entry_size};
use crate::object_log::{ObjectLog, ObjectLogView};
use crate::{
    BBHashLoader, FORMAT_VERSION, PerfectHashFunction, Result, ShardBuilder, ShardError,
    ShardHashConfig, ShardHashLoader, ShardHeader, ShardInfo, ShardLocation, ShardOptions,
    ShardReader, ShardWriter, ShardWriterWrapper,
};

/// Lifecycle of a [`Shard`].
///
/// Builder-only data lives in [`Writing`](Self::Writing); lookup structures
/// only exist once the shard is [`ReadOnly`](Self::ReadOnly).
pub enum ShardState<F: ShardWriter, P> {
    /// Created on a file, waiting for [`Shard::prepare`].
    Uninitialized { file: F },
    /// Accepting objects until [`Shard::finalize`].
    Writing {
        log: ObjectLog<F>,
        staging: IndexStaging,
    },
    /// A write or finalize failed part way; the file must be rebuilt.
    Failed,
    /// Finalized or loaded; serves lookups.
    ReadOnly(ReadOnlyShard<F, P>),
}

impl<F: ShardWriter, P> ShardState<F, P> {
    pub fn name(&self) -> &'static str {
        match self {
            ShardState::Uninitialized { .. } => "uninitialized",
            ShardState::Writing { .. } => "writing",
            ShardState::Failed => "failed",
            ShardState::ReadOnly(_) => "read-only",
        }
    }
}

/// Everything a finalized shard needs to answer lookups.
pub struct ReadOnlyShard<F, P> {
    file: F,
    header: ShardHeader,
    hash_config: ShardHashConfig,
    function: P,
    table: IndexTable,
    objects: ObjectLogView,
}

/// An immutable object container addressed by fixed-width keys.
///
/// A shard is written once: [`prepare`](Self::prepare) declares how many
/// objects will follow, [`write_object`](Self::write_object) appends them and
/// [`finalize`](Self::finalize) builds a minimal perfect hash over the keys,
/// lays the index out in bucket order and writes the header. From then on,
/// and for shards opened with [`load`](Self::load), lookups cost one hash
/// evaluation, one key comparison and one positioned read.
///
/// Read methods take `&self` and only issue positioned reads, so a finalized
/// shard can be shared between threads behind an `Arc`.
pub struct Shard<F: ShardWriter, H: ShardHashLoader = BBHashLoader> {
    options: ShardOptions,
    state: ShardState<F, H::Function>,
    phantom: PhantomData<H>,
}

impl<F: ShardReader + ShardWriter> Shard<F, BBHashLoader> {
    /// Wraps `file` in a new shard using default options.
    pub fn new(file: F) -> Result<Self> {
        ShardBuilder::default().new_shard(file)
    }

    /// Loads a finalized shard from `file` using default options.
    pub fn load(file: F) -> Result<Self> {
        ShardBuilder::default().load(file)
    }
}

impl Shard<File, BBHashLoader> {
    /// Creates a shard file at `path` using default options.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        ShardBuilder::default().create(path)
    }

    /// Opens the finalized shard at `path` using default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        ShardBuilder::default().open(path)
    }
}

impl<F: ShardReader + ShardWriter, H: ShardHashLoader> Shard<F, H> {
    pub fn with_options(file: F, options: ShardOptions) -> Result<Self> {
        options.validate()?;
        Ok(Shard {
            options,
            state: ShardState::Uninitialized { file },
            phantom: PhantomData,
        })
    }

    /// Name of the current lifecycle state.
    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    pub fn key_width(&self) -> usize {
        self.options.key_width
    }

    pub fn options(&self) -> &ShardOptions {
        &self.options
    }

    /// Number of live objects: staged ones while writing, indexed ones once finalized.
    pub fn len(&self) -> u64 {
        match &self.state {
            ShardState::Writing { staging, .. } => staging.live(),
            ShardState::ReadOnly(read) => read.header.objects_count,
            ShardState::Uninitialized { .. } | ShardState::Failed => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Declares that exactly `objects_count` objects will be written.
    ///
    /// May be called again to change the count as long as nothing has been
    /// written yet. Zero is allowed and finalizes to an empty shard.
    pub fn prepare(&mut self, objects_count: u64) -> Result<()> {
        let state = std::mem::replace(&mut self.state, ShardState::Failed);
        self.state = match state {
            ShardState::Uninitialized { file } => ShardState::Writing {
                log: ObjectLog::new(
                    file,
                    ShardHeader::SIZE as u64,
                    self.options.writer_buffer_size,
                ),
                staging: IndexStaging::new(objects_count),
            },
            ShardState::Writing { log, staging } if staging.written() == 0 => {
                debug_assert_eq!(log.size(), 0);
                ShardState::Writing {
                    log,
                    staging: IndexStaging::new(objects_count),
                }
            }
            other => return Err(self.reject(other, "prepare")),
        };
        debug!(objects_count, "shard prepared");
        Ok(())
    }

    /// Appends `payload` under `key`.
    ///
    /// # Errors
    ///
    /// [`ShardError::InvalidKeyLength`] if `key` is not exactly the configured
    /// width, [`ShardError::DuplicateKey`] if it is already staged,
    /// [`ShardError::CapacityExceeded`] once the prepared count has been
    /// written and [`ShardError::InvalidState`] outside the writing phase.
    /// An I/O failure leaves the shard [`Failed`](ShardState::Failed).
    pub fn write_object(&mut self, key: &[u8], payload: &[u8]) -> Result<()> {
        self.check_key(key)?;
        let ShardState::Writing { log, staging } = &mut self.state else {
            return Err(self.invalid_state("write an object"));
        };
        staging.check(key)?;
        let location = match log.append(payload) {
            Ok(location) => location,
            Err(e) => {
                self.state = ShardState::Failed;
                return Err(e);
            }
        };
        staging.stage(key, location)
    }

    /// Removes a staged object before finalization.
    ///
    /// The payload bytes stay in the object log but become unreachable. The
    /// capacity slot used by the write is not given back.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.check_key(key)?;
        let ShardState::Writing { log, staging } = &mut self.state else {
            return Err(self.invalid_state("delete an object"));
        };
        let location = staging.remove(key)?;
        log.mark_unreachable(location);
        debug!(
            offset = location.offset,
            size = location.size,
            "staged object deleted"
        );
        Ok(())
    }

    /// Builds the perfect hash, writes the index, hash and header sections
    /// and switches the shard to read-only.
    ///
    /// # Errors
    ///
    /// [`ShardError::CountMismatch`] if fewer objects were written than
    /// prepared; the shard stays writable in that case.
    /// [`ShardError::HashConstruction`] or an I/O error leave the shard
    /// [`Failed`](ShardState::Failed); build a new one from scratch.
    pub fn finalize(&mut self) -> Result<ShardInfo> {
        let state = std::mem::replace(&mut self.state, ShardState::Failed);
        let (log, staging) = match state {
            ShardState::Writing { log, staging } if staging.written() == staging.capacity() => {
                (log, staging)
            }
            ShardState::Writing { log, staging } => {
                let error = ShardError::CountMismatch {
                    expected: staging.capacity(),
                    actual: staging.written(),
                };
                self.state = ShardState::Writing { log, staging };
                return Err(error);
            }
            other => return Err(self.reject(other, "finalize")),
        };

        let unreachable = log.unreachable();
        let read = Self::write_sections(&self.options, log, staging)?;
        let info = read.info();
        info!(
            objects = read.header.objects_count,
            objects_size = read.header.objects_size,
            unreachable,
            file_length = info.file_length,
            "shard finalized"
        );
        self.state = ShardState::ReadOnly(read);
        Ok(info)
    }

    fn write_sections(
        options: &ShardOptions,
        log: ObjectLog<F>,
        staging: IndexStaging,
    ) -> Result<ReadOnlyShard<F, H::Function>> {
        let objects = ObjectLogView {
            position: log.position(),
            size: log.size(),
        };

        let function = {
            let keys: Vec<&[u8]> = staging.keys().collect();
            H::build(&options.hash_config, &keys)?
        };
        let table = staging.reorder(&function)?;
        let file = log.finish()?;

        let index_position = objects.position + objects.size;
        let index_size = table.len() as u64 * entry_size(options.key_width) as u64;
        let hash_position = index_position + index_size;

        let config = rmp_serde::to_vec(&options.hash_config).map_err(|e| {
            ShardError::HashConstruction(format!("failed to serialize hash config: {}", e))
        })?;
        let function_data = function.to_bytes()?;
        let hash_size = (4 + config.len() + function_data.len()) as u64;

        {
            let mut sink = BufWriter::with_capacity(
                options.writer_buffer_size,
                ShardWriterWrapper::new(&file, index_position),
            );
            table.write_to(&mut sink)?;
            sink.write_all(&(config.len() as u32).to_be_bytes())?;
            sink.write_all(&config)?;
            sink.write_all(&function_data)?;
            let wrapper = sink.into_inner().map_err(|e| e.into_error())?;
            debug_assert_eq!(wrapper.offset(), hash_position + hash_size);
        }

        let header = ShardHeader {
            version: FORMAT_VERSION,
            key_width: options.key_width as u32,
            objects_count: table.len() as u64,
            objects_position: objects.position,
            objects_size: objects.size,
            index_position,
            index_size,
            hash_position,
            hash_size,
        };
        file.write_all_at(&header.serialize(), 0)?;
        file.sync()?;

        Ok(ReadOnlyShard {
            file,
            header,
            hash_config: options.hash_config.clone(),
            function,
            table,
            objects,
        })
    }

    /// Loads a finalized shard, validating its header and every section.
    pub fn load_with_options(file: F, options: ShardOptions) -> Result<Self> {
        options.validate()?;
        let read = Self::read_sections(&options, file).inspect_err(|e| {
            warn!(error = %e, "failed to load shard");
        })?;
        info!(
            objects = read.header.objects_count,
            version = read.header.version,
            "shard loaded"
        );
        Ok(Shard {
            options,
            state: ShardState::ReadOnly(read),
            phantom: PhantomData,
        })
    }

    fn read_sections(options: &ShardOptions, file: F) -> Result<ReadOnlyShard<F, H::Function>> {
        let file_length = file.stored_length()?;
        if file_length < ShardHeader::SIZE as u64 {
            return Err(ShardError::corrupt(format!(
                "file of {} bytes is shorter than the header",
                file_length
            )));
        }

        let header = file.read_exact_at(0, ShardHeader::SIZE as u64, |data| Ok(data.to_vec()))?;
        let header = ShardHeader::deserialize(&header)?;
        header.validate(file_length)?;
        if header.key_width as usize != options.key_width {
            return Err(ShardError::corrupt(format!(
                "shard stores {}-byte keys, expected {}",
                header.key_width, options.key_width
            )));
        }

        let table = file.read_exact_at(header.index_position, header.index_size, |data| {
            Ok(data.to_vec())
        })?;
        let table = IndexTable::parse(&table, options.key_width, header.objects_count)?;

        let (hash_config, function) =
            file.read_exact_at(header.hash_position, header.hash_size, |data| {
                Ok(Self::parse_hash_section(data))
            })??;
        if function.len() != header.objects_count {
            return Err(ShardError::corrupt(format!(
                "hash function covers {} keys, header records {}",
                function.len(),
                header.objects_count
            )));
        }
        table.verify(&function)?;

        Ok(ReadOnlyShard {
            file,
            header,
            hash_config,
            function,
            table,
            objects: ObjectLogView {
                position: header.objects_position,
                size: header.objects_size,
            },
        })
    }

    fn parse_hash_section(data: &[u8]) -> Result<(ShardHashConfig, H::Function)> {
        if data.len() < 4 {
            return Err(ShardError::corrupt("hash section truncated"));
        }
        let (length, rest) = data.split_at(4);
        let length = u32::from_be_bytes([length[0], length[1], length[2], length[3]]) as usize;
        if length > rest.len() {
            return Err(ShardError::corrupt("hash config length exceeds section"));
        }
        let (config, function) = rest.split_at(length);
        let config: ShardHashConfig = rmp_serde::from_slice(config).map_err(|e| {
            ShardError::corrupt(format!("failed to deserialize hash config: {}", e))
        })?;
        let function = H::load(&config, function).map_err(|e| match e {
            ShardError::HashConstruction(message) => ShardError::Corrupt(message),
            other => other,
        })?;
        Ok((config, function))
    }

    /// Header of a finalized shard.
    pub fn header(&self) -> Option<&ShardHeader> {
        match &self.state {
            ShardState::ReadOnly(read) => Some(&read.header),
            _ => None,
        }
    }

    /// Summary of a finalized shard.
    pub fn info(&self) -> Result<ShardInfo> {
        Ok(self.read_only("describe")?.info())
    }

    /// Locates the object stored under `key`.
    ///
    /// Returns `Ok(None)` for keys that were never written, even when the
    /// perfect hash maps them onto an occupied bucket.
    pub fn find(&self, key: &[u8]) -> Result<Option<ShardLocation>> {
        self.check_key(key)?;
        let read = self.read_only("find")?;
        Ok(read
            .table
            .lookup(&read.function, key)
            .map(|entry| entry.location))
    }

    /// Reads the object stored under `key`.
    pub fn read_object(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(location) = self.find(key)? else {
            return Ok(None);
        };
        let read = self.read_only("read an object")?;
        read.objects.read(&read.file, location).map(Some)
    }

    /// Reads the bytes at `location` of the object log.
    ///
    /// Fails with [`ShardError::OutOfRange`] if the range leaves the section.
    pub fn read_location(&self, location: ShardLocation) -> Result<Vec<u8>> {
        let read = self.read_only("read a location")?;
        read.objects.read(&read.file, location)
    }

    /// Reads several objects, preserving the order of `keys`.
    ///
    /// Found objects are fetched through [`ShardReader::batch_read_at`], so
    /// readers with vectored IO can serve them in one call.
    pub fn batch_read_objects(
        &self,
        keys: impl IntoIterator<Item = impl AsRef<[u8]>>,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let read = self.read_only("read objects")?;
        let mut slots = Vec::new();
        let mut iov = Vec::new();
        for key in keys {
            let key = key.as_ref();
            self.check_key(key)?;
            match read.table.lookup(&read.function, key) {
                Some(entry) => {
                    read.objects.check(entry.location)?;
                    slots.push(Some(iov.len()));
                    iov.push((
                        read.objects.position + entry.location.offset,
                        entry.location.size,
                    ));
                }
                None => slots.push(None),
            }
        }

        let mut payloads = read
            .file
            .batch_read_at(&iov, |_, data| Ok(data.to_vec()))?
            .into_iter()
            .map(Some)
            .collect::<Vec<_>>();
        Ok(slots
            .into_iter()
            .map(|slot| slot.and_then(|index| payloads[index].take()))
            .collect())
    }

    /// Iterates over all `(key, payload)` pairs in bucket order.
    pub fn iter(&self) -> Result<ShardIter<'_, F, H::Function>> {
        let read = self.read_only("iterate")?;
        Ok(ShardIter {
            read,
            entries: read.table.iter(),
        })
    }

    /// Releases the file handle and in-memory index. Never modifies the file.
    pub fn close(self) {
        debug!(state = self.state.name(), "shard closed");
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.options.key_width {
            return Err(ShardError::InvalidKeyLength {
                expected: self.options.key_width,
                actual: key.len(),
            });
        }
        Ok(())
    }

    fn read_only(&self, operation: &'static str) -> Result<&ReadOnlyShard<F, H::Function>> {
        match &self.state {
            ShardState::ReadOnly(read) => Ok(read),
            _ => Err(self.invalid_state(operation)),
        }
    }

    fn invalid_state(&self, operation: &'static str) -> ShardError {
        ShardError::InvalidState {
            operation,
            state: self.state.name(),
        }
    }

    /// Puts `state` back and reports that `operation` is not allowed in it.
    fn reject(&mut self, state: ShardState<F, H::Function>, operation: &'static str) -> ShardError {
        self.state = state;
        self.invalid_state(operation)
    }
}

impl<F: ShardWriter, P> ReadOnlyShard<F, P> {
    fn info(&self) -> ShardInfo {
        ShardInfo {
            header: self.header,
            file_length: self.header.hash_position + self.header.hash_size,
            hash_config: self.hash_config.clone(),
        }
    }
}

impl<F: ShardWriter, H: ShardHashLoader> std::fmt::Debug for Shard<F, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Shard");
        debug
            .field("options", &self.options)
            .field("state", &self.state.name());
        if let ShardState::ReadOnly(read) = &self.state {
            debug.field("header", &read.header);
        }
        debug.finish()
    }
}

/// Iterator over all objects of a finalized [`Shard`], in bucket order.
///
/// Each payload is read from storage when its entry is reached.
pub struct ShardIter<'a, F, P> {
    read: &'a ReadOnlyShard<F, P>,
    entries: std::slice::Iter<'a, crate::IndexEntry>,
}

impl<'a, F: ShardReader, P> Iterator for ShardIter<'a, F, P> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.next()?;
        Some(
            self.read
                .objects
                .read(&self.read.file, entry.location)
                .map(|payload| (entry.key.to_vec(), payload)),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

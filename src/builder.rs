use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::path::Path;

use crate::{
    BBHashLoader, Result, Shard, ShardError, ShardHashConfig, ShardHashLoader, ShardReader,
    ShardWriter,
};

/// Settings shared by the writer and every reader of a family of shards.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardOptions {
    /// Width in bytes of every key; shorter or longer keys are rejected.
    pub key_width: usize,
    /// Perfect hash construction recorded in the file.
    pub hash_config: ShardHashConfig,
    /// Capacity of the buffered writer used while streaming sections.
    pub writer_buffer_size: usize,
}

impl ShardOptions {
    pub fn validate(&self) -> Result<()> {
        if self.key_width == 0 || self.key_width > u32::MAX as usize {
            return Err(ShardError::InvalidOptions(format!(
                "key width {} outside [1, {}]",
                self.key_width,
                u32::MAX
            )));
        }
        if self.writer_buffer_size == 0 {
            return Err(ShardError::InvalidOptions(
                "writer buffer size is zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self {
            key_width: 32,
            hash_config: ShardHashConfig::default(),
            writer_buffer_size: 16 << 20, // 16 MiB
        }
    }
}

/// Configures and opens [`Shard`]s.
///
/// The loader type parameter `H` allows swapping in custom
/// [`ShardHashLoader`] implementations; it must match between the process
/// that writes a shard and the processes that read it.
///
/// ```
/// use mphshard::ShardBuilder;
///
/// # fn main() -> mphshard::Result<()> {
/// let dir = tempfile::tempdir()?;
/// let path = dir.path().join("objects.shard");
///
/// let mut shard = ShardBuilder::default()
///     .with_key_width(4)
///     .with_hash_seed(7)
///     .create(&path)?;
/// shard.prepare(2)?;
/// shard.write_object(b"key1", b"first")?;
/// shard.write_object(b"key2", b"second")?;
/// shard.finalize()?;
///
/// let shard = ShardBuilder::default().with_key_width(4).open(&path)?;
/// assert_eq!(shard.read_object(b"key2")?, Some(b"second".to_vec()));
/// assert_eq!(shard.read_object(b"key3")?, None);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ShardBuilder<H: ShardHashLoader = BBHashLoader> {
    options: ShardOptions,
    phantom: PhantomData<H>,
}

impl<H: ShardHashLoader> Default for ShardBuilder<H> {
    fn default() -> Self {
        Self {
            options: ShardOptions::default(),
            phantom: PhantomData,
        }
    }
}

impl<H: ShardHashLoader> Clone for ShardBuilder<H> {
    fn clone(&self) -> Self {
        Self {
            options: self.options.clone(),
            phantom: PhantomData,
        }
    }
}

impl ShardBuilder {
    /// Creates a new default shard builder with the default hash loader.
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        <Self as Default>::default()
    }
}

impl<H: ShardHashLoader> ShardBuilder<H> {
    /// Replaces all options at once.
    pub fn with_options(mut self, options: ShardOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the fixed key width shared by writers and readers.
    pub fn with_key_width(mut self, width: usize) -> Self {
        self.options.key_width = width;
        self
    }

    /// Replaces the entire perfect hash configuration.
    ///
    /// For most use cases, [`with_hash_seed`](Self::with_hash_seed) is
    /// sufficient to override just the seed parameter.
    pub fn with_hash_config(mut self, config: ShardHashConfig) -> Self {
        self.options.hash_config = config;
        self
    }

    /// Overrides the seed of the perfect hash construction.
    pub fn with_hash_seed(mut self, seed: u64) -> Self {
        self.options.hash_config.parameters["seed"] = serde_json::json!(seed);
        self
    }

    /// Adjusts the capacity of the buffered writer used while streaming data.
    pub fn with_writer_buffer_size(mut self, size: usize) -> Self {
        self.options.writer_buffer_size = size;
        self
    }

    pub fn options(&self) -> &ShardOptions {
        &self.options
    }

    /// Wraps `file` in a shard ready for [`prepare`](Shard::prepare).
    ///
    /// The file must support both positioned writes and reads, since a
    /// finalized shard serves lookups from the same handle.
    pub fn new_shard<F: ShardReader + ShardWriter>(&self, file: F) -> Result<Shard<F, H>> {
        Shard::with_options(file, self.options.clone())
    }

    /// Loads a finalized shard from `file`.
    pub fn load<F: ShardReader + ShardWriter>(&self, file: F) -> Result<Shard<F, H>> {
        Shard::load_with_options(file, self.options.clone())
    }

    /// Creates (or truncates) the file at `path` and wraps it in a new shard.
    pub fn create(&self, path: impl AsRef<Path>) -> Result<Shard<File, H>> {
        self.options.validate()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        self.new_shard(file)
    }

    /// Opens the finalized shard at `path` for reading.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<Shard<File, H>> {
        let file = File::open(path)?;
        self.load(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options() {
        let builder = ShardBuilder::default()
            .with_key_width(20)
            .with_hash_seed(99)
            .with_writer_buffer_size(1 << 10);
        assert_eq!(builder.options().key_width, 20);
        assert_eq!(builder.options().hash_config.parameters["seed"], 99);
        assert_eq!(builder.options().hash_config.name, "bbhash");
        assert_eq!(builder.options().writer_buffer_size, 1024);

        let options = builder.options().clone();
        let rebuilt = ShardBuilder::default().with_options(options.clone());
        assert_eq!(rebuilt.options(), &options);
    }

    #[test]
    fn test_zero_key_width_rejected() {
        let file = crate::tests::MemoryFile::default();
        ShardBuilder::default()
            .with_key_width(0)
            .new_shard(&file)
            .unwrap_err();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.shard");
        let result = ShardBuilder::default().with_key_width(0).create(&path);
        assert!(matches!(result, Err(ShardError::InvalidOptions(_))));
        assert!(!path.exists());
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShardBuilder::default().open(dir.path().join("missing.shard"));
        assert!(matches!(result, Err(ShardError::Io(_))));
    }
}

use std::io::Result;

/// Trait representing positional writers suitable for shard serialization.
///
/// Writers must support writing arbitrary byte slices at fixed offsets without
/// altering shared state.
pub trait ShardWriter {
    /// Writes `data` at the given absolute `offset`.
    fn write_all_at(&self, data: &[u8], offset: u64) -> Result<()>;

    /// Makes previously written data durable.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

impl ShardWriter for std::fs::File {
    #[cfg(unix)]
    fn write_all_at(&self, data: &[u8], offset: u64) -> Result<()> {
        std::os::unix::fs::FileExt::write_all_at(self, data, offset)
    }

    #[cfg(windows)]
    fn write_all_at(&self, mut data: &[u8], mut offset: u64) -> Result<()> {
        use std::os::windows::fs::FileExt;

        while !data.is_empty() {
            let written = self.seek_write(data, offset)?;
            if written == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ));
            }
            data = &data[written..];
            offset += written as u64;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.sync_all()
    }
}

/// Thin adapter implementing [`std::io::Write`] in terms of [`ShardWriter`].
///
/// Each write lands at the next offset after the previous one, starting from
/// the offset given to [`new`](Self::new). Wrap it in a `BufWriter` to batch
/// small writes.
#[derive(Debug)]
pub struct ShardWriterWrapper<W: ShardWriter> {
    inner: W,
    offset: u64,
}

impl<W: ShardWriter> ShardWriterWrapper<W> {
    pub fn new(inner: W, offset: u64) -> Self {
        Self { inner, offset }
    }

    /// Absolute offset of the next byte to be written.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: ShardWriter> std::io::Write for ShardWriterWrapper<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write_all_at(buf, self.offset)?;
        self.offset += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: ShardWriter + ?Sized> ShardWriter for &T {
    fn write_all_at(&self, data: &[u8], offset: u64) -> Result<()> {
        (**self).write_all_at(data, offset)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

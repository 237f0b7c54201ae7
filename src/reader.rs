use std::io::Result;

/// Trait abstracting read access to shard files.
///
/// Implementations must support positional reads without mutating shared
/// state, so a finalized shard can serve many threads through one handle.
pub trait ShardReader {
    /// Reads `length` bytes starting at `offset` and forwards them to `f`.
    ///
    /// Implementations should return an error whenever the requested range
    /// cannot be satisfied in full.
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>;

    /// Total length in bytes of the underlying storage.
    fn stored_length(&self) -> Result<u64>;

    /// Reads multiple ranges in sequence, delegating to [`read_exact_at`](Self::read_exact_at).
    ///
    /// Override this method to take advantage of vectored IO when available.
    fn batch_read_at<F, R>(&self, iov: &[(u64, u64)], f: F) -> Result<Vec<R>>
    where
        F: Fn(usize, &[u8]) -> Result<R>,
    {
        let mut results = Vec::with_capacity(iov.len());
        for (index, &(offset, length)) in iov.iter().enumerate() {
            if length == 0 {
                results.push(f(index, &[])?);
            } else {
                let result = self.read_exact_at(offset, length, |data| f(index, data))?;
                results.push(result);
            }
        }
        Ok(results)
    }
}

impl ShardReader for std::fs::File {
    #[cfg(unix)]
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        let mut buffer = vec![0u8; length as usize];
        std::os::unix::fs::FileExt::read_exact_at(self, &mut buffer, offset)?;
        f(&buffer)
    }

    #[cfg(windows)]
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        use std::os::windows::fs::FileExt;

        let mut buffer = vec![0u8; length as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            let bytes = self.seek_read(&mut buffer[filled..], offset + filled as u64)?;
            if bytes == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "Failed to read enough bytes",
                ));
            }
            filled += bytes;
        }
        f(&buffer)
    }

    fn stored_length(&self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }
}

impl<T: ShardReader + ?Sized> ShardReader for &T {
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        (**self).read_exact_at(offset, length, f)
    }

    fn stored_length(&self) -> Result<u64> {
        (**self).stored_length()
    }
}

use std::io::{BufWriter, Write};

use crate::{Result, ShardError, ShardLocation, ShardReader, ShardWriter, ShardWriterWrapper};

/// Append-only writer for the object log section of a shard under construction.
///
/// Payloads are concatenated without framing; their offsets and sizes are
/// carried by the index table instead.
#[derive(Debug)]
pub struct ObjectLog<W: ShardWriter> {
    sink: BufWriter<ShardWriterWrapper<W>>,
    position: u64,
    size: u64,
    unreachable: u64,
}

impl<W: ShardWriter> ObjectLog<W> {
    /// Starts a log at absolute file offset `position`.
    pub fn new(writer: W, position: u64, buffer_size: usize) -> Self {
        Self {
            sink: BufWriter::with_capacity(buffer_size, ShardWriterWrapper::new(writer, position)),
            position,
            size: 0,
            unreachable: 0,
        }
    }

    /// Appends `payload` and returns its location relative to the section start.
    pub fn append(&mut self, payload: &[u8]) -> Result<ShardLocation> {
        let offset = self.size;
        self.sink.write_all(payload)?;
        self.size += payload.len() as u64;
        Ok(ShardLocation {
            offset,
            size: payload.len() as u64,
        })
    }

    /// Records that the bytes at `location` are no longer referenced.
    pub fn mark_unreachable(&mut self, location: ShardLocation) {
        self.unreachable += location.size;
    }

    /// Absolute offset of the section.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes appended so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes appended by objects that were later deleted.
    pub fn unreachable(&self) -> u64 {
        self.unreachable
    }

    /// Flushes buffered payloads and hands back the underlying writer.
    pub fn finish(self) -> Result<W> {
        let wrapper = self.sink.into_inner().map_err(|e| e.into_error())?;
        debug_assert_eq!(wrapper.offset(), self.position + self.size);
        Ok(wrapper.into_inner())
    }
}

/// Read-side view of a finalized object log section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectLogView {
    pub position: u64,
    pub size: u64,
}

impl ObjectLogView {
    /// Fails with [`ShardError::OutOfRange`] unless `location` lies inside the section.
    pub fn check(&self, location: ShardLocation) -> Result<()> {
        match location.offset.checked_add(location.size) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(ShardError::OutOfRange {
                offset: location.offset,
                size: location.size,
                limit: self.size,
            }),
        }
    }

    /// Reads exactly `location.size` bytes of the payload at `location`.
    pub fn read<R: ShardReader>(&self, reader: &R, location: ShardLocation) -> Result<Vec<u8>> {
        self.check(location)?;
        if location.size == 0 {
            return Ok(Vec::new());
        }
        let data = reader.read_exact_at(
            self.position + location.offset,
            location.size,
            |data| Ok(data.to_vec()),
        )?;
        Ok(data)
    }
}

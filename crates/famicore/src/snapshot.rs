//! Save-state byte stream
//!
//! Snapshots are a flat little-endian byte stream of versioned records:
//! each component writes a version byte followed by its registers, and
//! restores by reading the same sequence back. The container carries no
//! framing; producer and consumer agree on the record order.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot ended early")]
    UnexpectedEof,
    #[error("unsupported snapshot record version {0}")]
    UnsupportedVersion(u8),
    #[error("snapshot data is corrupt")]
    Corrupt,
}

/// Accumulates a snapshot stream.
#[derive(Debug, Default)]
pub struct SnapshotWriter {
    buf: Vec<u8>,
}

impl SnapshotWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads a snapshot stream back in record order.
#[derive(Debug)]
pub struct SnapshotReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SnapshotReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn get_u8(&mut self) -> Result<u8, SnapshotError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(SnapshotError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn get_u32(&mut self) -> Result<u32, SnapshotError> {
        let bytes = self.get_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], SnapshotError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(SnapshotError::UnexpectedEof)?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

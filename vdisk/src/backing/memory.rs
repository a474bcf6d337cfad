//! Memory-backed store.
//!
//! The device is split into fixed-size chunks that are allocated on first
//! write and zero-filled, so a freshly attached device costs almost nothing
//! until it is touched. Untouched chunks read back as zeros, and writing
//! zeros into an untouched chunk allocates nothing. With `reserve` every
//! chunk is allocated up front instead, which moves allocation failures from
//! I/O time to creation time.
//!
//! All allocation is fallible (`try_reserve_exact`): running out of memory
//! yields an error, never an abort.

use std::io;

use crate::backing::{BackingKind, BackingStore, check_bounds};
use crate::error::{Result, VdiskError};

/// Heap memory split into lazily allocated chunks.
#[derive(Debug)]
pub struct MemoryBacking {
    capacity: u64,
    chunk_size: u64,
    chunks: Vec<Option<Box<[u8]>>>,
    /// Sum of the lengths of all allocated chunks.
    resident: u64,
}

impl MemoryBacking {
    /// Creates a memory store of `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`VdiskError::InvalidParameter`] for a zero capacity or a
    /// chunk size that is not a power of two, and
    /// [`VdiskError::ResourceExhausted`] if the chunk table (or, with
    /// `reserve`, any chunk) cannot be allocated.
    pub fn new(capacity: u64, chunk_size: u32, reserve: bool) -> Result<Self> {
        if capacity == 0 || !chunk_size.is_power_of_two() {
            return Err(VdiskError::invalid(format!(
                "memory store needs a non-zero capacity and power-of-two chunk size (got {capacity}, {chunk_size})"
            )));
        }

        let chunk_size = u64::from(chunk_size);
        let count = usize::try_from(capacity.div_ceil(chunk_size)).map_err(|_| {
            VdiskError::ResourceExhausted {
                reason: format!("{capacity} bytes cannot be addressed on this platform"),
            }
        })?;

        let mut chunks = Vec::new();
        chunks
            .try_reserve_exact(count)
            .map_err(|e| VdiskError::ResourceExhausted {
                reason: format!("chunk table for {count} chunks: {e}"),
            })?;
        chunks.resize_with(count, || None);

        let mut store = Self {
            capacity,
            chunk_size,
            chunks,
            resident: 0,
        };

        if reserve {
            for index in 0..count {
                let len = store.chunk_len(index);
                let chunk = alloc_chunk(len).map_err(|e| VdiskError::ResourceExhausted {
                    reason: format!("reserving {capacity} bytes: {e}"),
                })?;
                store.chunks[index] = Some(chunk);
                store.resident += len as u64;
            }
        }

        Ok(store)
    }

    /// Number of chunks currently allocated.
    pub fn allocated_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    /// Length of chunk `index`; only the last chunk can be short.
    #[allow(clippy::cast_possible_truncation)] // bounded by chunk_size, a u32
    fn chunk_len(&self, index: usize) -> usize {
        let start = index as u64 * self.chunk_size;
        (self.capacity - start).min(self.chunk_size) as usize
    }

    fn spans(&self, offset: u64, len: u64) -> Spans {
        Spans {
            chunk_size: self.chunk_size,
            pos: offset,
            end: offset + len,
            buf: 0,
        }
    }
}

impl BackingStore for MemoryBacking {
    fn kind(&self) -> BackingKind {
        BackingKind::Memory
    }

    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn resident_bytes(&self) -> u64 {
        self.resident
    }

    fn read_into(&mut self, dest: &mut [u8], offset: u64) -> io::Result<()> {
        check_bounds(offset, dest.len() as u64, self.capacity)?;

        for span in self.spans(offset, dest.len() as u64) {
            let out = &mut dest[span.buf..span.buf + span.len];
            match &self.chunks[span.chunk] {
                Some(chunk) => out.copy_from_slice(&chunk[span.within..span.within + span.len]),
                None => out.fill(0),
            }
        }
        Ok(())
    }

    fn write_from(&mut self, src: &[u8], offset: u64) -> io::Result<()> {
        check_bounds(offset, src.len() as u64, self.capacity)?;

        for span in self.spans(offset, src.len() as u64) {
            let data = &src[span.buf..span.buf + span.len];
            let chunk_len = self.chunk_len(span.chunk);
            let slot = &mut self.chunks[span.chunk];
            if slot.is_none() {
                if data.iter().all(|&b| b == 0) {
                    continue;
                }
                *slot = Some(alloc_chunk(chunk_len)?);
                self.resident += chunk_len as u64;
            }
            if let Some(chunk) = slot {
                chunk[span.within..span.within + span.len].copy_from_slice(data);
            }
        }
        Ok(())
    }

    fn discard(&mut self, offset: u64, len: u64) -> io::Result<()> {
        check_bounds(offset, len, self.capacity)?;

        for span in self.spans(offset, len) {
            let whole = span.within == 0 && span.len == self.chunk_len(span.chunk);
            let slot = &mut self.chunks[span.chunk];
            if whole {
                if slot.take().is_some() {
                    self.resident -= span.len as u64;
                }
            } else if let Some(chunk) = slot {
                chunk[span.within..span.within + span.len].fill(0);
            }
        }
        Ok(())
    }

    fn release(mut self: Box<Self>) -> io::Result<()> {
        self.chunks.clear();
        self.resident = 0;
        Ok(())
    }
}

/// Allocates a zeroed chunk without aborting on allocation failure.
fn alloc_chunk(len: usize) -> io::Result<Box<[u8]>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;
    buf.resize(len, 0);
    Ok(buf.into_boxed_slice())
}

/// A piece of an access that falls inside a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    chunk: usize,
    /// Offset inside the chunk.
    within: usize,
    len: usize,
    /// Offset inside the caller's buffer.
    buf: usize,
}

/// Splits `[pos, end)` at chunk boundaries.
struct Spans {
    chunk_size: u64,
    pos: u64,
    end: u64,
    buf: usize,
}

impl Iterator for Spans {
    type Item = Span;

    #[allow(clippy::cast_possible_truncation)] // offsets were bounds-checked against an allocated table
    fn next(&mut self) -> Option<Span> {
        if self.pos >= self.end {
            return None;
        }
        let within = self.pos % self.chunk_size;
        let len = (self.chunk_size - within).min(self.end - self.pos);
        let span = Span {
            chunk: (self.pos / self.chunk_size) as usize,
            within: within as usize,
            len: len as usize,
            buf: self.buf,
        };
        self.pos += len;
        self.buf += span.len;
        Some(span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: u32 = 4096;

    #[test]
    fn test_fresh_store_reads_zeros_without_allocating() {
        let mut store = MemoryBacking::new(64 * 1024, CHUNK, false).unwrap();
        let mut buf = vec![0xFFu8; 10_000];
        store.read_into(&mut buf, 1234).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(store.allocated_chunks(), 0);
        assert_eq!(store.resident_bytes(), 0);
    }

    #[test]
    fn test_write_read_across_chunk_boundary() {
        let mut store = MemoryBacking::new(64 * 1024, CHUNK, false).unwrap();
        let data: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8 + 1).collect();
        store.write_from(&data, 3000).unwrap();
        assert_eq!(store.allocated_chunks(), 3);

        let mut back = vec![0u8; data.len()];
        store.read_into(&mut back, 3000).unwrap();
        assert_eq!(back, data);

        // Neighbouring bytes stay zero.
        let mut edge = [0xFFu8; 2];
        store.read_into(&mut edge, 2999).unwrap();
        assert_eq!(edge[0], 0);
        assert_eq!(edge[1], data[0]);
    }

    #[test]
    fn test_zero_writes_do_not_allocate() {
        let mut store = MemoryBacking::new(64 * 1024, CHUNK, false).unwrap();
        store.write_from(&[0u8; 8192], 0).unwrap();
        assert_eq!(store.allocated_chunks(), 0);

        // Zeros into an allocated chunk must still overwrite.
        store.write_from(&[7u8; 16], 100).unwrap();
        store.write_from(&[0u8; 16], 100).unwrap();
        let mut buf = [1u8; 16];
        store.read_into(&mut buf, 100).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn test_discard_frees_whole_chunks_and_zeroes_partials() {
        let mut store = MemoryBacking::new(16 * 1024, CHUNK, false).unwrap();
        store.write_from(&vec![0xAB; 16 * 1024], 0).unwrap();
        assert_eq!(store.allocated_chunks(), 4);

        // Covers the tail of chunk 0, all of chunk 1 and the head of chunk 2.
        store.discard(2048, 8192).unwrap();
        assert_eq!(store.allocated_chunks(), 3);
        assert_eq!(store.resident_bytes(), 3 * 4096);

        let mut buf = vec![0u8; 16 * 1024];
        store.read_into(&mut buf, 0).unwrap();
        assert!(buf[..2048].iter().all(|&b| b == 0xAB));
        assert!(buf[2048..10_240].iter().all(|&b| b == 0));
        assert!(buf[10_240..].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_reserve_allocates_everything() {
        let store = MemoryBacking::new(10_000, CHUNK, true).unwrap();
        assert_eq!(store.allocated_chunks(), 3);
        assert_eq!(store.resident_bytes(), 10_000);
    }

    #[test]
    fn test_short_last_chunk() {
        let mut store = MemoryBacking::new(5120, CHUNK, false).unwrap();
        store.write_from(&[9u8; 1024], 4096).unwrap();
        assert_eq!(store.resident_bytes(), 1024);
        assert!(store.write_from(&[9u8; 2], 5119).is_err());
    }

    #[test]
    fn test_out_of_bounds_is_an_error() {
        let mut store = MemoryBacking::new(4096, CHUNK, false).unwrap();
        let mut buf = [0u8; 8];
        let err = store.read_into(&mut buf, 4092).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(store.discard(0, 4097).is_err());
    }

    #[test]
    fn test_rejects_zero_capacity() {
        assert!(MemoryBacking::new(0, CHUNK, false).is_err());
        assert!(MemoryBacking::new(4096, 3000, false).is_err());
    }

    #[test]
    fn test_spans_split_at_boundaries() {
        let store = MemoryBacking::new(16 * 1024, CHUNK, false).unwrap();
        let spans: Vec<Span> = store.spans(4000, 5000).collect();
        assert_eq!(
            spans,
            vec![
                Span { chunk: 0, within: 4000, len: 96, buf: 0 },
                Span { chunk: 1, within: 0, len: 4096, buf: 96 },
                Span { chunk: 2, within: 0, len: 808, buf: 4192 },
            ]
        );
    }
}

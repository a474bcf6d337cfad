//! Swap-backed store.
//!
//! An anonymous private mapping of the full device size. The OS pager hands
//! out zero-filled pages on first touch and may page them out to swap under
//! memory pressure, so reads and writes can block on page-in. Unmapping on
//! release returns every page, resident or swapped, to the system.
//!
//! Resident bytes count the pages this store has written. Reading an
//! untouched page does not materialize it, and discard only zeroes pages
//! that were written before.

use std::io;
use std::ops::Range;

use memmap2::MmapMut;

use crate::backing::{BackingKind, BackingStore, check_bounds};
use crate::error::{Result, VdiskError};
use crate::mapper::PAGE_SIZE;

/// Anonymous pageable memory.
#[derive(Debug)]
pub struct SwapBacking {
    map: MmapMut,
    /// One flag per page, set once the page has been written.
    touched: Vec<bool>,
    /// Sum of the lengths of all touched pages.
    resident: u64,
}

impl SwapBacking {
    /// Maps `capacity` bytes of anonymous memory.
    ///
    /// Only address space is reserved here; pages are supplied on demand.
    ///
    /// # Errors
    ///
    /// Returns [`VdiskError::InvalidParameter`] for a zero capacity and
    /// [`VdiskError::ResourceExhausted`] if the mapping cannot be created.
    pub fn new(capacity: u64) -> Result<Self> {
        if capacity == 0 {
            return Err(VdiskError::invalid("swap store needs a non-zero capacity"));
        }
        let len = usize::try_from(capacity).map_err(|_| VdiskError::ResourceExhausted {
            reason: format!("{capacity} bytes cannot be mapped on this platform"),
        })?;
        let map = MmapMut::map_anon(len).map_err(|e| VdiskError::ResourceExhausted {
            reason: format!("mapping {capacity} bytes of swap-backed memory: {e}"),
        })?;

        let pages = len.div_ceil(PAGE_SIZE);
        let mut touched = Vec::new();
        touched
            .try_reserve_exact(pages)
            .map_err(|e| VdiskError::ResourceExhausted {
                reason: format!("page table for {pages} pages: {e}"),
            })?;
        touched.resize(pages, false);

        Ok(Self {
            map,
            touched,
            resident: 0,
        })
    }

    #[allow(clippy::cast_possible_truncation)] // bounds-checked against a usize-sized mapping
    fn range(&self, offset: u64, len: u64) -> io::Result<Range<usize>> {
        let end = check_bounds(offset, len, self.map.len() as u64)?;
        Ok(offset as usize..end as usize)
    }

    /// Indices of the pages overlapping `range`.
    fn pages(range: &Range<usize>) -> Range<usize> {
        if range.is_empty() {
            return 0..0;
        }
        range.start / PAGE_SIZE..range.end.div_ceil(PAGE_SIZE)
    }

    /// The part of page `page` that lies inside `range`.
    fn clip(page: usize, range: &Range<usize>) -> Range<usize> {
        let start = (page * PAGE_SIZE).max(range.start);
        let end = ((page + 1) * PAGE_SIZE).min(range.end);
        start..end
    }
}

impl BackingStore for SwapBacking {
    fn kind(&self) -> BackingKind {
        BackingKind::Swap
    }

    fn capacity_bytes(&self) -> u64 {
        self.map.len() as u64
    }

    fn resident_bytes(&self) -> u64 {
        self.resident
    }

    fn read_into(&mut self, dest: &mut [u8], offset: u64) -> io::Result<()> {
        let range = self.range(offset, dest.len() as u64)?;
        dest.copy_from_slice(&self.map[range]);
        Ok(())
    }

    fn write_from(&mut self, src: &[u8], offset: u64) -> io::Result<()> {
        let range = self.range(offset, src.len() as u64)?;
        for page in Self::pages(&range) {
            if !self.touched[page] {
                self.touched[page] = true;
                let page_end = ((page + 1) * PAGE_SIZE).min(self.map.len());
                self.resident += (page_end - page * PAGE_SIZE) as u64;
            }
        }
        self.map[range].copy_from_slice(src);
        Ok(())
    }

    fn discard(&mut self, offset: u64, len: u64) -> io::Result<()> {
        let range = self.range(offset, len)?;
        // Untouched pages already read as zeros; writing them would fault them in.
        for page in Self::pages(&range) {
            if self.touched[page] {
                let part = Self::clip(page, &range);
                self.map[part].fill(0);
            }
        }
        Ok(())
    }

    fn release(self: Box<Self>) -> io::Result<()> {
        // Dropping the mapping unmaps it.
        drop(self.map);
        Ok(())
    }
}

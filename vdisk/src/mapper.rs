//! Page mapper for scatter/gather request buffers.
//!
//! Request buffers arrive as an [`SgList`]: caller-owned page segments that
//! are not guaranteed to be contiguous. Backing stores want one contiguous
//! byte window. [`with_mapped_window`] bridges the two for exactly the
//! duration of a closure:
//!
//! - a single-segment list already is contiguous and is lent as-is
//! - a multi-segment list is gathered into a scoped bounce window that is
//!   freed on every exit path, including unwinding
//!
//! For reads the window is scattered back into the segments only when the
//! closure succeeds; a failed or panicking read leaves a multi-segment list
//! untouched. Nothing handed to the closure can outlive the call.

use std::io;

/// Default segment size used by [`SgList::zeroed`] and [`SgList::from_bytes`].
pub const PAGE_SIZE: usize = 4096;

/// A scatter/gather buffer descriptor: an ordered list of byte segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgList {
    segments: Vec<Vec<u8>>,
}

impl SgList {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// A zero-filled list of `len` bytes in page-sized segments.
    pub fn zeroed(len: usize) -> Self {
        let mut segments = Vec::with_capacity(len.div_ceil(PAGE_SIZE));
        let mut left = len;
        while left > 0 {
            let step = left.min(PAGE_SIZE);
            segments.push(vec![0u8; step]);
            left -= step;
        }
        Self { segments }
    }

    /// Copies `data` into page-sized segments.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            segments: data.chunks(PAGE_SIZE).map(<[u8]>::to_vec).collect(),
        }
    }

    /// Wraps caller-provided segments of arbitrary sizes. Empty segments are dropped.
    pub fn from_segments(segments: Vec<Vec<u8>>) -> Self {
        Self {
            segments: segments.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    /// Total length in bytes.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    /// Returns true if the list holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The segments in order.
    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    /// Concatenates all segments.
    pub fn to_vec(&self) -> Vec<u8> {
        self.segments.concat()
    }

    /// Gives the segments back to the caller.
    pub fn into_segments(self) -> Vec<Vec<u8>> {
        self.segments
    }
}

/// Which way data moves through a mapped window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapDirection {
    /// The window is filled from the segments before the closure runs (writes).
    ToDevice,
    /// The window is copied into the segments after the closure runs (reads).
    FromDevice,
}

/// Runs `f` over a contiguous view of `sg`.
///
/// # Errors
///
/// Returns [`io::ErrorKind::OutOfMemory`] if a bounce window is needed and
/// cannot be allocated; `f` is not called in that case. Otherwise returns
/// whatever `f` returns.
pub fn with_mapped_window<T>(
    sg: &mut SgList,
    direction: MapDirection,
    f: impl FnOnce(&mut [u8]) -> io::Result<T>,
) -> io::Result<T> {
    if let [single] = sg.segments.as_mut_slice() {
        return f(single.as_mut_slice());
    }

    let mut window = BounceWindow::map(sg, direction)?;
    let value = f(&mut window.buf)?;
    window.commit();
    Ok(value)
}

/// A contiguous copy of a multi-segment list, alive for one mapping.
struct BounceWindow<'a> {
    sg: &'a mut SgList,
    buf: Vec<u8>,
    direction: MapDirection,
}

impl<'a> BounceWindow<'a> {
    fn map(sg: &'a mut SgList, direction: MapDirection) -> io::Result<Self> {
        let len = sg.len();
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;

        match direction {
            MapDirection::ToDevice => {
                for segment in &sg.segments {
                    buf.extend_from_slice(segment);
                }
            }
            MapDirection::FromDevice => buf.resize(len, 0),
        }

        Ok(Self { sg, buf, direction })
    }

    /// Scatters a completed read back into the segments.
    fn commit(self) {
        if self.direction == MapDirection::FromDevice {
            let mut pos = 0;
            for segment in &mut self.sg.segments {
                let end = pos + segment.len();
                segment.copy_from_slice(&self.buf[pos..end]);
                pos = end;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn test_constructors() {
        let sg = SgList::zeroed(10_000);
        assert_eq!(sg.len(), 10_000);
        assert_eq!(sg.segments().len(), 3);
        assert_eq!(sg.segments()[2].len(), 10_000 - 2 * PAGE_SIZE);

        let data: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        let sg = SgList::from_bytes(&data);
        assert_eq!(sg.segments().len(), 2);
        assert_eq!(sg.to_vec(), data);

        let sg = SgList::from_segments(vec![vec![1], vec![], vec![2, 3]]);
        assert_eq!(sg.segments().len(), 2);
        assert_eq!(sg.len(), 3);
        assert!(SgList::new().is_empty());
    }

    #[test]
    fn test_single_segment_is_lent_directly() {
        let mut sg = SgList::from_segments(vec![vec![0u8; 512]]);
        let original = sg.segments()[0].as_ptr();

        let seen = with_mapped_window(&mut sg, MapDirection::FromDevice, |window| {
            window.fill(0x11);
            Ok(window.as_ptr())
        })
        .unwrap();

        assert_eq!(seen, original);
        assert!(sg.to_vec().iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_gather_for_writes() {
        let mut sg = SgList::from_segments(vec![vec![1u8; 3], vec![2u8; 5], vec![3u8; 2]]);
        let seen = with_mapped_window(&mut sg, MapDirection::ToDevice, |window| {
            let copy = window.to_vec();
            window.fill(0xEE);
            Ok(copy)
        })
        .unwrap();

        assert_eq!(seen, vec![1, 1, 1, 2, 2, 2, 2, 2, 3, 3]);
        // Writes never scatter back into the caller's pages.
        assert_eq!(sg.to_vec(), seen);
    }

    #[test]
    fn test_scatter_for_reads() {
        let mut sg = SgList::from_segments(vec![vec![0u8; 3], vec![0u8; 4]]);
        with_mapped_window(&mut sg, MapDirection::FromDevice, |window| {
            for (i, b) in window.iter_mut().enumerate() {
                *b = i as u8;
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(sg.segments()[0], vec![0, 1, 2]);
        assert_eq!(sg.segments()[1], vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_failed_read_leaves_segments_untouched() {
        let mut sg = SgList::from_segments(vec![vec![0x5A; PAGE_SIZE], vec![0x5A; 100]]);
        let result: io::Result<()> =
            with_mapped_window(&mut sg, MapDirection::FromDevice, |window| {
                window[..10].fill(0x42);
                Err(io::Error::other("medium failure"))
            });

        assert_eq!(result.unwrap_err().to_string(), "medium failure");
        assert!(sg.to_vec().iter().all(|&b| b == 0x5A));
        assert_eq!(sg.len(), PAGE_SIZE + 100);
    }

    #[test]
    fn test_window_released_on_unwind() {
        let mut sg = SgList::zeroed(PAGE_SIZE + 1);
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            with_mapped_window(&mut sg, MapDirection::FromDevice, |window| {
                window[0] = 9;
                if window[0] == 9 {
                    panic!("closure panicked");
                }
                Ok(())
            })
        }));

        assert!(outcome.is_err());
        // Nothing scattered and the descriptor is intact.
        assert_eq!(sg.segments()[0][0], 0);
        assert_eq!(sg.len(), PAGE_SIZE + 1);
    }

    #[test]
    fn test_empty_list() {
        let mut sg = SgList::new();
        let len =
            with_mapped_window(&mut sg, MapDirection::ToDevice, |window| Ok(window.len())).unwrap();
        assert_eq!(len, 0);
    }
}

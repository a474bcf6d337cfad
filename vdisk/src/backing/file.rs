//! File-backed store.
//!
//! Delegates to an existing host file opened read/write (read-only for
//! read-only devices). Each transfer seeks to the device offset and loops
//! until the whole buffer has moved: short transfers and `Interrupted` are
//! retried, anything else (including an unexpected end of file) is returned
//! to the worker, which reports it to the request as an I/O error.
//!
//! This store may block the worker on host I/O.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::backing::{BackingKind, BackingStore, check_bounds};
use crate::error::{Result, VdiskError};

/// Size of the zero buffer used to service discards.
const ZERO_BLOCK: usize = 64 * 1024;

/// An open backing file.
#[derive(Debug)]
pub struct FileBacking {
    file: File,
    path: PathBuf,
    capacity: u64,
    read_only: bool,
}

impl FileBacking {
    /// Opens `path` as a backing file.
    ///
    /// With `size == None` the device takes the file's current length. An
    /// explicit size larger than the file extends it (sparse where the host
    /// filesystem allows).
    ///
    /// # Errors
    ///
    /// - [`VdiskError::Io`] if the file cannot be opened, inspected or extended
    /// - [`VdiskError::InvalidParameter`] if it is not a regular file, is empty
    ///   with no explicit size, or would need extending while read-only
    pub fn open(path: &Path, size: Option<u64>, read_only: bool) -> Result<Self> {
        let io_err = |source| VdiskError::Io {
            path: path.to_path_buf(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(io_err)?;

        let metadata = file.metadata().map_err(io_err)?;
        if !metadata.is_file() {
            return Err(VdiskError::invalid(format!(
                "'{}' is not a regular file",
                path.display()
            )));
        }

        let len = metadata.len();
        let capacity = match size {
            None if len == 0 => {
                return Err(VdiskError::invalid(format!(
                    "'{}' is empty and no size was given",
                    path.display()
                )));
            }
            None => len,
            Some(size) if size > len && read_only => {
                return Err(VdiskError::invalid(format!(
                    "'{}' is {len} bytes; cannot extend to {size} on a read-only device",
                    path.display()
                )));
            }
            Some(size) => {
                if size > len {
                    file.set_len(size).map_err(io_err)?;
                }
                size
            }
        };

        Ok(Self {
            file,
            path: path.to_path_buf(),
            capacity,
            read_only,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BackingStore for FileBacking {
    fn kind(&self) -> BackingKind {
        BackingKind::File
    }

    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn resident_bytes(&self) -> u64 {
        self.capacity
    }

    fn read_into(&mut self, mut dest: &mut [u8], offset: u64) -> io::Result<()> {
        check_bounds(offset, dest.len() as u64, self.capacity)?;
        self.file.seek(SeekFrom::Start(offset))?;

        while !dest.is_empty() {
            match self.file.read(dest) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "'{}' ended with {} bytes still to read",
                            self.path.display(),
                            dest.len()
                        ),
                    ));
                }
                Ok(n) => dest = &mut dest[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn write_from(&mut self, mut src: &[u8], offset: u64) -> io::Result<()> {
        check_bounds(offset, src.len() as u64, self.capacity)?;
        self.file.seek(SeekFrom::Start(offset))?;

        while !src.is_empty() {
            match self.file.write(src) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!(
                            "'{}' accepted no data with {} bytes still to write",
                            self.path.display(),
                            src.len()
                        ),
                    ));
                }
                Ok(n) => src = &src[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn discard(&mut self, offset: u64, len: u64) -> io::Result<()> {
        check_bounds(offset, len, self.capacity)?;

        let zeros = vec![0u8; ZERO_BLOCK];
        let mut done = 0u64;
        while done < len {
            #[allow(clippy::cast_possible_truncation)] // min with ZERO_BLOCK fits usize
            let step = (len - done).min(ZERO_BLOCK as u64) as usize;
            self.write_from(&zeros[..step], offset + done)?;
            done += step as u64;
        }
        Ok(())
    }

    fn release(self: Box<Self>) -> io::Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.sync_all()
    }
}

#![forbid(unsafe_code)]

use std::{
    fs::File,
    io::{self, IoSlice},
    path::Path,
    sync::Arc,
};

use crate::types::{Result, SombraError};

#[cfg(test)]
macro_rules! io_test_log {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

#[cfg(not(test))]
macro_rules! io_test_log {
    ($($arg:tt)*) => {
        if false {
            let _ = format_args!($($arg)*);
        }
    };
}

/// Positioned I/O on the local cache file.
pub trait FileIo: Send + Sync + 'static {
    /// Reads up to `dst.len()` bytes at `off`, returning how many were read.
    ///
    /// A return value smaller than `dst.len()` is not an error; it usually means EOF.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<usize>;
    /// Reads until `dst` is full or EOF is reached and returns the total read.
    fn read_full_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<usize> {
        let mut total = 0usize;
        while !dst.is_empty() {
            let read = self.read_at(off, dst)?;
            if read == 0 {
                break;
            }
            total += read;
            off += read as u64;
            dst = &mut dst[read..];
        }
        Ok(total)
    }
    /// Writes all of `src` at `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Writes multiple buffers back to back starting at `off`.
    fn writev_at(&self, mut off: u64, bufs: &[IoSlice<'_>]) -> Result<()> {
        for slice in bufs {
            if slice.is_empty() {
                continue;
            }
            self.write_at(off, slice)?;
            off = off
                .checked_add(slice.len() as u64)
                .ok_or(SombraError::Invalid("writev offset overflow"))?;
        }
        Ok(())
    }
    /// Flushes file data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Flushes file data to stable storage (`fdatasync`).
    fn sync_data(&self) -> Result<()> {
        self.sync_all()
    }
    /// Returns the current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
/// Cache-file helpers built on POSIX `pread`/`pwrite`.
pub mod stdio_unix {
    use std::{
        fs::{File, OpenOptions},
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
        path::Path,
    };

    use crate::types::{Result, SombraError};

    use super::StdFileIo;

    /// Opens or creates a cache file for read-write access.
    pub fn open_rw(path: impl AsRef<Path>) -> Result<StdFileIo> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(SombraError::from)?;
        Ok(StdFileIo::new(file))
    }

    /// Single positioned read; retried on `EINTR`.
    pub fn read_some(file: &File, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        loop {
            match file.read_at(dst, off) {
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    /// Writes all bytes at offset using `pwrite`.
    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        io_test_log!("[io.write_all] start off={} len={}", off, src.len());
        while !src.is_empty() {
            let written = match file.write_at(src, off) {
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                other => other?,
            };
            if written == 0 {
                io_test_log!(
                    "[io.write_all] zero bytes written off={} remaining={}",
                    off,
                    src.len()
                );
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
/// Cache-file helpers built on Windows `seek_read`/`seek_write`.
pub mod stdio_win {
    use std::{
        fs::{File, OpenOptions},
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
        path::Path,
    };

    use crate::types::{Result, SombraError};

    use super::StdFileIo;

    /// Opens or creates a cache file for read-write access.
    pub fn open_rw(path: impl AsRef<Path>) -> Result<StdFileIo> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(SombraError::from)?;
        Ok(StdFileIo::new(file))
    }

    /// Single positioned read.
    pub fn read_some(file: &File, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        file.seek_read(dst, off)
    }

    /// Writes all bytes at offset using `seek_write`.
    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// [`FileIo`] over a shared `std::fs::File`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already opened file.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens or creates a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        #[cfg(unix)]
        {
            return stdio_unix::open_rw(path);
        }
        #[cfg(windows)]
        {
            return stdio_win::open_rw(path);
        }
        #[allow(unreachable_code)]
        Err(SombraError::Invalid(
            "StdFileIo unsupported on this platform",
        ))
    }

    fn file(&self) -> &File {
        &self.inner
    }

    #[cfg(unix)]
    fn read_some(&self, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        stdio_unix::read_some(self.file(), off, dst)
    }

    #[cfg(windows)]
    fn read_some(&self, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        stdio_win::read_some(self.file(), off, dst)
    }

    #[cfg(unix)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_unix::write_all(self.file(), off, src)
    }

    #[cfg(windows)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_win::write_all(self.file(), off, src)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_some(&self, _off: u64, _dst: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "StdFileIo unsupported on this platform",
        ))
    }

    #[cfg(not(any(unix, windows)))]
    fn write_all(&self, _off: u64, _src: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "StdFileIo unsupported on this platform",
        ))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<usize> {
        self.read_some(off, dst).map_err(SombraError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.write_all(off, src).map_err(SombraError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.file().sync_all().map_err(SombraError::from)
    }

    fn sync_data(&self) -> Result<()> {
        io_test_log!("[io.sync_data] start");
        let result = self.file().sync_data().map_err(SombraError::from);
        if let Err(err) = &result {
            io_test_log!("[io.sync_data] error: {}", err);
        }
        result
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata().map_err(SombraError::from)?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file().set_len(len).map_err(SombraError::from)
    }
}

//! Backing-file access and the working stream abstraction.
//!
//! The container never touches a `File` directly; it reads and writes
//! through a [`WorkingStream`], which is the backing file itself for
//! plaintext databases, an anonymous in-memory stream for encrypted ones,
//! and may carry a read-only memory map as a transparent fast path.

use fs2::FileExt;
use log::debug;
use memmap2::Mmap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::Error;
use crate::limits::MMAP_MAX_SIZE;

/// The kind of anonymous storage backing an encrypted handle's plaintext
/// working stream. Recorded for diagnostics only.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SecureStreamKind {
    /// A kernel-backed anonymous memory file (`memfd_create`).
    Memfd,
    /// An unlinked temporary file (`O_TMPFILE` where available); it has no
    /// user-visible path and is reclaimed when the handle closes.
    TempFile,
}

impl std::fmt::Display for SecureStreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecureStreamKind::Memfd => write!(f, "memfd"),
            SecureStreamKind::TempFile => write!(f, "tmpfile"),
        }
    }
}

/// Opens the backing file with the requested mode.
///
/// # Parameters
/// - `path`: Filesystem location of the database.
/// - `create`: Create the file when it does not exist (ignored for
///   read-only opens).
/// - `read_only`: Open without write access.
///
/// # Returns
/// - `File`: The opened backing file, positioned at the start.
/// - `Err(Error::NotFound)`: The file is missing and may not be created.
/// - `Err(Error::Perm)`: The file exists but cannot be opened.
pub fn open_backing(path: &Path, create: bool, read_only: bool) -> Result<File, Error> {
    let mut options = std::fs::OpenOptions::new();
    options.read(true);
    if !read_only {
        options.write(true).create(create);
    }
    options.open(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
        io::ErrorKind::PermissionDenied => Error::Perm(path.display().to_string()),
        _ => Error::Perm(err.to_string()),
    })
}

/// Acquires the advisory lock on the backing file without blocking:
/// shared for read-only handles, exclusive for writable ones.
///
/// # Returns
/// - `Err(Error::Busy)`: The lock is already held in a conflicting mode.
pub fn lock_backing(file: &File, read_only: bool) -> Result<(), Error> {
    let res = if read_only {
        fs2::FileExt::try_lock_shared(file)
    } else {
        fs2::FileExt::try_lock_exclusive(file)
    };
    res.map_err(|_| Error::Busy)
}

#[cfg(target_os = "linux")]
fn memfd_stream() -> Option<File> {
    use std::os::fd::FromRawFd;

    const NAME: &[u8] = b"idydb_plain\0";
    let fd = unsafe {
        libc::memfd_create(NAME.as_ptr() as *const libc::c_char, libc::MFD_CLOEXEC)
    };
    if fd < 0 {
        return None;
    }
    Some(unsafe { File::from_raw_fd(fd) })
}

#[cfg(not(target_os = "linux"))]
fn memfd_stream() -> Option<File> {
    None
}

/// Creates the anonymous plaintext working storage for an encrypted handle.
///
/// Preference order: an anonymous in-memory file descriptor, then an
/// unlinked temporary. Neither has a user-visible filesystem path, and both
/// are reclaimed automatically when the handle closes or the process exits.
///
/// # Returns
/// - `(File, SecureStreamKind)`: The stream and the storage kind obtained.
/// - `Err(Error::SecureStreamFailed)`: No anonymous storage could be
///   obtained.
pub fn secure_plain_stream() -> Result<(File, SecureStreamKind), Error> {
    if let Some(file) = memfd_stream() {
        return Ok((file, SecureStreamKind::Memfd));
    }
    match tempfile::tempfile() {
        Ok(file) => Ok((file, SecureStreamKind::TempFile)),
        Err(err) => Err(Error::SecureStreamFailed(err.to_string())),
    }
}

/// The byte sequence the container reads and writes.
///
/// Offers positioned reads/writes and truncation over an owned file. When a
/// read-only plaintext open qualifies, the file is additionally memory
/// mapped and reads are served from the map; writes are rejected by the
/// read-only handle long before they could reach a mapped stream.
pub struct WorkingStream {
    file: File,
    map: Option<Mmap>,
}

impl WorkingStream {
    /// Wraps a file as a plain, unmapped working stream.
    pub fn new(file: File) -> WorkingStream {
        WorkingStream { file, map: None }
    }

    /// Wraps a read-only backing file, memory mapping it when its size lies
    /// in `(0, MMAP_MAX_SIZE]`. Mapping failures fall back to buffered
    /// reads without surfacing an error.
    pub fn new_read_only(file: File, size: u64) -> WorkingStream {
        let map = if size > 0 && size <= MMAP_MAX_SIZE {
            match unsafe { Mmap::map(&file) } {
                Ok(map) => Some(map),
                Err(err) => {
                    debug!("mmap unavailable, falling back to buffered reads: {}", err);
                    None
                }
            }
        } else {
            None
        };
        WorkingStream { file, map }
    }

    /// Whether reads are currently served from a memory map.
    pub fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    /// Reads exactly `buf.len()` bytes starting at `offset`.
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        if let Some(map) = &self.map {
            let start = offset as usize;
            let end = start.checked_add(buf.len()).ok_or_else(|| {
                Error::Corrupt(String::from("read extends past the end of the mapped file"))
            })?;
            if end > map.len() {
                return Err(Error::Corrupt(String::from(
                    "read extends past the end of the mapped file",
                )));
            }
            buf.copy_from_slice(&map[start..end]);
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Writes all of `buf` starting at `offset`.
    pub fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    /// Truncates (or extends) the stream to `size` bytes.
    pub fn truncate(&mut self, size: u64) -> Result<(), Error> {
        self.file.set_len(size)?;
        Ok(())
    }

    /// Reports the current stream length.
    pub fn len(&mut self) -> Result<u64, Error> {
        if let Some(map) = &self.map {
            return Ok(map.len() as u64);
        }
        Ok(self.file.seek(SeekFrom::End(0))?)
    }

    /// Hands out the underlying file, for the encryption writeback path.
    pub(crate) fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Releases the advisory lock, if one is held. Errors are ignored; the
    /// lock dies with the descriptor anyway.
    pub fn unlock(&self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn secure_stream_has_no_visible_path() {
        let (mut file, kind) = secure_plain_stream().unwrap();
        // Whatever the kind, the stream must behave like a normal file.
        file.write_all(b"scratch").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = String::new();
        file.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "scratch");
        assert!(matches!(
            kind,
            SecureStreamKind::Memfd | SecureStreamKind::TempFile
        ));
    }

    #[test]
    fn positioned_io_roundtrip() {
        let file = tempfile::tempfile().unwrap();
        let mut stream = WorkingStream::new(file);
        stream.write_all_at(0, b"0123456789").unwrap();
        stream.write_all_at(4, b"xy").unwrap();

        let mut buf = [0u8; 10];
        stream.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"0123xy6789");

        stream.truncate(4).unwrap();
        assert_eq!(stream.len().unwrap(), 4);
    }

    #[test]
    fn conflicting_locks_report_busy() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let first = open_backing(tmp.path(), false, false).unwrap();
        lock_backing(&first, false).unwrap();

        let second = open_backing(tmp.path(), false, false).unwrap();
        assert!(matches!(lock_backing(&second, false), Err(Error::Busy)));
        assert!(matches!(lock_backing(&second, true), Err(Error::Busy)));
    }
}

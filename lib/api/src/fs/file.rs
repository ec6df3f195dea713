use std::{
    fs,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use portos_types::{Errno, ResourceKind, Whence};

use super::{path_error, FileInfo};
use crate::{
    handle::{Descriptor, Handle},
    io::{RawIo, Stream, StreamSource},
    Error, Result,
};

/// An open file.
pub type File = Handle<Stream<HostFile>>;

/// A C `fopen` mode string: `r`, `w`, `a`, `r+`, `w+` or `a+`, each
/// optionally carrying a `b` which is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
}

impl FromStr for OpenMode {
    type Err = Error;

    fn from_str(mode: &str) -> Result<Self> {
        let invalid = || Error::invalid(format!("invalid mode '{mode}'"));
        let mut chars = mode.chars();
        let base = chars.next().ok_or_else(invalid)?;
        let mut update = false;
        for c in chars {
            match c {
                '+' if !update => update = true,
                'b' => {}
                _ => return Err(invalid()),
            }
        }
        let (read, write, append, create, truncate) = match base {
            'r' => (true, update, false, false, false),
            'w' => (update, true, false, true, true),
            'a' => (update, true, true, true, false),
            _ => return Err(invalid()),
        };
        Ok(Self {
            read,
            write,
            append,
            create,
            truncate,
        })
    }
}

impl OpenMode {
    fn options(&self) -> fs::OpenOptions {
        let mut options = fs::OpenOptions::new();
        options
            .read(self.read)
            .write(self.write && !self.append)
            .append(self.append)
            .create(self.create)
            .truncate(self.truncate);
        options
    }
}

/// The host side of a [`File`].
#[derive(Debug)]
pub struct HostFile {
    file: fs::File,
    path: PathBuf,
}

impl HostFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RawIo for HostFile {
    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.file.read(buf).map_err(Error::from)
    }

    fn write_raw(&mut self, buf: &[u8]) -> Result<usize> {
        self.file.write(buf).map_err(Error::from)
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn seek_raw(&mut self, pos: SeekFrom) -> Result<u64> {
        self.file.seek(pos).map_err(Error::from)
    }

    fn buffers_writes(&self) -> bool {
        true
    }
}

impl StreamSource for HostFile {
    const KIND: ResourceKind = ResourceKind::File;

    fn descriptor(&self) -> Descriptor {
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            Descriptor::from_fd(self.file.as_raw_fd())
        }
        #[cfg(windows)]
        {
            use std::os::windows::io::AsRawHandle;
            Descriptor::Os(self.file.as_raw_handle() as usize as i64)
        }
        #[cfg(not(any(unix, windows)))]
        {
            Descriptor::unique()
        }
    }

    fn close_source(&mut self) -> Result<()> {
        // The descriptor itself is released when the file drops
        tracing::trace!(path = %self.path.display(), "closing file");
        Ok(())
    }
}

/// Opens `path` with a C `fopen` style `mode`.
pub fn file_open(path: impl AsRef<Path>, mode: &str) -> Result<File> {
    let path = path.as_ref();
    let mode: OpenMode = mode.parse()?;
    let file = mode
        .options()
        .open(path)
        .map_err(|err| path_error(path, err))?;
    if file.metadata().map(|m| m.is_dir()).unwrap_or(false) && mode.write {
        return Err(Error::new(
            Errno::Isdir,
            format!("{}: is a directory", path.display()),
        ));
    }
    tracing::debug!(path = %path.display(), ?mode, "file opened");
    Ok(Handle::new(Stream::new(HostFile {
        file,
        path: path.to_path_buf(),
    })))
}

impl Handle<Stream<HostFile>> {
    /// The path the file was opened with.
    pub fn path(&self) -> Result<PathBuf> {
        self.with(|stream| Ok(stream.source().path.clone()))
    }

    pub fn stat(&self) -> Result<FileInfo> {
        self.with(|stream| {
            stream.flush()?;
            let source = stream.source();
            let metadata = source
                .file
                .metadata()
                .map_err(|err| path_error(&source.path, err))?;
            Ok(FileInfo::from_metadata(&source.path, &metadata))
        })
    }

    /// Cuts the file at `len`, or at the current position when `len` is
    /// `None`. The position itself does not move.
    pub fn truncate(&self, len: Option<u64>) -> Result<()> {
        self.with(|stream| {
            let position = stream.seek(Whence::Cur, 0)?;
            let len = len.unwrap_or(position);
            let source = stream.source_mut();
            source
                .file
                .set_len(len)
                .map_err(|err| path_error(&source.path, err))
        })
    }

    /// Takes an advisory lock on the whole file, blocking until it is
    /// granted.
    pub fn lock(&self, exclusive: bool) -> Result<()> {
        let operation = if exclusive { FlockOp::Exclusive } else { FlockOp::Shared };
        self.with(|stream| {
            stream.flush()?;
            flock(&stream.source().file, operation)
        })
    }

    pub fn unlock(&self) -> Result<()> {
        self.with(|stream| {
            stream.flush()?;
            flock(&stream.source().file, FlockOp::Unlock)
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum FlockOp {
    Shared,
    Exclusive,
    Unlock,
}

#[cfg(unix)]
fn flock(file: &fs::File, operation: FlockOp) -> Result<()> {
    use std::os::fd::AsRawFd;

    let operation = match operation {
        FlockOp::Shared => libc::LOCK_SH,
        FlockOp::Exclusive => libc::LOCK_EX,
        FlockOp::Unlock => libc::LOCK_UN,
    };
    loop {
        // SAFETY: the descriptor is owned by `file` and stays open for the call
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err.into());
        }
    }
}

#[cfg(not(unix))]
fn flock(_file: &fs::File, _operation: FlockOp) -> Result<()> {
    Err(Error::not_implemented("file locking"))
}

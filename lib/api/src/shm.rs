//! Shared memory segments backed by a file mapping.
//!
//! A segment is created once under a path and attached to by any number of
//! processes. Contents are not synchronized: writers coordinate among
//! themselves.
use std::{
    fs::{self, OpenOptions},
    io::SeekFrom,
    path::{Path, PathBuf},
};

use memmap2::{MmapMut, MmapOptions};
use portos_types::{Errno, ResourceKind};

use crate::{
    fs::path_error,
    handle::{Descriptor, Handle},
    io::{RawIo, Stream, StreamSource},
    Error, Result,
};

pub type SharedMemory = Handle<Stream<Segment>>;

#[derive(Debug)]
pub struct Segment {
    map: MmapMut,
    position: usize,
    path: PathBuf,
    owner: bool,
    descriptor: Descriptor,
}

impl Segment {
    fn map(path: &Path, file: &fs::File, owner: bool) -> Result<Self> {
        let len = file.metadata().map_err(|err| path_error(path, err))?.len();
        let len = usize::try_from(len)
            .map_err(|_| Error::new(Errno::Nomem, "shared memory segment is too large"))?;
        if len == 0 {
            return Err(Error::invalid(format!(
                "{}: shared memory segment is empty",
                path.display()
            )));
        }
        // SAFETY: the mapping is shared with other processes on purpose;
        // we only ever copy bytes in and out and never hand out references
        // into it.
        let map = unsafe { MmapOptions::new().len(len).map_mut(file) }
            .map_err(|err| path_error(path, err))?;
        Ok(Self {
            map,
            position: 0,
            path: path.to_path_buf(),
            owner,
            descriptor: Descriptor::unique(),
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this handle created the segment.
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl RawIo for Segment {
    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        let available = &self.map[self.position.min(self.map.len())..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.position += n;
        Ok(n)
    }

    fn write_raw(&mut self, buf: &[u8]) -> Result<usize> {
        if self.position >= self.map.len() {
            return Err(Error::new(
                Errno::Nospc,
                format!("no space left in shared memory segment of {} bytes", self.map.len()),
            ));
        }
        let n = (self.map.len() - self.position).min(buf.len());
        self.map[self.position..self.position + n].copy_from_slice(&buf[..n]);
        self.position += n;
        Ok(n)
    }

    fn flush_raw(&mut self) -> Result<()> {
        Ok(self.map.flush()?)
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn seek_raw(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(offset) => self.position as i128 + i128::from(offset),
            SeekFrom::End(offset) => self.map.len() as i128 + i128::from(offset),
        };
        if target < 0 {
            return Err(Error::invalid("cannot seek before the start of the segment"));
        }
        self.position = usize::try_from(target).unwrap_or(usize::MAX);
        Ok(self.position as u64)
    }
}

impl StreamSource for Segment {
    const KIND: ResourceKind = ResourceKind::SharedMemory;

    fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    fn close_source(&mut self) -> Result<()> {
        tracing::debug!(path = %self.path.display(), owner = self.owner, "shared memory detached");
        Ok(())
    }
}

/// Creates a zero filled segment of `size` bytes at `path`. Fails with
/// `EEXIST` if the path is taken.
pub fn shm_create(path: impl AsRef<Path>, size: usize) -> Result<SharedMemory> {
    let path = path.as_ref();
    if size == 0 {
        return Err(Error::invalid("shared memory size must be at least 1 byte"));
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|err| path_error(path, err))?;
    if let Err(err) = file.set_len(size as u64) {
        let _ = fs::remove_file(path);
        return Err(path_error(path, err));
    }
    let segment = match Segment::map(path, &file, true) {
        Ok(segment) => segment,
        Err(err) => {
            let _ = fs::remove_file(path);
            return Err(err);
        }
    };
    tracing::debug!(path = %path.display(), size, "shared memory created");
    Ok(Handle::new(Stream::new(segment)))
}

/// Attaches to the segment created at `path`.
pub fn shm_attach(path: impl AsRef<Path>) -> Result<SharedMemory> {
    let path = path.as_ref();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|err| path_error(path, err))?;
    let segment = Segment::map(path, &file, false)?;
    tracing::debug!(path = %path.display(), size = segment.len(), "shared memory attached");
    Ok(Handle::new(Stream::new(segment)))
}

/// Removes the segment's name. Mappings that exist stay valid; further
/// attaches fail with `ENOENT`.
pub fn shm_remove(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    fs::remove_file(path).map_err(|err| path_error(path, err))
}

impl Handle<Stream<Segment>> {
    /// Size of the segment in bytes.
    pub fn size(&self) -> Result<usize> {
        self.with(|stream| Ok(stream.source().len()))
    }

    pub fn path(&self) -> Result<PathBuf> {
        self.with(|stream| Ok(stream.source().path().to_path_buf()))
    }

    /// Unmaps the segment, leaving it in place for others.
    pub fn detach(&self) -> Result<()> {
        self.close()
    }

    /// Unmaps and removes the segment. Only the handle that created it may
    /// do this; others get `EPERM`.
    pub fn destroy(&self) -> Result<()> {
        let path = self.with(|stream| {
            let segment = stream.source();
            if !segment.is_owner() {
                return Err(Error::new(
                    Errno::Perm,
                    "only the creator of a shared memory segment may destroy it",
                ));
            }
            Ok(segment.path().to_path_buf())
        })?;
        self.close()?;
        shm_remove(path)
    }
}

//! Files, directories and path level helpers.
mod dir;
mod file;

use std::{
    fs,
    io,
    path::{Path, PathBuf},
    time::SystemTime,
};

pub use self::{
    dir::{dir_open, DirEntries, DirEntry, DirStream, Directory},
    file::{file_open, File, HostFile, OpenMode},
};
use crate::{Error, Result};

/// Attaches the offending path to an OS error.
pub(crate) fn path_error(path: &Path, err: io::Error) -> Error {
    let code = Error::from(&err).code();
    Error::new(code, format!("{}: {err}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Pipe,
    Socket,
    CharDevice,
    BlockDevice,
    Unknown,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::File => "file",
            FileKind::Directory => "directory",
            FileKind::Symlink => "link",
            FileKind::Pipe => "pipe",
            FileKind::Socket => "socket",
            FileKind::CharDevice => "character device",
            FileKind::BlockDevice => "block device",
            FileKind::Unknown => "unknown",
        }
    }
}

impl From<fs::FileType> for FileKind {
    fn from(ty: fs::FileType) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if ty.is_fifo() {
                return FileKind::Pipe;
            }
            if ty.is_socket() {
                return FileKind::Socket;
            }
            if ty.is_char_device() {
                return FileKind::CharDevice;
            }
            if ty.is_block_device() {
                return FileKind::BlockDevice;
            }
        }
        if ty.is_symlink() {
            FileKind::Symlink
        } else if ty.is_dir() {
            FileKind::Directory
        } else if ty.is_file() {
            FileKind::File
        } else {
            FileKind::Unknown
        }
    }
}

/// What `stat` reports about a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: PathBuf,
    pub kind: FileKind,
    pub size: u64,
    pub readonly: bool,
    /// Permission bits (`0o644` style); `None` where the platform has no
    /// such notion.
    pub mode: Option<u32>,
    pub modified: Option<SystemTime>,
    pub accessed: Option<SystemTime>,
    pub created: Option<SystemTime>,
}

impl FileInfo {
    pub(crate) fn from_metadata(path: &Path, metadata: &fs::Metadata) -> Self {
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode() & 0o7777)
        };
        #[cfg(not(unix))]
        let mode = None;

        Self {
            path: path.to_path_buf(),
            kind: metadata.file_type().into(),
            size: metadata.len(),
            readonly: metadata.permissions().readonly(),
            mode,
            modified: metadata.modified().ok(),
            accessed: metadata.accessed().ok(),
            created: metadata.created().ok(),
        }
    }
}

/// Looks up a path, following symbolic links.
pub fn stat(path: impl AsRef<Path>) -> Result<FileInfo> {
    let path = path.as_ref();
    let metadata = fs::metadata(path).map_err(|err| path_error(path, err))?;
    Ok(FileInfo::from_metadata(path, &metadata))
}

pub fn file_remove(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    fs::remove_file(path).map_err(|err| path_error(path, err))
}

pub fn file_rename(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
    let from = from.as_ref();
    fs::rename(from, to.as_ref()).map_err(|err| path_error(from, err))
}

/// Copies `from` over `to`, returning the number of bytes copied.
pub fn file_copy(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<u64> {
    let from = from.as_ref();
    fs::copy(from, to.as_ref()).map_err(|err| path_error(from, err))
}

/// Appends the contents of `from` to `to`, creating `to` if needed.
pub fn file_append(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<u64> {
    let (from, to) = (from.as_ref(), to.as_ref());
    let mut source = fs::File::open(from).map_err(|err| path_error(from, err))?;
    let mut target = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(to)
        .map_err(|err| path_error(to, err))?;
    io::copy(&mut source, &mut target).map_err(|err| path_error(to, err))
}

pub fn dir_make(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    fs::create_dir(path).map_err(|err| path_error(path, err))
}

/// Creates a directory and any missing parents. Existing directories are
/// fine.
pub fn dir_make_recursive(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    fs::create_dir_all(path).map_err(|err| path_error(path, err))
}

/// Removes an empty directory.
pub fn dir_remove(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    fs::remove_dir(path).map_err(|err| path_error(path, err))
}

pub fn dir_remove_recursive(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    fs::remove_dir_all(path).map_err(|err| path_error(path, err))
}

/// The directory for temporary files.
pub fn temp_dir_get() -> PathBuf {
    std::env::temp_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use portos_types::Errno;
    use pretty_assertions::assert_eq;

    #[test]
    fn helpers_report_symbolic_codes() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");

        let err = stat(&missing).unwrap_err();
        assert_eq!(err.code(), Errno::Noent);
        assert!(err.message().contains("missing"), "{}", err.message());
        assert_eq!(file_remove(&missing).unwrap_err().code(), Errno::Noent);

        let sub = dir.path().join("a");
        dir_make(&sub).unwrap();
        assert_eq!(dir_make(&sub).unwrap_err().code(), Errno::Exist);
        fs::write(sub.join("f"), b"x").unwrap();
        assert_eq!(dir_remove(&sub).unwrap_err().code(), Errno::Notempty);
        dir_remove_recursive(&sub).unwrap();
        assert_eq!(stat(&sub).unwrap_err().code(), Errno::Noent);
    }

    #[test]
    fn copy_append_rename() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, b"hello ").unwrap();

        assert_eq!(file_copy(&a, &b).unwrap(), 6);
        assert_eq!(file_append(&a, &b).unwrap(), 6);
        assert_eq!(fs::read(&b).unwrap(), b"hello hello ");

        let c = dir.path().join("c.txt");
        file_rename(&b, &c).unwrap();
        let info = stat(&c).unwrap();
        assert_eq!(info.kind, FileKind::File);
        assert_eq!(info.size, 12);
        assert!(!info.readonly);
        assert_eq!(stat(&b).unwrap_err().code(), Errno::Noent);
    }

    #[test]
    fn recursive_creation_and_stat_of_directories() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("x").join("y").join("z");
        dir_make_recursive(&deep).unwrap();
        dir_make_recursive(&deep).unwrap();
        assert_eq!(stat(&deep).unwrap().kind, FileKind::Directory);
        assert!(temp_dir_get().is_absolute());
    }
}

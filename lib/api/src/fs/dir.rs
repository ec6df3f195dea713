use std::{
    fs,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use portos_types::ResourceKind;

use super::{path_error, FileKind};
use crate::{
    arena::Arena,
    handle::{Descriptor, Handle, Resource},
    Error, Result,
};

/// An open directory listing.
pub type Directory = Handle<DirStream>;

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// The file name, without any leading path. Raw bytes since file names
    /// need not be UTF-8.
    pub name: Bytes,
    pub path: PathBuf,
    pub kind: FileKind,
}

impl DirEntry {
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

#[derive(Debug)]
pub struct DirStream {
    path: PathBuf,
    entries: fs::ReadDir,
    arena: Option<Arena>,
    descriptor: Descriptor,
}

impl Resource for DirStream {
    const KIND: ResourceKind = ResourceKind::Directory;

    fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    fn close(&mut self) -> Result<()> {
        if let Some(arena) = self.arena.take() {
            arena.destroy();
        }
        Ok(())
    }
}

impl DirStream {
    fn next_entry(&mut self) -> Result<Option<DirEntry>> {
        let arena = self
            .arena
            .as_ref()
            .ok_or_else(|| Error::closed(ResourceKind::Directory))?;
        let entry = match self.entries.next() {
            Some(entry) => entry.map_err(|err| path_error(&self.path, err))?,
            None => return Ok(None),
        };
        let kind = entry
            .file_type()
            .map(FileKind::from)
            .unwrap_or(FileKind::Unknown);
        let name = entry.file_name();
        #[cfg(unix)]
        let name = {
            use std::os::unix::ffi::OsStrExt;
            arena.alloc(name.as_bytes())
        };
        #[cfg(not(unix))]
        let name = arena.alloc_str(&name.to_string_lossy());
        Ok(Some(DirEntry {
            name,
            path: entry.path(),
            kind,
        }))
    }
}

/// Opens a directory for listing. `.` and `..` are not reported.
pub fn dir_open(path: impl AsRef<Path>) -> Result<Directory> {
    let path = path.as_ref();
    let entries = fs::read_dir(path).map_err(|err| path_error(path, err))?;
    tracing::debug!(path = %path.display(), "directory opened");
    Ok(Handle::new(DirStream {
        path: path.to_path_buf(),
        entries,
        arena: Some(Arena::new("directory")),
        descriptor: Descriptor::unique(),
    }))
}

impl Handle<DirStream> {
    /// The next entry, or `None` once the listing is exhausted.
    pub fn read(&self) -> Result<Option<DirEntry>> {
        self.with(|dir| dir.next_entry())
    }

    /// Restarts the listing from the beginning.
    pub fn rewind(&self) -> Result<()> {
        self.with(|dir| {
            dir.entries = fs::read_dir(&dir.path).map_err(|err| path_error(&dir.path, err))?;
            Ok(())
        })
    }

    pub fn path(&self) -> Result<PathBuf> {
        self.with(|dir| Ok(dir.path.clone()))
    }

    /// Iterates over the remaining entries.
    pub fn entries(&self) -> DirEntries {
        DirEntries {
            dir: self.clone(),
            done: false,
        }
    }
}

/// Iterator returned by [`Handle::entries`](Directory).
#[derive(Debug)]
pub struct DirEntries {
    dir: Directory,
    done: bool,
}

impl Iterator for DirEntries {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.dir.read().transpose();
        self.done = !matches!(next, Some(Ok(_)));
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portos_types::Errno;
    use pretty_assertions::assert_eq;

    fn names(dir: &Directory) -> Vec<String> {
        let mut names: Vec<String> = dir
            .entries()
            .map(|entry| entry.unwrap().name_lossy())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn lists_and_rewinds() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("b.txt"), b"").unwrap();
        fs::write(tmp.path().join("a.txt"), b"").unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();

        let dir = dir_open(tmp.path()).unwrap();
        assert_eq!(names(&dir), vec!["a.txt", "b.txt", "sub"]);
        assert_eq!(dir.read().unwrap(), None);

        dir.rewind().unwrap();
        let mut kinds = Vec::new();
        while let Some(entry) = dir.read().unwrap() {
            kinds.push((entry.name_lossy(), entry.kind));
        }
        kinds.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            kinds,
            vec![
                ("a.txt".to_string(), FileKind::File),
                ("b.txt".to_string(), FileKind::File),
                ("sub".to_string(), FileKind::Directory),
            ]
        );
    }

    #[test]
    fn entry_names_outlive_the_handle() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("keep"), b"").unwrap();
        let dir = dir_open(tmp.path()).unwrap();
        let entry = dir.read().unwrap().unwrap();
        dir.close().unwrap();
        assert_eq!(&entry.name[..], b"keep");
        assert_eq!(dir.read().unwrap_err().code(), Errno::Closed);
        assert_eq!(dir.to_string(), "directory (closed)");
    }

    #[test]
    fn missing_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let err = dir_open(tmp.path().join("nope")).unwrap_err();
        assert_eq!(err.code(), Errno::Noent);
    }
}

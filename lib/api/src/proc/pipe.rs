use std::{
    io::{self, Read, Write},
    process::{ChildStderr, ChildStdin, ChildStdout},
};

use portos_types::{Errno, ResourceKind};

use crate::{
    arena::ArenaRef,
    handle::{Descriptor, Handle},
    io::{RawIo, Stream, StreamSource},
    Error, Result,
};

/// One end of a pipe, or a standard stream.
pub type Pipe = Handle<Stream<PipeSource>>;

#[derive(Debug)]
pub(crate) enum PipeEnd {
    Reader(io::PipeReader),
    Writer(io::PipeWriter),
    ChildStdin(ChildStdin),
    ChildStdout(ChildStdout),
    ChildStderr(ChildStderr),
    Stdin(io::Stdin),
    Stdout(io::Stdout),
    Stderr(io::Stderr),
}

impl PipeEnd {
    fn label(&self) -> &'static str {
        match self {
            PipeEnd::Reader(_) => "pipe read end",
            PipeEnd::Writer(_) => "pipe write end",
            PipeEnd::ChildStdin(_) => "child stdin",
            PipeEnd::ChildStdout(_) => "child stdout",
            PipeEnd::ChildStderr(_) => "child stderr",
            PipeEnd::Stdin(_) => "stdin",
            PipeEnd::Stdout(_) => "stdout",
            PipeEnd::Stderr(_) => "stderr",
        }
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        match self {
            PipeEnd::Reader(end) => end.as_raw_fd(),
            PipeEnd::Writer(end) => end.as_raw_fd(),
            PipeEnd::ChildStdin(end) => end.as_raw_fd(),
            PipeEnd::ChildStdout(end) => end.as_raw_fd(),
            PipeEnd::ChildStderr(end) => end.as_raw_fd(),
            PipeEnd::Stdin(end) => end.as_raw_fd(),
            PipeEnd::Stdout(end) => end.as_raw_fd(),
            PipeEnd::Stderr(end) => end.as_raw_fd(),
        }
    }
}

/// The host side of a [`Pipe`].
#[derive(Debug)]
pub struct PipeSource {
    end: PipeEnd,
    descriptor: Descriptor,
    /// Keeps the owning process's teardown pending while this end is open
    _process: Option<ArenaRef>,
}

impl PipeSource {
    pub(crate) fn new(end: PipeEnd, process: Option<ArenaRef>) -> Self {
        #[cfg(unix)]
        let descriptor = Descriptor::from_fd(end.raw_fd());
        #[cfg(not(unix))]
        let descriptor = Descriptor::unique();
        Self {
            end,
            descriptor,
            _process: process,
        }
    }

    /// Switches the descriptor in or out of non-blocking mode. Reads and
    /// writes that would block then fail with `EAGAIN`.
    #[cfg(unix)]
    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        let fd = self.end.raw_fd();
        // SAFETY: fd belongs to `self.end`, which is open
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        // SAFETY: as above
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub(crate) fn set_nonblocking(&self, _nonblocking: bool) -> Result<()> {
        Err(Error::not_implemented("non-blocking pipes"))
    }

    fn wrong_direction(&self, what: &str) -> Error {
        Error::new(
            Errno::Badf,
            format!("cannot {what} on {}", self.end.label()),
        )
    }
}

impl RawIo for PipeSource {
    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        let read = match &mut self.end {
            PipeEnd::Reader(end) => end.read(buf),
            PipeEnd::ChildStdout(end) => end.read(buf),
            PipeEnd::ChildStderr(end) => end.read(buf),
            PipeEnd::Stdin(end) => end.read(buf),
            _ => return Err(self.wrong_direction("read")),
        };
        match read {
            Ok(n) => Ok(n),
            // The writer went away; that is just the end of the stream
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn write_raw(&mut self, buf: &[u8]) -> Result<usize> {
        let written = match &mut self.end {
            PipeEnd::Writer(end) => end.write(buf),
            PipeEnd::ChildStdin(end) => end.write(buf),
            PipeEnd::Stdout(end) => end.write(buf),
            PipeEnd::Stderr(end) => end.write(buf),
            _ => return Err(self.wrong_direction("write")),
        };
        Ok(written?)
    }

    fn flush_raw(&mut self) -> Result<()> {
        match &mut self.end {
            PipeEnd::Stdout(end) => Ok(end.flush()?),
            PipeEnd::Stderr(end) => Ok(end.flush()?),
            _ => Ok(()),
        }
    }
}

impl StreamSource for PipeSource {
    const KIND: ResourceKind = ResourceKind::Pipe;

    fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    fn close_source(&mut self) -> Result<()> {
        tracing::trace!(end = self.end.label(), "closing pipe");
        Ok(())
    }
}

pub(crate) fn wrap(end: PipeEnd, process: Option<ArenaRef>) -> Pipe {
    Handle::new(Stream::new(PipeSource::new(end, process)))
}

/// Creates an anonymous pipe and returns its `(read, write)` ends.
pub fn pipe_create() -> Result<(Pipe, Pipe)> {
    let (reader, writer) = io::pipe()?;
    Ok((
        wrap(PipeEnd::Reader(reader), None),
        wrap(PipeEnd::Writer(writer), None),
    ))
}

/// Creates a FIFO special file at `path` with permission bits `mode`.
#[cfg(unix)]
pub fn namedpipe_create(path: impl AsRef<std::path::Path>, mode: u32) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let path = path.as_ref();
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::invalid("path contains a NUL byte"))?;
    // SAFETY: c_path is a valid NUL terminated string
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), mode as libc::mode_t) };
    if rc != 0 {
        return Err(crate::fs::path_error(path, io::Error::last_os_error()));
    }
    tracing::debug!(path = %path.display(), mode, "named pipe created");
    Ok(())
}

#[cfg(not(unix))]
pub fn namedpipe_create(_path: impl AsRef<std::path::Path>, _mode: u32) -> Result<()> {
    Err(Error::not_implemented("named pipes"))
}

pub fn pipe_open_stdin() -> Result<Pipe> {
    Ok(wrap(PipeEnd::Stdin(io::stdin()), None))
}

pub fn pipe_open_stdout() -> Result<Pipe> {
    Ok(wrap(PipeEnd::Stdout(io::stdout()), None))
}

pub fn pipe_open_stderr() -> Result<Pipe> {
    Ok(wrap(PipeEnd::Stderr(io::stderr()), None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{io::ReadFormat, Value};
    use pretty_assertions::assert_eq;

    #[test]
    fn anonymous_pipe_round_trip() {
        let (reader, writer) = pipe_create().unwrap();
        writer.write(&[Value::from("line one\n"), Value::Number(7.0)]).unwrap();
        writer.close().unwrap();

        let values = reader
            .read(&[ReadFormat::Line, ReadFormat::Number, ReadFormat::Line])
            .unwrap();
        assert_eq!(values, vec![Value::from("line one"), Value::Number(7.0), Value::Nil]);
        assert_eq!(reader.read_all().unwrap(), bytes::Bytes::new());
    }

    #[test]
    fn ends_only_go_one_way() {
        let (reader, writer) = pipe_create().unwrap();
        assert_eq!(reader.write_bytes("x").unwrap_err().code(), Errno::Badf);
        assert_eq!(writer.read_line().unwrap_err().code(), Errno::Badf);
        assert_ne!(reader, writer);
        assert_eq!(reader.kind(), ResourceKind::Pipe);
    }

    #[test]
    fn standard_streams_open() {
        let stderr = pipe_open_stderr().unwrap();
        assert_eq!(stderr.write_bytes("").unwrap(), 0);
        stderr.close().unwrap();
        assert!(pipe_open_stdin().is_ok());
        assert!(pipe_open_stdout().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn named_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo");
        namedpipe_create(&path, 0o600).unwrap();
        assert_eq!(
            crate::fs::stat(&path).unwrap().kind,
            crate::fs::FileKind::Pipe
        );
        assert_eq!(
            namedpipe_create(&path, 0o600).unwrap_err().code(),
            Errno::Exist
        );

        let writer_path = path.clone();
        let writer = std::thread::spawn(move || {
            let fifo = crate::fs::file_open(&writer_path, "w").unwrap();
            fifo.write_bytes("through the fifo\n").unwrap();
            fifo.close().unwrap();
        });
        let fifo = crate::fs::file_open(&path, "r").unwrap();
        assert_eq!(&fifo.read_line().unwrap().unwrap()[..], b"through the fifo");
        writer.join().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn nonblocking_reads_report_again() {
        let (reader, _writer) = pipe_create().unwrap();
        reader
            .with(|stream| stream.source().set_nonblocking(true))
            .unwrap();
        assert_eq!(reader.read_line().unwrap_err().code(), Errno::Again);
    }
}

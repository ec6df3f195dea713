//! Platform independent status codes.
use std::io;
use thiserror::Error;

/// Symbolic error codes.
///
/// The set is fixed and does not depend on the numeric `errno` values of the
/// host, so callers can branch on the same symbols on every platform. The
/// `Display` implementation gives the human readable description, while
/// [`Errno::symbol`] gives the stable name (`"ENOENT"`, `"EOF"`, ...).
#[derive(Error, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Errno {
    /// No such file or directory
    #[error("no such file or directory")]
    Noent,
    /// Permission denied
    #[error("permission denied")]
    Acces,
    /// Operation not permitted
    #[error("operation not permitted")]
    Perm,
    /// File exists
    #[error("file exists")]
    Exist,
    /// Not a directory
    #[error("not a directory")]
    Notdir,
    /// Is a directory
    #[error("is a directory")]
    Isdir,
    /// Directory not empty
    #[error("directory not empty")]
    Notempty,
    /// Invalid argument
    #[error("invalid argument")]
    Inval,
    /// Bad file descriptor
    #[error("bad file descriptor")]
    Badf,
    /// Illegal seek
    #[error("illegal seek")]
    Spipe,
    /// Broken pipe
    #[error("broken pipe")]
    Pipe,
    /// Resource temporarily unavailable
    #[error("resource temporarily unavailable")]
    Again,
    /// Interrupted call
    #[error("interrupted system call")]
    Intr,
    /// The operation did not complete within the given amount of time
    #[error("connection timed out")]
    Timedout,
    /// Connection refused
    #[error("connection refused")]
    Connrefused,
    /// Connection reset by peer
    #[error("connection reset by peer")]
    Connreset,
    /// Connection aborted
    #[error("software caused connection abort")]
    Connaborted,
    /// The socket is not connected
    #[error("transport endpoint is not connected")]
    Notconn,
    /// Address already in use
    #[error("address already in use")]
    Addrinuse,
    /// Cannot assign requested address
    #[error("cannot assign requested address")]
    Addrnotavail,
    /// No route to host
    #[error("no route to host")]
    Hostunreach,
    /// Network is unreachable
    #[error("network is unreachable")]
    Netunreach,
    /// Too many open files
    #[error("too many open files")]
    Mfile,
    /// Out of memory
    #[error("not enough space")]
    Nomem,
    /// No space left on device
    #[error("no space left on device")]
    Nospc,
    /// The platform lacks the requested capability
    #[error("this function has not been implemented on this platform")]
    Notimpl,
    /// End of file or end of stream
    #[error("end of file found")]
    Eof,
    /// The handle was closed before the operation
    #[error("attempt to use a closed resource")]
    Closed,
    /// A generic failure that has no better classification
    #[error("internal error")]
    General,
    /// Some other unhandled error. If you see this, it's probably a bug.
    #[error("unknown error")]
    Unknown,
}

impl Errno {
    /// All codes, in declaration order.
    pub const ALL: [Errno; 30] = [
        Errno::Noent,
        Errno::Acces,
        Errno::Perm,
        Errno::Exist,
        Errno::Notdir,
        Errno::Isdir,
        Errno::Notempty,
        Errno::Inval,
        Errno::Badf,
        Errno::Spipe,
        Errno::Pipe,
        Errno::Again,
        Errno::Intr,
        Errno::Timedout,
        Errno::Connrefused,
        Errno::Connreset,
        Errno::Connaborted,
        Errno::Notconn,
        Errno::Addrinuse,
        Errno::Addrnotavail,
        Errno::Hostunreach,
        Errno::Netunreach,
        Errno::Mfile,
        Errno::Nomem,
        Errno::Nospc,
        Errno::Notimpl,
        Errno::Eof,
        Errno::Closed,
        Errno::General,
        Errno::Unknown,
    ];

    /// The stable symbolic name of this code.
    pub const fn symbol(&self) -> &'static str {
        match self {
            Errno::Noent => "ENOENT",
            Errno::Acces => "EACCES",
            Errno::Perm => "EPERM",
            Errno::Exist => "EEXIST",
            Errno::Notdir => "ENOTDIR",
            Errno::Isdir => "EISDIR",
            Errno::Notempty => "ENOTEMPTY",
            Errno::Inval => "EINVAL",
            Errno::Badf => "EBADF",
            Errno::Spipe => "ESPIPE",
            Errno::Pipe => "EPIPE",
            Errno::Again => "EAGAIN",
            Errno::Intr => "EINTR",
            Errno::Timedout => "ETIMEDOUT",
            Errno::Connrefused => "ECONNREFUSED",
            Errno::Connreset => "ECONNRESET",
            Errno::Connaborted => "ECONNABORTED",
            Errno::Notconn => "ENOTCONN",
            Errno::Addrinuse => "EADDRINUSE",
            Errno::Addrnotavail => "EADDRNOTAVAIL",
            Errno::Hostunreach => "EHOSTUNREACH",
            Errno::Netunreach => "ENETUNREACH",
            Errno::Mfile => "EMFILE",
            Errno::Nomem => "ENOMEM",
            Errno::Nospc => "ENOSPC",
            Errno::Notimpl => "ENOTIMPL",
            Errno::Eof => "EOF",
            Errno::Closed => "ECLOSED",
            Errno::General => "EGENERAL",
            Errno::Unknown => "EUNKNOWN",
        }
    }

    /// Looks a code up by its symbolic name.
    pub fn from_symbol(symbol: &str) -> Option<Errno> {
        Self::ALL.iter().copied().find(|errno| errno.symbol() == symbol)
    }

    /// Translates a raw OS error number into a symbolic code.
    #[cfg(unix)]
    pub fn from_raw_os_error(code: i32) -> Errno {
        match code {
            libc::ENOENT => Errno::Noent,
            libc::EACCES => Errno::Acces,
            libc::EPERM => Errno::Perm,
            libc::EEXIST => Errno::Exist,
            libc::ENOTDIR => Errno::Notdir,
            libc::EISDIR => Errno::Isdir,
            libc::ENOTEMPTY => Errno::Notempty,
            libc::EINVAL => Errno::Inval,
            libc::EBADF => Errno::Badf,
            libc::ESPIPE => Errno::Spipe,
            libc::EPIPE => Errno::Pipe,
            libc::EINTR => Errno::Intr,
            libc::ETIMEDOUT => Errno::Timedout,
            libc::ECONNREFUSED => Errno::Connrefused,
            libc::ECONNRESET => Errno::Connreset,
            libc::ECONNABORTED => Errno::Connaborted,
            libc::ENOTCONN => Errno::Notconn,
            libc::EADDRINUSE => Errno::Addrinuse,
            libc::EADDRNOTAVAIL => Errno::Addrnotavail,
            libc::EHOSTUNREACH => Errno::Hostunreach,
            libc::ENETUNREACH => Errno::Netunreach,
            libc::EMFILE | libc::ENFILE => Errno::Mfile,
            libc::ENOMEM => Errno::Nomem,
            libc::ENOSPC => Errno::Nospc,
            libc::ENOSYS | libc::ENOTSUP => Errno::Notimpl,
            code if code == libc::EAGAIN || code == libc::EWOULDBLOCK => Errno::Again,
            _ => Errno::Unknown,
        }
    }

    /// Translates a raw OS error number into a symbolic code.
    #[cfg(not(unix))]
    pub fn from_raw_os_error(code: i32) -> Errno {
        Errno::from(io::Error::from_raw_os_error(code).kind())
    }
}

impl From<io::ErrorKind> for Errno {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => Errno::Noent,
            io::ErrorKind::PermissionDenied => Errno::Acces,
            io::ErrorKind::AlreadyExists => Errno::Exist,
            io::ErrorKind::NotADirectory => Errno::Notdir,
            io::ErrorKind::IsADirectory => Errno::Isdir,
            io::ErrorKind::DirectoryNotEmpty => Errno::Notempty,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Errno::Inval,
            io::ErrorKind::NotSeekable => Errno::Spipe,
            io::ErrorKind::BrokenPipe => Errno::Pipe,
            io::ErrorKind::WouldBlock => Errno::Again,
            io::ErrorKind::Interrupted => Errno::Intr,
            io::ErrorKind::TimedOut => Errno::Timedout,
            io::ErrorKind::ConnectionRefused => Errno::Connrefused,
            io::ErrorKind::ConnectionReset => Errno::Connreset,
            io::ErrorKind::ConnectionAborted => Errno::Connaborted,
            io::ErrorKind::NotConnected => Errno::Notconn,
            io::ErrorKind::AddrInUse => Errno::Addrinuse,
            io::ErrorKind::AddrNotAvailable => Errno::Addrnotavail,
            io::ErrorKind::HostUnreachable => Errno::Hostunreach,
            io::ErrorKind::NetworkUnreachable => Errno::Netunreach,
            io::ErrorKind::OutOfMemory => Errno::Nomem,
            io::ErrorKind::StorageFull | io::ErrorKind::WriteZero => Errno::Nospc,
            io::ErrorKind::Unsupported => Errno::Notimpl,
            io::ErrorKind::UnexpectedEof => Errno::Eof,
            // if the following triggers, a new error type was added to this non-exhaustive enum
            _ => Errno::Unknown,
        }
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        Errno::from(&err)
    }
}

impl From<&io::Error> for Errno {
    fn from(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => match Errno::from_raw_os_error(code) {
                Errno::Unknown => Errno::from(err.kind()),
                errno => errno,
            },
            None => Errno::from(err.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn symbols_are_unique_and_reversible() {
        for errno in Errno::ALL {
            assert_eq!(Errno::from_symbol(errno.symbol()), Some(errno));
        }
        assert_eq!(Errno::from_symbol("ENOPE"), None);
    }

    #[test]
    fn io_errors_translate_to_symbols() {
        let err = io::Error::new(io::ErrorKind::NotFound, "missing");
        assert_eq!(Errno::from(err).symbol(), "ENOENT");

        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(Errno::from(&err), Errno::Connrefused);

        let err = io::Error::from(io::ErrorKind::WouldBlock);
        assert_eq!(Errno::from(err), Errno::Again);
    }

    #[cfg(unix)]
    #[test]
    fn raw_os_errors_translate_to_symbols() {
        let err = io::Error::from_raw_os_error(libc::EADDRINUSE);
        assert_eq!(Errno::from(err), Errno::Addrinuse);
        assert_eq!(Errno::from_raw_os_error(libc::ENOSYS), Errno::Notimpl);
    }
}

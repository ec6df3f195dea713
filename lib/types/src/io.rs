use std::str::FromStr;

use crate::Errno;

/// Reference point for a seek.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Whence {
    /// From the start of the stream
    Set,
    /// From the current position
    Cur,
    /// From the end of the stream
    End,
}

impl FromStr for Whence {
    type Err = Errno;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "set" => Ok(Whence::Set),
            "cur" => Ok(Whence::Cur),
            "end" => Ok(Whence::End),
            _ => Err(Errno::Inval),
        }
    }
}

/// Readiness a pollset entry is interested in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Interest {
    /// Data can be read without blocking
    Readable,
    /// Data can be written without blocking
    Writable,
    /// Both of the above
    Both,
}

impl Interest {
    /// Whether read readiness is requested.
    pub const fn is_readable(&self) -> bool {
        matches!(self, Interest::Readable | Interest::Both)
    }

    /// Whether write readiness is requested.
    pub const fn is_writable(&self) -> bool {
        matches!(self, Interest::Writable | Interest::Both)
    }
}

impl FromStr for Interest {
    type Err = Errno;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" | "readable" => Ok(Interest::Readable),
            "output" | "writable" => Ok(Interest::Writable),
            "both" => Ok(Interest::Both),
            _ => Err(Errno::Inval),
        }
    }
}

/// Which direction of a socket to shut down.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ShutdownHow {
    /// No more reads
    Read,
    /// No more writes
    Write,
    /// Neither
    Both,
}

impl FromStr for ShutdownHow {
    type Err = Errno;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(ShutdownHow::Read),
            "write" => Ok(ShutdownHow::Write),
            "both" => Ok(ShutdownHow::Both),
            _ => Err(Errno::Inval),
        }
    }
}

//! The buffered I/O engine shared by files, sockets, pipes and shared
//! memory segments.
//!
//! Reads follow the classic `io` text contract: a read takes a list of
//! [`ReadFormat`]s and yields one value per format, nil once the stream
//! runs dry. Writes accept strings and numbers.
mod buffer;
mod format;
mod lines;
mod stream;

pub use self::{
    format::{format_number, ReadFormat},
    lines::Lines,
    stream::{RawIo, Stream, StreamSource},
};

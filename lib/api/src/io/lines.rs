use bytes::Bytes;

use super::stream::{Stream, StreamSource};
use crate::{handle::Handle, Result};

/// Iterator over the lines of a stream handle, created by
/// [`Handle::lines`](crate::Handle).
///
/// Holds its own reference to the handle. Iteration ends at end of stream
/// or after the first error, which is yielded once.
#[derive(Debug)]
pub struct Lines<S: StreamSource> {
    handle: Handle<Stream<S>>,
    done: bool,
}

impl<S: StreamSource> Lines<S> {
    pub(crate) fn new(handle: Handle<Stream<S>>) -> Self {
        Self {
            handle,
            done: false,
        }
    }
}

impl<S: StreamSource> Iterator for Lines<S> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.handle.read_line() {
            Ok(Some(line)) => Some(Ok(line)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl<S: StreamSource> std::iter::FusedIterator for Lines<S> {}

#[cfg(test)]
mod tests {
    use super::super::stream::tests::Chunked;
    use super::*;
    use portos_types::Errno;

    #[test]
    fn stops_at_end_of_stream() {
        let handle = Handle::new(Stream::with_capacity(Chunked::new(b"a\nb\n", 1), 4));
        let lines: Vec<Bytes> = handle.lines().collect::<Result<_>>().unwrap();
        assert_eq!(lines, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(handle.lines().count(), 0);
    }

    #[test]
    fn yields_the_closed_error_once() {
        let handle = Handle::new(Stream::with_capacity(Chunked::new(b"a\n", 1), 4));
        let mut lines = handle.lines();
        handle.close().unwrap();
        assert_eq!(lines.next().unwrap().unwrap_err().code(), Errno::Closed);
        assert!(lines.next().is_none());
    }
}

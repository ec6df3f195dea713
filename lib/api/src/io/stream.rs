use std::io::SeekFrom;

use bytes::Bytes;
use portos_types::{Errno, ResourceKind, Whence};

use super::{
    buffer::Buffer,
    format::{format_number, parse_numeral, scan_numeral, ReadFormat},
    lines::Lines,
};
use crate::{
    handle::{Canceller, Descriptor, Handle, Resource},
    runtime, Error, Result, Value,
};

/// Unbuffered access to a transport.
///
/// Errors are already mapped into the crate's status model. A read of zero
/// bytes means end of stream; everything else is just a hint.
pub trait RawIo {
    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn write_raw(&mut self, buf: &[u8]) -> Result<usize>;

    fn flush_raw(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_seekable(&self) -> bool {
        false
    }

    fn seek_raw(&mut self, pos: SeekFrom) -> Result<u64> {
        let _ = pos;
        Err(Error::new(Errno::Spipe, "illegal seek"))
    }

    /// Whether writes are collected until a flush instead of being sent
    /// immediately.
    fn buffers_writes(&self) -> bool {
        false
    }
}

/// A transport that can back a [`Stream`] handle.
pub trait StreamSource: RawIo + Send + 'static {
    const KIND: ResourceKind;

    fn descriptor(&self) -> Descriptor;

    /// Releases the transport. Pending writes have already been flushed.
    fn close_source(&mut self) -> Result<()>;

    fn canceller(&self) -> Option<Canceller> {
        None
    }
}

/// A buffered reader/writer over a [`StreamSource`].
#[derive(Debug)]
pub struct Stream<S> {
    source: S,
    input: Buffer,
    output: Vec<u8>,
}

impl<S: StreamSource> Resource for Stream<S> {
    const KIND: ResourceKind = S::KIND;

    fn descriptor(&self) -> Descriptor {
        self.source.descriptor()
    }

    fn close(&mut self) -> Result<()> {
        let flushed = self.flush();
        let closed = self.source.close_source();
        flushed.and(closed)
    }

    fn canceller(&self) -> Option<Canceller> {
        self.source.canceller()
    }
}

impl<S: StreamSource> Stream<S> {
    pub fn new(source: S) -> Self {
        Self::with_capacity(source, runtime::active_config().buffer_size)
    }

    pub fn with_capacity(source: S, capacity: usize) -> Self {
        Self {
            source,
            input: Buffer::new(capacity),
            output: Vec::new(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn has_buffered_input(&self) -> bool {
        !self.input.is_empty()
    }

    /// Evaluates `formats` left to right. Once one of them yields nil the
    /// remaining ones yield nil too.
    pub fn read(&mut self, formats: &[ReadFormat]) -> Result<Vec<Value>> {
        self.flush()?;
        let formats = if formats.is_empty() {
            &[ReadFormat::Line][..]
        } else {
            formats
        };

        let mut values = Vec::with_capacity(formats.len());
        let mut exhausted = false;
        for format in formats {
            if exhausted {
                values.push(Value::Nil);
                continue;
            }
            let value = match *format {
                ReadFormat::Line => self.read_line(false)?.map(Value::String),
                ReadFormat::LineWithEnding => self.read_line(true)?.map(Value::String),
                ReadFormat::All => Some(Value::String(self.read_all()?)),
                ReadFormat::Number => self.read_number()?.map(Value::Number),
                ReadFormat::Bytes(count) => self.read_bytes(count)?.map(Value::String),
            };
            exhausted = value.is_none();
            values.push(value.unwrap_or(Value::Nil));
        }
        Ok(values)
    }

    /// Reads up to the next `\n`. Returns `None` only when the stream is
    /// already at its end.
    ///
    /// Bytes stay buffered until the line is complete, so a failed read
    /// (a deadline, `EAGAIN`) loses nothing and the next call picks up
    /// where this one stopped.
    pub fn read_line(&mut self, keep_newline: bool) -> Result<Option<Bytes>> {
        self.flush()?;
        let mut scanned = 0;
        loop {
            let unread = self.input.unread();
            if let Some(pos) = unread[scanned..].iter().position(|&b| b == b'\n') {
                let newline = scanned + pos;
                let end = if keep_newline { newline + 1 } else { newline };
                let line = Bytes::copy_from_slice(&unread[..end]);
                self.input.consume(newline + 1);
                return Ok(Some(line));
            }
            scanned = unread.len();
            if self.fill()? == 0 {
                let rest = self.input.available();
                return Ok((rest > 0).then(|| self.take(rest)));
            }
        }
    }

    /// Reads until end of stream. At end of stream this is the empty string,
    /// every time.
    pub fn read_all(&mut self) -> Result<Bytes> {
        self.flush()?;
        while self.fill()? > 0 {}
        Ok(self.take(self.input.available()))
    }

    /// Reads up to `count` bytes. `None` at end of stream unless `count` is
    /// zero, which always succeeds with the empty string.
    pub fn read_bytes(&mut self, count: usize) -> Result<Option<Bytes>> {
        if count == 0 {
            return Ok(Some(Bytes::new()));
        }
        self.flush()?;
        while self.input.available() < count {
            if self.fill()? == 0 {
                break;
            }
        }
        let take = count.min(self.input.available());
        Ok((take > 0).then(|| self.take(take)))
    }

    /// Skips whitespace and reads a numeral. An invalid numeral yields
    /// `None` and leaves the stream positioned at its first byte.
    pub fn read_number(&mut self) -> Result<Option<f64>> {
        self.flush()?;
        loop {
            if self.input.is_empty() && self.fill()? == 0 {
                return Ok(None);
            }
            let unread = self.input.unread();
            let blanks = unread
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            let all_blank = blanks == unread.len();
            self.input.consume(blanks);
            if !all_blank {
                break;
            }
        }

        let number = match scan_numeral(|index| self.peek(index))? {
            Some(len) => parse_numeral(&self.input.unread()[..len]).map(|number| (len, number)),
            None => None,
        };
        match number {
            Some((len, number)) => {
                self.input.consume(len);
                Ok(Some(number))
            }
            None => {
                tracing::trace!(kind = %S::KIND, "read: invalid numeral");
                Ok(None)
            }
        }
    }

    /// Writes strings and numbers, returning the number of bytes written.
    pub fn write(&mut self, values: &[Value]) -> Result<usize> {
        let mut chunks = Vec::with_capacity(values.len());
        for (index, value) in values.iter().enumerate() {
            match value {
                Value::String(data) => chunks.push(data.clone()),
                Value::Number(number) => chunks.push(Bytes::from(format_number(*number))),
                other => {
                    return Err(Error::invalid(format!(
                        "bad argument #{} to 'write' (string expected, got {})",
                        index + 1,
                        other.type_name()
                    )))
                }
            }
        }
        let mut written = 0;
        for chunk in chunks {
            written += self.write_bytes(&chunk)?;
        }
        Ok(written)
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<usize> {
        self.discard_read_ahead()?;
        if self.source.buffers_writes() {
            self.output.extend_from_slice(data);
            if self.output.len() >= self.input.capacity() {
                self.flush()?;
            }
        } else {
            self.write_through(data)?;
        }
        Ok(data.len())
    }

    /// Sends buffered writes to the transport.
    pub fn flush(&mut self) -> Result<()> {
        if !self.output.is_empty() {
            let pending = std::mem::take(&mut self.output);
            tracing::trace!(kind = %S::KIND, bytes = pending.len(), "flushing");
            self.write_through(&pending)?;
        }
        self.source.flush_raw()
    }

    /// Moves the stream position and returns the new absolute offset.
    pub fn seek(&mut self, whence: Whence, offset: i64) -> Result<u64> {
        if !self.source.is_seekable() {
            return Err(Error::new(
                Errno::Spipe,
                format!("cannot seek on this {}", S::KIND),
            ));
        }
        self.flush()?;
        let target = match whence {
            Whence::Set => SeekFrom::Start(
                u64::try_from(offset).map_err(|_| Error::invalid("negative seek offset"))?,
            ),
            Whence::Cur => SeekFrom::Current(
                i64::try_from(self.input.available())
                    .ok()
                    .and_then(|buffered| offset.checked_sub(buffered))
                    .ok_or_else(|| Error::invalid("seek offset out of range"))?,
            ),
            Whence::End => SeekFrom::End(offset),
        };
        let position = self.source.seek_raw(target)?;
        self.input.clear();
        Ok(position)
    }

    /// Reads more from the transport behind the bytes already buffered.
    /// Returns 0 at end of stream.
    fn fill(&mut self) -> Result<usize> {
        let source = &mut self.source;
        loop {
            match self.input.extend(|buf| source.read_raw(buf)) {
                Err(err) if err.interrupted() => continue,
                other => return other,
            }
        }
    }

    fn peek(&mut self, index: usize) -> Result<Option<u8>> {
        while self.input.available() <= index {
            if self.fill()? == 0 {
                return Ok(None);
            }
        }
        Ok(Some(self.input.unread()[index]))
    }

    fn take(&mut self, amount: usize) -> Bytes {
        let data = Bytes::copy_from_slice(&self.input.unread()[..amount]);
        self.input.consume(amount);
        data
    }

    /// Read-ahead moved the transport position past the logical one; put it
    /// back before writing.
    fn discard_read_ahead(&mut self) -> Result<()> {
        if self.input.is_empty() || !self.source.is_seekable() {
            return Ok(());
        }
        let back = self.input.available() as i64;
        self.source.seek_raw(SeekFrom::Current(-back))?;
        self.input.clear();
        Ok(())
    }

    fn write_through(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            match self.source.write_raw(data) {
                Ok(0) => {
                    return Err(Error::new(
                        Errno::Pipe,
                        format!("{} accepted no more data", S::KIND),
                    ))
                }
                Ok(written) => data = &data[written.min(data.len())..],
                Err(err) if err.interrupted() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Buffered I/O shared by every stream-like handle (files, sockets, pipes,
/// shared memory segments).
impl<S: StreamSource> Handle<Stream<S>> {
    /// Reads one value per format. See [`ReadFormat`].
    pub fn read(&self, formats: &[ReadFormat]) -> Result<Vec<Value>> {
        self.with(|stream| stream.read(formats))
    }

    pub fn read_line(&self) -> Result<Option<Bytes>> {
        self.with(|stream| stream.read_line(false))
    }

    pub fn read_all(&self) -> Result<Bytes> {
        self.with(|stream| stream.read_all())
    }

    pub fn read_bytes(&self, count: usize) -> Result<Option<Bytes>> {
        self.with(|stream| stream.read_bytes(count))
    }

    pub fn read_number(&self) -> Result<Option<f64>> {
        self.with(|stream| stream.read_number())
    }

    pub fn write(&self, values: &[Value]) -> Result<usize> {
        self.with(|stream| stream.write(values))
    }

    pub fn write_bytes(&self, data: impl AsRef<[u8]>) -> Result<usize> {
        self.with(|stream| stream.write_bytes(data.as_ref()))
    }

    pub fn flush(&self) -> Result<()> {
        self.with(|stream| stream.flush())
    }

    pub fn seek(&self, whence: Whence, offset: i64) -> Result<u64> {
        self.with(|stream| stream.seek(whence, offset))
    }

    /// Iterates over the remaining lines, terminators stripped.
    pub fn lines(&self) -> Lines<S> {
        Lines::new(self.clone())
    }

    /// Whether bytes have been read from the transport but not yet
    /// consumed. `false` for closed handles.
    pub fn has_buffered_input(&self) -> bool {
        self.try_with(|stream| stream.has_buffered_input())
            .unwrap_or(false)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    /// An in-memory transport that hands out its input in fixed-size
    /// chunks and records what gets written.
    #[derive(Debug)]
    pub(crate) struct Chunked {
        pub input: Vec<u8>,
        pub position: usize,
        pub chunk: usize,
        pub written: Arc<Mutex<Vec<u8>>>,
        pub buffered: bool,
        pub closes: Arc<AtomicUsize>,
        pub descriptor: Descriptor,
    }

    impl Chunked {
        pub fn new(input: &[u8], chunk: usize) -> Self {
            Self {
                input: input.to_vec(),
                position: 0,
                chunk,
                written: Arc::default(),
                buffered: false,
                closes: Arc::default(),
                descriptor: Descriptor::unique(),
            }
        }
    }

    impl RawIo for Chunked {
        fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
            let rest = &self.input[self.position.min(self.input.len())..];
            let n = rest.len().min(buf.len()).min(self.chunk);
            buf[..n].copy_from_slice(&rest[..n]);
            self.position += n;
            Ok(n)
        }

        fn write_raw(&mut self, buf: &[u8]) -> Result<usize> {
            let n = buf.len().min(self.chunk);
            self.written.lock().unwrap().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn buffers_writes(&self) -> bool {
            self.buffered
        }

        fn is_seekable(&self) -> bool {
            true
        }

        fn seek_raw(&mut self, pos: SeekFrom) -> Result<u64> {
            let base = match pos {
                SeekFrom::Start(offset) => offset as i64,
                SeekFrom::Current(offset) => self.position as i64 + offset,
                SeekFrom::End(offset) => self.input.len() as i64 + offset,
            };
            if base < 0 {
                return Err(Error::invalid("negative position"));
            }
            self.position = base as usize;
            Ok(self.position as u64)
        }
    }

    impl StreamSource for Chunked {
        const KIND: ResourceKind = ResourceKind::File;

        fn descriptor(&self) -> Descriptor {
            self.descriptor
        }

        fn close_source(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Plays back a fixed sequence of reads; an `Err` step fails exactly
    /// one read, like a deadline or a non-blocking descriptor would.
    #[derive(Debug)]
    struct Scripted {
        steps: VecDeque<std::result::Result<Vec<u8>, Errno>>,
        descriptor: Descriptor,
    }

    impl Scripted {
        fn new(steps: Vec<std::result::Result<&[u8], Errno>>) -> Self {
            Self {
                steps: steps.into_iter().map(|step| step.map(<[u8]>::to_vec)).collect(),
                descriptor: Descriptor::unique(),
            }
        }
    }

    impl RawIo for Scripted {
        fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
            match self.steps.pop_front() {
                None => Ok(0),
                Some(Err(code)) => Err(Error::from(code)),
                Some(Ok(mut chunk)) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.steps.push_front(Ok(chunk.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }

        fn write_raw(&mut self, buf: &[u8]) -> Result<usize> {
            Ok(buf.len())
        }
    }

    impl StreamSource for Scripted {
        const KIND: ResourceKind = ResourceKind::Socket;

        fn descriptor(&self) -> Descriptor {
            self.descriptor
        }

        fn close_source(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn stream(input: &[u8], chunk: usize) -> Stream<Chunked> {
        Stream::with_capacity(Chunked::new(input, chunk), 8)
    }

    fn text(value: &Value) -> &[u8] {
        value.as_bytes().expect("string value")
    }

    #[test]
    fn lines_survive_any_chunking() {
        let input = b"first line\nsecond, somewhat longer line\n\nlast";
        for chunk in 1..=input.len() {
            let mut stream = stream(input, chunk);
            let mut lines = Vec::new();
            while let Some(line) = stream.read_line(false).unwrap() {
                lines.push(line);
            }
            assert_eq!(
                lines,
                vec![
                    Bytes::from_static(b"first line"),
                    Bytes::from_static(b"second, somewhat longer line"),
                    Bytes::new(),
                    Bytes::from_static(b"last"),
                ],
                "chunk size {chunk}"
            );
        }
    }

    #[test]
    fn keeps_line_endings_on_request() {
        let mut stream = stream(b"a\nb", 3);
        let values = stream
            .read(&[ReadFormat::LineWithEnding, ReadFormat::LineWithEnding])
            .unwrap();
        assert_eq!(text(&values[0]), b"a\n");
        assert_eq!(text(&values[1]), b"b");
    }

    #[test]
    fn end_of_stream_is_idempotent() {
        let mut stream = stream(b"xyz", 2);
        assert_eq!(&stream.read_all().unwrap()[..], b"xyz");
        for _ in 0..3 {
            assert_eq!(stream.read_all().unwrap(), Bytes::new());
            assert_eq!(stream.read_line(false).unwrap(), None);
            assert_eq!(stream.read_bytes(4).unwrap(), None);
            assert_eq!(stream.read_bytes(0).unwrap(), Some(Bytes::new()));
            assert_eq!(stream.read_number().unwrap(), None);
        }
    }

    #[test]
    fn nil_poisons_the_remaining_formats() {
        let mut stream = stream(b"only\n", 16);
        let values = stream
            .read(&[ReadFormat::Line, ReadFormat::Line, ReadFormat::All])
            .unwrap();
        assert_eq!(text(&values[0]), b"only");
        assert_eq!(values[1], Value::Nil);
        assert_eq!(values[2], Value::Nil);

        // not sticky across calls
        let values = stream.read(&[ReadFormat::All]).unwrap();
        assert_eq!(text(&values[0]), b"");
    }

    #[test]
    fn reads_numbers_across_chunks() {
        let mut stream = stream(b"  12.5e1\n-0x10 3 oops 4", 1);
        let values = stream
            .read(&[
                ReadFormat::Number,
                ReadFormat::Number,
                ReadFormat::Number,
            ])
            .unwrap();
        assert_eq!(
            values,
            vec![
                Value::Number(125.0),
                Value::Number(-16.0),
                Value::Number(3.0)
            ]
        );
        assert_eq!(stream.read_number().unwrap(), None);
        // the invalid token is still there
        assert_eq!(&stream.read_bytes(4).unwrap().unwrap()[..], b"oops");
        assert_eq!(stream.read_number().unwrap(), Some(4.0));
    }

    #[test]
    fn fixed_size_reads_are_binary_safe() {
        let mut stream = stream(b"\0\n\0abc\n", 2);
        assert_eq!(&stream.read_bytes(3).unwrap().unwrap()[..], b"\0\n\0");
        assert_eq!(&stream.read_bytes(100).unwrap().unwrap()[..], b"abc\n");
        assert_eq!(stream.read_bytes(1).unwrap(), None);
    }

    #[test]
    fn writes_strings_and_numbers() {
        let mut stream = stream(b"", 3);
        let written = stream
            .write(&[Value::from("n="), Value::Number(1.5), Value::from("\n")])
            .unwrap();
        assert_eq!(written, 6);
        assert_eq!(&*stream.source().written.lock().unwrap(), b"n=1.5\n");

        let err = stream.write(&[Value::Boolean(true)]).unwrap_err();
        assert_eq!(err.code(), Errno::Inval);
        assert_eq!(
            err.message(),
            "bad argument #1 to 'write' (string expected, got boolean)"
        );
    }

    #[test]
    fn buffered_writes_wait_for_flush() {
        let mut source = Chunked::new(b"", 64);
        source.buffered = true;
        let written = source.written.clone();
        let mut stream = Stream::with_capacity(source, 8);
        stream.write_bytes(b"abc").unwrap();
        assert!(written.lock().unwrap().is_empty());
        stream.flush().unwrap();
        assert_eq!(&*written.lock().unwrap(), b"abc");
        // a full buffer goes out on its own
        stream.write_bytes(b"0123456789").unwrap();
        assert_eq!(written.lock().unwrap().len(), 13);
    }

    #[test]
    fn seek_accounts_for_buffered_input() {
        let mut stream = stream(b"0123456789", 10);
        assert_eq!(&stream.read_bytes(2).unwrap().unwrap()[..], b"01");
        assert!(stream.has_buffered_input());
        assert_eq!(stream.seek(Whence::Cur, 0).unwrap(), 2);
        assert!(!stream.has_buffered_input());
        assert_eq!(stream.seek(Whence::End, -3).unwrap(), 7);
        assert_eq!(&stream.read_all().unwrap()[..], b"789");
        assert_eq!(stream.seek(Whence::Set, 4).unwrap(), 4);
        assert_eq!(stream.read_number().unwrap(), Some(456789.0));
        assert_eq!(
            stream.seek(Whence::Set, -1).unwrap_err().code(),
            Errno::Inval
        );
    }

    #[test]
    fn close_flushes_then_releases_once() {
        let mut source = Chunked::new(b"", 64);
        source.buffered = true;
        let written = source.written.clone();
        let closes = source.closes.clone();
        let handle = Handle::new(Stream::with_capacity(source, 64));
        handle.write_bytes("pending").unwrap();
        handle.close().unwrap();
        handle.close().unwrap();
        assert_eq!(&*written.lock().unwrap(), b"pending");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(
            handle.read_line().unwrap_err().message(),
            "attempt to use a closed file"
        );
    }

    #[test]
    fn failed_reads_keep_partial_input() {
        let mut stream = Stream::with_capacity(
            Scripted::new(vec![
                Ok(&b"abc"[..]),
                Err(Errno::Timedout),
                Ok(&b"def\n12"[..]),
                Err(Errno::Again),
                Ok(&b"34 tail"[..]),
                Err(Errno::Again),
                Ok(&b"\n"[..]),
            ]),
            4,
        );
        assert_eq!(stream.read_line(false).unwrap_err().code(), Errno::Timedout);
        assert_eq!(&stream.read_line(false).unwrap().unwrap()[..], b"abcdef");

        assert_eq!(stream.read_number().unwrap_err().code(), Errno::Again);
        assert_eq!(stream.read_number().unwrap(), Some(1234.0));

        assert_eq!(stream.read_bytes(10).unwrap_err().code(), Errno::Again);
        assert_eq!(&stream.read_bytes(10).unwrap().unwrap()[..], b" tail\n");
        assert_eq!(stream.read_all().unwrap(), Bytes::new());
    }

    #[test]
    fn read_all_keeps_input_across_failures() {
        let mut stream = Stream::with_capacity(
            Scripted::new(vec![Ok(&b"first "[..]), Err(Errno::Again), Ok(&b"second"[..])]),
            4,
        );
        assert_eq!(stream.read_all().unwrap_err().code(), Errno::Again);
        assert_eq!(&stream.read_all().unwrap()[..], b"first second");
    }

    #[test]
    fn overlong_numerals_read_as_nil() {
        let mut input = vec![b'1'; 250];
        input.extend_from_slice(b" 7\n");
        let mut stream = stream(&input, 16);
        assert_eq!(
            stream.read(&[ReadFormat::Number, ReadFormat::Number]).unwrap(),
            vec![Value::Nil, Value::Nil]
        );
        // nothing was consumed
        assert_eq!(&stream.read_bytes(3).unwrap().unwrap()[..], b"111");
    }

    #[test]
    fn relative_seeks_that_overflow_are_invalid() {
        let mut stream = stream(b"0123456789", 10);
        assert_eq!(&stream.read_bytes(2).unwrap().unwrap()[..], b"01");
        assert_eq!(
            stream.seek(Whence::Cur, i64::MIN).unwrap_err().code(),
            Errno::Inval
        );
        assert_eq!(stream.seek(Whence::Cur, 0).unwrap(), 2);
    }
}

use crate::Result;

/// A byte block with a read cursor and a write cursor.
///
/// `read <= write <= capacity` holds at all times. The block grows while
/// a read needs more look-ahead and drops back to its initial size once
/// everything has been consumed.
#[derive(Debug)]
pub(crate) struct Buffer {
    data: Vec<u8>,
    initial: usize,
    read: usize,
    write: usize,
}

impl Buffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: vec![0; capacity],
            initial: capacity,
            read: 0,
            write: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of bytes that have been filled but not consumed.
    pub fn available(&self) -> usize {
        self.write - self.read
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    pub fn unread(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    pub fn consume(&mut self, amount: usize) {
        debug_assert!(amount <= self.available());
        self.read += amount.min(self.available());
        if self.is_empty() {
            self.clear();
        }
    }

    /// Drops everything, e.g. after a seek.
    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
        if self.data.len() > self.initial {
            self.data.truncate(self.initial);
            self.data.shrink_to_fit();
        }
    }

    /// Appends more bytes after the unread ones, compacting first and
    /// growing the block when it is full. A failing `source` leaves the
    /// unread bytes untouched.
    pub fn extend(
        &mut self,
        source: impl FnOnce(&mut [u8]) -> Result<usize>,
    ) -> Result<usize> {
        if self.read > 0 {
            self.data.copy_within(self.read..self.write, 0);
            self.write -= self.read;
            self.read = 0;
        }
        if self.write == self.data.len() {
            let grown = self.data.len() * 2;
            self.data.resize(grown, 0);
        }
        let filled = source(&mut self.data[self.write..])?;
        self.write += filled.min(self.data.len() - self.write);
        Ok(filled)
    }
}

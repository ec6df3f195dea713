//! Scoped allocation contexts.
//!
//! An [`Arena`] is paired with a single resource (a directory, a process)
//! and owns the byte strings allocated on that resource's behalf plus the
//! teardown actions the resource registered. Dependent handles hold an
//! [`ArenaRef`]; the teardown runs exactly once, after the owner and every
//! reference are gone.
use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use bytes::{Bytes, BytesMut};

const CHUNK_SIZE: usize = 4096;

type Cleanup = Box<dyn FnOnce() + Send>;

struct ArenaInner {
    label: &'static str,
    chunk: Mutex<BytesMut>,
    allocated: AtomicUsize,
    cleanups: Mutex<Vec<Cleanup>>,
}

impl Drop for ArenaInner {
    fn drop(&mut self) {
        let cleanups = std::mem::take(
            self.cleanups
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        tracing::trace!(
            label = self.label,
            allocated = self.allocated.load(Ordering::Relaxed),
            cleanups = cleanups.len(),
            "arena destroyed"
        );
        for cleanup in cleanups.into_iter().rev() {
            cleanup();
        }
    }
}

/// The owning side of an arena. Not cloneable: exactly one resource drives
/// its lifetime.
pub struct Arena {
    inner: Arc<ArenaInner>,
}

/// A non-owning reference that defers the arena's teardown.
#[derive(Clone)]
pub struct ArenaRef {
    inner: Arc<ArenaInner>,
}

impl Arena {
    pub fn new(label: &'static str) -> Self {
        Self {
            inner: Arc::new(ArenaInner {
                label,
                chunk: Mutex::new(BytesMut::new()),
                allocated: AtomicUsize::new(0),
                cleanups: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Copies `data` into arena storage.
    ///
    /// Small allocations share chunks; the returned [`Bytes`] keep their
    /// chunk alive on their own.
    pub fn alloc(&self, data: &[u8]) -> Bytes {
        let mut chunk = self
            .inner
            .chunk
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if chunk.capacity() - chunk.len() < data.len() {
            *chunk = BytesMut::with_capacity(CHUNK_SIZE.max(data.len()));
        }
        chunk.extend_from_slice(data);
        self.inner.allocated.fetch_add(data.len(), Ordering::Relaxed);
        chunk.split().freeze()
    }

    pub fn alloc_str(&self, data: &str) -> Bytes {
        self.alloc(data.as_bytes())
    }

    /// Registers an action to run when the arena is torn down. Actions run
    /// in reverse registration order.
    pub fn on_destroy(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.inner
            .cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(cleanup));
    }

    pub fn reference(&self) -> ArenaRef {
        ArenaRef {
            inner: self.inner.clone(),
        }
    }

    /// Total bytes handed out by [`Arena::alloc`].
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }

    /// Releases the owner's claim. Teardown happens now if nothing else
    /// references the arena, otherwise when the last [`ArenaRef`] drops.
    pub fn destroy(self) {
        let pending = Arc::strong_count(&self.inner) - 1;
        if pending > 0 {
            tracing::trace!(label = self.inner.label, pending, "arena teardown deferred");
        }
    }
}

impl ArenaRef {
    pub fn label(&self) -> &'static str {
        self.inner.label
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("label", &self.inner.label)
            .field("allocated", &self.allocated())
            .finish()
    }
}

impl fmt::Debug for ArenaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaRef")
            .field("label", &self.inner.label)
            .finish()
    }
}

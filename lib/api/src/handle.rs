//! Reference counted resource handles.
//!
//! Every resource kind (files, sockets, processes, ...) is wrapped in a
//! [`Handle`]. A handle is cheap to clone: clones share the same resource
//! and the resource is closed exactly once, either by an explicit
//! [`Handle::close`] or when the last clone is dropped.
use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak,
    },
};

use portos_types::ResourceKind;

use crate::{Error, Result};

/// What a handle wraps, used for identity comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Descriptor {
    /// An operating system descriptor (file descriptor, socket, handle)
    Os(i64),
    /// A process unique id for resources that have no OS descriptor
    Unique(u64),
}

impl Descriptor {
    /// Allocates a fresh process unique descriptor.
    pub fn unique() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Descriptor::Unique(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(unix)]
    pub fn from_fd(fd: std::os::fd::RawFd) -> Self {
        Descriptor::Os(fd as i64)
    }

    /// The OS descriptor number, if there is one.
    pub fn raw(&self) -> Option<i64> {
        match self {
            Descriptor::Os(raw) => Some(*raw),
            Descriptor::Unique(_) => None,
        }
    }
}

/// Forces a blocking call on a resource to return early.
///
/// Only invoked by [`Handle::close`] while the resource is still open.
pub type Canceller = Box<dyn Fn() + Send + Sync>;

/// A resource that can live inside a [`Handle`].
///
/// Implementations exist for every kind this crate provides; external
/// collaborators (database drivers, parsers, ...) implement it for their
/// own types to get the same lifecycle.
pub trait Resource: Send + 'static {
    const KIND: ResourceKind;

    fn descriptor(&self) -> Descriptor;

    /// Releases the underlying resource. Called at most once.
    fn close(&mut self) -> Result<()>;

    /// How to wake a thread that is blocked inside an operation on this
    /// resource. Resources without one make `close` wait for the
    /// operation to finish.
    fn canceller(&self) -> Option<Canceller> {
        None
    }
}

struct Inner<R: Resource> {
    descriptor: Descriptor,
    closing: AtomicBool,
    closed: AtomicBool,
    cancel: Option<Canceller>,
    resource: Mutex<Option<R>>,
}

impl<R: Resource> Drop for Inner<R> {
    fn drop(&mut self) {
        let resource = self
            .resource
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut resource) = resource {
            tracing::debug!(kind = %R::KIND, descriptor = ?self.descriptor, "finalizing handle");
            // Nobody is left to report this to
            if let Err(err) = resource.close() {
                tracing::warn!(
                    kind = %R::KIND,
                    descriptor = ?self.descriptor,
                    error = %err,
                    "failed to close resource during finalization"
                );
            }
        }
    }
}

/// A shared, closable resource.
pub struct Handle<R: Resource> {
    inner: Arc<Inner<R>>,
}

impl<R: Resource> Handle<R> {
    pub fn new(resource: R) -> Self {
        let descriptor = resource.descriptor();
        let cancel = resource.canceller();
        tracing::debug!(kind = %R::KIND, ?descriptor, "handle opened");
        Self {
            inner: Arc::new(Inner {
                descriptor,
                closing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                cancel,
                resource: Mutex::new(Some(resource)),
            }),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        R::KIND
    }

    pub fn descriptor(&self) -> Descriptor {
        self.inner.descriptor
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of live references to the resource.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Closes the resource. Closing an already closed handle succeeds
    /// without doing anything.
    ///
    /// A thread blocked in an operation on the same resource is woken
    /// through the resource's [`Canceller`] and sees a closed error.
    pub fn close(&self) -> Result<()> {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            // Somebody else closes; wait until the resource is gone
            drop(self.guard());
            return Ok(());
        }
        let resource = {
            let mut guard = match self.inner.resource.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    // Only closers take the resource, so it is still open here
                    if let Some(cancel) = &self.inner.cancel {
                        tracing::debug!(kind = %R::KIND, descriptor = ?self.inner.descriptor, "cancelling blocked operation");
                        cancel();
                    }
                    self.guard()
                }
            };
            let resource = guard.take();
            self.inner.closed.store(true, Ordering::Release);
            resource
        };
        match resource {
            Some(mut resource) => {
                tracing::debug!(kind = %R::KIND, descriptor = ?self.inner.descriptor, "closing handle");
                resource.close()
            }
            None => Ok(()),
        }
    }

    /// Runs `f` against the open resource, or fails with a closed error.
    ///
    /// The handle stays locked while `f` runs; operations issued through
    /// the same handle are therefore serialized. An operation that fails
    /// because the handle got closed underneath it reports a closed error.
    pub fn with<T>(&self, f: impl FnOnce(&mut R) -> Result<T>) -> Result<T> {
        let mut guard = self.guard();
        match guard.as_mut() {
            Some(resource) => match f(resource) {
                Err(_) if self.inner.closing.load(Ordering::Acquire) => {
                    Err(Error::closed(R::KIND))
                }
                other => other,
            },
            None => Err(Error::closed(R::KIND)),
        }
    }

    /// Like [`Handle::with`] but gives up instead of waiting when another
    /// thread currently uses the handle. Returns `None` when the handle is
    /// busy or closed.
    pub fn try_with<T>(&self, f: impl FnOnce(&mut R) -> T) -> Option<T> {
        let mut guard = match self.inner.resource.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        guard.as_mut().map(f)
    }

    pub fn downgrade(&self) -> WeakHandle<R> {
        WeakHandle {
            inner: Arc::downgrade(&self.inner),
            descriptor: self.inner.descriptor,
        }
    }

    /// Whether both handles are clones of the same wrapper.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn guard(&self) -> MutexGuard<'_, Option<R>> {
        // A panic while holding the lock leaves the resource usable
        self.inner
            .resource
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: Resource> Clone for Handle<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: Resource> PartialEq for Handle<R> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.descriptor == other.inner.descriptor
    }
}

impl<R: Resource> Eq for Handle<R> {}

impl<R: Resource> Hash for Handle<R> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        R::KIND.hash(state);
        self.inner.descriptor.hash(state);
    }
}

impl<R: Resource> fmt::Display for Handle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_closed() {
            write!(f, "{} (closed)", R::KIND)
        } else {
            write!(f, "{} ({:p})", R::KIND, Arc::as_ptr(&self.inner))
        }
    }
}

impl<R: Resource> fmt::Debug for Handle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A reference that does not keep the resource alive.
pub struct WeakHandle<R: Resource> {
    inner: Weak<Inner<R>>,
    descriptor: Descriptor,
}

impl<R: Resource> WeakHandle<R> {
    pub fn upgrade(&self) -> Option<Handle<R>> {
        self.inner.upgrade().map(|inner| Handle { inner })
    }

    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }
}

impl<R: Resource> Clone for WeakHandle<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            descriptor: self.descriptor,
        }
    }
}

impl<R: Resource> fmt::Debug for WeakHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakHandle")
            .field("kind", &R::KIND)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portos_types::Errno;
    use std::{
        sync::{atomic::AtomicUsize, mpsc, Condvar},
        time::Duration,
    };

    struct Counted {
        descriptor: Descriptor,
        closes: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Resource for Counted {
        const KIND: ResourceKind = ResourceKind::Dbm;

        fn descriptor(&self) -> Descriptor {
            self.descriptor
        }

        fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::new(Errno::General, "flush failed"))
            } else {
                Ok(())
            }
        }
    }

    fn counted(fail: bool) -> (Handle<Counted>, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let handle = Handle::new(Counted {
            descriptor: Descriptor::unique(),
            closes: closes.clone(),
            fail,
        });
        (handle, closes)
    }

    #[test]
    fn close_is_idempotent() {
        let (handle, closes) = counted(false);
        assert!(!handle.is_closed());
        handle.close().unwrap();
        handle.close().unwrap();
        assert!(handle.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        drop(handle);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn operations_after_close_fail_with_closed() {
        let (handle, _) = counted(false);
        handle.close().unwrap();
        let err = handle.with(|_| Ok(())).unwrap_err();
        assert_eq!(err.code(), Errno::Closed);
        assert_eq!(err.message(), "attempt to use a closed dbm");
        assert_eq!(handle.kind(), ResourceKind::Dbm);
    }

    #[test]
    #[tracing_test::traced_test]
    fn last_reference_finalizes_once() {
        let (handle, closes) = counted(true);
        let clone = handle.clone();
        assert_eq!(handle.ref_count(), 2);
        drop(handle);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(logs_contain("failed to close resource during finalization"));
    }

    #[test]
    fn renders_kind_and_address() {
        let (handle, _) = counted(false);
        let open = handle.to_string();
        assert!(open.starts_with("dbm (0x"), "{open}");
        assert!(open.ends_with(')'));
        handle.close().unwrap();
        assert_eq!(handle.to_string(), "dbm (closed)");
    }

    #[test]
    fn equality_follows_the_descriptor() {
        let closes = Arc::new(AtomicUsize::new(0));
        let descriptor = Descriptor::Os(42);
        let a = Handle::new(Counted {
            descriptor,
            closes: closes.clone(),
            fail: false,
        });
        let b = Handle::new(Counted {
            descriptor,
            closes,
            fail: false,
        });
        assert_eq!(a, b);
        assert!(!a.ptr_eq(&b));
        let (c, _) = counted(false);
        assert_ne!(a, c);
    }

    #[test]
    fn weak_handles_do_not_keep_resources_alive() {
        let (handle, closes) = counted(false);
        let weak = handle.downgrade();
        assert!(weak.upgrade().is_some());
        drop(handle);
        assert!(weak.upgrade().is_none());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    /// Blocks in `wait` until its canceller runs.
    struct Gate {
        descriptor: Descriptor,
        opened: Arc<(Mutex<bool>, Condvar)>,
    }

    impl Gate {
        fn wait(&self) -> Result<()> {
            let (lock, signal) = &*self.opened;
            let mut opened = lock.lock().unwrap();
            while !*opened {
                opened = signal.wait(opened).unwrap();
            }
            Err(Error::new(Errno::General, "gate opened"))
        }
    }

    impl Resource for Gate {
        const KIND: ResourceKind = ResourceKind::Socket;

        fn descriptor(&self) -> Descriptor {
            self.descriptor
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }

        fn canceller(&self) -> Option<Canceller> {
            let opened = self.opened.clone();
            Some(Box::new(move || {
                let (lock, signal) = &*opened;
                *lock.lock().unwrap() = true;
                signal.notify_all();
            }))
        }
    }

    #[test]
    fn close_wakes_a_blocked_operation() {
        let handle = Handle::new(Gate {
            descriptor: Descriptor::unique(),
            opened: Arc::default(),
        });
        let (started, on_start) = mpsc::channel();
        let blocked = {
            let handle = handle.clone();
            std::thread::spawn(move || {
                handle.with(|gate| {
                    started.send(()).unwrap();
                    gate.wait()
                })
            })
        };
        on_start.recv().unwrap();

        let (closed, on_close) = mpsc::channel();
        let closer = {
            let handle = handle.clone();
            std::thread::spawn(move || closed.send(handle.close()).unwrap())
        };
        on_close
            .recv_timeout(Duration::from_secs(5))
            .expect("close returned")
            .unwrap();
        let err = blocked.join().unwrap().unwrap_err();
        assert_eq!(err.code(), Errno::Closed);
        assert_eq!(err.message(), "attempt to use a closed socket");
        closer.join().unwrap();
        assert!(handle.is_closed());
    }
}

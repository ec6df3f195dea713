use mio::{unix::SourceFd, Events, Interest, Poll, Registry, Token};
use std::{
    collections::HashMap,
    io,
    os::fd::RawFd,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use crate::{InterestType, Readiness};

/// Token reserved for the selector's own waker
const TOKEN_WAKEUP: Token = Token(0);

#[derive(Debug, Clone, Copy)]
struct Registration {
    fd: RawFd,
    interest: Interest,
}

/// Result of a single [`Selector::poll`].
#[derive(Debug, Default)]
pub struct PollEvents {
    pub ready: Vec<Readiness>,
    /// Set when the wait was cut short by a [`SelectorWaker`]
    pub woken: bool,
}

/// Wakes a selector that is blocked in [`Selector::poll`] from another thread.
#[derive(Debug, Clone)]
pub struct SelectorWaker {
    inner: Arc<mio::Waker>,
}

impl SelectorWaker {
    pub fn wake(&self) -> io::Result<()> {
        self.inner.wake()
    }
}

#[derive(Debug)]
struct Waiter {
    poll: Poll,
    events: Events,
}

/// Every method takes `&self`: registrations can be added and removed
/// from other threads while one thread is blocked in [`Selector::poll`].
#[derive(Debug)]
pub struct Selector {
    registry: Registry,
    waiter: Mutex<Waiter>,
    wakeup: Arc<mio::Waker>,
    registrations: Mutex<HashMap<Token, Registration>>,
    next_seed: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Selector {
    pub fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let wakeup = Arc::new(mio::Waker::new(&registry, TOKEN_WAKEUP)?);
        Ok(Self {
            registry,
            waiter: Mutex::new(Waiter {
                poll,
                events: Events::with_capacity(capacity.max(1)),
            }),
            wakeup,
            registrations: Mutex::new(HashMap::new()),
            next_seed: AtomicUsize::new(1),
        })
    }

    pub fn waker(&self) -> SelectorWaker {
        SelectorWaker {
            inner: self.wakeup.clone(),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.registrations).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.registrations).is_empty()
    }

    /// Registers a raw descriptor and returns the token its events carry.
    #[must_use = "the token must be consumed"]
    pub fn add(&self, fd: RawFd, interests: &[InterestType]) -> io::Result<Token> {
        let interest = to_mio_interest(interests)?;
        let token = self.new_token();

        let mut registrations = lock(&self.registrations);
        let mut source = SourceFd(&fd);
        match self.registry.register(&mut source, token, interest) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                // A descriptor left behind by a registration that went stale
                self.registry.deregister(&mut source).ok();
                self.registry.register(&mut source, token, interest)?;
            }
            Err(err) => return Err(err),
        }

        tracing::trace!(token = token.0, fd, ?interests, "selector add");
        registrations.insert(token, Registration { fd, interest });
        Ok(token)
    }

    pub fn remove(&self, token: Token) -> io::Result<()> {
        let mut registrations = lock(&self.registrations);
        let Some(registration) = registrations.remove(&token) else {
            return Err(io::ErrorKind::NotFound.into());
        };
        tracing::trace!(token = token.0, fd = registration.fd, "selector remove");

        // The descriptor may already be closed, in which case the kernel has
        // dropped it from the interest list for us.
        let mut source = SourceFd(&registration.fd);
        match self.registry.deregister(&mut source) {
            Ok(()) => Ok(()),
            Err(err) if is_stale_error(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Waits until at least one registration is ready, the timeout elapses
    /// or the selector is woken.
    ///
    /// `None` waits forever, `Some(Duration::ZERO)` returns immediately.
    /// Concurrent callers take turns.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<PollEvents> {
        let mut result = PollEvents::default();
        let mut waiter = lock(&self.waiter);
        let Waiter { poll, events } = &mut *waiter;

        // Re-arm every registration, so readiness that is still pending is
        // reported again instead of only on the next edge.
        {
            let mut registrations = lock(&self.registrations);
            let mut stale = Vec::new();
            for (token, registration) in registrations.iter() {
                let mut source = SourceFd(&registration.fd);
                if let Err(err) =
                    self.registry
                        .reregister(&mut source, *token, registration.interest)
                {
                    tracing::debug!(
                        token = token.0,
                        fd = registration.fd,
                        error = %err,
                        "dropping stale registration"
                    );
                    stale.push(*token);
                }
            }
            for token in stale {
                registrations.remove(&token);
                result.ready.push(Readiness::stale(token));
            }
        }

        // Never block when there is already something to report
        let timeout = if result.ready.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        loop {
            match poll.poll(events, timeout) {
                Ok(()) => break,
                // This can happen when a debugger is attached
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        let registrations = lock(&self.registrations);
        for event in events.iter() {
            let token = event.token();
            if token == TOKEN_WAKEUP {
                result.woken = true;
                continue;
            }
            if !registrations.contains_key(&token) {
                tracing::debug!(token = token.0, "orphaned event");
                continue;
            }

            let readiness = Readiness {
                token,
                readable: event.is_readable(),
                writable: event.is_writable(),
                closed: event.is_read_closed() || event.is_write_closed(),
                error: event.is_error(),
                stale: false,
            };
            tracing::trace!(?readiness, "host poll");
            result.ready.push(readiness);
        }

        Ok(result)
    }

    /// Generate a new unique token
    #[must_use = "the token must be consumed"]
    fn new_token(&self) -> Token {
        Token(self.next_seed.fetch_add(1, Ordering::Relaxed))
    }
}

fn to_mio_interest(interests: &[InterestType]) -> io::Result<Interest> {
    let mut result: Option<Interest> = None;
    for interest in interests {
        let next = match interest {
            InterestType::Readable => Interest::READABLE,
            InterestType::Writable => Interest::WRITABLE,
            // Hang-ups and errors are always reported
            InterestType::Closed | InterestType::Error => continue,
        };
        result = Some(match result {
            Some(current) => current | next,
            None => next,
        });
    }
    result.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty interest set"))
}

fn is_stale_error(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EBADF) | Some(libc::ENOENT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    #[tracing_test::traced_test]
    fn reports_pending_data_until_consumed() {
        let selector = Selector::new(16).unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        let (_c, d) = UnixStream::pair().unwrap();

        let token_b = selector.add(b.as_raw_fd(), &[InterestType::Readable]).unwrap();
        let _token_d = selector.add(d.as_raw_fd(), &[InterestType::Readable]).unwrap();

        a.write_all(b"ping").unwrap();

        for _ in 0..2 {
            let events = selector.poll(Some(Duration::from_secs(5))).unwrap();
            let readable = events
                .ready
                .iter()
                .filter(|r| r.readable)
                .map(|r| r.token)
                .collect::<Vec<_>>();
            assert_eq!(readable, vec![token_b]);
        }
    }

    #[test]
    fn removed_registration_is_never_reported() {
        let selector = Selector::new(16).unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        let token = selector.add(b.as_raw_fd(), &[InterestType::Readable]).unwrap();
        a.write_all(b"ping").unwrap();

        selector.remove(token).unwrap();
        let events = selector.poll(Some(Duration::from_millis(10))).unwrap();
        assert!(events.ready.is_empty());
        assert_eq!(
            selector.remove(token).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn closed_descriptor_is_reported_stale_without_blocking() {
        let selector = Selector::new(16).unwrap();
        let (_a, b) = UnixStream::pair().unwrap();
        let token = selector.add(b.as_raw_fd(), &[InterestType::Readable]).unwrap();
        drop(b);

        let events = selector.poll(None).unwrap();
        assert_eq!(events.ready.len(), 1);
        assert!(events.ready[0].stale);
        assert_eq!(events.ready[0].token, token);
        assert!(selector.is_empty());
    }

    #[test]
    fn waker_interrupts_a_blocking_poll() {
        let selector = Selector::new(4).unwrap();
        let waker = selector.waker();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
        });
        let events = selector.poll(None).unwrap();
        assert!(events.woken);
        handle.join().unwrap();
    }

    #[test]
    fn registers_while_another_thread_waits() {
        let selector = Arc::new(Selector::new(4).unwrap());
        let (mut a, b) = UnixStream::pair().unwrap();
        let waiting = {
            let selector = selector.clone();
            std::thread::spawn(move || selector.poll(Some(Duration::from_secs(5))))
        };
        std::thread::sleep(Duration::from_millis(20));
        let token = selector.add(b.as_raw_fd(), &[InterestType::Readable]).unwrap();
        a.write_all(b"ping").unwrap();

        let events = waiting.join().unwrap().unwrap();
        assert_eq!(events.ready.len(), 1);
        assert_eq!(events.ready[0].token, token);
        assert!(events.ready[0].readable);
    }
}

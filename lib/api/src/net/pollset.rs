use std::{
    collections::HashMap,
    os::fd::RawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use portos_mio::{InterestType, Selector, SelectorWaker, Token};
use portos_types::{Errno, Interest, ResourceKind};

use super::socket::{HostSocket, Socket};
use crate::{
    handle::{Descriptor, Handle, Resource, WeakHandle},
    io::Stream,
    runtime, Error, Result,
};

/// Waits on many sockets at once.
pub type Pollset = Handle<PollsetState>;

#[derive(Debug)]
struct Entry {
    socket: WeakHandle<Stream<HostSocket>>,
    token: Token,
    interest: Interest,
}

impl Entry {
    /// The socket, unless it has been closed or dropped.
    fn live(&self) -> Option<Socket> {
        self.socket.upgrade().filter(|socket| !socket.is_closed())
    }
}

#[derive(Debug, Default)]
struct Members {
    entries: HashMap<Descriptor, Entry>,
    by_token: HashMap<Token, Descriptor>,
}

/// State shared between the handle and threads blocked in a poll, which
/// wait without holding the handle.
#[derive(Debug)]
struct PollsetShared {
    selector: Selector,
    capacity: usize,
    members: Mutex<Members>,
    closed: AtomicBool,
}

#[derive(Debug)]
pub struct PollsetState {
    shared: Arc<PollsetShared>,
    descriptor: Descriptor,
}

impl Resource for PollsetState {
    const KIND: ResourceKind = ResourceKind::Pollset;

    fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    fn close(&mut self) -> Result<()> {
        self.shared.closed.store(true, Ordering::Release);
        {
            let mut members = self.shared.members();
            let tokens: Vec<Token> = members.by_token.keys().copied().collect();
            for token in tokens {
                self.shared.forget(&mut members, token);
            }
            members.entries.clear();
        }
        // A thread still waiting sees the flag and reports the close
        self.shared.selector.waker().wake()?;
        Ok(())
    }
}

/// The sockets a [`Handle::poll`](Pollset) found ready.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollResult {
    pub readable: Vec<Socket>,
    pub writable: Vec<Socket>,
}

impl PollResult {
    fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty()
    }

    fn push_readable(&mut self, socket: Socket) {
        if !self.readable.contains(&socket) {
            self.readable.push(socket);
        }
    }
}

/// Interrupts a thread blocked in [`Handle::poll`](Pollset).
#[derive(Debug, Clone)]
pub struct PollsetWaker {
    inner: SelectorWaker,
}

impl PollsetWaker {
    pub fn wake(&self) -> Result<()> {
        Ok(self.inner.wake()?)
    }
}

/// Creates a pollset holding at most `capacity` sockets.
pub fn pollset(capacity: usize) -> Result<Pollset> {
    if capacity == 0 {
        return Err(Error::invalid("pollset capacity must be at least 1"));
    }
    let selector = Selector::new(capacity)?;
    tracing::debug!(capacity, "pollset created");
    Ok(Handle::new(PollsetState {
        shared: Arc::new(PollsetShared {
            selector,
            capacity,
            members: Mutex::default(),
            closed: AtomicBool::new(false),
        }),
        descriptor: Descriptor::unique(),
    }))
}

/// Creates a pollset sized by [`Config::pollset_capacity`](crate::Config).
pub fn pollset_default() -> Result<Pollset> {
    pollset(runtime::active_config().pollset_capacity)
}

impl PollsetShared {
    fn members(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed(ResourceKind::Pollset));
        }
        Ok(())
    }

    fn add(&self, socket: &Socket, interest: Interest) -> Result<()> {
        self.check_open()?;
        let mut members = self.members();
        self.purge(&mut members);
        let descriptor = socket.descriptor();
        if socket.is_closed() {
            return Err(Error::closed(ResourceKind::Socket));
        }
        if members.entries.contains_key(&descriptor) {
            return Err(Error::new(
                Errno::Exist,
                "socket is already part of the pollset",
            ));
        }
        if members.entries.len() >= self.capacity {
            return Err(Error::new(Errno::Nomem, "pollset is full"));
        }
        let fd = descriptor
            .raw()
            .ok_or_else(|| Error::invalid("socket has no descriptor"))? as RawFd;

        let mut interests = Vec::with_capacity(2);
        if interest.is_readable() {
            interests.push(InterestType::Readable);
        }
        if interest.is_writable() {
            interests.push(InterestType::Writable);
        }
        let token = self.selector.add(fd, &interests)?;
        members.by_token.insert(token, descriptor);
        members.entries.insert(
            descriptor,
            Entry {
                socket: socket.downgrade(),
                token,
                interest,
            },
        );
        Ok(())
    }

    fn remove(&self, descriptor: Descriptor) -> Result<()> {
        self.check_open()?;
        let mut members = self.members();
        let entry = members.entries.remove(&descriptor).ok_or_else(|| {
            Error::new(Errno::Noent, "socket is not part of the pollset")
        })?;
        self.forget(&mut members, entry.token);
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        self.check_open()?;
        let mut members = self.members();
        self.purge(&mut members);
        Ok(members.entries.len())
    }

    fn forget(&self, members: &mut Members, token: Token) {
        members.by_token.remove(&token);
        // Already gone when the descriptor went stale
        self.selector.remove(token).ok();
    }

    /// Drops entries whose socket was closed or dropped.
    fn purge(&self, members: &mut Members) {
        let dead: Vec<Descriptor> = members
            .entries
            .iter()
            .filter(|(_, entry)| entry.live().is_none())
            .map(|(descriptor, _)| *descriptor)
            .collect();
        for descriptor in dead {
            if let Some(entry) = members.entries.remove(&descriptor) {
                tracing::debug!(?descriptor, "purging closed socket from pollset");
                self.forget(members, entry.token);
            }
        }
    }

    fn poll(&self, timeout: Option<Duration>) -> Result<PollResult> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            self.check_open()?;
            let mut result = PollResult::default();
            {
                let mut members = self.members();
                self.purge(&mut members);
                if members.entries.is_empty() && deadline.is_none() {
                    return Err(Error::invalid("cannot wait forever on an empty pollset"));
                }
                // Input that is already buffered will not wake the selector
                for entry in members.entries.values() {
                    if !entry.interest.is_readable() {
                        continue;
                    }
                    if let Some(socket) = entry.live() {
                        if socket.has_buffered_input() {
                            result.push_readable(socket);
                        }
                    }
                }
            }

            let wait = match deadline {
                _ if !result.is_empty() => Some(Duration::ZERO),
                Some(deadline) => Some(deadline.saturating_duration_since(Instant::now())),
                None => None,
            };
            // Members may change while this waits
            let events = self.selector.poll(wait)?;

            {
                let mut members = self.members();
                for readiness in events.ready {
                    let Some(descriptor) = members.by_token.get(&readiness.token).copied() else {
                        continue;
                    };
                    if readiness.stale {
                        if let Some(entry) = members.entries.remove(&descriptor) {
                            members.by_token.remove(&entry.token);
                        }
                        continue;
                    }
                    let Some(entry) = members.entries.get(&descriptor) else {
                        continue;
                    };
                    let Some(socket) = entry.live() else {
                        continue;
                    };
                    // A hang-up or error is reported as readable so the next read
                    // surfaces end of stream or the error itself
                    let readable = readiness.readable || readiness.closed || readiness.error;
                    if readable && entry.interest.is_readable() {
                        result.push_readable(socket.clone());
                    }
                    if readiness.writable && entry.interest.is_writable() {
                        result.writable.push(socket);
                    }
                }
            }

            if !result.is_empty() {
                tracing::trace!(
                    readable = result.readable.len(),
                    writable = result.writable.len(),
                    "pollset ready"
                );
                return Ok(result);
            }
            if events.woken {
                self.check_open()?;
                return Err(Error::new(Errno::Intr, "pollset wait was interrupted"));
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(Error::new(Errno::Timedout, "pollset wait timed out"));
                }
            }
        }
    }
}

impl Handle<PollsetState> {
    fn shared(&self) -> Result<Arc<PollsetShared>> {
        self.with(|pollset| Ok(pollset.shared.clone()))
    }

    /// Registers `socket`. A socket can be registered only once.
    pub fn add(&self, socket: &Socket, interest: Interest) -> Result<()> {
        self.shared()?.add(socket, interest)
    }

    pub fn remove(&self, socket: &Socket) -> Result<()> {
        self.shared()?.remove(socket.descriptor())
    }

    /// Waits until at least one registered socket is ready.
    ///
    /// `None` waits forever and `Some(Duration::ZERO)` only checks. Fails
    /// with `ETIMEDOUT` when nothing became ready in time, and with `EINTR`
    /// when a [`PollsetWaker`] cut the wait short. Other threads may add
    /// and remove sockets, or close the pollset, while this waits.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<PollResult> {
        self.shared()?.poll(timeout)
    }

    /// Number of registered sockets.
    pub fn len(&self) -> Result<usize> {
        self.shared()?.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|len| len == 0)
    }

    pub fn waker(&self) -> Result<PollsetWaker> {
        Ok(PollsetWaker {
            inner: self.shared()?.selector.waker(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{socket_create, AddrWhich, Family, Protocol};
    use pretty_assertions::assert_eq;

    fn connected_pair() -> (Socket, Socket) {
        let server = socket_create(Protocol::Tcp, Family::Inet).unwrap();
        server.bind("127.0.0.1", 0).unwrap();
        server.listen(1).unwrap();
        let port = server.addr_get(AddrWhich::Local).unwrap().port;
        let client = socket_create(Protocol::Tcp, Family::Inet).unwrap();
        client.connect("127.0.0.1", port).unwrap();
        (client, server.accept().unwrap())
    }

    #[test]
    fn membership_rules() {
        let set = pollset(1).unwrap();
        let (a, b) = connected_pair();
        set.add(&a, Interest::Readable).unwrap();
        assert_eq!(set.add(&a, Interest::Both).unwrap_err().code(), Errno::Exist);
        assert_eq!(set.add(&b, Interest::Readable).unwrap_err().code(), Errno::Nomem);
        set.remove(&a).unwrap();
        assert_eq!(set.remove(&a).unwrap_err().code(), Errno::Noent);
        assert!(set.is_empty().unwrap());
        assert_eq!(pollset(0).unwrap_err().code(), Errno::Inval);
    }

    #[test]
    fn reports_only_ready_sockets() {
        let set = pollset(4).unwrap();
        let (a, a_peer) = connected_pair();
        let (b, _b_peer) = connected_pair();
        set.add(&a, Interest::Readable).unwrap();
        set.add(&b, Interest::Readable).unwrap();

        let err = set.poll(Some(Duration::from_millis(20))).unwrap_err();
        assert_eq!(err.code(), Errno::Timedout);

        a_peer.write_bytes("one\ntwo\n").unwrap();
        let ready = set.poll(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(ready.readable, vec![a.clone()]);
        assert!(ready.writable.is_empty());

        // "two" is now buffered inside the handle; it still counts
        assert_eq!(&a.read_line().unwrap().unwrap()[..], b"one");
        let ready = set.poll(Some(Duration::ZERO)).unwrap();
        assert_eq!(ready.readable, vec![a.clone()]);
        assert_eq!(&a.read_line().unwrap().unwrap()[..], b"two");
        assert_eq!(
            set.poll(Some(Duration::ZERO)).unwrap_err().code(),
            Errno::Timedout
        );
    }

    #[test]
    fn writable_interest() {
        let set = pollset(2).unwrap();
        let (a, _peer) = connected_pair();
        set.add(&a, Interest::Both).unwrap();
        let ready = set.poll(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(ready.writable, vec![a]);
        assert!(ready.readable.is_empty());
    }

    #[test]
    fn closed_sockets_are_skipped_and_purged() {
        let set = pollset(4).unwrap();
        let (a, a_peer) = connected_pair();
        let (b, b_peer) = connected_pair();
        set.add(&a, Interest::Readable).unwrap();
        set.add(&b, Interest::Readable).unwrap();
        a_peer.write_bytes("x").unwrap();
        b_peer.write_bytes("y").unwrap();

        a.close().unwrap();
        drop(b);
        assert_eq!(
            set.poll(Some(Duration::from_millis(20))).unwrap_err().code(),
            Errno::Timedout
        );
        assert_eq!(set.len().unwrap(), 0);
        assert_eq!(
            set.poll(None).unwrap_err().code(),
            Errno::Inval
        );
    }

    #[test]
    fn waker_interrupts_poll() {
        let set = pollset(2).unwrap();
        let (a, _peer) = connected_pair();
        set.add(&a, Interest::Readable).unwrap();
        let waker = set.waker().unwrap();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
        });
        assert_eq!(set.poll(None).unwrap_err().code(), Errno::Intr);
        thread.join().unwrap();
    }

    #[test]
    fn membership_changes_while_another_thread_waits() {
        let set = pollset(2).unwrap();
        let (a, a_peer) = connected_pair();
        let (b, b_peer) = connected_pair();
        set.add(&a, Interest::Readable).unwrap();

        let poller = {
            let set = set.clone();
            std::thread::spawn(move || set.poll(Some(Duration::from_secs(10))))
        };
        std::thread::sleep(Duration::from_millis(20));
        set.remove(&a).unwrap();
        set.add(&b, Interest::Readable).unwrap();
        a_peer.write_bytes("ignored\n").unwrap();
        b_peer.write_bytes("seen\n").unwrap();

        let ready = poller.join().unwrap().unwrap();
        assert_eq!(ready.readable, vec![b.clone()]);
        assert_eq!(&b.read_line().unwrap().unwrap()[..], b"seen");
    }

    #[test]
    fn closing_ends_a_pending_wait() {
        let set = pollset(1).unwrap();
        let (a, _peer) = connected_pair();
        set.add(&a, Interest::Readable).unwrap();
        let poller = {
            let set = set.clone();
            std::thread::spawn(move || set.poll(None))
        };
        std::thread::sleep(Duration::from_millis(20));
        set.close().unwrap();
        assert_eq!(poller.join().unwrap().unwrap_err().code(), Errno::Closed);
        assert_eq!(set.add(&a, Interest::Readable).unwrap_err().code(), Errno::Closed);
    }
}

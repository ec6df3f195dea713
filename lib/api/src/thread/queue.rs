use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use portos_types::{Errno, ResourceKind};

use crate::{
    handle::{Descriptor, Handle, Resource},
    runtime, Error, Result, Value,
};

/// A fixed capacity channel of value tuples between threads.
///
/// Handles travel by reference: the popping side gets a clone of the very
/// handle that was pushed.
pub type ThreadQueue = Handle<QueueState>;

#[derive(Debug, Default)]
struct Slots {
    items: VecDeque<Vec<Value>>,
    terminated: bool,
    /// Bumped by `interrupt` so waiters can tell they were woken on purpose
    epoch: u64,
}

#[derive(Debug)]
struct QueueShared {
    capacity: usize,
    slots: Mutex<Slots>,
    not_empty: Condvar,
    not_full: Condvar,
}

fn terminated() -> Error {
    Error::new(Errno::Eof, "thread queue has been terminated")
}

fn interrupted() -> Error {
    Error::new(Errno::Intr, "thread queue has been interrupted")
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, values: Vec<Value>, block: bool) -> Result<()> {
        let mut slots = self.lock();
        let epoch = slots.epoch;
        loop {
            if slots.terminated {
                return Err(terminated());
            }
            if slots.epoch != epoch {
                return Err(interrupted());
            }
            if slots.items.len() < self.capacity {
                slots.items.push_back(values);
                self.not_empty.notify_one();
                return Ok(());
            }
            if !block {
                return Err(Error::new(Errno::Again, "thread queue is full"));
            }
            slots = self
                .not_full
                .wait(slots)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn pop(&self, block: bool) -> Result<Vec<Value>> {
        let mut slots = self.lock();
        let epoch = slots.epoch;
        loop {
            if slots.terminated {
                return Err(terminated());
            }
            if slots.epoch != epoch {
                return Err(interrupted());
            }
            if let Some(values) = slots.items.pop_front() {
                self.not_full.notify_one();
                return Ok(values);
            }
            if !block {
                return Err(Error::new(Errno::Again, "thread queue is empty"));
            }
            slots = self
                .not_empty
                .wait(slots)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn terminate(&self) {
        let mut slots = self.lock();
        if !slots.terminated {
            slots.terminated = true;
            tracing::debug!(pending = slots.items.len(), "thread queue terminated");
            slots.items.clear();
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    fn interrupt(&self) {
        self.lock().epoch += 1;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[derive(Debug)]
pub struct QueueState {
    shared: Arc<QueueShared>,
    descriptor: Descriptor,
}

impl Resource for QueueState {
    const KIND: ResourceKind = ResourceKind::ThreadQueue;

    fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    fn close(&mut self) -> Result<()> {
        // Nobody may stay blocked on a queue that can no longer be reached
        self.shared.terminate();
        Ok(())
    }
}

/// Creates a queue that holds at most `capacity` tuples.
pub fn thread_queue(capacity: usize) -> Result<ThreadQueue> {
    if capacity == 0 {
        return Err(Error::invalid("thread queue capacity must be at least 1"));
    }
    Ok(Handle::new(QueueState {
        shared: Arc::new(QueueShared {
            capacity,
            slots: Mutex::new(Slots::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }),
        descriptor: Descriptor::unique(),
    }))
}

/// A queue with the configured default capacity.
pub fn thread_queue_default() -> Result<ThreadQueue> {
    thread_queue(runtime::active_config().queue_capacity)
}

impl Handle<QueueState> {
    fn shared(&self) -> Result<Arc<QueueShared>> {
        self.with(|queue| Ok(queue.shared.clone()))
    }

    /// Appends a tuple, blocking while the queue is full.
    pub fn push(&self, values: Vec<Value>) -> Result<()> {
        self.shared()?.push(values, true)
    }

    /// Removes the oldest tuple, blocking while the queue is empty.
    pub fn pop(&self) -> Result<Vec<Value>> {
        self.shared()?.pop(true)
    }

    /// Like [`push`](Self::push), failing with `EAGAIN` instead of blocking.
    pub fn trypush(&self, values: Vec<Value>) -> Result<()> {
        self.shared()?.push(values, false)
    }

    /// Like [`pop`](Self::pop), failing with `EAGAIN` instead of blocking.
    pub fn trypop(&self) -> Result<Vec<Value>> {
        self.shared()?.pop(false)
    }

    /// Fails every blocked and every future push or pop with `EOF`.
    pub fn terminate(&self) -> Result<()> {
        self.shared()?.terminate();
        Ok(())
    }

    /// Wakes the callers blocked right now with `EINTR`. Later calls are
    /// not affected.
    pub fn interrupt(&self) -> Result<()> {
        self.shared()?.interrupt();
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.shared()?.lock().items.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn capacity(&self) -> Result<usize> {
        Ok(self.shared()?.capacity)
    }
}

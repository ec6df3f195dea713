//! Operating system threads running isolated units of work, and the queues
//! that connect them.
mod queue;

use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle, ThreadId},
};

use once_cell::sync::OnceCell;
use portos_types::{Errno, ResourceKind};

pub use self::queue::{thread_queue, thread_queue_default, QueueState, ThreadQueue};
use crate::{
    handle::{Descriptor, Handle, Resource},
    runtime, Error, Result, Value,
};

/// A unit of work. A plain function so nothing from the spawning thread is
/// captured; everything it needs arrives through its arguments.
pub type Work = fn(Vec<Value>) -> anyhow::Result<Vec<Value>>;

pub type Thread = Handle<ThreadState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ThreadStatus {
    Init,
    Running,
    Done,
}

impl ThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadStatus::Init => "init",
            ThreadStatus::Running => "running",
            ThreadStatus::Done => "done",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ThreadStatus::Init,
            1 => ThreadStatus::Running,
            _ => ThreadStatus::Done,
        }
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Outcome = std::result::Result<Vec<Value>, String>;

#[derive(Debug)]
struct ThreadShared {
    status: AtomicU8,
    outcome: OnceCell<Outcome>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadShared {
    fn advance(&self, status: ThreadStatus) {
        self.status.fetch_max(status as u8, Ordering::AcqRel);
    }

    fn status(&self) -> ThreadStatus {
        ThreadStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn join(&self, id: ThreadId) -> Result<Vec<Value>> {
        if thread::current().id() == id {
            return Err(Error::invalid("a thread cannot join itself"));
        }
        {
            // Concurrent joiners queue up here and then read the cached outcome
            let mut join = self.join.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(handle) = join.take() {
                // The work runs under catch_unwind, so this only fails if
                // recording the outcome itself panicked
                if handle.join().is_err() {
                    tracing::warn!(?id, "thread exited abnormally");
                }
            }
        }
        match self.outcome.get() {
            Some(Ok(values)) => Ok(values.clone()),
            Some(Err(message)) => Err(Error::new(Errno::General, message.clone())),
            None => Err(Error::new(Errno::General, "thread exited without a result")),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "thread panicked".to_string()
    }
}

#[derive(Debug)]
pub struct ThreadState {
    shared: Arc<ThreadShared>,
    id: ThreadId,
    descriptor: Descriptor,
}

impl Resource for ThreadState {
    const KIND: ResourceKind = ResourceKind::Thread;

    fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    /// Detaches: the work keeps running to completion, nobody waits for it.
    fn close(&mut self) -> Result<()> {
        let handle = self
            .shared
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if handle.is_some() {
            tracing::debug!(id = ?self.id, status = %self.shared.status(), "detaching thread");
        }
        Ok(())
    }
}

/// Starts `work(args)` on a new thread right away.
pub fn thread_create(work: Work, args: Vec<Value>) -> Result<Thread> {
    let shared = Arc::new(ThreadShared {
        status: AtomicU8::new(ThreadStatus::Init as u8),
        outcome: OnceCell::new(),
        join: Mutex::new(None),
    });

    let mut builder = thread::Builder::new().name("portos-worker".to_string());
    if let Some(stack_size) = runtime::active_config().thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    let worker = shared.clone();
    let handle = builder.spawn(move || {
        worker.advance(ThreadStatus::Running);
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| work(args))) {
            Ok(Ok(values)) => Ok(values),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(payload) => Err(panic_message(payload.as_ref())),
        };
        if let Err(message) = &outcome {
            tracing::debug!(%message, "thread work failed");
        }
        let _ = worker.outcome.set(outcome);
        worker.advance(ThreadStatus::Done);
    })?;

    let id = handle.thread().id();
    *shared.join.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    tracing::debug!(?id, "thread started");
    Ok(Handle::new(ThreadState {
        shared,
        id,
        descriptor: Descriptor::unique(),
    }))
}

/// Gives up the rest of the calling thread's time slice.
pub fn thread_yield() {
    thread::yield_now();
}

impl Handle<ThreadState> {
    pub fn status(&self) -> Result<ThreadStatus> {
        self.with(|state| Ok(state.shared.status()))
    }

    /// Waits for the work to finish and returns its values. A failure or
    /// panic in the work is reported as `EGENERAL`. Every join after the
    /// first returns the same outcome.
    pub fn join(&self) -> Result<Vec<Value>> {
        let (shared, id) = self.with(|state| Ok((state.shared.clone(), state.id)))?;
        shared.join(id)
    }
}

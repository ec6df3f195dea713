//! Dynamic values carried by reads, thread arguments and queue tuples.
use std::fmt;

use bytes::Bytes;
use portos_types::ResourceKind;

use crate::{
    fs::{Directory, File},
    handle::Descriptor,
    net::Socket,
    proc::{Pipe, Process},
    shm::SharedMemory,
    thread::{Thread, ThreadQueue},
    Result,
};

#[cfg(unix)]
use crate::net::Pollset;

/// A plain value or a shared resource handle.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Number(f64),
    /// Arbitrary bytes; not necessarily UTF-8.
    String(Bytes),
    Handle(AnyHandle),
}

impl Value {
    /// The name used in diagnostics, e.g. `"number"`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Handle(_) => "userdata",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    /// The string contents if they are valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_handle(&self) -> Option<&AnyHandle> {
        match self {
            Value::Handle(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn into_handle(self) -> Option<AnyHandle> {
        match self {
            Value::Handle(handle) => Some(handle),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Handle(a), Value::Handle(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(value.into())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(Bytes::from(value))
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::String(Bytes::copy_from_slice(value))
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::String(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Nil, Into::into)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Boolean(value) => write!(f, "{value}"),
            Value::Number(value) => f.write_str(&crate::io::format_number(*value)),
            Value::String(value) => f.write_str(&String::from_utf8_lossy(value)),
            Value::Handle(handle) => write!(f, "{handle}"),
        }
    }
}

/// Any handle this crate hands out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnyHandle {
    File(File),
    Socket(Socket),
    Directory(Directory),
    Process(Process),
    Pipe(Pipe),
    Thread(Thread),
    ThreadQueue(ThreadQueue),
    SharedMemory(SharedMemory),
    #[cfg(unix)]
    Pollset(Pollset),
}

macro_rules! for_each_handle {
    ($value:expr, $handle:ident => $body:expr) => {
        match $value {
            AnyHandle::File($handle) => $body,
            AnyHandle::Socket($handle) => $body,
            AnyHandle::Directory($handle) => $body,
            AnyHandle::Process($handle) => $body,
            AnyHandle::Pipe($handle) => $body,
            AnyHandle::Thread($handle) => $body,
            AnyHandle::ThreadQueue($handle) => $body,
            AnyHandle::SharedMemory($handle) => $body,
            #[cfg(unix)]
            AnyHandle::Pollset($handle) => $body,
        }
    };
}

impl AnyHandle {
    pub fn kind(&self) -> ResourceKind {
        for_each_handle!(self, handle => handle.kind())
    }

    pub fn descriptor(&self) -> Descriptor {
        for_each_handle!(self, handle => handle.descriptor())
    }

    pub fn is_closed(&self) -> bool {
        for_each_handle!(self, handle => handle.is_closed())
    }

    pub fn close(&self) -> Result<()> {
        for_each_handle!(self, handle => handle.close())
    }
}

impl fmt::Display for AnyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for_each_handle!(self, handle => fmt::Display::fmt(handle, f))
    }
}

macro_rules! impl_from_handle {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for AnyHandle {
                fn from(handle: $ty) -> Self {
                    AnyHandle::$variant(handle)
                }
            }

            impl From<$ty> for Value {
                fn from(handle: $ty) -> Self {
                    Value::Handle(AnyHandle::$variant(handle))
                }
            }
        )*
    };
}

impl_from_handle!(
    File(File),
    Socket(Socket),
    Directory(Directory),
    Process(Process),
    Pipe(Pipe),
    Thread(Thread),
    ThreadQueue(ThreadQueue),
    SharedMemory(SharedMemory),
);

#[cfg(unix)]
impl_from_handle!(Pollset(Pollset));

impl From<AnyHandle> for Value {
    fn from(handle: AnyHandle) -> Self {
        Value::Handle(handle)
    }
}

/// The kind of resource `value` wraps, `None` for plain values.
pub fn type_of(value: &Value) -> Option<ResourceKind> {
    value.as_handle().map(AnyHandle::kind)
}

/// Whether both values are handles to the same resource: same kind and
/// same descriptor.
pub fn equals(a: &Value, b: &Value) -> bool {
    match (a.as_handle(), b.as_handle()) {
        (Some(a), Some(b)) => a.kind() == b.kind() && a.descriptor() == b.descriptor(),
        _ => false,
    }
}

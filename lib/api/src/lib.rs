#![deny(unused_extern_crates)]
#![warn(unused_import_braces, rustdoc::broken_intra_doc_links)]
#![allow(clippy::new_without_default, clippy::len_without_is_empty)]
#![warn(
    clippy::mut_mut,
    clippy::nonminimal_bool,
    clippy::map_unwrap_or,
    clippy::print_stdout,
    clippy::unicode_not_nfc,
    clippy::use_self
)]

//! `portos` is a portable operating system abstraction layer: files,
//! directories, TCP/UDP sockets, pollsets, child processes, pipes, threads
//! with thread queues and shared memory, all behind one handle model and one
//! status model.
//!
//! Every opened resource is a reference counted [`Handle`]. Clones share the
//! resource, [`Handle::close`] is idempotent, any use after close fails with
//! [`Errno::Closed`], and whatever is still open when the last clone goes
//! away is finalized. Every fallible operation returns a [`Result`] whose
//! error carries a symbolic [`Errno`] and a readable message.
//!
//! Streams (files, sockets, pipes, shared memory) share a buffered I/O
//! engine with the familiar `*l`, `*L`, `*a`, `*n` and byte count read
//! formats.
//!
//! # Usage
//!
//! ```rust
//! use portos::{fs, io::ReadFormat, Runtime, Value};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _runtime = Runtime::init_default()?;
//!     let dir = tempfile::tempdir()?;
//!     let path = dir.path().join("greeting.txt");
//!
//!     let file = fs::file_open(&path, "w")?;
//!     file.write(&[Value::from("hello\n"), Value::from(42)])?;
//!     file.close()?;
//!
//!     let file = fs::file_open(&path, "r")?;
//!     let values = file.read(&[ReadFormat::Line, ReadFormat::Number])?;
//!     assert_eq!(values, vec![Value::from("hello"), Value::from(42)]);
//!     Ok(())
//! }
//! ```
//!
//! Operations never initialize anything process wide on their own; create
//! a [`Runtime`] first. Without one, defaults from [`Config::default`]
//! apply.

mod arena;
mod config;
mod error;
mod handle;
mod runtime;
mod value;

pub mod fs;
pub mod io;
pub mod net;
pub mod proc;
pub mod shm;
pub mod thread;

pub use crate::arena::{Arena, ArenaRef};
pub use crate::config::{Config, ENV_BUFFER_SIZE, ENV_LOG};
pub use crate::error::{Error, Result};
pub use crate::handle::{Canceller, Descriptor, Handle, Resource, WeakHandle};
pub use crate::runtime::Runtime;
pub use crate::value::{equals, type_of, AnyHandle, Value};

// Reexport from other modules

pub use portos_types::{Errno, Interest, ResourceKind, ShutdownHow, Whence};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

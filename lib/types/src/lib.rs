//! Common types shared by the `portos` crates.
//!
//! This crate holds the platform independent vocabulary of the
//! abstraction layer: the symbolic status codes every fallible operation
//! reports ([`Errno`]), the resource kind tags handles carry
//! ([`ResourceKind`]) and a few small enums used at the I/O boundary.

#![deny(missing_docs, unused_extern_crates)]
#![warn(unused_import_braces)]
#![allow(clippy::new_without_default)]

mod error;
mod io;
mod kind;

pub use error::Errno;
pub use io::{Interest, ShutdownHow, Whence};
pub use kind::ResourceKind;

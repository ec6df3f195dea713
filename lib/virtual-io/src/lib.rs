//! Readiness selection over raw descriptors.
//!
//! [`Selector`] wraps a [`mio::Poll`] and keeps track of every registered
//! descriptor so that readiness can be re-armed before each wait. mio only
//! reports edges; re-arming turns those edges into the level style answers
//! a pollset promises ("this socket has data now").

#[cfg(unix)]
mod selector;

mod interest;

pub use interest::{InterestType, Readiness};
#[cfg(unix)]
pub use selector::{PollEvents, Selector, SelectorWaker};

pub use mio::Token;

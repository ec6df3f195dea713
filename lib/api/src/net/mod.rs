//! TCP/UDP sockets and the pollset that multiplexes them.
#[cfg(unix)]
mod pollset;
mod socket;

#[cfg(unix)]
pub use self::pollset::{pollset, pollset_default, PollResult, Pollset, PollsetState, PollsetWaker};
#[cfg(unix)]
pub use self::socket::from_raw_fd;
pub use self::socket::{
    host_to_addr, hostname_get, socket_create, AddrWhich, Family, HostSocket, OptionValue,
    PeerInfo, Protocol, Socket, SocketOption,
};

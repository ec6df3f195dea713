use std::{
    io::{Read, Write},
    mem::MaybeUninit,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    str::FromStr,
    time::Duration,
};

use bytes::Bytes;
use portos_types::{Errno, ResourceKind, ShutdownHow};
use socket2::{Domain, SockAddr, Type};

use crate::{
    handle::{Descriptor, Handle},
    io::{RawIo, Stream, StreamSource},
    Error, Result,
};

/// A TCP or UDP socket.
pub type Socket = Handle<Stream<HostSocket>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(Error::invalid(format!("invalid protocol '{s}'"))),
        }
    }
}

/// Address family. `Unspec` lets the system choose, which means IPv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Family {
    #[default]
    Inet,
    Inet6,
    Unspec,
}

impl Family {
    fn domain(self) -> Domain {
        match self {
            Family::Inet | Family::Unspec => Domain::IPV4,
            Family::Inet6 => Domain::IPV6,
        }
    }

    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Family::Inet | Family::Unspec => addr.is_ipv4(),
            Family::Inet6 => addr.is_ipv6(),
        }
    }

    fn any(self) -> IpAddr {
        match self {
            Family::Inet | Family::Unspec => Ipv4Addr::UNSPECIFIED.into(),
            Family::Inet6 => Ipv6Addr::UNSPECIFIED.into(),
        }
    }
}

impl FromStr for Family {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inet" => Ok(Family::Inet),
            "inet6" => Ok(Family::Inet6),
            "unspec" => Ok(Family::Unspec),
            _ => Err(Error::invalid(format!("invalid address family '{s}'"))),
        }
    }
}

/// The address and port on one side of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub address: String,
    pub port: u16,
}

impl From<SocketAddr> for PeerInfo {
    fn from(addr: SocketAddr) -> Self {
        Self {
            address: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

/// Which end of a socket [`addr_get`](Socket) describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrWhich {
    Local,
    Remote,
}

impl FromStr for AddrWhich {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(AddrWhich::Local),
            "remote" => Ok(AddrWhich::Remote),
            _ => Err(Error::invalid(format!("invalid address side '{s}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    ReuseAddr,
    KeepAlive,
    SendBuffer,
    RecvBuffer,
    NoDelay,
    Broadcast,
}

impl SocketOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketOption::ReuseAddr => "so-reuseaddr",
            SocketOption::KeepAlive => "so-keepalive",
            SocketOption::SendBuffer => "so-sndbuf",
            SocketOption::RecvBuffer => "so-rcvbuf",
            SocketOption::NoDelay => "tcp-nodelay",
            SocketOption::Broadcast => "so-broadcast",
        }
    }
}

impl FromStr for SocketOption {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        [
            SocketOption::ReuseAddr,
            SocketOption::KeepAlive,
            SocketOption::SendBuffer,
            SocketOption::RecvBuffer,
            SocketOption::NoDelay,
            SocketOption::Broadcast,
        ]
        .into_iter()
        .find(|option| option.as_str() == s)
        .ok_or_else(|| Error::invalid(format!("invalid socket option '{s}'")))
    }
}

/// Value of a [`SocketOption`]: buffer sizes are sizes, the rest are flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionValue {
    Flag(bool),
    Size(usize),
}

/// The host side of a [`Socket`].
#[derive(Debug)]
pub struct HostSocket {
    socket: socket2::Socket,
    protocol: Protocol,
    family: Family,
    timeout: Option<Duration>,
}

impl HostSocket {
    fn new(socket: socket2::Socket, protocol: Protocol, family: Family) -> Self {
        Self {
            socket,
            protocol,
            family,
            timeout: None,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Blocking calls that hit the configured deadline fail with
    /// `ETIMEDOUT` rather than `EAGAIN`.
    fn map_err(&self, err: std::io::Error) -> Error {
        let err = Error::from(err);
        let expired = err.would_block() || err.code() == Errno::Timedout;
        match self.timeout {
            Some(timeout) if expired && !timeout.is_zero() => {
                Error::new(Errno::Timedout, "socket operation timed out")
            }
            _ => err,
        }
    }

    fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        if host == "*" {
            return Ok(SocketAddr::new(self.family.any(), port));
        }
        let family = self.family;
        resolve_all(host, port)?
            .into_iter()
            .find(|addr| family.accepts(addr))
            .ok_or_else(|| {
                Error::new(
                    Errno::Addrnotavail,
                    format!("no {family:?} address found for '{host}'"),
                )
            })
    }
}

fn resolve_all(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    (host, port)
        .to_socket_addrs()
        .map(Iterator::collect)
        .map_err(|err| Error::new(Errno::Noent, format!("could not resolve '{host}': {err}")))
}

impl RawIo for HostSocket {
    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        (&self.socket).read(buf).map_err(|err| self.map_err(err))
    }

    fn write_raw(&mut self, buf: &[u8]) -> Result<usize> {
        (&self.socket).write(buf).map_err(|err| self.map_err(err))
    }
}

impl StreamSource for HostSocket {
    const KIND: ResourceKind = ResourceKind::Socket;

    fn descriptor(&self) -> Descriptor {
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            Descriptor::from_fd(self.socket.as_raw_fd())
        }
        #[cfg(windows)]
        {
            use std::os::windows::io::AsRawSocket;
            Descriptor::Os(self.socket.as_raw_socket() as i64)
        }
        #[cfg(not(any(unix, windows)))]
        {
            Descriptor::unique()
        }
    }

    fn close_source(&mut self) -> Result<()> {
        tracing::trace!(protocol = ?self.protocol, "closing socket");
        Ok(())
    }

    /// Shutting the socket down makes a blocked accept, read or receive
    /// return at once.
    #[cfg(unix)]
    fn canceller(&self) -> Option<crate::handle::Canceller> {
        use std::os::fd::{AsRawFd, BorrowedFd};

        let fd = self.socket.as_raw_fd();
        Some(Box::new(move || {
            // SAFETY: cancelling happens before the handle gives up the
            // socket, so `fd` is still open
            let fd = unsafe { BorrowedFd::borrow_raw(fd) };
            socket2::SockRef::from(&fd)
                .shutdown(std::net::Shutdown::Both)
                .ok();
        }))
    }
}

/// Creates an unconnected socket.
pub fn socket_create(protocol: Protocol, family: Family) -> Result<Socket> {
    let (ty, proto) = match protocol {
        Protocol::Tcp => (Type::STREAM, socket2::Protocol::TCP),
        Protocol::Udp => (Type::DGRAM, socket2::Protocol::UDP),
    };
    let socket = socket2::Socket::new(family.domain(), ty, Some(proto))?;
    tracing::debug!(?protocol, ?family, "socket created");
    Ok(wrap(HostSocket::new(socket, protocol, family)))
}

/// Wraps an OS socket that was created elsewhere.
///
/// # Safety
///
/// `fd` must be an open socket of the given protocol that nothing else
/// owns; the returned handle closes it.
#[cfg(unix)]
pub unsafe fn from_raw_fd(fd: std::os::fd::RawFd, protocol: Protocol, family: Family) -> Socket {
    use std::os::fd::FromRawFd;
    // SAFETY: upheld by the caller
    let socket = unsafe { socket2::Socket::from_raw_fd(fd) };
    wrap(HostSocket::new(socket, protocol, family))
}

fn wrap(socket: HostSocket) -> Socket {
    Handle::new(Stream::new(socket))
}

impl Handle<Stream<HostSocket>> {
    /// Binds to `host:port`; `"*"` means any local address.
    pub fn bind(&self, host: &str, port: u16) -> Result<()> {
        self.with(|stream| {
            let source = stream.source();
            let addr = source.resolve(host, port)?;
            source.socket.bind(&addr.into()).map_err(|err| {
                Error::new(Error::from(&err).code(), format!("could not bind to {addr}: {err}"))
            })
        })
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        self.with(|stream| Ok(stream.source().socket.listen(backlog)?))
    }

    /// Waits for an incoming connection.
    pub fn accept(&self) -> Result<Socket> {
        let accepted = self.with(|stream| {
            let source = stream.source();
            let (socket, peer) = source
                .socket
                .accept()
                .map_err(|err| source.map_err(err))?;
            tracing::debug!(peer = ?peer.as_socket(), "connection accepted");
            Ok(HostSocket::new(socket, source.protocol, source.family))
        })?;
        Ok(wrap(accepted))
    }

    /// Connects to the first address of `host` that matches the socket's
    /// family.
    pub fn connect(&self, host: &str, port: u16) -> Result<()> {
        self.with(|stream| {
            let source = stream.source();
            let addr: SockAddr = source.resolve(host, port)?.into();
            let connected = match source.timeout {
                Some(timeout) if !timeout.is_zero() => source.socket.connect_timeout(&addr, timeout),
                _ => source.socket.connect(&addr),
            };
            connected.map_err(|err| {
                let code = source.map_err(err).code();
                Error::new(code, format!("could not connect to {host}:{port}"))
            })
        })
    }

    /// Receives one datagram of at most `max` bytes.
    pub fn recvfrom(&self, max: usize) -> Result<(PeerInfo, Bytes)> {
        self.with(|stream| {
            let source = stream.source();
            let mut data = vec![0u8; max];
            // SAFETY: initialized bytes are valid `MaybeUninit<u8>`, and
            // recv_from never writes uninitialized bytes into the slice
            let buf = unsafe { &mut *(data.as_mut_slice() as *mut [u8] as *mut [MaybeUninit<u8>]) };
            let (received, peer) = source
                .socket
                .recv_from(buf)
                .map_err(|err| source.map_err(err))?;
            data.truncate(received);
            let peer = peer
                .as_socket()
                .map(PeerInfo::from)
                .ok_or_else(|| Error::new(Errno::Inval, "datagram from a non IP peer"))?;
            Ok((peer, Bytes::from(data)))
        })
    }

    /// Sends one datagram and returns the number of bytes sent.
    pub fn sendto(&self, host: &str, port: u16, data: impl AsRef<[u8]>) -> Result<usize> {
        self.with(|stream| {
            let source = stream.source();
            let addr: SockAddr = source.resolve(host, port)?.into();
            source
                .socket
                .send_to(data.as_ref(), &addr)
                .map_err(|err| source.map_err(err))
        })
    }

    pub fn shutdown(&self, how: ShutdownHow) -> Result<()> {
        self.with(|stream| {
            stream.flush()?;
            let how = match how {
                ShutdownHow::Read => std::net::Shutdown::Read,
                ShutdownHow::Write => std::net::Shutdown::Write,
                ShutdownHow::Both => std::net::Shutdown::Both,
            };
            Ok(stream.source().socket.shutdown(how)?)
        })
    }

    /// Sets the deadline for blocking calls. `None` blocks forever,
    /// a zero duration makes the socket non-blocking.
    pub fn timeout_set(&self, timeout: Option<Duration>) -> Result<()> {
        self.with(|stream| {
            let source = stream.source_mut();
            match timeout {
                Some(timeout) if timeout.is_zero() => source.socket.set_nonblocking(true)?,
                _ => {
                    source.socket.set_nonblocking(false)?;
                    source.socket.set_read_timeout(timeout)?;
                    source.socket.set_write_timeout(timeout)?;
                }
            }
            source.timeout = timeout;
            Ok(())
        })
    }

    pub fn timeout_get(&self) -> Result<Option<Duration>> {
        self.with(|stream| Ok(stream.source().timeout))
    }

    pub fn addr_get(&self, which: AddrWhich) -> Result<PeerInfo> {
        self.with(|stream| {
            let socket = &stream.source().socket;
            let addr = match which {
                AddrWhich::Local => socket.local_addr()?,
                AddrWhich::Remote => socket.peer_addr()?,
            };
            addr.as_socket()
                .map(PeerInfo::from)
                .ok_or_else(|| Error::invalid("socket has no IP address"))
        })
    }

    pub fn opt_set(&self, option: SocketOption, value: OptionValue) -> Result<()> {
        self.with(|stream| {
            let socket = &stream.source().socket;
            match (option, value) {
                (SocketOption::ReuseAddr, OptionValue::Flag(on)) => socket.set_reuse_address(on)?,
                (SocketOption::KeepAlive, OptionValue::Flag(on)) => socket.set_keepalive(on)?,
                (SocketOption::NoDelay, OptionValue::Flag(on)) => socket.set_nodelay(on)?,
                (SocketOption::Broadcast, OptionValue::Flag(on)) => socket.set_broadcast(on)?,
                (SocketOption::SendBuffer, OptionValue::Size(size)) => socket.set_send_buffer_size(size)?,
                (SocketOption::RecvBuffer, OptionValue::Size(size)) => socket.set_recv_buffer_size(size)?,
                (option, value) => {
                    return Err(Error::invalid(format!(
                        "option '{}' does not take {value:?}",
                        option.as_str()
                    )))
                }
            }
            Ok(())
        })
    }

    pub fn opt_get(&self, option: SocketOption) -> Result<OptionValue> {
        self.with(|stream| {
            let socket = &stream.source().socket;
            Ok(match option {
                SocketOption::ReuseAddr => OptionValue::Flag(socket.reuse_address()?),
                SocketOption::KeepAlive => OptionValue::Flag(socket.keepalive()?),
                SocketOption::NoDelay => OptionValue::Flag(socket.nodelay()?),
                SocketOption::Broadcast => OptionValue::Flag(socket.broadcast()?),
                SocketOption::SendBuffer => OptionValue::Size(socket.send_buffer_size()?),
                SocketOption::RecvBuffer => OptionValue::Size(socket.recv_buffer_size()?),
            })
        })
    }

    /// The OS descriptor number.
    pub fn fd_get(&self) -> Result<i64> {
        let descriptor = self.with(|stream| Ok(stream.source().descriptor()))?;
        descriptor
            .raw()
            .ok_or_else(|| Error::not_implemented("socket descriptors"))
    }
}

/// Resolves `host` to its first address.
pub fn host_to_addr(host: &str) -> Result<String> {
    resolve_all(host, 0)?
        .first()
        .map(|addr| addr.ip().to_string())
        .ok_or_else(|| Error::new(Errno::Noent, format!("could not resolve '{host}'")))
}

/// The name of this machine.
#[cfg(unix)]
pub fn hostname_get() -> Result<String> {
    let mut buf = [0u8; 256];
    // SAFETY: the length passed is the length of `buf`
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

/// The name of this machine.
#[cfg(not(unix))]
pub fn hostname_get() -> Result<String> {
    std::env::var("COMPUTERNAME").map_err(|_| Error::not_implemented("hostname lookup"))
}

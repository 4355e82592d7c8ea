//! Thin helpers around [`socket2`] for the option-setting and bind/connect
//! plumbing shared by the TCP and UDP crushers. Nothing here is aware of
//! the reactor; it only produces already-configured, nonblocking
//! `std::net` sockets with their raw descriptor ready to register.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::Duration;

use log::trace;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

/// Socket options applied uniformly to both ends of a TCP pair. Mirrors the
/// subset of `java.net.Socket` / `ServerSocket` options NetCrusher exposes.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpOptions {
    pub no_delay: Option<bool>,
    pub keep_alive: Option<bool>,
    pub recv_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
}

impl TcpOptions {
    fn apply(&self, socket: &Socket) -> io::Result<()> {
        if let Some(nd) = self.no_delay {
            socket.set_nodelay(nd)?;
        }
        if let Some(ka) = self.keep_alive {
            if ka {
                socket.set_tcp_keepalive(&TcpKeepalive::new())?;
            }
        }
        if let Some(n) = self.recv_buffer_size {
            socket.set_recv_buffer_size(n)?;
        }
        if let Some(n) = self.send_buffer_size {
            socket.set_send_buffer_size(n)?;
        }
        Ok(())
    }
}

/// Options applied to the bound UDP socket underlying a datagram crusher.
#[derive(Clone, Copy, Debug, Default)]
pub struct UdpOptions {
    pub recv_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
}

impl UdpOptions {
    fn apply(&self, socket: &Socket) -> io::Result<()> {
        if let Some(n) = self.recv_buffer_size {
            socket.set_recv_buffer_size(n)?;
        }
        if let Some(n) = self.send_buffer_size {
            socket.set_send_buffer_size(n)?;
        }
        Ok(())
    }
}

/// Binds and listens a nonblocking TCP listener at `addr` with `backlog`
/// pending connections. Accepted streams are configured separately by the
/// caller via [`configure_stream`].
pub fn tcp_listen(addr: SocketAddr, backlog: i32, opts: &TcpOptions) -> io::Result<TcpListener> {
    trace!("tcp_listen({}, backlog={})", addr, backlog);
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    opts.apply(&socket)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// Applies `opts` to a freshly accepted or connected stream and puts it in
/// nonblocking mode.
pub fn configure_stream(stream: &TcpStream, opts: &TcpOptions) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    let socket = Socket::from(stream.try_clone()?);
    opts.apply(&socket)?;
    // `socket` only wraps a dup of the fd; forget it so its `Drop` doesn't
    // close the descriptor out from under `stream`.
    std::mem::forget(socket);
    Ok(())
}

/// Begins a nonblocking connect to `addr`. Returns the stream and whether
/// the connect already completed synchronously (common for loopback
/// addresses). If not yet complete, the stream's writable readiness
/// signals completion; the caller must consult [`take_connect_error`] once
/// writable to distinguish success from a refused or unreachable connect.
pub fn tcp_connect_nonblocking(addr: SocketAddr, opts: &TcpOptions) -> io::Result<(TcpStream, bool)> {
    trace!("tcp_connect_nonblocking({})", addr);
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    opts.apply(&socket)?;
    let completed = match socket.connect(&addr.into()) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
        Err(e) => return Err(e),
    };
    Ok((socket.into(), completed))
}

/// Returns the pending error on a socket whose nonblocking connect just
/// became writable, if the connect in fact failed (`SO_ERROR`).
pub fn take_connect_error(stream: &TcpStream) -> io::Result<Option<io::Error>> {
    let socket = Socket::from(stream.try_clone()?);
    let err = socket.take_error()?;
    std::mem::forget(socket);
    Ok(err)
}

/// Binds a nonblocking UDP socket at `addr`, applying `opts`.
pub fn udp_bind(addr: SocketAddr, opts: &UdpOptions) -> io::Result<UdpSocket> {
    trace!("udp_bind({})", addr);
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    opts.apply(&socket)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Creates a nonblocking, unbound UDP socket matching `family_of`'s address
/// family, used by a datagram outer connection to send toward the real
/// server on behalf of one client source address.
pub fn udp_unbound(family_of: SocketAddr, opts: &UdpOptions) -> io::Result<UdpSocket> {
    let domain = Domain::for_address(family_of);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    opts.apply(&socket)?;
    Ok(socket.into())
}

/// Normalizes a zero duration (meaning "disabled") to `None`.
pub fn as_nonzero(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        None
    } else {
        Some(d)
    }
}

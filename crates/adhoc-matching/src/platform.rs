//! Platform collaborators: sockets, local address discovery, and time
//!
//! The matching core talks to the outside world only through the traits in
//! this module, so tests (and the emulator shell) can substitute their own
//! network. The system implementations ride on `std::net` — broadcast and
//! receive timeouts are applied through what `std` exposes; providers that
//! control the raw socket may additionally honor the address-reuse request.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Socket Traits
// ----------------------------------------------------------------------------

/// Options applied when a matching socket is bound
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketOptions {
    /// Allow sending to the limited broadcast address
    pub broadcast: bool,
    /// Request address reuse on the bound port
    pub reuse_addr: bool,
}

/// One bound UDP socket
///
/// `recv_from` blocks until a datagram arrives or [`MatchingSocket::close`]
/// is called from another thread, after which it returns an error.
pub trait MatchingSocket: Send + Sync {
    fn send_to(&self, buf: &[u8], addr: SocketAddrV4) -> io::Result<usize>;
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)>;
    fn close(&self);
}

/// Factory for matching sockets
pub trait SocketProvider: Send + Sync {
    /// Bind a UDP socket on all interfaces at `port`
    fn bind(&self, port: u16, opts: SocketOptions) -> io::Result<Arc<dyn MatchingSocket>>;
}

// ----------------------------------------------------------------------------
// Address / Time Traits
// ----------------------------------------------------------------------------

/// Resolves this host's IPv4 address on the ad-hoc interface
pub trait LocalAddressProvider: Send + Sync {
    fn local_addr(&self) -> io::Result<Ipv4Addr>;
}

/// Monotonic microsecond clock driving the callout scheduler
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> u64;
}

// ----------------------------------------------------------------------------
// System Socket Provider
// ----------------------------------------------------------------------------

/// Poll granularity of a blocking receive; bounds how long `close` can take
/// to unblock a reader.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Socket provider backed by `std::net::UdpSocket`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSocketProvider;

impl SocketProvider for SystemSocketProvider {
    fn bind(&self, port: u16, opts: SocketOptions) -> io::Result<Arc<dyn MatchingSocket>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        if opts.broadcast {
            socket.set_broadcast(true)?;
        }
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        tracing::debug!(port, "udp socket bound");
        Ok(Arc::new(SystemSocket {
            socket,
            closed: AtomicBool::new(false),
        }))
    }
}

struct SystemSocket {
    socket: UdpSocket,
    closed: AtomicBool,
}

impl MatchingSocket for SystemSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddrV4) -> io::Result<usize> {
        self.socket.send_to(buf, SocketAddr::V4(addr))
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
            }
            match self.socket.recv_from(buf) {
                Ok((len, SocketAddr::V4(from))) => return Ok((len, from)),
                // Not reachable for a v4-bound socket, but don't hang on it
                Ok((_, SocketAddr::V6(_))) => continue,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ----------------------------------------------------------------------------
// Local Address Providers
// ----------------------------------------------------------------------------

/// Local address provider returning a fixed, preconfigured address
#[derive(Debug, Clone, Copy)]
pub struct FixedLocalAddress(pub Ipv4Addr);

impl LocalAddressProvider for FixedLocalAddress {
    fn local_addr(&self) -> io::Result<Ipv4Addr> {
        Ok(self.0)
    }
}

/// Local address provider that asks the routing table which source address
/// would be used for broadcast traffic
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLocalAddress;

impl LocalAddressProvider for SystemLocalAddress {
    fn local_addr(&self) -> io::Result<Ipv4Addr> {
        let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        probe.set_broadcast(true)?;
        probe.connect((Ipv4Addr::BROADCAST, 9))?;
        match probe.local_addr()? {
            SocketAddr::V4(addr) => Ok(*addr.ip()),
            SocketAddr::V6(_) => Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no ipv4 source address",
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// Monotonic Clock
// ----------------------------------------------------------------------------

/// Clock anchored at its own creation time
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

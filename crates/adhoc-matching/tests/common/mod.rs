//! In-memory LAN standing in for the ad-hoc link
//!
//! Every host gets its own socket provider; datagrams are routed between
//! bound sockets by (address, port), with limited-broadcast fan-out and an
//! optional per-packet-type drop list for loss scenarios.

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use adhoc_matching::{
    ContextId, HandlerEvent, LocalAddressProvider, MatchingHandler, MatchingSocket,
    MonotonicClock, Platform, SocketOptions, SocketProvider,
};

// ----------------------------------------------------------------------------
// Virtual Sockets
// ----------------------------------------------------------------------------

struct VirtualSocket {
    host: Ipv4Addr,
    port: u16,
    queue: Mutex<VecDeque<(Vec<u8>, SocketAddrV4)>>,
    condvar: Condvar,
    closed: AtomicBool,
    lan: Arc<LanCore>,
}

impl VirtualSocket {
    fn deliver(&self, bytes: &[u8], from: SocketAddrV4) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.queue
            .lock()
            .unwrap()
            .push_back((bytes.to_vec(), from));
        self.condvar.notify_one();
    }
}

impl MatchingSocket for VirtualSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddrV4) -> io::Result<usize> {
        self.lan
            .route(buf, SocketAddrV4::new(self.host, self.port), addr);
        Ok(buf.len())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
            }
            if let Some((bytes, from)) = queue.pop_front() {
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                return Ok((len, from));
            }
            queue = self.condvar.wait(queue).unwrap();
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.condvar.notify_all();
    }
}

// ----------------------------------------------------------------------------
// LAN Core
// ----------------------------------------------------------------------------

struct LanCore {
    sockets: Mutex<Vec<Arc<VirtualSocket>>>,
    /// Wire packet-type bytes to drop, simulating loss
    dropped_types: Mutex<Vec<u8>>,
}

impl LanCore {
    fn route(&self, bytes: &[u8], from: SocketAddrV4, to: SocketAddrV4) {
        if bytes.len() >= 2 && self.dropped_types.lock().unwrap().contains(&bytes[1]) {
            return;
        }
        let sockets = self.sockets.lock().unwrap();
        for socket in sockets.iter() {
            if socket.port != to.port() {
                continue;
            }
            let broadcast = *to.ip() == Ipv4Addr::BROADCAST;
            if broadcast || socket.host == *to.ip() {
                socket.deliver(bytes, from);
            }
        }
    }
}

/// One simulated local network
pub struct VirtualLan {
    core: Arc<LanCore>,
}

impl VirtualLan {
    pub fn new() -> Self {
        Self {
            core: Arc::new(LanCore {
                sockets: Mutex::new(Vec::new()),
                dropped_types: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A platform bundle for one host on this network
    pub fn host(&self, addr: Ipv4Addr) -> Platform {
        Platform {
            sockets: Arc::new(HostSockets {
                host: addr,
                lan: Arc::clone(&self.core),
            }),
            local_addr: Arc::new(FixedAddr(addr)),
            clock: Arc::new(MonotonicClock::new()),
        }
    }

    /// Start dropping every datagram of the given wire packet type
    pub fn drop_packet_type(&self, packet_type: u8) {
        self.core.dropped_types.lock().unwrap().push(packet_type);
    }

    pub fn clear_drops(&self) {
        self.core.dropped_types.lock().unwrap().clear();
    }
}

struct HostSockets {
    host: Ipv4Addr,
    lan: Arc<LanCore>,
}

impl SocketProvider for HostSockets {
    fn bind(&self, port: u16, _opts: SocketOptions) -> io::Result<Arc<dyn MatchingSocket>> {
        let mut sockets = self.lan.sockets.lock().unwrap();
        sockets.retain(|s| {
            !(s.closed.load(Ordering::Acquire) || (s.host == self.host && s.port == port))
        });
        let socket = Arc::new(VirtualSocket {
            host: self.host,
            port,
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            closed: AtomicBool::new(false),
            lan: Arc::clone(&self.lan),
        });
        sockets.push(Arc::clone(&socket));
        Ok(socket)
    }
}

struct FixedAddr(Ipv4Addr);

impl LocalAddressProvider for FixedAddr {
    fn local_addr(&self) -> io::Result<Ipv4Addr> {
        Ok(self.0)
    }
}

// ----------------------------------------------------------------------------
// Event Recorder
// ----------------------------------------------------------------------------

/// Handler that records every notification for assertions
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<(HandlerEvent, Option<Ipv4Addr>, Vec<u8>)>>,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self, event: HandlerEvent) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _, _)| *e == event)
            .count()
    }

    /// Latest opt payload recorded for `event`
    pub fn last_opt(&self, event: HandlerEvent) -> Option<Vec<u8>> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(e, _, _)| *e == event)
            .map(|(_, _, opt)| opt.clone())
    }

    /// Block until `event` has been seen at least `count` times
    pub fn wait_for(&self, event: HandlerEvent, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.count(event) >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

impl MatchingHandler for EventRecorder {
    fn on_event(&self, _id: ContextId, event: HandlerEvent, peer: Option<Ipv4Addr>, opt: &[u8]) {
        self.events
            .lock()
            .unwrap()
            .push((event, peer, opt.to_vec()));
    }
}

/// Poll `check` until it passes or the timeout runs out
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

//! Context registry and the public matching API
//!
//! One registry instance owns every context and the single lock their state
//! lives under. Game-facing calls take the lock, mutate synchronously and
//! return a vendor status code; the only operations that block longer are
//! `start` and `stop`, which bring the three per-context workers up and
//! down. The lock is never held across a thread join.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::callout::{CalloutKey, CalloutScheduler};
use crate::config::{CreateParams, StartParams};
use crate::context::{Context, WorkerThreads};
use crate::errors::{MatchingError, Result};
use crate::events::{callout_fire, event_loop, PipeEvent};
use crate::input::input_loop;
use crate::platform::{
    Clock, LocalAddressProvider, MatchingSocket, MonotonicClock, SocketOptions, SocketProvider,
    SystemLocalAddress, SystemSocketProvider,
};
use crate::types::{ContextId, ContextStatus, MAX_HELLO_OPT_LEN};

// ----------------------------------------------------------------------------
// Platform Bundle
// ----------------------------------------------------------------------------

/// The collaborators a registry talks to the outside world through
#[derive(Clone)]
pub struct Platform {
    pub sockets: Arc<dyn SocketProvider>,
    pub local_addr: Arc<dyn LocalAddressProvider>,
    pub clock: Arc<dyn Clock>,
}

impl Platform {
    /// Real network, real clock
    pub fn system() -> Self {
        Self {
            sockets: Arc::new(SystemSocketProvider),
            local_addr: Arc::new(SystemLocalAddress),
            clock: Arc::new(MonotonicClock::new()),
        }
    }
}

// ----------------------------------------------------------------------------
// Registry State
// ----------------------------------------------------------------------------

/// Everything behind the registry lock
pub(crate) struct RegistryState {
    initialized: bool,
    contexts: Vec<Context>,
    /// Last granted id; allocation resumes just after it
    last_id: i32,
}

impl RegistryState {
    pub(crate) fn context_mut(&mut self, id: ContextId) -> Option<&mut Context> {
        self.contexts.iter_mut().find(|c| c.id == id)
    }

    /// Rotate through 1..=15, skipping ids in use
    fn allocate_id(&mut self) -> Result<ContextId> {
        let mut candidate = self.last_id;
        for _ in 0..ContextId::MAX {
            candidate = if candidate >= ContextId::MAX {
                ContextId::MIN
            } else {
                candidate + 1
            };
            if !self.contexts.iter().any(|c| c.id.value() == candidate) {
                self.last_id = candidate;
                return Ok(ContextId::new(candidate));
            }
        }
        Err(MatchingError::IdNotAvail)
    }
}

// ----------------------------------------------------------------------------
// Matching Registry
// ----------------------------------------------------------------------------

/// The ad-hoc matching runtime
///
/// The vendor API is a process singleton bracketed by `init`/`term`; the
/// embedder owns that discipline, the registry only enforces the
/// initialized flag.
pub struct AdhocMatching {
    state: Arc<Mutex<RegistryState>>,
    platform: Platform,
}

impl AdhocMatching {
    pub fn new(platform: Platform) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState {
                initialized: false,
                contexts: Vec::new(),
                last_id: 0,
            })),
            platform,
        }
    }

    /// Bring the runtime up; the pool size mirrors the vendor signature and
    /// only needs to be nonzero
    pub fn init(&self, pool_size: u32) -> Result<()> {
        let mut guard = self.state.lock();
        if guard.initialized {
            return Err(MatchingError::AlreadyInitialized);
        }
        if pool_size == 0 {
            return Err(MatchingError::InvalidArg);
        }
        guard.initialized = true;
        info!(pool_size, "matching runtime initialized");
        Ok(())
    }

    /// Stop and delete every context, then tear the runtime down
    ///
    /// Fails with Busy (and stays initialized) if a context would not stop.
    pub fn term(&self) -> Result<()> {
        if !self.state.lock().initialized {
            return Err(MatchingError::NotInitialized);
        }
        for raw in ContextId::MIN..=ContextId::MAX {
            let _ = self.stop(ContextId::new(raw));
        }
        let mut guard = self.state.lock();
        guard
            .contexts
            .retain(|c| c.status != ContextStatus::NotRunning);
        if guard.contexts.is_empty() {
            guard.initialized = false;
            info!("matching runtime terminated");
            Ok(())
        } else {
            Err(MatchingError::Busy)
        }
    }

    /// Create a context on `params.port`
    pub fn create(&self, params: CreateParams) -> Result<ContextId> {
        let mut guard = self.state.lock();
        if !guard.initialized {
            return Err(MatchingError::NotInitialized);
        }
        params.validate()?;
        if guard.contexts.iter().any(|c| c.params.port == params.port) {
            return Err(MatchingError::PortInUse);
        }
        let id = guard.allocate_id()?;
        info!(%id, mode = ?params.mode, port = params.port, "context created");
        guard.contexts.push(Context::new(id, params));
        Ok(id)
    }

    /// Delete a stopped context
    pub fn delete(&self, id: ContextId) -> Result<()> {
        let mut guard = self.state.lock();
        if !guard.initialized {
            return Err(MatchingError::NotInitialized);
        }
        let position = guard
            .contexts
            .iter()
            .position(|c| c.id == id)
            .ok_or(MatchingError::InvalidId)?;
        if guard.contexts[position].status != ContextStatus::NotRunning {
            return Err(MatchingError::IsRunning);
        }
        guard.contexts.remove(position);
        info!(%id, "context deleted");
        Ok(())
    }

    /// Start a context's three workers and begin announcing
    pub fn start(&self, id: ContextId, start: StartParams, hello_opt: &[u8]) -> Result<()> {
        let mut guard = self.state.lock();
        if !guard.initialized {
            return Err(MatchingError::NotInitialized);
        }
        let ctx = guard.context_mut(id).ok_or(MatchingError::InvalidId)?;
        if ctx.status != ContextStatus::NotRunning {
            return Err(MatchingError::IsRunning);
        }
        if hello_opt.len() > MAX_HELLO_OPT_LEN {
            return Err(MatchingError::InvalidOptlen);
        }
        let port = ctx.params.port;
        let rxbuf_len = ctx.params.rxbuf_len;
        let sends_hello = ctx.params.mode.sends_hello();
        let hello_interval = ctx.params.hello_interval;

        let own_addr = self.platform.local_addr.local_addr()?;

        // Send socket first: scan the ports above ours until one binds.
        let send_socket = self.bind_send_socket(port)?;

        // Event pipe and its drain thread.
        let (tx, rx) = crossbeam_channel::unbounded();
        let event_state = Arc::clone(&self.state);
        let event_handle = worker_builder("adhoc-event", id, start)
            .spawn(move || event_loop(event_state, id, rx))
            .map_err(MatchingError::Io)?;

        // Receive socket and the input thread.
        let recv_socket = match self.platform.sockets.bind(
            port,
            SocketOptions {
                broadcast: false,
                reuse_addr: true,
            },
        ) {
            Ok(socket) => socket,
            Err(e) => {
                let _ = tx.send(PipeEvent::Abort);
                drop(guard);
                let _ = event_handle.join();
                return Err(e.into());
            }
        };
        let input_state = Arc::clone(&self.state);
        let input_socket = Arc::clone(&recv_socket);
        let input_tx = tx.clone();
        let input_handle = match worker_builder("adhoc-input", id, start).spawn(move || {
            input_loop(input_state, id, input_socket, rxbuf_len, own_addr, input_tx)
        }) {
            Ok(handle) => handle,
            Err(e) => {
                recv_socket.close();
                let _ = tx.send(PipeEvent::Abort);
                drop(guard);
                let _ = event_handle.join();
                return Err(e.into());
            }
        };

        // Callout worker last.
        let callout = CalloutScheduler::new(Arc::clone(&self.platform.clock));
        let fire_state = Arc::clone(&self.state);
        let fire_tx = tx.clone();
        if let Err(e) = callout.start(move |key| callout_fire(&fire_state, id, &fire_tx, key)) {
            recv_socket.close();
            let _ = tx.send(PipeEvent::Abort);
            drop(guard);
            let _ = input_handle.join();
            let _ = event_handle.join();
            return Err(e.into());
        }

        let ctx = guard.context_mut(id).ok_or(MatchingError::InvalidId)?;
        ctx.own_addr = own_addr;
        ctx.send_socket = Some(send_socket);
        ctx.recv_socket = Some(recv_socket);
        ctx.pipe_tx = Some(tx);
        ctx.callout = Some(callout);
        ctx.threads = WorkerThreads {
            event: Some(event_handle),
            input: Some(input_handle),
        };
        if sends_hello {
            ctx.rebuild_hello_message(hello_opt);
            ctx.rearm_timer(CalloutKey::HelloTick, u64::from(hello_interval));
        }
        ctx.seed_member_message();
        ctx.status = ContextStatus::Running;
        info!(%id, %own_addr, port, "context started");
        Ok(())
    }

    fn bind_send_socket(&self, port: u16) -> Result<Arc<dyn MatchingSocket>> {
        let mut last_error = None;
        for offset in 1..=19u16 {
            match self.platform.sockets.bind(
                port.wrapping_add(offset),
                SocketOptions {
                    broadcast: true,
                    reuse_addr: false,
                },
            ) {
                Ok(socket) => return Ok(socket),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::AddrInUse))
            .into())
    }

    /// Stop a context; a no-op when it is not running
    ///
    /// Synchronous: all three workers have joined by the time this returns.
    pub fn stop(&self, id: ContextId) -> Result<()> {
        let mut guard = self.state.lock();
        if !guard.initialized {
            return Err(MatchingError::NotInitialized);
        }
        let ctx = guard.context_mut(id).ok_or(MatchingError::InvalidId)?;
        if ctx.status != ContextStatus::Running {
            return Ok(());
        }
        debug!(%id, "stopping context");
        ctx.status = ContextStatus::Stopping;
        let callout = ctx.callout.take();
        let pipe_tx = ctx.pipe_tx.take();
        let recv_socket = ctx.recv_socket.take();
        let event_handle = ctx.threads.event.take();
        let input_handle = ctx.threads.input.take();
        drop(guard);

        // Workers down in order: timers, event drain, input.
        if let Some(callout) = callout {
            callout.shutdown();
        }
        if let Some(tx) = &pipe_tx {
            let _ = tx.send(PipeEvent::Abort);
        }
        if let Some(handle) = event_handle {
            let _ = handle.join();
        }
        if let Some(socket) = &recv_socket {
            socket.close();
        }
        if let Some(handle) = input_handle {
            let _ = handle.join();
        }

        let mut guard = self.state.lock();
        let Some(ctx) = guard.context_mut(id) else {
            return Ok(());
        };
        if ctx.params.mode.sends_hello() {
            ctx.hello_message = None;
            ctx.hello_tick_scheduled = false;
        }
        ctx.broadcast_bye();
        ctx.targets.clear();
        ctx.member_message = None;
        if let Some(socket) = ctx.send_socket.take() {
            socket.close();
        }
        ctx.status = ContextStatus::NotRunning;
        info!(%id, "context stopped");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Target operations
    // ------------------------------------------------------------------

    pub fn select_target(&self, id: ContextId, addr: Ipv4Addr, opt: &[u8]) -> Result<()> {
        let mut guard = self.state.lock();
        if !guard.initialized {
            return Err(MatchingError::NotInitialized);
        }
        let ctx = guard.context_mut(id).ok_or(MatchingError::InvalidId)?;
        if ctx.status != ContextStatus::Running {
            return Err(MatchingError::NotRunning);
        }
        ctx.select_target(addr, opt)
    }

    pub fn cancel_target(&self, id: ContextId, addr: Ipv4Addr) -> Result<()> {
        self.cancel_target_with_opt(id, addr, &[])
    }

    pub fn cancel_target_with_opt(&self, id: ContextId, addr: Ipv4Addr, opt: &[u8]) -> Result<()> {
        let mut guard = self.state.lock();
        if !guard.initialized {
            return Err(MatchingError::NotInitialized);
        }
        let ctx = guard.context_mut(id).ok_or(MatchingError::InvalidId)?;
        if ctx.status != ContextStatus::Running {
            return Err(MatchingError::NotRunning);
        }
        ctx.cancel_target(addr, opt)
    }

    pub fn send_data(&self, id: ContextId, addr: Ipv4Addr, data: &[u8]) -> Result<()> {
        let mut guard = self.state.lock();
        if !guard.initialized {
            return Err(MatchingError::NotInitialized);
        }
        let ctx = guard.context_mut(id).ok_or(MatchingError::InvalidId)?;
        ctx.send_data(addr, data)
    }

    pub fn abort_send_data(&self, id: ContextId, addr: Ipv4Addr) -> Result<()> {
        let mut guard = self.state.lock();
        if !guard.initialized {
            return Err(MatchingError::NotInitialized);
        }
        let ctx = guard.context_mut(id).ok_or(MatchingError::InvalidId)?;
        if ctx.status != ContextStatus::Running {
            return Err(MatchingError::NotRunning);
        }
        ctx.abort_send_data(addr)
    }

    // ------------------------------------------------------------------
    // Hello opt / members
    // ------------------------------------------------------------------

    pub fn set_hello_opt(&self, id: ContextId, opt: &[u8]) -> Result<()> {
        let mut guard = self.state.lock();
        if !guard.initialized {
            return Err(MatchingError::NotInitialized);
        }
        let ctx = guard.context_mut(id).ok_or(MatchingError::InvalidId)?;
        if !ctx.params.mode.sends_hello() {
            return Err(MatchingError::InvalidMode);
        }
        if ctx.status != ContextStatus::Running {
            return Err(MatchingError::NotRunning);
        }
        ctx.set_hello_opt(opt)
    }

    /// Copy the hello opt blob into `out`, returning the copied length
    pub fn get_hello_opt(&self, id: ContextId, out: &mut [u8]) -> Result<usize> {
        let mut guard = self.state.lock();
        if !guard.initialized {
            return Err(MatchingError::NotInitialized);
        }
        let ctx = guard.context_mut(id).ok_or(MatchingError::InvalidId)?;
        if !ctx.params.mode.sends_hello() {
            return Err(MatchingError::InvalidMode);
        }
        if ctx.status != ContextStatus::Running {
            return Err(MatchingError::NotRunning);
        }
        Ok(ctx.copy_hello_opt(out))
    }

    /// Fill `out` with the roster (authority first), returning the roster
    /// size; when `out` is shorter, only its prefix is written
    pub fn get_members(&self, id: ContextId, out: &mut [Ipv4Addr]) -> Result<usize> {
        let members = self.members(id)?;
        let copied = members.len().min(out.len());
        out[..copied].copy_from_slice(&members[..copied]);
        Ok(members.len())
    }

    /// The current roster, authority first
    pub fn members(&self, id: ContextId) -> Result<Vec<Ipv4Addr>> {
        let mut guard = self.state.lock();
        if !guard.initialized {
            return Err(MatchingError::NotInitialized);
        }
        let ctx = guard.context_mut(id).ok_or(MatchingError::InvalidId)?;
        if ctx.status != ContextStatus::Running {
            return Err(MatchingError::NotRunning);
        }
        Ok(ctx.member_addrs())
    }
}

impl Drop for AdhocMatching {
    fn drop(&mut self) {
        // Contexts own threads that reference the registry; make sure none
        // outlive it.
        let ids: Vec<ContextId> = self
            .state
            .lock()
            .contexts
            .iter()
            .map(|c| c.id)
            .collect();
        for id in ids {
            let _ = self.stop(id);
        }
    }
}

fn worker_builder(prefix: &str, id: ContextId, start: StartParams) -> thread::Builder {
    let mut builder = thread::Builder::new().name(format!("{prefix}-{id}"));
    if start.thread_stack_size > 0 {
        builder = builder.stack_size(start.thread_stack_size);
    }
    builder
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

//! One matching context: configuration, targets, messages and sockets
//!
//! A context's mutable state is only ever touched under the registry lock.
//! The registry orchestrates thread bring-up/teardown; everything else about
//! a session (hello and roster messages, wire sends, the guest-facing target
//! operations) lives here.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use tracing::{debug, trace, warn};

use crate::callout::{CalloutKey, CalloutScheduler};
use crate::config::CreateParams;
use crate::errors::{MatchingError, Result};
use crate::events::PipeEvent;
use crate::platform::MatchingSocket;
use crate::protocol::packet::MatchingPacket;
use crate::target::{Target, TargetKey, TargetTable};
use crate::types::{
    ContextId, ContextStatus, Mode, SendDataStatus, TargetStatus, MAX_DATA_LEN, MAX_HELLO_OPT_LEN,
    MAX_OPT_LEN,
};

// ----------------------------------------------------------------------------
// Worker Handles
// ----------------------------------------------------------------------------

/// Join handles of the two pipe-driven workers; the callout worker joins
/// through its scheduler
#[derive(Debug, Default)]
pub(crate) struct WorkerThreads {
    pub event: Option<JoinHandle<()>>,
    pub input: Option<JoinHandle<()>>,
}

// ----------------------------------------------------------------------------
// Matching Context
// ----------------------------------------------------------------------------

pub(crate) struct Context {
    pub id: ContextId,
    pub params: CreateParams,
    /// Member limit actually enforced (children are capped at 2)
    pub maxnum: i32,
    pub status: ContextStatus,
    /// Our address on the ad-hoc interface, resolved at start
    pub own_addr: Ipv4Addr,
    pub targets: TargetTable,
    /// Serialized HELLO beacon, present while a Parent/P2P context runs
    pub hello_message: Option<Vec<u8>>,
    /// Serialized roster; regenerated by the roster authority, replaced
    /// wholesale on children
    pub member_message: Option<Vec<u8>>,
    /// Pipe-slot flag of the hello tick: one in-flight event at most
    pub hello_tick_scheduled: bool,
    pub send_socket: Option<Arc<dyn MatchingSocket>>,
    pub recv_socket: Option<Arc<dyn MatchingSocket>>,
    pub pipe_tx: Option<Sender<PipeEvent>>,
    pub callout: Option<Arc<CalloutScheduler>>,
    pub threads: WorkerThreads,
}

impl Context {
    pub fn new(id: ContextId, params: CreateParams) -> Self {
        let maxnum = params.effective_maxnum();
        Self {
            id,
            params,
            maxnum,
            status: ContextStatus::NotRunning,
            own_addr: Ipv4Addr::UNSPECIFIED,
            targets: TargetTable::new(),
            hello_message: None,
            member_message: None,
            hello_tick_scheduled: false,
            send_socket: None,
            recv_socket: None,
            pipe_tx: None,
            callout: None,
            threads: WorkerThreads::default(),
        }
    }

    /// Targets already counting against the member limit
    pub fn member_count(&self) -> usize {
        self.targets.count_with_status_at_least(TargetStatus::InProgress)
    }

    /// Whether we own the roster: parents always, P2P when our address is
    /// the lower one
    pub fn roster_authority_over(&self, remote: Ipv4Addr) -> bool {
        match self.params.mode {
            Mode::Parent => true,
            Mode::Child => false,
            Mode::P2p => u32::from(self.own_addr) < u32::from(remote),
        }
    }

    // ------------------------------------------------------------------
    // Wire sends
    // ------------------------------------------------------------------

    /// Send one message to a peer's matching port
    ///
    /// Would-block is normalized away (the retransmit timers cover the
    /// loss); other send failures are logged and otherwise ignored.
    pub fn send_packet(&self, addr: Ipv4Addr, packet: &MatchingPacket) {
        self.send_raw(addr, &packet.serialize());
    }

    pub(crate) fn send_raw(&self, addr: Ipv4Addr, bytes: &[u8]) {
        let Some(socket) = &self.send_socket else {
            return;
        };
        let dest = SocketAddrV4::new(addr, self.params.port);
        match socket.send_to(bytes, dest) {
            Ok(_) => trace!(id = %self.id, %dest, len = bytes.len(), "sent"),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(id = %self.id, %dest, error = %e, "send failed"),
        }
    }

    /// Broadcast the current HELLO beacon
    pub fn broadcast_hello(&self) {
        if let Some(hello) = &self.hello_message {
            trace!(id = %self.id, "broadcasting hello");
            self.send_raw(Ipv4Addr::BROADCAST, hello);
        }
    }

    /// Broadcast a BYE on the way down
    pub fn broadcast_bye(&self) {
        self.send_raw(Ipv4Addr::BROADCAST, &MatchingPacket::Bye.serialize());
    }

    // ------------------------------------------------------------------
    // Hello message
    // ------------------------------------------------------------------

    /// Rebuild the HELLO beacon with `opt` attached
    pub fn rebuild_hello_message(&mut self, opt: &[u8]) {
        self.hello_message = Some(
            MatchingPacket::Hello {
                hello_interval: self.params.hello_interval,
                rexmt_interval: self.params.rexmt_interval,
                opt: opt.to_vec(),
            }
            .serialize(),
        );
    }

    /// Copy the beacon's opt blob into `out`, returning the copied length
    pub fn copy_hello_opt(&self, out: &mut [u8]) -> usize {
        let Some(bytes) = &self.hello_message else {
            return 0;
        };
        let Ok(MatchingPacket::Hello { opt, .. }) = MatchingPacket::parse(bytes) else {
            return 0;
        };
        let len = opt.len().min(out.len());
        out[..len].copy_from_slice(&opt[..len]);
        len
    }

    // ------------------------------------------------------------------
    // Member message
    // ------------------------------------------------------------------

    /// Lay down the initial self-only roster; every mode gets one at start
    pub fn seed_member_message(&mut self) {
        self.member_message = Some(
            MatchingPacket::MemberList {
                parent: self.own_addr,
                members: Vec::new(),
            }
            .serialize(),
        );
    }

    /// Regenerate the roster from the established targets
    ///
    /// Children never generate; their roster is whatever the parent last
    /// sent.
    pub fn refresh_member_message(&mut self) {
        if self.params.mode == Mode::Child {
            return;
        }
        let members: Vec<Ipv4Addr> = self
            .targets
            .iter()
            .filter(|(_, t)| t.status == TargetStatus::Established)
            .map(|(_, t)| t.addr)
            .collect();
        self.member_message = Some(
            MatchingPacket::MemberList {
                parent: self.own_addr,
                members,
            }
            .serialize(),
        );
    }

    /// Replace the roster with one received from the authority, dropping our
    /// own entry so the stored list is "everyone but us"
    pub fn adopt_member_message(&mut self, parent: Ipv4Addr, members: &[Ipv4Addr]) {
        let own = self.own_addr;
        self.member_message = Some(
            MatchingPacket::MemberList {
                parent,
                members: members.iter().copied().filter(|m| *m != own).collect(),
            }
            .serialize(),
        );
    }

    /// Addresses in the stored roster, authority first
    pub fn member_addrs(&self) -> Vec<Ipv4Addr> {
        let Some(bytes) = &self.member_message else {
            return Vec::new();
        };
        match MatchingPacket::parse(bytes) {
            Ok(MatchingPacket::MemberList { parent, members }) => {
                let mut addrs = Vec::with_capacity(members.len() + 1);
                addrs.push(parent);
                addrs.extend(members);
                addrs
            }
            _ => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Timer plumbing
    // ------------------------------------------------------------------

    /// (Re)arm a callout entry, replacing any scheduled instance
    pub fn rearm_timer(&self, key: CalloutKey, delay_micros: u64) {
        let Some(callout) = &self.callout else {
            return;
        };
        callout.cancel(key);
        if let Err(e) = callout.schedule(key, delay_micros) {
            trace!(id = %self.id, ?key, error = %e, "timer not armed");
        }
    }

    /// Drop both per-target timers
    pub fn cancel_target_timers(&self, key: TargetKey) {
        if let Some(callout) = &self.callout {
            callout.cancel_target(key);
        }
    }

    // ------------------------------------------------------------------
    // Guest operations
    // ------------------------------------------------------------------

    /// Select a peer for membership
    pub fn select_target(&mut self, addr: Ipv4Addr, opt: &[u8]) -> Result<()> {
        let key = self
            .targets
            .find_by_addr(addr)
            .ok_or(MatchingError::UnknownTarget)?;
        if opt.len() > MAX_OPT_LEN {
            return Err(MatchingError::InvalidOptlen);
        }
        let members = self.member_count();
        let maxnum = self.maxnum;
        let mode = self.params.mode;
        let retry_count = self.params.retry_count;

        let target = self.targets.get_mut(key).ok_or(MatchingError::UnknownTarget)?;
        let reply = match target.status {
            TargetStatus::Cancelled => {
                // A parent never initiates; it answers requests seen from
                // children.
                if mode == Mode::Parent {
                    return Err(MatchingError::TargetNotReady);
                }
                if members + 1 >= maxnum as usize {
                    return Err(MatchingError::ExceedMaxnum);
                }
                MatchingPacket::HelloAck {
                    nonce: 0, // filled below, after the nonce advances
                    opt: opt.to_vec(),
                }
            }
            TargetStatus::Seen => {
                if members + 1 >= maxnum as usize {
                    return Err(MatchingError::ExceedMaxnum);
                }
                MatchingPacket::Accept {
                    nonce: 0,
                    opt: opt.to_vec(),
                }
            }
            TargetStatus::InProgress | TargetStatus::InProgress2 => {
                return Err(MatchingError::RequestInProgress)
            }
            TargetStatus::Established => return Err(MatchingError::AlreadyEstablished),
        };

        target.bump_target_count();
        let nonce = target.target_count;
        target.set_status(TargetStatus::InProgress2);
        target.opt = opt.to_vec();
        target.retry_count = retry_count;
        let reply = match reply {
            MatchingPacket::HelloAck { opt, .. } => MatchingPacket::HelloAck { nonce, opt },
            MatchingPacket::Accept { opt, .. } => MatchingPacket::Accept { nonce, opt },
            other => other,
        };
        debug!(id = %self.id, peer = %addr, kind = ?reply.packet_type(), "target selected");
        self.send_packet(addr, &reply);
        self.rearm_timer(
            CalloutKey::TargetTimeout(key),
            u64::from(self.params.rexmt_interval),
        );
        Ok(())
    }

    /// Cancel a peer, optionally attaching a reason blob
    pub fn cancel_target(&mut self, addr: Ipv4Addr, opt: &[u8]) -> Result<()> {
        let key = self
            .targets
            .find_by_addr(addr)
            .ok_or(MatchingError::UnknownTarget)?;
        if opt.len() > MAX_OPT_LEN {
            return Err(MatchingError::InvalidOptlen);
        }
        let target = self.targets.get_mut(key).ok_or(MatchingError::UnknownTarget)?;
        if target.status == TargetStatus::Cancelled {
            return Ok(());
        }
        let was_established = target.status == TargetStatus::Established;
        target.set_status(TargetStatus::Cancelled);
        // Kept for CANCEL replies to late traffic from this peer
        target.opt = opt.to_vec();
        self.cancel_target_timers(key);
        debug!(id = %self.id, peer = %addr, "target cancelled");
        self.send_packet(addr, &MatchingPacket::Cancel { opt: opt.to_vec() });
        if was_established {
            self.refresh_member_message();
        }
        Ok(())
    }

    /// Queue one acknowledged payload to an established peer
    pub fn send_data(&mut self, addr: Ipv4Addr, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() > MAX_DATA_LEN {
            return Err(MatchingError::InvalidDatalen);
        }
        let key = self
            .targets
            .find_by_addr(addr)
            .ok_or(MatchingError::UnknownTarget)?;
        let retry_count = self.params.retry_count;
        let target = self.targets.get_mut(key).ok_or(MatchingError::UnknownTarget)?;
        if target.status != TargetStatus::Established {
            return Err(MatchingError::NotEstablished);
        }
        if target.send_data_status == SendDataStatus::Busy {
            return Err(MatchingError::DataBusy);
        }

        target.send_data = Some(data.to_vec());
        target.send_data_status = SendDataStatus::Busy;
        target.send_data_count = target.send_data_count.wrapping_add(1);
        target.send_retry_count = retry_count;
        let packet = MatchingPacket::Data {
            nonce: target.target_count,
            seq: target.send_data_count,
            payload: data.to_vec(),
        };
        self.send_packet(addr, &packet);
        self.rearm_timer(
            CalloutKey::SendDataTimeout(key),
            u64::from(self.params.rexmt_interval),
        );
        Ok(())
    }

    /// Drop an outstanding send without waiting for its ack or timeout
    pub fn abort_send_data(&mut self, addr: Ipv4Addr) -> Result<()> {
        let key = self
            .targets
            .find_by_addr(addr)
            .ok_or(MatchingError::UnknownTarget)?;
        self.cancel_send_data_timer(key);
        if let Some(target) = self.targets.get_mut(key) {
            target.set_send_data_status(SendDataStatus::Ready);
        }
        Ok(())
    }

    fn cancel_send_data_timer(&self, key: TargetKey) {
        if let Some(callout) = &self.callout {
            callout.cancel(CalloutKey::SendDataTimeout(key));
        }
    }

    /// Replace the HELLO opt blob while running
    pub fn set_hello_opt(&mut self, opt: &[u8]) -> Result<()> {
        if opt.len() > MAX_HELLO_OPT_LEN {
            return Err(MatchingError::InvalidOptlen);
        }
        self.rebuild_hello_message(opt);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Target;

    fn context(mode: Mode) -> Context {
        let params = CreateParams {
            mode,
            maxnum: 4,
            port: 3658,
            rxbuf_len: 1024,
            hello_interval: 1_000_000,
            keep_alive_interval: 1_000_000,
            retry_count: 3,
            rexmt_interval: 100_000,
            handler: None,
        };
        let mut ctx = Context::new(ContextId::new(1), params);
        ctx.own_addr = Ipv4Addr::new(10, 0, 0, 1);
        ctx
    }

    fn add_target(ctx: &mut Context, last_octet: u8, status: TargetStatus) -> TargetKey {
        let key = ctx.targets.insert(Target::new(
            Ipv4Addr::new(10, 0, 0, last_octet),
            ctx.params.retry_count,
            u64::from(ctx.params.keep_alive_interval),
        ));
        ctx.targets.get_mut(key).unwrap().set_status(status);
        key
    }

    #[test]
    fn hello_opt_roundtrips_through_the_beacon() {
        let mut ctx = context(Mode::Parent);
        ctx.set_hello_opt(b"room-42").unwrap();
        let mut out = [0u8; 32];
        let len = ctx.copy_hello_opt(&mut out);
        assert_eq!(&out[..len], b"room-42");

        // Capacity-limited copy truncates
        let mut small = [0u8; 4];
        assert_eq!(ctx.copy_hello_opt(&mut small), 4);
        assert_eq!(&small, b"room");
    }

    #[test]
    fn hello_opt_length_cap() {
        let mut ctx = context(Mode::Parent);
        assert!(matches!(
            ctx.set_hello_opt(&vec![0u8; MAX_HELLO_OPT_LEN + 1]),
            Err(MatchingError::InvalidOptlen)
        ));
        ctx.set_hello_opt(&vec![0u8; MAX_HELLO_OPT_LEN]).unwrap();
    }

    #[test]
    fn roster_lists_established_targets_only() {
        let mut ctx = context(Mode::Parent);
        add_target(&mut ctx, 2, TargetStatus::Established);
        add_target(&mut ctx, 3, TargetStatus::InProgress);
        ctx.refresh_member_message();
        assert_eq!(
            ctx.member_addrs(),
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
        );
    }

    #[test]
    fn children_keep_the_received_roster() {
        let mut ctx = context(Mode::Child);
        ctx.own_addr = Ipv4Addr::new(10, 0, 0, 3);
        ctx.adopt_member_message(
            Ipv4Addr::new(10, 0, 0, 1),
            &[Ipv4Addr::new(10, 0, 0, 3), Ipv4Addr::new(10, 0, 0, 4)],
        );
        // Own address is filtered; refresh is a no-op for children
        assert_eq!(
            ctx.member_addrs(),
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 4)]
        );
        ctx.refresh_member_message();
        assert_eq!(
            ctx.member_addrs(),
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 4)]
        );
    }

    #[test]
    fn select_rules_per_status() {
        let mut ctx = context(Mode::P2p);
        let key = add_target(&mut ctx, 2, TargetStatus::Cancelled);
        ctx.select_target(Ipv4Addr::new(10, 0, 0, 2), b"hi").unwrap();
        assert_eq!(
            ctx.targets.get(key).unwrap().status,
            TargetStatus::InProgress2
        );
        assert_eq!(ctx.targets.get(key).unwrap().target_count, 1);

        assert!(matches!(
            ctx.select_target(Ipv4Addr::new(10, 0, 0, 2), b""),
            Err(MatchingError::RequestInProgress)
        ));

        add_target(&mut ctx, 3, TargetStatus::Established);
        assert!(matches!(
            ctx.select_target(Ipv4Addr::new(10, 0, 0, 3), b""),
            Err(MatchingError::AlreadyEstablished)
        ));

        assert!(matches!(
            ctx.select_target(Ipv4Addr::new(10, 0, 0, 99), b""),
            Err(MatchingError::UnknownTarget)
        ));
    }

    #[test]
    fn parent_cannot_select_unseen_targets() {
        let mut ctx = context(Mode::Parent);
        add_target(&mut ctx, 2, TargetStatus::Cancelled);
        assert!(matches!(
            ctx.select_target(Ipv4Addr::new(10, 0, 0, 2), b""),
            Err(MatchingError::TargetNotReady)
        ));
    }

    #[test]
    fn select_enforces_the_member_limit() {
        let mut ctx = context(Mode::P2p);
        add_target(&mut ctx, 2, TargetStatus::Established);
        add_target(&mut ctx, 3, TargetStatus::Established);
        add_target(&mut ctx, 4, TargetStatus::Established);
        add_target(&mut ctx, 5, TargetStatus::Cancelled);
        assert!(matches!(
            ctx.select_target(Ipv4Addr::new(10, 0, 0, 5), b""),
            Err(MatchingError::ExceedMaxnum)
        ));
    }

    #[test]
    fn send_data_validation() {
        let mut ctx = context(Mode::P2p);
        let addr = Ipv4Addr::new(10, 0, 0, 2);
        let key = add_target(&mut ctx, 2, TargetStatus::Established);

        assert!(matches!(
            ctx.send_data(addr, &[]),
            Err(MatchingError::InvalidDatalen)
        ));
        assert!(matches!(
            ctx.send_data(addr, &vec![0u8; MAX_DATA_LEN + 1]),
            Err(MatchingError::InvalidDatalen)
        ));

        ctx.send_data(addr, &vec![0u8; MAX_DATA_LEN]).unwrap();
        assert_eq!(
            ctx.targets.get(key).unwrap().send_data_status,
            SendDataStatus::Busy
        );
        assert!(matches!(
            ctx.send_data(addr, b"again"),
            Err(MatchingError::DataBusy)
        ));

        ctx.abort_send_data(addr).unwrap();
        let target = ctx.targets.get(key).unwrap();
        assert_eq!(target.send_data_status, SendDataStatus::Ready);
        assert!(target.send_data.is_none());
    }

    #[test]
    fn send_data_requires_establishment() {
        let mut ctx = context(Mode::P2p);
        add_target(&mut ctx, 2, TargetStatus::Seen);
        assert!(matches!(
            ctx.send_data(Ipv4Addr::new(10, 0, 0, 2), b"x"),
            Err(MatchingError::NotEstablished)
        ));
    }

    #[test]
    fn cancel_is_idempotent_and_keeps_the_opt() {
        let mut ctx = context(Mode::P2p);
        let addr = Ipv4Addr::new(10, 0, 0, 2);
        let key = add_target(&mut ctx, 2, TargetStatus::InProgress2);
        ctx.cancel_target(addr, b"busy").unwrap();
        let target = ctx.targets.get(key).unwrap();
        assert_eq!(target.status, TargetStatus::Cancelled);
        assert_eq!(target.opt, b"busy");
        // Already cancelled: fine, nothing changes
        ctx.cancel_target(addr, b"").unwrap();
    }

    #[test]
    fn roster_authority_rules() {
        let mut ctx = context(Mode::P2p);
        assert!(ctx.roster_authority_over(Ipv4Addr::new(10, 0, 0, 2)));
        assert!(!ctx.roster_authority_over(Ipv4Addr::new(9, 255, 255, 255)));
        ctx.params.mode = Mode::Parent;
        assert!(ctx.roster_authority_over(Ipv4Addr::new(9, 0, 0, 1)));
    }
}

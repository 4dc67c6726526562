//! Event pipe and the per-context event loop
//!
//! The event loop is the only place target state changes. Everything funnels
//! through the pipe: parked packets from the input loop, fired timers from
//! the callout worker, and the abort message from `stop`. One registry lock
//! is taken per drained event; handler notices collected during the locked
//! section are dispatched after it ends, so handlers can call back into the
//! public API.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::callout::CalloutKey;
use crate::context::Context;
use crate::handler::{dispatch_all, HandlerEvent, HandlerNotice};
use crate::protocol::packet::MatchingPacket;
use crate::registry::RegistryState;
use crate::target::TargetKey;
use crate::types::{ContextId, Mode, SendDataStatus, TargetStatus};

// ----------------------------------------------------------------------------
// Pipe Events
// ----------------------------------------------------------------------------

/// Fixed-size messages flowing through a context's event pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipeEvent {
    /// A datagram is parked on the target
    Packet(TargetKey),
    /// Handshake retry / keep-alive timer fired
    TargetTimeout(TargetKey),
    /// Send-data ack timer fired
    SendDataTimeout(TargetKey),
    /// Time to consider another HELLO broadcast
    HelloTick,
    /// Stop requested; drain and exit
    Abort,
}

// ----------------------------------------------------------------------------
// Callout-to-Pipe Conversion
// ----------------------------------------------------------------------------

/// Convert a fired callout entry into a pipe event
///
/// Runs on the callout worker. The per-slot `scheduled` bit guarantees at
/// most one in-flight pipe event per slot; a key whose target is gone is
/// dropped here.
pub(crate) fn callout_fire(
    state: &Mutex<RegistryState>,
    id: ContextId,
    tx: &Sender<PipeEvent>,
    key: CalloutKey,
) {
    let mut guard = state.lock();
    let Some(ctx) = guard.context_mut(id) else {
        return;
    };
    match key {
        CalloutKey::HelloTick => {
            if !ctx.hello_tick_scheduled {
                ctx.hello_tick_scheduled = true;
                let _ = tx.send(PipeEvent::HelloTick);
            }
        }
        CalloutKey::TargetTimeout(target_key) => {
            if let Some(target) = ctx.targets.get_mut(target_key) {
                if !target.target_timeout_scheduled {
                    target.target_timeout_scheduled = true;
                    let _ = tx.send(PipeEvent::TargetTimeout(target_key));
                }
            }
        }
        CalloutKey::SendDataTimeout(target_key) => {
            if let Some(target) = ctx.targets.get_mut(target_key) {
                if !target.send_data_timeout_scheduled {
                    target.send_data_timeout_scheduled = true;
                    let _ = tx.send(PipeEvent::SendDataTimeout(target_key));
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Event Loop
// ----------------------------------------------------------------------------

pub(crate) fn event_loop(state: Arc<Mutex<RegistryState>>, id: ContextId, rx: Receiver<PipeEvent>) {
    debug!(%id, "event loop up");
    while let Ok(event) = rx.recv() {
        if event == PipeEvent::Abort {
            break;
        }
        let (handler, notices) = {
            let mut guard = state.lock();
            let Some(ctx) = guard.context_mut(id) else {
                break;
            };
            let mut notices = Vec::new();
            handle_event(ctx, event, &mut notices);
            harvest_tombstones(ctx);
            (ctx.params.handler.clone(), notices)
        };
        dispatch_all(handler.as_ref(), notices);
    }
    debug!(%id, "event loop down");
}

/// Reclaim tombstoned targets whose pipe slots are all idle
fn harvest_tombstones(ctx: &mut Context) {
    for key in ctx.targets.keys() {
        let reclaim = ctx.targets.get(key).is_some_and(|t| t.can_reclaim());
        if reclaim {
            ctx.cancel_target_timers(key);
            if let Some(target) = ctx.targets.remove(key) {
                trace!(id = %ctx.id, peer = %target.addr, "target reclaimed");
            }
        }
    }
}

pub(crate) fn handle_event(ctx: &mut Context, event: PipeEvent, notices: &mut Vec<HandlerNotice>) {
    match event {
        PipeEvent::Packet(key) => {
            let Some(target) = ctx.targets.get_mut(key) else {
                return;
            };
            target.packet_scheduled = false;
            let Some(raw) = target.pending_packet.take() else {
                return;
            };
            process_packet(ctx, key, &raw, notices);
        }
        PipeEvent::TargetTimeout(key) => {
            if let Some(target) = ctx.targets.get_mut(key) {
                target.target_timeout_scheduled = false;
            }
            on_target_timeout(ctx, key, notices);
        }
        PipeEvent::SendDataTimeout(key) => {
            if let Some(target) = ctx.targets.get_mut(key) {
                target.send_data_timeout_scheduled = false;
            }
            on_send_data_timeout(ctx, key, notices);
        }
        PipeEvent::HelloTick => on_hello_tick(ctx),
        PipeEvent::Abort => {}
    }
}

// ----------------------------------------------------------------------------
// Deferred Side Effects
// ----------------------------------------------------------------------------

/// Side effects accumulated while the target is mutably borrowed and applied
/// once the borrow ends
#[derive(Default)]
struct Outcome {
    sends: Vec<MatchingPacket>,
    /// Delay to (re)arm the target timer with, in microseconds
    arm_target: Option<u64>,
    arm_send_data: Option<u64>,
    cancel_timers: bool,
    cancel_send_timer: bool,
    send_roster: bool,
    refresh_roster: bool,
    adopt_roster: Option<(Ipv4Addr, Vec<Ipv4Addr>)>,
}

fn apply(ctx: &mut Context, key: TargetKey, addr: Ipv4Addr, out: Outcome) {
    if out.cancel_timers {
        ctx.cancel_target_timers(key);
    }
    if out.cancel_send_timer {
        if let Some(callout) = &ctx.callout {
            callout.cancel(CalloutKey::SendDataTimeout(key));
        }
    }
    if out.send_roster {
        if let Some(roster) = ctx.member_message.clone() {
            ctx.send_raw(addr, &roster);
        }
    }
    for packet in &out.sends {
        ctx.send_packet(addr, packet);
    }
    if let Some(delay) = out.arm_target {
        ctx.rearm_timer(CalloutKey::TargetTimeout(key), delay);
    }
    if let Some(delay) = out.arm_send_data {
        ctx.rearm_timer(CalloutKey::SendDataTimeout(key), delay);
    }
    if let Some((parent, members)) = out.adopt_roster {
        ctx.adopt_member_message(parent, &members);
    }
    if out.refresh_roster {
        ctx.refresh_member_message();
    }
}

fn push_notice(
    notices: &mut Vec<HandlerNotice>,
    id: ContextId,
    event: HandlerEvent,
    peer: Ipv4Addr,
    opt: Vec<u8>,
) {
    notices.push(HandlerNotice {
        id,
        event,
        peer: Some(peer),
        opt,
    });
}

// ----------------------------------------------------------------------------
// Packet Processing
// ----------------------------------------------------------------------------

pub(crate) fn process_packet(
    ctx: &mut Context,
    key: TargetKey,
    raw: &[u8],
    notices: &mut Vec<HandlerNotice>,
) {
    let packet = match MatchingPacket::parse(raw) {
        Ok(packet) => packet,
        Err(e) => {
            trace!(id = %ctx.id, error = %e, "dropping malformed datagram");
            return;
        }
    };

    let id = ctx.id;
    let mode = ctx.params.mode;
    let maxnum = ctx.maxnum as usize;
    let retry_init = ctx.params.retry_count;
    let rexmt = u64::from(ctx.params.rexmt_interval);
    let own_addr = ctx.own_addr;
    let members = ctx.member_count();

    let Some(target) = ctx.targets.get(key) else {
        return;
    };
    let addr = target.addr;

    // Mode pre-filter: traffic the local role never consumes.
    let dropped = match &packet {
        MatchingPacket::Hello { .. } | MatchingPacket::MemberList { .. }
            if mode == Mode::Parent =>
        {
            true
        }
        MatchingPacket::HelloAck { .. } if mode == Mode::Child => true,
        MatchingPacket::MemberList { .. }
            if mode == Mode::P2p && u32::from(addr) > u32::from(own_addr) =>
        {
            true
        }
        MatchingPacket::MemberListAck if mode == Mode::Child => true,
        _ => false,
    };
    if dropped {
        trace!(id = %id, peer = %addr, kind = ?packet.packet_type(), "dropped by role filter");
        return;
    }

    let mut out = Outcome::default();
    let Some(target) = ctx.targets.get_mut(key) else {
        return;
    };

    // A changed session nonce means the remote restarted: reset the pairing
    // and let the packet take effect against a fresh Cancelled target.
    if let MatchingPacket::HelloAck { nonce, .. } | MatchingPacket::Accept { nonce, .. } = &packet
    {
        match target.peer_nonce {
            None => target.peer_nonce = Some(*nonce),
            Some(seen) if seen != *nonce => {
                let previous = target.status;
                target.set_status(TargetStatus::Cancelled);
                target.peer_nonce = Some(*nonce);
                out.cancel_timers = true;
                match previous {
                    TargetStatus::Seen | TargetStatus::InProgress => {
                        push_notice(notices, id, HandlerEvent::Cancel, addr, Vec::new());
                    }
                    TargetStatus::Established => {
                        push_notice(notices, id, HandlerEvent::Leave, addr, Vec::new());
                        out.refresh_roster = true;
                    }
                    _ => {}
                }
            }
            Some(_) => {}
        }
    }

    let status = target.status;
    match (packet, status) {
        // -- HELLO ---------------------------------------------------------
        (
            MatchingPacket::Hello {
                hello_interval,
                opt,
                ..
            },
            _,
        ) => {
            target.keep_alive_interval = u64::from(hello_interval).max(1);
            if status == TargetStatus::Cancelled && members + 1 < maxnum {
                push_notice(notices, id, HandlerEvent::Hello, addr, opt);
            }
        }

        // -- HELLO_ACK -----------------------------------------------------
        (MatchingPacket::HelloAck { opt, .. }, TargetStatus::Cancelled) => {
            if members + 1 < maxnum {
                target.set_status(TargetStatus::Seen);
                out.sends.push(MatchingPacket::Keepalive);
                push_notice(notices, id, HandlerEvent::Request, addr, opt);
            } else {
                out.sends.push(MatchingPacket::Cancel { opt: Vec::new() });
            }
        }
        (MatchingPacket::HelloAck { .. }, TargetStatus::Seen) => {
            if members + 1 < maxnum {
                out.sends.push(MatchingPacket::Keepalive);
            } else {
                target.set_status(TargetStatus::Cancelled);
                out.cancel_timers = true;
                out.sends.push(MatchingPacket::Cancel { opt: Vec::new() });
                push_notice(notices, id, HandlerEvent::Cancel, addr, Vec::new());
            }
        }
        (MatchingPacket::HelloAck { .. }, TargetStatus::InProgress) => {
            out.sends.push(MatchingPacket::Accept {
                nonce: target.target_count,
                opt: target.opt.clone(),
            });
            out.arm_target = Some(rexmt);
        }
        (MatchingPacket::HelloAck { opt, .. }, TargetStatus::InProgress2) => {
            target.set_status(TargetStatus::InProgress);
            out.sends.push(MatchingPacket::Accept {
                nonce: target.target_count,
                opt: target.opt.clone(),
            });
            out.arm_target = Some(rexmt);
            push_notice(notices, id, HandlerEvent::Accept, addr, opt);
        }
        (MatchingPacket::HelloAck { .. }, TargetStatus::Established) => {
            target.set_status(TargetStatus::Cancelled);
            out.cancel_timers = true;
            out.sends.push(MatchingPacket::Cancel { opt: Vec::new() });
            push_notice(notices, id, HandlerEvent::Error, addr, Vec::new());
            out.refresh_roster = true;
        }

        // -- ACCEPT --------------------------------------------------------
        (MatchingPacket::Accept { .. }, TargetStatus::Cancelled) => {
            out.sends.push(MatchingPacket::Cancel {
                opt: target.opt.clone(),
            });
        }
        (MatchingPacket::Accept { .. }, TargetStatus::Seen) => {
            target.set_status(TargetStatus::Cancelled);
            out.cancel_timers = true;
            out.sends.push(MatchingPacket::Cancel { opt: Vec::new() });
            push_notice(notices, id, HandlerEvent::Error, addr, Vec::new());
        }
        (MatchingPacket::Accept { opt, .. }, TargetStatus::InProgress | TargetStatus::InProgress2) => {
            let was_waiting_for_their_confirm = status == TargetStatus::InProgress2;
            target.set_status(TargetStatus::Established);
            target.retry_count = retry_init;
            out.sends.push(MatchingPacket::Confirm);
            out.arm_target = Some(target.keep_alive_interval);
            if was_waiting_for_their_confirm {
                push_notice(notices, id, HandlerEvent::Accept, addr, opt);
            }
            push_notice(notices, id, HandlerEvent::Established, addr, Vec::new());
            out.refresh_roster = true;
        }
        (MatchingPacket::Accept { .. }, TargetStatus::Established) => {
            out.sends.push(MatchingPacket::Confirm);
        }

        // -- CONFIRM -------------------------------------------------------
        (MatchingPacket::Confirm, TargetStatus::Seen | TargetStatus::InProgress) => {
            target.set_status(TargetStatus::Cancelled);
            out.cancel_timers = true;
            out.sends.push(MatchingPacket::Cancel { opt: Vec::new() });
            push_notice(notices, id, HandlerEvent::Error, addr, Vec::new());
        }
        (MatchingPacket::Confirm, TargetStatus::InProgress2) => {
            target.set_status(TargetStatus::Established);
            target.retry_count = retry_init;
            out.arm_target = Some(rexmt);
            push_notice(notices, id, HandlerEvent::Established, addr, Vec::new());
            out.refresh_roster = true;
        }
        (MatchingPacket::Confirm, _) => {}

        // -- CANCEL --------------------------------------------------------
        (MatchingPacket::Cancel { .. }, TargetStatus::Cancelled) => {}
        (MatchingPacket::Cancel { opt }, TargetStatus::Seen | TargetStatus::InProgress) => {
            target.set_status(TargetStatus::Cancelled);
            out.cancel_timers = true;
            push_notice(notices, id, HandlerEvent::Cancel, addr, opt);
        }
        (MatchingPacket::Cancel { opt }, TargetStatus::InProgress2) => {
            target.set_status(TargetStatus::Cancelled);
            out.cancel_timers = true;
            push_notice(notices, id, HandlerEvent::Deny, addr, opt);
        }
        (MatchingPacket::Cancel { opt }, TargetStatus::Established) => {
            target.set_status(TargetStatus::Cancelled);
            out.cancel_timers = true;
            push_notice(notices, id, HandlerEvent::Leave, addr, opt);
            out.refresh_roster = true;
        }

        // -- MEMBER_LIST ---------------------------------------------------
        (MatchingPacket::MemberList { .. }, TargetStatus::Cancelled) => {
            out.sends.push(MatchingPacket::Cancel {
                opt: target.opt.clone(),
            });
        }
        (
            MatchingPacket::MemberList { .. },
            TargetStatus::Seen | TargetStatus::InProgress2,
        ) => {
            target.set_status(TargetStatus::Cancelled);
            out.cancel_timers = true;
            out.sends.push(MatchingPacket::Cancel { opt: Vec::new() });
            push_notice(notices, id, HandlerEvent::Error, addr, Vec::new());
        }
        (MatchingPacket::MemberList { parent, members }, TargetStatus::InProgress) => {
            target.set_status(TargetStatus::Established);
            target.retry_count = retry_init;
            out.sends.push(MatchingPacket::MemberListAck);
            out.arm_target = Some(target.keep_alive_interval);
            if mode == Mode::Child {
                out.adopt_roster = Some((parent, members));
            }
            push_notice(notices, id, HandlerEvent::Established, addr, Vec::new());
            out.refresh_roster = true;
        }
        (MatchingPacket::MemberList { parent, members }, TargetStatus::Established) => {
            target.retry_count = retry_init;
            out.sends.push(MatchingPacket::MemberListAck);
            if mode == Mode::Child {
                out.adopt_roster = Some((parent, members));
            }
        }

        // -- MEMBER_LIST_ACK -----------------------------------------------
        (MatchingPacket::MemberListAck, TargetStatus::Established) => {
            target.retry_count = retry_init;
        }
        (MatchingPacket::MemberListAck, TargetStatus::Cancelled) => {}
        (MatchingPacket::MemberListAck, _) => {
            target.set_status(TargetStatus::Cancelled);
            out.cancel_timers = true;
            out.sends.push(MatchingPacket::Cancel { opt: Vec::new() });
            push_notice(notices, id, HandlerEvent::Error, addr, Vec::new());
        }

        // -- BYE -----------------------------------------------------------
        (MatchingPacket::Bye, _) => {
            let was_established = status == TargetStatus::Established;
            target.set_status(TargetStatus::Cancelled);
            target.delete_flag = true;
            out.cancel_timers = true;
            push_notice(notices, id, HandlerEvent::Bye, addr, Vec::new());
            if was_established {
                out.refresh_roster = true;
            }
        }

        // -- KEEPALIVE -----------------------------------------------------
        (MatchingPacket::Keepalive, _) => {}

        // -- DATA ----------------------------------------------------------
        (MatchingPacket::Data { nonce, seq, payload }, TargetStatus::Established) => {
            if target.peer_nonce == Some(nonce) && seq >= target.recv_data_count {
                target.recv_data_count = seq.wrapping_add(1);
                out.sends.push(MatchingPacket::DataAck {
                    nonce: target.target_count,
                    seq,
                });
                push_notice(notices, id, HandlerEvent::Data, addr, payload);
            }
        }
        (MatchingPacket::Data { .. }, _) => {}

        // -- DATA_ACK ------------------------------------------------------
        (MatchingPacket::DataAck { seq, .. }, TargetStatus::Established) => {
            if target.send_data_status == SendDataStatus::Busy && seq == target.send_data_count {
                target.set_send_data_status(SendDataStatus::Ready);
                out.cancel_send_timer = true;
                push_notice(notices, id, HandlerEvent::DataAck, addr, Vec::new());
            }
        }
        (MatchingPacket::DataAck { .. }, _) => {}
    }

    apply(ctx, key, addr, out);
}

// ----------------------------------------------------------------------------
// Timer Handlers
// ----------------------------------------------------------------------------

/// Handshake retry while in progress, keep-alive probing once established
fn on_target_timeout(ctx: &mut Context, key: TargetKey, notices: &mut Vec<HandlerNotice>) {
    let id = ctx.id;
    let rexmt = u64::from(ctx.params.rexmt_interval);

    let Some(target) = ctx.targets.get(key) else {
        return;
    };
    let addr = target.addr;
    let authority = ctx.roster_authority_over(addr);

    let mut out = Outcome::default();
    let Some(target) = ctx.targets.get_mut(key) else {
        return;
    };

    match target.status {
        TargetStatus::InProgress2 => {
            if target.retry_count > 0 {
                target.retry_count -= 1;
                out.sends.push(MatchingPacket::HelloAck {
                    nonce: target.target_count,
                    opt: target.opt.clone(),
                });
                out.arm_target = Some(rexmt);
            } else {
                target.set_status(TargetStatus::Cancelled);
                out.cancel_timers = true;
                push_notice(notices, id, HandlerEvent::Timeout, addr, Vec::new());
            }
        }
        TargetStatus::InProgress => {
            // The retry counter goes up here in the vendor runtime; kept
            // bug-for-bug so retry exhaustion behaves identically.
            target.retry_count += 1;
            out.sends.push(MatchingPacket::Accept {
                nonce: target.target_count,
                opt: target.opt.clone(),
            });
            out.arm_target = Some(rexmt);
        }
        TargetStatus::Established => {
            if authority {
                out.send_roster = true;
            }
            target.retry_count -= 1;
            if target.retry_count <= 0 {
                target.set_status(TargetStatus::Cancelled);
                out.cancel_timers = true;
                push_notice(notices, id, HandlerEvent::Timeout, addr, Vec::new());
                out.refresh_roster = true;
            } else {
                out.arm_target = Some(target.keep_alive_interval);
            }
        }
        TargetStatus::Cancelled | TargetStatus::Seen => {}
    }

    apply(ctx, key, addr, out);
}

/// Retransmit or give up on the outstanding DATA payload
fn on_send_data_timeout(ctx: &mut Context, key: TargetKey, notices: &mut Vec<HandlerNotice>) {
    let id = ctx.id;
    let rexmt = u64::from(ctx.params.rexmt_interval);

    let mut out = Outcome::default();
    let Some(target) = ctx.targets.get_mut(key) else {
        return;
    };
    let addr = target.addr;

    if target.send_data_status == SendDataStatus::Busy {
        target.send_retry_count -= 1;
        if target.send_retry_count <= 0 {
            target.set_send_data_status(SendDataStatus::Ready);
            push_notice(notices, id, HandlerEvent::DataTimeout, addr, Vec::new());
        } else if let Some(payload) = target.send_data.clone() {
            out.sends.push(MatchingPacket::Data {
                nonce: target.target_count,
                seq: target.send_data_count,
                payload,
            });
            out.arm_send_data = Some(rexmt);
        }
    }

    apply(ctx, key, addr, out);
}

/// Broadcast a HELLO if the session still has room, then re-arm the tick
fn on_hello_tick(ctx: &mut Context) {
    ctx.hello_tick_scheduled = false;
    if ctx.member_count() + 1 < ctx.maxnum as usize {
        ctx.broadcast_hello();
    }
    ctx.rearm_timer(
        CalloutKey::HelloTick,
        u64::from(ctx.params.hello_interval),
    );
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CreateParams;
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

    fn feed(ctx: &mut Context, key: TargetKey, packet: MatchingPacket) -> Vec<HandlerNotice> {
        let mut notices = Vec::new();
        let raw = packet.serialize();
        process_packet(ctx, key, &raw, &mut notices);
        notices
    }

    fn events(notices: &[HandlerNotice]) -> Vec<HandlerEvent> {
        notices.iter().map(|n| n.event).collect()
    }

    #[test]
    fn hello_notifies_while_there_is_room() {
        let mut ctx = context(Mode::P2p);
        let key = add_target(&mut ctx, 2, TargetStatus::Cancelled);
        let notices = feed(
            &mut ctx,
            key,
            MatchingPacket::Hello {
                hello_interval: 2_000_000,
                rexmt_interval: 100_000,
                opt: b"srv".to_vec(),
            },
        );
        assert_eq!(events(&notices), vec![HandlerEvent::Hello]);
        assert_eq!(notices[0].opt, b"srv");
        // Advertised interval becomes the keep-alive period
        assert_eq!(ctx.targets.get(key).unwrap().keep_alive_interval, 2_000_000);
    }

    #[test]
    fn hello_is_silent_when_full() {
        let mut ctx = context(Mode::P2p);
        add_target(&mut ctx, 3, TargetStatus::Established);
        add_target(&mut ctx, 4, TargetStatus::Established);
        add_target(&mut ctx, 5, TargetStatus::Established);
        let key = add_target(&mut ctx, 2, TargetStatus::Cancelled);
        let notices = feed(
            &mut ctx,
            key,
            MatchingPacket::Hello {
                hello_interval: 1,
                rexmt_interval: 1,
                opt: Vec::new(),
            },
        );
        assert!(notices.is_empty());
    }

    #[test]
    fn parent_ignores_hello() {
        let mut ctx = context(Mode::Parent);
        let key = add_target(&mut ctx, 2, TargetStatus::Cancelled);
        let notices = feed(
            &mut ctx,
            key,
            MatchingPacket::Hello {
                hello_interval: 1,
                rexmt_interval: 1,
                opt: Vec::new(),
            },
        );
        assert!(notices.is_empty());
    }

    #[test]
    fn hello_ack_starts_a_request() {
        let mut ctx = context(Mode::Parent);
        let key = add_target(&mut ctx, 2, TargetStatus::Cancelled);
        let notices = feed(
            &mut ctx,
            key,
            MatchingPacket::HelloAck {
                nonce: 5,
                opt: b"join".to_vec(),
            },
        );
        assert_eq!(events(&notices), vec![HandlerEvent::Request]);
        let target = ctx.targets.get(key).unwrap();
        assert_eq!(target.status, TargetStatus::Seen);
        assert_eq!(target.peer_nonce, Some(5));
    }

    #[test]
    fn accept_completes_our_selection() {
        let mut ctx = context(Mode::P2p);
        let key = add_target(&mut ctx, 2, TargetStatus::InProgress2);
        let notices = feed(
            &mut ctx,
            key,
            MatchingPacket::Accept {
                nonce: 9,
                opt: b"ok".to_vec(),
            },
        );
        assert_eq!(
            events(&notices),
            vec![HandlerEvent::Accept, HandlerEvent::Established]
        );
        let target = ctx.targets.get(key).unwrap();
        assert_eq!(target.status, TargetStatus::Established);
        assert_eq!(target.retry_count, ctx.params.retry_count);
        // Entering Established resets the data counters
        assert_eq!(target.send_data_count, 0);
        assert_eq!(target.recv_data_count, 0);
    }

    #[test]
    fn confirm_completes_their_selection() {
        let mut ctx = context(Mode::P2p);
        let key = add_target(&mut ctx, 2, TargetStatus::InProgress2);
        let notices = feed(&mut ctx, key, MatchingPacket::Confirm);
        assert_eq!(events(&notices), vec![HandlerEvent::Established]);
        assert_eq!(
            ctx.targets.get(key).unwrap().status,
            TargetStatus::Established
        );
    }

    #[test]
    fn cancel_maps_to_deny_leave_or_cancel() {
        let mut ctx = context(Mode::P2p);
        let key = add_target(&mut ctx, 2, TargetStatus::InProgress2);
        let notices = feed(
            &mut ctx,
            key,
            MatchingPacket::Cancel {
                opt: b"no".to_vec(),
            },
        );
        assert_eq!(events(&notices), vec![HandlerEvent::Deny]);
        assert_eq!(notices[0].opt, b"no");

        let key = add_target(&mut ctx, 3, TargetStatus::Established);
        let notices = feed(&mut ctx, key, MatchingPacket::Cancel { opt: Vec::new() });
        assert_eq!(events(&notices), vec![HandlerEvent::Leave]);

        let key = add_target(&mut ctx, 4, TargetStatus::Seen);
        let notices = feed(&mut ctx, key, MatchingPacket::Cancel { opt: Vec::new() });
        assert_eq!(events(&notices), vec![HandlerEvent::Cancel]);
    }

    #[test]
    fn bye_tombstones_the_target() {
        let mut ctx = context(Mode::Parent);
        let key = add_target(&mut ctx, 2, TargetStatus::Established);
        let notices = feed(&mut ctx, key, MatchingPacket::Bye);
        assert_eq!(events(&notices), vec![HandlerEvent::Bye]);
        let target = ctx.targets.get(key).unwrap();
        assert_eq!(target.status, TargetStatus::Cancelled);
        assert!(target.delete_flag);

        // All pipe slots idle: the next harvest frees the slot
        harvest_tombstones(&mut ctx);
        assert!(ctx.targets.get(key).is_none());
    }

    #[test]
    fn nonce_change_resets_an_established_pairing() {
        let mut ctx = context(Mode::P2p);
        let key = add_target(&mut ctx, 2, TargetStatus::Established);
        ctx.targets.get_mut(key).unwrap().peer_nonce = Some(1);

        let notices = feed(
            &mut ctx,
            key,
            MatchingPacket::HelloAck {
                nonce: 2,
                opt: Vec::new(),
            },
        );
        // Leave for the dead session, then the ack plays against Cancelled
        assert_eq!(
            events(&notices),
            vec![HandlerEvent::Leave, HandlerEvent::Request]
        );
        let target = ctx.targets.get(key).unwrap();
        assert_eq!(target.status, TargetStatus::Seen);
        assert_eq!(target.peer_nonce, Some(2));
    }

    #[test]
    fn member_list_establishes_and_children_adopt_the_roster() {
        let mut ctx = context(Mode::Child);
        ctx.own_addr = Ipv4Addr::new(10, 0, 0, 3);
        let key = add_target(&mut ctx, 1, TargetStatus::InProgress);
        let notices = feed(
            &mut ctx,
            key,
            MatchingPacket::MemberList {
                parent: Ipv4Addr::new(10, 0, 0, 1),
                members: vec![Ipv4Addr::new(10, 0, 0, 3), Ipv4Addr::new(10, 0, 0, 4)],
            },
        );
        assert_eq!(events(&notices), vec![HandlerEvent::Established]);
        assert_eq!(
            ctx.member_addrs(),
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 4)]
        );
    }

    #[test]
    fn p2p_drops_rosters_from_higher_addresses() {
        let mut ctx = context(Mode::P2p);
        let key = add_target(&mut ctx, 2, TargetStatus::InProgress);
        let notices = feed(
            &mut ctx,
            key,
            MatchingPacket::MemberList {
                parent: Ipv4Addr::new(10, 0, 0, 2),
                members: Vec::new(),
            },
        );
        assert!(notices.is_empty());
        assert_eq!(
            ctx.targets.get(key).unwrap().status,
            TargetStatus::InProgress
        );
    }

    #[test]
    fn data_is_delivered_once_and_acked() {
        let mut ctx = context(Mode::P2p);
        let key = add_target(&mut ctx, 2, TargetStatus::Established);
        ctx.targets.get_mut(key).unwrap().peer_nonce = Some(1);

        let packet = MatchingPacket::Data {
            nonce: 1,
            seq: 0,
            payload: b"payload".to_vec(),
        };
        let notices = feed(&mut ctx, key, packet.clone());
        assert_eq!(events(&notices), vec![HandlerEvent::Data]);
        assert_eq!(notices[0].opt, b"payload");
        assert_eq!(ctx.targets.get(key).unwrap().recv_data_count, 1);

        // A duplicate (stale sequence) is ignored
        let notices = feed(&mut ctx, key, packet);
        assert!(notices.is_empty());
    }

    #[test]
    fn data_with_a_foreign_nonce_is_ignored() {
        let mut ctx = context(Mode::P2p);
        let key = add_target(&mut ctx, 2, TargetStatus::Established);
        ctx.targets.get_mut(key).unwrap().peer_nonce = Some(1);
        let notices = feed(
            &mut ctx,
            key,
            MatchingPacket::Data {
                nonce: 3,
                seq: 0,
                payload: b"x".to_vec(),
            },
        );
        assert!(notices.is_empty());
    }

    #[test]
    fn data_ack_releases_the_send_slot() {
        let mut ctx = context(Mode::P2p);
        let key = add_target(&mut ctx, 2, TargetStatus::Established);
        {
            let target = ctx.targets.get_mut(key).unwrap();
            target.send_data = Some(b"out".to_vec());
            target.send_data_status = SendDataStatus::Busy;
            target.send_data_count = 1;
        }
        let notices = feed(&mut ctx, key, MatchingPacket::DataAck { nonce: 1, seq: 1 });
        assert_eq!(events(&notices), vec![HandlerEvent::DataAck]);
        let target = ctx.targets.get(key).unwrap();
        assert_eq!(target.send_data_status, SendDataStatus::Ready);
        assert!(target.send_data.is_none());
    }

    #[test]
    fn stale_data_ack_is_ignored() {
        let mut ctx = context(Mode::P2p);
        let key = add_target(&mut ctx, 2, TargetStatus::Established);
        {
            let target = ctx.targets.get_mut(key).unwrap();
            target.send_data = Some(b"out".to_vec());
            target.send_data_status = SendDataStatus::Busy;
            target.send_data_count = 2;
        }
        let notices = feed(&mut ctx, key, MatchingPacket::DataAck { nonce: 1, seq: 1 });
        assert!(notices.is_empty());
        assert_eq!(
            ctx.targets.get(key).unwrap().send_data_status,
            SendDataStatus::Busy
        );
    }

    #[test]
    fn registration_retry_exhaustion_times_out() {
        let mut ctx = context(Mode::P2p);
        let key = add_target(&mut ctx, 2, TargetStatus::InProgress2);
        ctx.targets.get_mut(key).unwrap().retry_count = 0;

        let mut notices = Vec::new();
        handle_event(&mut ctx, PipeEvent::TargetTimeout(key), &mut notices);
        assert_eq!(events(&notices), vec![HandlerEvent::Timeout]);
        assert_eq!(
            ctx.targets.get(key).unwrap().status,
            TargetStatus::Cancelled
        );
    }

    #[test]
    fn registration_retry_decrements_while_budget_remains() {
        let mut ctx = context(Mode::P2p);
        let key = add_target(&mut ctx, 2, TargetStatus::InProgress2);

        let mut notices = Vec::new();
        handle_event(&mut ctx, PipeEvent::TargetTimeout(key), &mut notices);
        assert!(notices.is_empty());
        assert_eq!(ctx.targets.get(key).unwrap().retry_count, 2);
    }

    #[test]
    fn keepalive_exhaustion_times_out_an_established_target() {
        let mut ctx = context(Mode::P2p);
        let key = add_target(&mut ctx, 2, TargetStatus::Established);
        ctx.targets.get_mut(key).unwrap().retry_count = 1;

        let mut notices = Vec::new();
        handle_event(&mut ctx, PipeEvent::TargetTimeout(key), &mut notices);
        assert_eq!(events(&notices), vec![HandlerEvent::Timeout]);
        assert_eq!(
            ctx.targets.get(key).unwrap().status,
            TargetStatus::Cancelled
        );
    }

    #[test]
    fn send_data_timeout_exhaustion_releases_the_buffer() {
        let mut ctx = context(Mode::P2p);
        let key = add_target(&mut ctx, 2, TargetStatus::Established);
        {
            let target = ctx.targets.get_mut(key).unwrap();
            target.send_data = Some(b"lost".to_vec());
            target.send_data_status = SendDataStatus::Busy;
            target.send_retry_count = 1;
        }
        let mut notices = Vec::new();
        handle_event(&mut ctx, PipeEvent::SendDataTimeout(key), &mut notices);
        assert_eq!(events(&notices), vec![HandlerEvent::DataTimeout]);
        let target = ctx.targets.get(key).unwrap();
        assert_eq!(target.send_data_status, SendDataStatus::Ready);
        assert!(target.send_data.is_none());
    }

    #[test]
    fn unexpected_member_list_ack_resets_the_handshake() {
        let mut ctx = context(Mode::Parent);
        let key = add_target(&mut ctx, 2, TargetStatus::InProgress2);
        let notices = feed(&mut ctx, key, MatchingPacket::MemberListAck);
        assert_eq!(events(&notices), vec![HandlerEvent::Error]);
        assert_eq!(
            ctx.targets.get(key).unwrap().status,
            TargetStatus::Cancelled
        );
    }
}

//! Input loop: blocking receive, framing pre-checks and target admission
//!
//! One thread per running context blocks in `recv_from` on the receive
//! socket. A datagram is parked on its target (creating the target when the
//! packet kind makes sense for the role pairing) and a single PACKET pipe
//! event is posted; the slot flag guarantees the event loop never sees two
//! in-flight packets for one target. Closing the socket is what ends the
//! thread.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::events::PipeEvent;
use crate::platform::MatchingSocket;
use crate::protocol::packet::{peek_header, PacketType, HEADER_LEN};
use crate::registry::RegistryState;
use crate::target::Target;
use crate::types::{ContextId, ContextStatus, Mode};

/// Whether a packet from an unknown peer may create a target
///
/// Discovery traffic only: a HELLO admits a new peer on contexts that join
/// (Child/P2P), a HELLO_ACK admits one on contexts that get joined
/// (Parent/P2P). Everything else from a stranger is noise.
fn admits_new_target(packet_type: u8, mode: Mode) -> bool {
    match PacketType::from_u8(packet_type) {
        Some(PacketType::Hello) => matches!(mode, Mode::Child | Mode::P2p),
        Some(PacketType::HelloAck) => matches!(mode, Mode::Parent | Mode::P2p),
        _ => false,
    }
}

pub(crate) fn input_loop(
    state: Arc<Mutex<RegistryState>>,
    id: ContextId,
    socket: Arc<dyn MatchingSocket>,
    rxbuf_len: usize,
    own_addr: Ipv4Addr,
    tx: Sender<PipeEvent>,
) {
    debug!(%id, "input loop up");
    let mut rxbuf = vec![0u8; rxbuf_len];

    loop {
        let (len, from) = match socket.recv_from(&mut rxbuf) {
            Ok(received) => received,
            Err(e) => {
                debug!(%id, error = %e, "input loop down");
                return;
            }
        };
        let datagram = &rxbuf[..len];

        // Our own broadcasts loop back; drop them at the door.
        if *from.ip() == own_addr {
            continue;
        }
        let header = match peek_header(datagram) {
            Ok(header) => header,
            Err(e) => {
                trace!(%id, from = %from, error = %e, "dropping datagram");
                continue;
            }
        };
        if len < HEADER_LEN + header.payload_len {
            trace!(%id, from = %from, "dropping truncated datagram");
            continue;
        }

        let mut guard = state.lock();
        let Some(ctx) = guard.context_mut(id) else {
            return;
        };
        if ctx.status != ContextStatus::Running {
            continue;
        }

        let key = match ctx.targets.find_by_addr(*from.ip()) {
            Some(key) => key,
            None => {
                if !admits_new_target(header.packet_type, ctx.params.mode) {
                    trace!(%id, from = %from, "stranger dropped");
                    continue;
                }
                debug!(%id, peer = %from.ip(), "new target");
                ctx.targets.insert(Target::new(
                    *from.ip(),
                    ctx.params.retry_count,
                    u64::from(ctx.params.keep_alive_interval),
                ))
            }
        };

        let Some(target) = ctx.targets.get_mut(key) else {
            continue;
        };
        // One parked packet per target; while the event loop is behind, the
        // retransmit machinery makes up for the drop.
        if !target.packet_scheduled {
            target.pending_packet = Some(datagram.to_vec());
            target.packet_scheduled = true;
            let _ = tx.send(PipeEvent::Packet(key));
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

//! Per-peer target state and the target arena
//!
//! Targets live in a generation-tagged slot arena owned by their context.
//! Everything that crosses a thread boundary (pipe events, timer keys) refers
//! to a target by [`TargetKey`]; a key whose generation no longer matches
//! resolves to nothing, so events raced against target teardown are dropped
//! instead of touching a recycled slot.

use std::net::Ipv4Addr;

use crate::types::{SendDataStatus, TargetStatus};

// ----------------------------------------------------------------------------
// Target Key
// ----------------------------------------------------------------------------

/// Stable reference to one arena slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TargetKey {
    pub index: u32,
    pub gen: u32,
}

// ----------------------------------------------------------------------------
// Target
// ----------------------------------------------------------------------------

/// One remote peer as seen by a context
#[derive(Debug)]
pub(crate) struct Target {
    pub addr: Ipv4Addr,
    pub status: TargetStatus,
    /// Opt blob tied to the in-flight selection (ours or the remote's)
    pub opt: Vec<u8>,
    /// Raw datagram parked by the input loop until the event loop drains it
    pub pending_packet: Option<Vec<u8>>,
    /// Payload buffered while a DATA send awaits its ack
    pub send_data: Option<Vec<u8>>,
    pub send_data_status: SendDataStatus,
    /// Our session nonce for this pairing; advances on every selection
    pub target_count: i32,
    /// The remote's session nonce, adopted from its first nonce-carrying
    /// packet; a later mismatch means the remote restarted
    pub peer_nonce: Option<i32>,
    pub send_data_count: i32,
    pub recv_data_count: i32,
    /// Remaining retry budget of the handshake/keep-alive timer
    pub retry_count: i32,
    /// Remaining retry budget of the send-data timer; independent because
    /// both timers can be armed at once
    pub send_retry_count: i32,
    /// Keep-alive period in microseconds; overwritten by the remote's
    /// advertised hello interval once a HELLO from it is parsed
    pub keep_alive_interval: u64,
    /// Tombstone; the slot is reclaimed once every pipe slot is idle
    pub delete_flag: bool,
    // Pipe-slot flags: at most one in-flight pipe event per kind per target
    pub packet_scheduled: bool,
    pub target_timeout_scheduled: bool,
    pub send_data_timeout_scheduled: bool,
}

impl Target {
    pub fn new(addr: Ipv4Addr, retry_count: i32, keep_alive_interval: u64) -> Self {
        Self {
            addr,
            status: TargetStatus::Cancelled,
            opt: Vec::new(),
            pending_packet: None,
            send_data: None,
            send_data_status: SendDataStatus::Ready,
            target_count: 0,
            peer_nonce: None,
            send_data_count: 0,
            recv_data_count: 0,
            retry_count,
            send_retry_count: retry_count,
            keep_alive_interval,
            delete_flag: false,
            packet_scheduled: false,
            target_timeout_scheduled: false,
            send_data_timeout_scheduled: false,
        }
    }

    /// Transition to `status`, releasing per-state resources
    ///
    /// Leaving the in-progress pair drops the selection opt; entering
    /// Established resets both data counters; leaving Established releases
    /// the send buffer and returns the data channel to Ready.
    pub fn set_status(&mut self, status: TargetStatus) {
        if self.status == status {
            return;
        }

        let was_in_progress = matches!(
            self.status,
            TargetStatus::InProgress | TargetStatus::InProgress2
        );
        let still_in_progress = matches!(
            status,
            TargetStatus::InProgress | TargetStatus::InProgress2
        );
        if was_in_progress && !still_in_progress {
            self.opt = Vec::new();
        }

        if self.status != TargetStatus::Established && status == TargetStatus::Established {
            self.send_data_count = 0;
            self.recv_data_count = 0;
        }

        if self.status == TargetStatus::Established && status != TargetStatus::Established {
            self.send_data = None;
            self.send_data_status = SendDataStatus::Ready;
        }

        self.status = status;
    }

    /// Flip the data channel, dropping the buffered payload on Busy -> Ready
    pub fn set_send_data_status(&mut self, status: SendDataStatus) {
        if self.send_data_status == status {
            return;
        }
        if status == SendDataStatus::Ready {
            self.send_data = None;
        }
        self.send_data_status = status;
    }

    /// Advance our session nonce; zero is never a valid live nonce
    pub fn bump_target_count(&mut self) {
        self.target_count = self.target_count.wrapping_add(1);
        if self.target_count == 0 {
            self.target_count = 1;
        }
    }

    /// Whether the tombstoned slot can be reclaimed
    pub fn can_reclaim(&self) -> bool {
        self.delete_flag
            && !self.packet_scheduled
            && !self.target_timeout_scheduled
            && !self.send_data_timeout_scheduled
    }
}

// ----------------------------------------------------------------------------
// Target Table
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Slot {
    gen: u32,
    target: Option<Target>,
}

/// Generation-tagged slot arena holding a context's targets
#[derive(Debug, Default)]
pub(crate) struct TargetTable {
    slots: Vec<Slot>,
}

impl TargetTable {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn insert(&mut self, target: Target) -> TargetKey {
        if let Some(index) = self.slots.iter().position(|s| s.target.is_none()) {
            let slot = &mut self.slots[index];
            slot.target = Some(target);
            return TargetKey {
                index: index as u32,
                gen: slot.gen,
            };
        }
        self.slots.push(Slot {
            gen: 0,
            target: Some(target),
        });
        TargetKey {
            index: (self.slots.len() - 1) as u32,
            gen: 0,
        }
    }

    pub fn get(&self, key: TargetKey) -> Option<&Target> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.gen != key.gen {
            return None;
        }
        slot.target.as_ref()
    }

    pub fn get_mut(&mut self, key: TargetKey) -> Option<&mut Target> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.gen != key.gen {
            return None;
        }
        slot.target.as_mut()
    }

    /// Free the slot and bump its generation so stale keys miss
    pub fn remove(&mut self, key: TargetKey) -> Option<Target> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.gen != key.gen || slot.target.is_none() {
            return None;
        }
        slot.gen = slot.gen.wrapping_add(1);
        slot.target.take()
    }

    pub fn find_by_addr(&self, addr: Ipv4Addr) -> Option<TargetKey> {
        self.iter()
            .find(|(_, t)| t.addr == addr)
            .map(|(key, _)| key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TargetKey, &Target)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.target.as_ref().map(|t| {
                (
                    TargetKey {
                        index: index as u32,
                        gen: slot.gen,
                    },
                    t,
                )
            })
        })
    }

    pub fn keys(&self) -> Vec<TargetKey> {
        self.iter().map(|(key, _)| key).collect()
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            if slot.target.take().is_some() {
                slot.gen = slot.gen.wrapping_add(1);
            }
        }
    }

    /// Targets at `floor` or better, i.e. the session's member-like peers
    pub fn count_with_status_at_least(&self, floor: TargetStatus) -> usize {
        self.iter().filter(|(_, t)| t.status >= floor).count()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

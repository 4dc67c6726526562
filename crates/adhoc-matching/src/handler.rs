//! Guest handler events and the dispatcher boundary
//!
//! Every interesting membership change surfaces to the game through a single
//! caller-supplied handler. Dispatch happens on the event-loop thread after
//! the registry lock has been released, so a handler is free to call back
//! into any public matching operation.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::types::ContextId;

// ----------------------------------------------------------------------------
// Handler Events
// ----------------------------------------------------------------------------

/// Event kinds delivered to the guest handler
///
/// Values are the wire/ABI numbering games switch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HandlerEvent {
    /// A peer's HELLO beacon was seen
    Hello = 1,
    /// A peer asked to join us
    Request = 2,
    /// An established peer left
    Leave = 3,
    /// Our join request was denied
    Deny = 4,
    /// A pending handshake was cancelled by the remote
    Cancel = 5,
    /// The remote accepted our selection
    Accept = 6,
    /// Membership is now bidirectional
    Established = 7,
    /// A handshake or keep-alive retry budget ran out
    Timeout = 8,
    /// The remote answered out of protocol; the target was reset
    Error = 9,
    /// The remote shut down its context
    Bye = 10,
    /// An acknowledged data payload arrived
    Data = 11,
    /// The remote acknowledged our data payload
    DataAck = 12,
    /// A data payload was never acknowledged
    DataTimeout = 13,
}

// ----------------------------------------------------------------------------
// Handler Notice
// ----------------------------------------------------------------------------

/// One pending handler invocation, captured while the registry lock is held
/// and dispatched after it is dropped
#[derive(Debug, Clone)]
pub struct HandlerNotice {
    pub id: ContextId,
    pub event: HandlerEvent,
    pub peer: Option<Ipv4Addr>,
    pub opt: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Dispatcher Trait
// ----------------------------------------------------------------------------

/// Caller-supplied handler invoked with `(context, event, peer, opt)`
///
/// Implementations must not panic; a missing handler is simply never called.
pub trait MatchingHandler: Send + Sync {
    fn on_event(&self, id: ContextId, event: HandlerEvent, peer: Option<Ipv4Addr>, opt: &[u8]);
}

/// Dispatch a batch of notices to an optional handler
pub(crate) fn dispatch_all(handler: Option<&Arc<dyn MatchingHandler>>, notices: Vec<HandlerNotice>) {
    let Some(handler) = handler else { return };
    for notice in notices {
        handler.on_event(notice.id, notice.event, notice.peer, &notice.opt);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

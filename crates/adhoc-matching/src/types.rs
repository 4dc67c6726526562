//! Core types for the ad-hoc matching runtime
//!
//! Numeric values of the enums below are wire/ABI values carried over from
//! the console runtime and must not be renumbered.

use core::fmt;

// ----------------------------------------------------------------------------
// Protocol Limits
// ----------------------------------------------------------------------------

/// Upper bound on members of one matching session (including ourselves)
pub const MAX_MEMBERS: usize = 16;

/// Maximum length of the opt blob attached to select/cancel/accept traffic
pub const MAX_OPT_LEN: usize = 9196;

/// Maximum length of one acknowledged data payload
pub const MAX_DATA_LEN: usize = 9204;

/// Maximum length of the opt blob carried by HELLO beacons
pub const MAX_HELLO_OPT_LEN: usize = 1426;

// ----------------------------------------------------------------------------
// Context Identifier
// ----------------------------------------------------------------------------

/// Identifier of one matching context; valid ids are 1..=15
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(i32);

impl ContextId {
    /// Smallest id the registry hands out
    pub const MIN: i32 = 1;

    /// Largest id the registry hands out
    pub const MAX: i32 = (MAX_MEMBERS - 1) as i32;

    pub(crate) fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Get the raw id value
    pub fn value(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Matching Mode
// ----------------------------------------------------------------------------

/// Topology role of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    /// Accepts many children and owns the roster
    Parent = 1,
    /// Pairs with exactly one parent
    Child = 2,
    /// Symmetric negotiation; the lower address owns the roster
    P2p = 3,
}

impl Mode {
    /// Convert from the raw wire/API value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Mode::Parent),
            2 => Some(Mode::Child),
            3 => Some(Mode::P2p),
            _ => None,
        }
    }

    /// Get the raw value
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this mode broadcasts HELLO beacons and owns a hello message
    pub fn sends_hello(self) -> bool {
        matches!(self, Mode::Parent | Mode::P2p)
    }
}

// ----------------------------------------------------------------------------
// Context Status
// ----------------------------------------------------------------------------

/// Lifecycle state of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    NotRunning,
    Stopping,
    Running,
}

// ----------------------------------------------------------------------------
// Target Status
// ----------------------------------------------------------------------------

/// Handshake state of one remote peer as seen by a context
///
/// Ordered: "member-like" checks compare with [`TargetStatus::InProgress`]
/// and better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum TargetStatus {
    /// Initial state, and the resting state after cancel/bye
    Cancelled = 1,
    /// We acknowledged the remote's request; selection not decided yet
    Seen = 2,
    /// Remote accepted our selection; waiting for confirmation
    InProgress = 3,
    /// We accepted the remote's selection; waiting for their confirmation
    InProgress2 = 4,
    /// Full bidirectional membership
    Established = 5,
}

impl TargetStatus {
    /// Whether this peer counts against the session's member limit
    pub fn counts_as_member(self) -> bool {
        self >= TargetStatus::InProgress
    }
}

// ----------------------------------------------------------------------------
// Send Data Status
// ----------------------------------------------------------------------------

/// State of the single-slot acknowledged-data channel of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDataStatus {
    /// No transfer outstanding
    Ready,
    /// A payload is buffered and awaiting DATA_ACK or timeout
    Busy,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

//! Ad-hoc peer matching runtime
//!
//! A reimplementation of the handheld console's matching service: UDP peer
//! discovery on the local link, parent/child and peer-to-peer session
//! negotiation, roster exchange, and a single-slot acknowledged data channel
//! per peer.
//!
//! ## Architecture Overview
//!
//! The unit of everything is a **matching context**, one configured session
//! bound to a UDP port. A registry ([`AdhocMatching`]) owns up to fifteen of
//! them and the single lock their state lives under. While a context runs it
//! drives three worker threads:
//!
//! - the **input loop** blocks in `recv_from`, validates framing and parks
//!   datagrams on their target,
//! - the **event loop** drains the context's pipe and is the only thread
//!   that advances target state machines and answers on the wire,
//! - the **callout worker** fires scheduled timers (hello tick, handshake
//!   retries, keep-alive, data-ack timeouts) back into the pipe.
//!
//! Game-facing calls ([`AdhocMatching::select_target`],
//! [`AdhocMatching::send_data`], ...) mutate context state synchronously
//! under the registry lock and return vendor status codes via
//! [`MatchingError::code`]. Membership changes surface through a
//! caller-supplied [`MatchingHandler`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::net::Ipv4Addr;
//! use adhoc_matching::{
//!     AdhocMatching, CreateParams, Mode, Platform, StartParams,
//! };
//!
//! # fn main() -> Result<(), adhoc_matching::MatchingError> {
//! let matching = AdhocMatching::new(Platform::system());
//! matching.init(0x20000)?;
//!
//! let id = matching.create(CreateParams {
//!     mode: Mode::P2p,
//!     maxnum: 4,
//!     port: 3658,
//!     rxbuf_len: 1024,
//!     hello_interval: 1_000_000,
//!     keep_alive_interval: 1_000_000,
//!     retry_count: 5,
//!     rexmt_interval: 500_000,
//!     handler: None,
//! })?;
//! matching.start(id, StartParams::default(), b"my lobby")?;
//!
//! // ... select peers reported through the handler ...
//! matching.select_target(id, Ipv4Addr::new(10, 0, 0, 2), b"")?;
//!
//! matching.stop(id)?;
//! matching.delete(id)?;
//! matching.term()?;
//! # Ok(())
//! # }
//! ```

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod errors;
pub mod handler;
pub mod platform;
pub mod protocol;
pub mod types;

mod callout;
mod context;
mod events;
mod input;
mod registry;
mod target;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{CreateParams, StartParams};
pub use errors::{MatchingError, Result};
pub use handler::{HandlerEvent, MatchingHandler};
pub use platform::{
    Clock, FixedLocalAddress, LocalAddressProvider, MatchingSocket, MonotonicClock,
    SocketOptions, SocketProvider, SystemLocalAddress, SystemSocketProvider,
};
pub use registry::{AdhocMatching, Platform};
pub use types::{
    ContextId, ContextStatus, Mode, SendDataStatus, TargetStatus, MAX_DATA_LEN,
    MAX_HELLO_OPT_LEN, MAX_MEMBERS, MAX_OPT_LEN,
};

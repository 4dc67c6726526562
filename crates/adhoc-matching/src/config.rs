//! Construction-time parameters of a matching context

use std::sync::Arc;

use crate::errors::{MatchingError, Result};
use crate::handler::MatchingHandler;
use crate::types::{Mode, MAX_MEMBERS};

// ----------------------------------------------------------------------------
// Create Parameters
// ----------------------------------------------------------------------------

/// Arguments of `create`, fixed for the context's lifetime
///
/// Intervals are microseconds, matching the callout clock.
#[derive(Clone)]
pub struct CreateParams {
    pub mode: Mode,
    /// Member limit including ourselves; forced to 2 for children
    pub maxnum: i32,
    pub port: u16,
    /// Receive buffer size; must hold the largest roster plus its header
    pub rxbuf_len: usize,
    pub hello_interval: u32,
    pub keep_alive_interval: u32,
    /// Retry budget armed on handshake, keep-alive and data timers
    pub retry_count: i32,
    pub rexmt_interval: u32,
    pub handler: Option<Arc<dyn MatchingHandler>>,
}

impl CreateParams {
    /// Validate the argument combination the way `create` does
    pub fn validate(&self) -> Result<()> {
        if self.maxnum < 2 || self.maxnum > MAX_MEMBERS as i32 {
            return Err(MatchingError::InvalidMaxnum);
        }
        if self.rxbuf_len < self.maxnum as usize * 4 + 4 {
            return Err(MatchingError::RxbufTooShort);
        }
        if self.mode.sends_hello() && self.hello_interval == 0 {
            return Err(MatchingError::InvalidArg);
        }
        if self.rexmt_interval == 0 || self.retry_count <= 0 {
            return Err(MatchingError::InvalidArg);
        }
        Ok(())
    }

    /// Effective member limit: children only ever pair with their parent
    pub fn effective_maxnum(&self) -> i32 {
        if self.mode == Mode::Child {
            2
        } else {
            self.maxnum
        }
    }
}

// ----------------------------------------------------------------------------
// Start Parameters
// ----------------------------------------------------------------------------

/// Thread placement arguments of `start`
///
/// Priority and affinity are recorded for API fidelity; std threads expose
/// neither, so only the stack size is applied.
#[derive(Debug, Clone, Copy)]
pub struct StartParams {
    pub thread_priority: i32,
    pub thread_stack_size: usize,
    pub cpu_affinity_mask: i32,
}

impl Default for StartParams {
    fn default() -> Self {
        Self {
            thread_priority: 0,
            thread_stack_size: 0,
            cpu_affinity_mask: 0,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

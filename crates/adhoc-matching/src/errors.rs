//! Error types for the ad-hoc matching runtime
//!
//! Every public operation returns one of the vendor status codes games test
//! against; [`MatchingError::code`] yields the numeric value unchanged.

// ----------------------------------------------------------------------------
// Matching Error
// ----------------------------------------------------------------------------

/// Failure of a public matching operation
#[derive(Debug, thiserror::Error)]
pub enum MatchingError {
    #[error("invalid matching mode")]
    InvalidMode,
    #[error("invalid port")]
    InvalidPort,
    #[error("invalid member limit")]
    InvalidMaxnum,
    #[error("receive buffer too short")]
    RxbufTooShort,
    #[error("invalid opt length")]
    InvalidOptlen,
    #[error("invalid argument")]
    InvalidArg,
    #[error("no context with that id")]
    InvalidId,
    #[error("no context id available")]
    IdNotAvail,
    #[error("out of memory")]
    NoSpace,
    #[error("context is running")]
    IsRunning,
    #[error("context is not running")]
    NotRunning,
    #[error("unknown target")]
    UnknownTarget,
    #[error("target is not ready for selection")]
    TargetNotReady,
    #[error("member limit exceeded")]
    ExceedMaxnum,
    #[error("a selection request is already in progress")]
    RequestInProgress,
    #[error("target is already established")]
    AlreadyEstablished,
    #[error("a context is still busy")]
    Busy,
    #[error("already initialized")]
    AlreadyInitialized,
    #[error("not initialized")]
    NotInitialized,
    #[error("port already in use")]
    PortInUse,
    #[error("thread stack size too short")]
    StacksizeTooShort,
    #[error("invalid data length")]
    InvalidDatalen,
    #[error("target is not established")]
    NotEstablished,
    #[error("a data send is already outstanding")]
    DataBusy,
    #[error("invalid alignment")]
    InvalidAlignment,
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl MatchingError {
    /// Vendor status code of this error
    ///
    /// Socket failures have no slot in the vendor table and surface as the
    /// generic failure value.
    pub fn code(&self) -> u32 {
        match self {
            MatchingError::InvalidMode => 0x8041_3101,
            MatchingError::InvalidPort => 0x8041_3102,
            MatchingError::InvalidMaxnum => 0x8041_3103,
            MatchingError::RxbufTooShort => 0x8041_3104,
            MatchingError::InvalidOptlen => 0x8041_3105,
            MatchingError::InvalidArg => 0x8041_3106,
            MatchingError::InvalidId => 0x8041_3107,
            MatchingError::IdNotAvail => 0x8041_3108,
            MatchingError::NoSpace => 0x8041_3109,
            MatchingError::IsRunning => 0x8041_310a,
            MatchingError::NotRunning => 0x8041_310b,
            MatchingError::UnknownTarget => 0x8041_310c,
            MatchingError::TargetNotReady => 0x8041_310d,
            MatchingError::ExceedMaxnum => 0x8041_310e,
            MatchingError::RequestInProgress => 0x8041_310f,
            MatchingError::AlreadyEstablished => 0x8041_3110,
            MatchingError::Busy => 0x8041_3111,
            MatchingError::AlreadyInitialized => 0x8041_3112,
            MatchingError::NotInitialized => 0x8041_3113,
            MatchingError::PortInUse => 0x8041_3114,
            MatchingError::StacksizeTooShort => 0x8041_3115,
            MatchingError::InvalidDatalen => 0x8041_3116,
            MatchingError::NotEstablished => 0x8041_3117,
            MatchingError::DataBusy => 0x8041_3118,
            MatchingError::InvalidAlignment => 0x8041_3119,
            MatchingError::Io(_) => 0xffff_ffff,
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, MatchingError>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

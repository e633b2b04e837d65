use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Failures surfaced by the engine's control surface.
///
/// Only `Bind` and the lookup/validation variants ever reach API callers.
/// Transmit and persistence failures are logged where they happen and the
/// engine keeps running.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The sACN source could not bind to the requested address.
    #[error("failed to bind sACN source on {address}: {reason}")]
    Bind { address: String, reason: String },

    /// A universe could not be registered or a packet could not be sent.
    #[error("transmit error on universe {universe}: {reason}")]
    Transmit { universe: u16, reason: String },

    #[error("persistence error: {0}")]
    Persistence(String),

    /// The persisted document could not be understood.
    #[error("malformed restore record: {0}")]
    MalformedRecord(String),

    #[error("strip {0} not found")]
    StripNotFound(u64),

    #[error("mask {0} not found")]
    MaskNotFound(u64),

    #[error("unknown mask type '{0}'")]
    UnknownMaskType(String),

    #[error("invalid mask parameters: {0}")]
    InvalidParams(String),

    #[error("invalid strip: {0}")]
    InvalidStrip(String),
}

impl EngineError {
    pub fn bind(address: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Bind {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transmit(universe: u16, reason: impl std::fmt::Display) -> Self {
        Self::Transmit {
            universe,
            reason: reason.to_string(),
        }
    }

    /// Flattens an `anyhow` chain into a persistence error.
    pub fn persistence(err: &anyhow::Error) -> Self {
        Self::Persistence(format!("{:#}", err))
    }
}

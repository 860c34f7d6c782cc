use thiserror::Error;

/// Errors raised by the simulator core.
///
/// Running into a HALT or undoing with an empty history are not errors; those
/// are reported through ordinary return values.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("address {0} is outside memory (0-99)")]
    InvalidAddress(usize),
    #[error("value {value} does not fit a 4-digit cell at @{addr:02}")]
    InvalidValue { addr: usize, value: u32 },
    #[error("program counter {0} is outside memory (0-99)")]
    InvalidProgramCounter(u32),
    #[error("@{0:02} is a derived register and cannot be edited directly")]
    DerivedRegister(usize),
    #[error("@00 (HALT) is constant 0, got {0}")]
    HaltNotZero(u32),
    #[error("memory image has {0} cells, expected 100")]
    InvalidImageLength(usize),
    #[error("run loop thread panicked")]
    RunLoopPanicked,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors raised by a [`crate::storage::StoragePort`] adapter.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid image name '{0}'")]
    InvalidName(String),
    #[error("unsupported image version {0}")]
    UnsupportedVersion(u32),
}

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the ingest core.
///
/// Per-board and per-channel failures never cross thread boundaries: a
/// receiver or sender thread converts them into local termination plus an
/// end-of-run statistics report. Only `SettingsMismatch` and `AttachTimeout`
/// are fatal to a whole process, and both can only occur during startup.
#[derive(Error, Debug)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("stored buffer settings do not match the locally computed settings")]
    SettingsMismatch,

    #[error("shared memory region {key:?} did not appear within {timeout_ms} ms")]
    AttachTimeout { key: String, timeout_ms: u64 },

    #[error("shared memory error: {0}")]
    Shm(std::io::Error),

    #[error("channel {channel} received step {got}, expected step {expected}")]
    StepOrder {
        channel: usize,
        got: usize,
        expected: usize,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Persistence failed; nothing from the failing item was committed.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
    #[error("progress percent {0} is outside 0..=100")]
    InvalidProgress(f64),
    #[error("reading threshold {reading} is above finished threshold {finished}")]
    InvalidThresholds { reading: f64, finished: f64 },
    #[error("unknown or revoked token")]
    UnknownToken,
}

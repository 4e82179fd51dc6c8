use thiserror::Error;

/// Failure classes surfaced by the tracker.
///
/// Only `ConfigMissing` and `StreamFatal` terminate anything; every other
/// failure (store, RPC, decode, sampler) is recovered where it happens and
/// shows up as log output. Per-event errors never block subsequent events.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("missing configuration: {0}")]
    ConfigMissing(&'static str),

    #[error("stream error (will retry): {0}")]
    StreamTransient(String),

    #[error("stream failed permanently: {0}")]
    StreamFatal(String),
}

/// Error taxonomy for the transfer engine.
///
/// Every variant here corresponds to one of the six error classes the
/// protocol distinguishes: a single failed send, a malformed inbound
/// message, a verification failure after full receipt, exhausted
/// per-piece retries, an idle timeout, or a local I/O fault. Errors are
/// absorbed locally by the state machines -- the only externally
/// visible signal is a transfer's terminal state plus log records --
/// but the typed enum lets internal code use `?` instead of stringly
/// typed failures.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transport send to {peer} failed: {source}")]
    Transport {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid message from {peer}: {reason}")]
    InvalidMessage { peer: String, reason: String },

    #[error("integrity verification failed for transfer from {peer}: {reason}")]
    IntegrityFailure { peer: String, reason: String },

    #[error("piece {index} for {peer} exceeded max_retries ({max_retries})")]
    RetryExhausted {
        peer: String,
        index: u32,
        max_retries: u16,
    },

    #[error("transfer with {peer} timed out after {idle_secs}s of inactivity")]
    Timeout { peer: String, idle_secs: u64 },

    #[error("local I/O error during transfer with {peer}: {source}")]
    LocalIo {
        peer: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, TransferError>;

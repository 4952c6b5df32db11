/// Every tunable knob the engine exposes, collected into one
/// `serde`-deserializable struct so a caller can load it from
/// TOML/JSON/env rather than the crate hardcoding a config format.
/// Defaults match the documented protocol knobs.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Piece size in bytes, chosen to fit the mesh MTU.
    pub piece_size: u32,
    /// Inter-send sleep at the sender, in seconds.
    pub initial_delay: f64,
    /// Upper bound on `initial_delay` after backoff.
    pub max_delay: f64,
    /// Multiplier applied to `current_delay` on sustained loss.
    pub backoff_factor: f64,
    /// Consecutive lossy `ResumeRequest`s before the pacing controller backs off.
    pub retry_threshold: u32,
    /// Per-piece retransmission attempts before a transfer is abandoned.
    pub max_retries: u16,
    /// Receiver's periodic resume-request cadence, in seconds.
    pub request_interval_secs: u64,
    /// Send-side abandonment window with no observed `ResumeRequest`, in seconds.
    pub send_idle_timeout_secs: u64,
    /// Receive-side abandonment window with no progress, in seconds.
    pub receive_idle_timeout_secs: u64,
    /// Consecutive send failures for one index before a transfer fails.
    pub max_send_errors: u32,
    /// Maximum sanitized filename length.
    pub max_filename_len: usize,
    /// Budget, in bytes, for one encoded `ResumeRequest` -- bounds how many
    /// missing indices are requested per message before the rest waits for
    /// the next tick.
    pub resume_request_mtu: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            piece_size: 200,
            initial_delay: 1.0,
            max_delay: 30.0,
            backoff_factor: 1.5,
            retry_threshold: 3,
            max_retries: 10,
            request_interval_secs: 10,
            send_idle_timeout_secs: 300,
            receive_idle_timeout_secs: 300,
            max_send_errors: 5,
            max_filename_len: 255,
            resume_request_mtu: 1024,
        }
    }
}

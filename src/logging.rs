/// Structured logging for transfer lifecycle events.
///
/// A closed `TransferEvent` enum feeds a `TransferLogger` trait with
/// `tracing`-backed and no-op implementations. Lifecycle events (start,
/// complete, fail, verification outcome) log at `info`; per-piece churn
/// logs at `debug`; dropped/invalid frames log at `warn`.
use std::fmt;

#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub peer: String,
    pub event: TransferEvent,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    TransferStarted {
        filename: String,
        num_pieces: u32,
    },
    PieceSent {
        index: u32,
    },
    PieceReceived {
        index: u32,
    },
    PieceRejected {
        index: u32,
        reason: String,
    },
    ResumeRequestSent {
        missing_count: usize,
        acknowledged_count: usize,
    },
    ResumeRequestHandled {
        missing_count: usize,
    },
    PacingBackoff {
        old_delay: f64,
        new_delay: f64,
    },
    VerificationFailed {
        reason: String,
    },
    TransferComplete {
        total_bytes: u64,
    },
    TransferFailed {
        reason: String,
    },
    InvalidMessageDropped {
        reason: String,
    },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransferStarted { filename, num_pieces } => {
                write!(f, "transfer_started filename={filename} pieces={num_pieces}")
            }
            Self::PieceSent { index } => write!(f, "piece_sent index={index}"),
            Self::PieceReceived { index } => write!(f, "piece_received index={index}"),
            Self::PieceRejected { index, reason } => {
                write!(f, "piece_rejected index={index} reason={reason}")
            }
            Self::ResumeRequestSent { missing_count, acknowledged_count } => write!(
                f,
                "resume_request_sent missing={missing_count} acknowledged={acknowledged_count}"
            ),
            Self::ResumeRequestHandled { missing_count } => {
                write!(f, "resume_request_handled missing={missing_count}")
            }
            Self::PacingBackoff { old_delay, new_delay } => {
                write!(f, "pacing_backoff old={old_delay:.2}s new={new_delay:.2}s")
            }
            Self::VerificationFailed { reason } => write!(f, "verification_failed reason={reason}"),
            Self::TransferComplete { total_bytes } => {
                write!(f, "transfer_complete bytes={total_bytes}")
            }
            Self::TransferFailed { reason } => write!(f, "transfer_failed reason={reason}"),
            Self::InvalidMessageDropped { reason } => {
                write!(f, "invalid_message_dropped reason={reason}")
            }
        }
    }
}

pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that emits through `tracing`, with per-event level chosen by
/// traffic volume: lifecycle events at `info`, per-piece/per-request
/// churn at `debug`, drops at `warn`.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        match &entry.event {
            TransferEvent::TransferStarted { .. }
            | TransferEvent::TransferComplete { .. }
            | TransferEvent::TransferFailed { .. }
            | TransferEvent::VerificationFailed { .. }
            | TransferEvent::PacingBackoff { .. } => {
                tracing::info!(component = entry.component, peer = %entry.peer, "{}", entry.event);
            }
            TransferEvent::PieceRejected { .. } | TransferEvent::InvalidMessageDropped { .. } => {
                tracing::warn!(component = entry.component, peer = %entry.peer, "{}", entry.event);
            }
            _ => {
                tracing::debug!(component = entry.component, peer = %entry.peer, "{}", entry.event);
            }
        }
    }
}

/// Discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}

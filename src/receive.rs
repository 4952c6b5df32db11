/// Receive-side transfer state machine and per-peer registry.
///
/// Mirrors the lock discipline in `send.rs`: a handler acquires the
/// engine's coarse-grained lock, mutates state, stages any outbound
/// `ResumeRequest` into a local value, releases the lock, then performs
/// transport I/O. There is no dedicated worker thread on this side --
/// everything is driven synchronously by `handle_file_start`,
/// `handle_piece_data`, and `tick`.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::EngineConfig;
use crate::hash::{merkle_root, piece_hash};
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::piece_store::{PieceStore, PutOutcome};
use crate::protocol::{self, AkitaMessage, FileStart, PieceData, ResumeRequest};
use crate::sanitize::sanitize_filename;
use crate::sink::FileSink;
use crate::transport::{Transport, AKITA_CONTENT_TYPE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    AwaitStart,
    Receiving,
    Verifying,
    Complete,
    Failed,
}

struct ReceiveTransferState {
    filename: String,
    piece_size: u32,
    total_size: u32,
    num_pieces: u32,
    expected_hashes: Vec<String>,
    merkle_root: Option<String>,
    store: PieceStore,
    per_piece_retry: HashMap<u32, u16>,
    is_broadcast: bool,
    last_request_sent: Option<Instant>,
    last_piece_received: Instant,
    status: ReceiveStatus,
    failure_reason: Option<String>,
}

impl ReceiveTransferState {
    fn is_terminal(&self) -> bool {
        matches!(self.status, ReceiveStatus::Complete | ReceiveStatus::Failed)
    }

    fn matches_file_start(&self, fs: &FileStart, sanitized: &str) -> bool {
        self.filename == sanitized
            && self.total_size == fs.total_size
            && self.piece_size == fs.piece_size
            && self.expected_hashes == fs.piece_hashes
            && self.merkle_root == fs.merkle_root
    }
}

/// Per-peer receive-side engine: owns the registry of active inbound
/// transfers and hands completed files to a `FileSink`.
pub struct ReceiveEngine {
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    logger: Arc<dyn TransferLogger>,
    sink: Arc<dyn FileSink>,
    registry: Mutex<HashMap<String, ReceiveTransferState>>,
}

impl ReceiveEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: EngineConfig,
        logger: Arc<dyn TransferLogger>,
        sink: Arc<dyn FileSink>,
    ) -> Self {
        Self {
            transport,
            config,
            logger,
            sink,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Validate and (re)allocate receive state for an inbound `FileStart`.
    /// An identical `FileStart` for an existing transfer is a no-op; a
    /// differing one resets the transfer.
    pub fn handle_file_start(&self, peer: &str, fs: FileStart, is_broadcast: bool) {
        let Some(sanitized) = sanitize_filename(&fs.filename, self.config.max_filename_len) else {
            self.logger.log(TransferLog {
                component: "receive",
                peer: peer.to_string(),
                event: TransferEvent::InvalidMessageDropped {
                    reason: format!("unusable filename {:?}", fs.filename),
                },
            });
            return;
        };

        if fs.total_size > 0 && fs.piece_size == 0 {
            self.drop_invalid(peer, "piece_size == 0 with non-empty total_size");
            return;
        }

        let num_pieces = protocol::num_pieces(fs.total_size, fs.piece_size);
        if !fs.piece_hashes.is_empty() && fs.piece_hashes.len() as u32 != num_pieces {
            self.drop_invalid(peer, "piece_hashes length does not match num_pieces");
            return;
        }

        let mut registry = self.registry.lock().unwrap();

        if let Some(existing) = registry.get(peer) {
            if existing.matches_file_start(&fs, &sanitized) && !existing.is_terminal() {
                return; // idempotent no-op
            }
        }

        let state = ReceiveTransferState {
            filename: sanitized,
            piece_size: fs.piece_size,
            total_size: fs.total_size,
            num_pieces,
            expected_hashes: fs.piece_hashes,
            merkle_root: fs.merkle_root,
            store: PieceStore::new(num_pieces),
            per_piece_retry: HashMap::new(),
            is_broadcast,
            last_request_sent: None,
            last_piece_received: Instant::now(),
            status: if num_pieces == 0 {
                ReceiveStatus::Verifying
            } else {
                ReceiveStatus::Receiving
            },
            failure_reason: None,
        };

        self.logger.log(TransferLog {
            component: "receive",
            peer: peer.to_string(),
            event: TransferEvent::TransferStarted {
                filename: state.filename.clone(),
                num_pieces,
            },
        });

        registry.insert(peer.to_string(), state);

        // Immediate resume request, staged under the lock and
        // sent after release.
        let immediate_resume = if num_pieces > 0 {
            registry.get_mut(peer).and_then(|st| self.stage_resume_request(peer, st))
        } else {
            None
        };

        let attempted_verification = registry
            .get(peer)
            .is_some_and(|st| st.status == ReceiveStatus::Verifying);
        let sink_job = if attempted_verification {
            registry.get_mut(peer).and_then(|st| self.run_verification(peer, st))
        } else {
            None
        };

        // Verification failure is one of the documented resume-request
        // emission triggers; stage one immediately rather than waiting
        // for the next periodic tick.
        let failure_resume = if attempted_verification && sink_job.is_none() {
            registry.get_mut(peer).and_then(|st| self.stage_resume_request(peer, st))
        } else {
            None
        };
        drop(registry);

        if let Some(msg) = immediate_resume {
            self.send_message(peer, &msg);
        }
        if let Some(msg) = failure_resume {
            self.send_message(peer, &msg);
        }
        if let Some((filename, bytes)) = sink_job {
            self.finish(peer, &filename, bytes);
        }
    }

    /// Store an inbound piece, updating `missing` and triggering
    /// verification once the set empties.
    pub fn handle_piece_data(&self, peer: &str, piece: PieceData, _is_broadcast: bool) {
        let mut registry = self.registry.lock().unwrap();
        let Some(st) = registry.get_mut(peer) else {
            self.logger.log(TransferLog {
                component: "receive",
                peer: peer.to_string(),
                event: TransferEvent::InvalidMessageDropped {
                    reason: "PieceData for unknown receive transfer".into(),
                },
            });
            return;
        };

        if st.is_terminal() {
            return;
        }

        if piece.piece_index >= st.num_pieces {
            self.logger.log(TransferLog {
                component: "receive",
                peer: peer.to_string(),
                event: TransferEvent::PieceRejected {
                    index: piece.piece_index,
                    reason: "index out of range".into(),
                },
            });
            return;
        }

        if st.store.has(piece.piece_index) {
            return; // duplicate, silently discarded
        }

        if let Some(expected) = st.expected_hashes.get(piece.piece_index as usize) {
            let actual = piece_hash(&piece.data);
            if &actual != expected {
                self.logger.log(TransferLog {
                    component: "receive",
                    peer: peer.to_string(),
                    event: TransferEvent::PieceRejected {
                        index: piece.piece_index,
                        reason: "hash mismatch".into(),
                    },
                });
                return;
            }
        }

        match st.store.put(piece.piece_index, piece.data) {
            PutOutcome::Stored => {
                st.last_piece_received = Instant::now();
                self.logger.log(TransferLog {
                    component: "receive",
                    peer: peer.to_string(),
                    event: TransferEvent::PieceReceived {
                        index: piece.piece_index,
                    },
                });
            }
            PutOutcome::DuplicateSame => {}
            PutOutcome::DuplicateMismatch => {
                self.logger.log(TransferLog {
                    component: "receive",
                    peer: peer.to_string(),
                    event: TransferEvent::PieceRejected {
                        index: piece.piece_index,
                        reason: "differs from already-stored payload".into(),
                    },
                });
                return;
            }
        }

        let attempted_verification = st.store.missing().is_empty();
        let sink_job = if attempted_verification {
            st.status = ReceiveStatus::Verifying;
            self.run_verification(peer, st)
        } else {
            None
        };

        // Verification failure is one of the documented resume-request
        // emission triggers; stage one immediately rather than waiting
        // for the next periodic tick.
        let failure_resume = if attempted_verification && sink_job.is_none() {
            self.stage_resume_request(peer, st)
        } else {
            None
        };

        drop(registry);

        if let Some(msg) = failure_resume {
            self.send_message(peer, &msg);
        }
        if let Some((filename, bytes)) = sink_job {
            self.finish(peer, &filename, bytes);
        }
    }

    /// Re-verify (on Merkle mismatch reset), time out idle transfers, and
    /// emit periodic resume requests. Idempotent under repeated calls.
    pub fn tick(&self, now: Instant) {
        let mut registry = self.registry.lock().unwrap();
        let idle_timeout = std::time::Duration::from_secs(self.config.receive_idle_timeout_secs);
        let request_interval = std::time::Duration::from_secs(self.config.request_interval_secs);

        let mut outbound = Vec::new();
        let mut to_remove = Vec::new();

        for (peer, st) in registry.iter_mut() {
            if st.is_terminal() {
                to_remove.push(peer.clone());
                continue;
            }

            if now.duration_since(st.last_piece_received) >= idle_timeout
                && st.store.missing().len() as u32 != 0
            {
                st.status = ReceiveStatus::Failed;
                st.failure_reason = Some("receive_idle_timeout".into());
                self.logger.log(TransferLog {
                    component: "receive",
                    peer: peer.clone(),
                    event: TransferEvent::TransferFailed {
                        reason: "receive_idle_timeout".into(),
                    },
                });
                to_remove.push(peer.clone());
                continue;
            }

            if st.is_broadcast {
                continue;
            }

            let due = st
                .last_request_sent
                .is_none_or(|last| now.duration_since(last) >= request_interval);

            if due && !st.store.missing().is_empty() {
                if let Some(msg) = self.stage_resume_request(peer, st) {
                    outbound.push((peer.clone(), msg));
                }
                if st.status == ReceiveStatus::Failed {
                    to_remove.push(peer.clone());
                }
            }
        }

        for peer in &to_remove {
            registry.remove(peer);
        }
        drop(registry);

        for (peer, msg) in outbound {
            self.send_message(&peer, &msg);
        }
    }

    pub fn status(&self, peer: &str) -> Option<ReceiveStatus> {
        self.registry.lock().unwrap().get(peer).map(|st| st.status)
    }

    fn drop_invalid(&self, peer: &str, reason: &str) {
        self.logger.log(TransferLog {
            component: "receive",
            peer: peer.to_string(),
            event: TransferEvent::InvalidMessageDropped {
                reason: reason.to_string(),
            },
        });
    }

    /// Build a `ResumeRequest` for `st`, bump `last_request_sent` and
    /// per-piece retry counters, and fail the transfer if any index
    /// exceeds `max_retries`. Truncates the missing list to fit
    /// `resume_request_mtu` if necessary. Returns `None` when
    /// broadcast (caller should not call this for broadcast transfers).
    fn stage_resume_request(&self, peer: &str, st: &mut ReceiveTransferState) -> Option<AkitaMessage> {
        if st.is_broadcast {
            return None;
        }

        let mut missing = st.store.missing();
        missing.sort_unstable();

        for &idx in &missing {
            let count = st.per_piece_retry.entry(idx).or_insert(0);
            *count += 1;
            if *count > self.config.max_retries {
                st.status = ReceiveStatus::Failed;
                st.failure_reason = Some(format!("piece {idx} exceeded max_retries"));
                self.logger.log(TransferLog {
                    component: "receive",
                    peer: peer.to_string(),
                    event: TransferEvent::TransferFailed {
                        reason: format!("piece {idx} exceeded max_retries"),
                    },
                });
                return None;
            }
        }

        let acknowledged: Vec<u32> = st.store.iter_ordered().map(|(i, _)| i).collect();
        let missing = truncate_to_mtu(missing, self.config.resume_request_mtu);

        st.last_request_sent = Some(Instant::now());

        self.logger.log(TransferLog {
            component: "receive",
            peer: peer.to_string(),
            event: TransferEvent::ResumeRequestSent {
                missing_count: missing.len(),
                acknowledged_count: acknowledged.len(),
            },
        });

        Some(AkitaMessage::ResumeRequest(ResumeRequest {
            missing_indices: missing,
            acknowledged_indices: acknowledged,
        }))
    }

    /// Run the VERIFYING-state logic. Returns `Some((filename,
    /// bytes))` when verification passes and the file should be handed
    /// to the sink; leaves `st` in RECEIVING (with `missing` repopulated)
    /// on failure, or Failed if the caller already staged that.
    fn run_verification(&self, peer: &str, st: &mut ReceiveTransferState) -> Option<(String, Vec<u8>)> {
        if let Some(expected_root) = &st.merkle_root {
            let hashes = if !st.expected_hashes.is_empty() {
                st.expected_hashes.clone()
            } else {
                st.store
                    .iter_ordered()
                    .map(|(_, data)| piece_hash(data))
                    .collect()
            };

            let computed = if hashes.is_empty() {
                None
            } else {
                merkle_root(&hashes).ok()
            };

            if computed.as_deref() != Some(expected_root.as_str()) {
                self.logger.log(TransferLog {
                    component: "receive",
                    peer: peer.to_string(),
                    event: TransferEvent::VerificationFailed {
                        reason: "merkle root mismatch".into(),
                    },
                });
                st.store.clear();
                st.status = ReceiveStatus::Receiving;
                return None;
            }
        } else if !st.expected_hashes.is_empty() {
            let mismatched: Vec<u32> = st
                .store
                .iter_ordered()
                .filter(|(i, data)| {
                    st.expected_hashes
                        .get(*i as usize)
                        .is_some_and(|expected| &piece_hash(data) != expected)
                })
                .map(|(i, _)| i)
                .collect();

            if !mismatched.is_empty() {
                self.logger.log(TransferLog {
                    component: "receive",
                    peer: peer.to_string(),
                    event: TransferEvent::VerificationFailed {
                        reason: format!("{} piece(s) failed hash check", mismatched.len()),
                    },
                });
                for idx in mismatched {
                    st.store.remove(idx);
                }
                st.status = ReceiveStatus::Receiving;
                return None;
            }
        }

        let bytes = st.store.assemble();
        let filename = st.filename.clone();
        st.status = ReceiveStatus::Complete;

        self.logger.log(TransferLog {
            component: "receive",
            peer: peer.to_string(),
            event: TransferEvent::TransferComplete {
                total_bytes: bytes.len() as u64,
            },
        });

        Some((filename, bytes))
    }

    fn finish(&self, peer: &str, filename: &str, bytes: Vec<u8>) {
        if let Err(e) = self.sink.save(filename, &bytes) {
            self.logger.log(TransferLog {
                component: "receive",
                peer: peer.to_string(),
                event: TransferEvent::TransferFailed {
                    reason: format!("save failed: {e}"),
                },
            });
        }
        self.registry.lock().unwrap().remove(peer);
    }

    fn send_message(&self, peer: &str, msg: &AkitaMessage) {
        let Ok(bytes) = protocol::encode_message(msg) else {
            return;
        };
        if let Err(e) = self.transport.send(peer, &bytes, AKITA_CONTENT_TYPE) {
            self.logger.log(TransferLog {
                component: "receive",
                peer: peer.to_string(),
                event: TransferEvent::InvalidMessageDropped {
                    reason: format!("resume request send failed: {e}"),
                },
            });
        }
    }
}

/// Truncate `missing` (already sorted ascending) to a prefix whose
/// bincode encoding of a `ResumeRequest` (with no acknowledged indices,
/// the cheapest possible companion payload) fits within `mtu` bytes.
/// The remainder waits for the next tick.
fn truncate_to_mtu(missing: Vec<u32>, mtu: usize) -> Vec<u32> {
    let mut prefix = missing;
    loop {
        let probe = ResumeRequest {
            missing_indices: prefix.clone(),
            acknowledged_indices: Vec::new(),
        };
        let encoded_len = protocol::encode_message(&AkitaMessage::ResumeRequest(probe))
            .map(|b| b.len())
            .unwrap_or(usize::MAX);
        if encoded_len <= mtu || prefix.is_empty() {
            return prefix;
        }
        prefix.pop();
    }
}

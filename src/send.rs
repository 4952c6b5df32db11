/// Send-side transfer state machine and per-peer registry.
///
/// One streaming-and-pacing worker thread drives each transfer's
/// initial sweep and retransmissions. The coarse-grained lock
/// discipline -- mutate state under the lock, compute outbound
/// messages, release, then do transport I/O -- avoids the deadlock
/// class where a transport callback reenters the engine while a lock
/// is held.
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::error::{Result, TransferError};
use crate::hash::{merkle_root, piece_hash};
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::pacing::PacingController;
use crate::protocol::{self, AkitaMessage, FileStart, PieceData, ResumeRequest};
use crate::transport::{Transport, AKITA_CONTENT_TYPE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    InProgress,
    Complete,
    Failed,
}

struct SendTransferState {
    file_path: PathBuf,
    filename: String,
    piece_size: u32,
    total_size: u32,
    num_pieces: u32,
    piece_hashes: Vec<String>,
    merkle_root: Option<String>,
    acknowledged: HashSet<u32>,
    /// Indices a `ResumeRequest` asked to have resent; the worker drains
    /// this ahead of its initial sweep.
    pending_retransmit: BTreeSet<u32>,
    pacing: PacingController,
    send_error_counts: HashMap<u32, u32>,
    status: SendStatus,
    last_activity: Instant,
    failure_reason: Option<String>,
}

impl SendTransferState {
    fn is_terminal(&self) -> bool {
        matches!(self.status, SendStatus::Complete | SendStatus::Failed)
    }
}

struct SendTransferHandle {
    state: Mutex<SendTransferState>,
    cancelled: AtomicBool,
}

/// Per-peer send-side engine: owns the registry of active outbound
/// transfers and the worker thread driving each one.
pub struct SendEngine {
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    logger: Arc<dyn TransferLogger>,
    registry: Mutex<HashMap<String, Arc<SendTransferHandle>>>,
}

impl SendEngine {
    pub fn new(transport: Arc<dyn Transport>, config: EngineConfig, logger: Arc<dyn TransferLogger>) -> Self {
        Self {
            transport,
            config,
            logger,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Open `path`, hash it piece-by-piece, send `FileStart`, and spawn
    /// the streaming worker. Returns `Ok(false)` (without side effects
    /// beyond logging) when the file cannot be opened or `piece_size==0`
    /// with a non-empty file.
    pub fn start_transfer(
        &self,
        peer: &str,
        path: impl AsRef<Path>,
        piece_size: u32,
        use_merkle: bool,
    ) -> Result<bool> {
        let path = path.as_ref();
        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                self.logger.log(TransferLog {
                    component: "send",
                    peer: peer.to_string(),
                    event: TransferEvent::TransferFailed {
                        reason: format!("cannot open {}: {e}", path.display()),
                    },
                });
                return Ok(false);
            }
        };

        let total_size = match u32::try_from(metadata.len()) {
            Ok(v) => v,
            Err(_) => {
                self.logger.log(TransferLog {
                    component: "send",
                    peer: peer.to_string(),
                    event: TransferEvent::TransferFailed {
                        reason: "file too large for a 32-bit total_size".into(),
                    },
                });
                return Ok(false);
            }
        };

        if piece_size == 0 && total_size > 0 {
            return Ok(false);
        }

        let num_pieces = protocol::num_pieces(total_size, piece_size);
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());

        let piece_hashes = hash_pieces(path, total_size, piece_size)?;
        let merkle = if use_merkle && !piece_hashes.is_empty() {
            Some(merkle_root(&piece_hashes)?)
        } else {
            None
        };

        let file_start = FileStart {
            filename: filename.clone(),
            total_size,
            piece_size,
            merkle_root: merkle.clone(),
            piece_hashes: piece_hashes.clone(),
        };

        let state = SendTransferState {
            file_path: path.to_path_buf(),
            filename,
            piece_size,
            total_size,
            num_pieces,
            piece_hashes,
            merkle_root: merkle,
            acknowledged: HashSet::new(),
            pending_retransmit: BTreeSet::new(),
            pacing: PacingController::new(&self.config),
            send_error_counts: HashMap::new(),
            status: if num_pieces == 0 {
                SendStatus::Complete
            } else {
                SendStatus::InProgress
            },
            last_activity: Instant::now(),
            failure_reason: None,
        };

        let handle = Arc::new(SendTransferHandle {
            state: Mutex::new(state),
            cancelled: AtomicBool::new(false),
        });

        // Register the transfer before the FileStart goes out. On an
        // in-process/synchronous transport, the receiver's immediate
        // ResumeRequest reply can arrive before this call returns; the
        // registry entry must already exist or it is dropped as
        // "ResumeRequest for unknown send transfer".
        self.registry
            .lock()
            .unwrap()
            .insert(peer.to_string(), handle.clone());

        if let Err(e) = self.send_message(peer, &AkitaMessage::FileStart(file_start)) {
            self.registry.lock().unwrap().remove(peer);
            return Err(e);
        }

        self.logger.log(TransferLog {
            component: "send",
            peer: peer.to_string(),
            event: TransferEvent::TransferStarted {
                filename: handle.state.lock().unwrap().filename.clone(),
                num_pieces,
            },
        });

        if num_pieces > 0 {
            self.spawn_worker(peer.to_string(), handle);
        }

        Ok(true)
    }

    fn spawn_worker(&self, peer: String, handle: Arc<SendTransferHandle>) {
        let transport = self.transport.clone();
        let logger = self.logger.clone();
        let config = self.config.clone();

        std::thread::spawn(move || {
            let file_path = handle.state.lock().unwrap().file_path.clone();
            let mut file = match File::open(&file_path) {
                Ok(f) => f,
                Err(e) => {
                    fail(&handle, &logger, &peer, format!("cannot reopen file for streaming: {e}"));
                    return;
                }
            };

            let mut next_initial = 0u32;
            loop {
                if handle.cancelled.load(Ordering::Relaxed) {
                    let mut st = handle.state.lock().unwrap();
                    if !st.is_terminal() {
                        st.status = SendStatus::Failed;
                        st.failure_reason = Some("cancelled".into());
                    }
                    return;
                }

                let (done, next_index) = {
                    let st = handle.state.lock().unwrap();
                    if st.is_terminal() {
                        (true, None)
                    } else if let Some(&idx) = st.pending_retransmit.iter().next() {
                        (false, Some(idx))
                    } else if next_initial < st.num_pieces {
                        (false, Some(next_initial))
                    } else {
                        (false, None)
                    }
                };

                if done {
                    return;
                }

                let Some(index) = next_index else {
                    // Nothing to send right now; idle briefly and let
                    // tick() detect completion or timeout.
                    std::thread::sleep(Duration::from_millis(200));
                    continue;
                };

                let is_retransmit = {
                    let st = handle.state.lock().unwrap();
                    st.pending_retransmit.contains(&index)
                };

                let (piece_size, total_size) = {
                    let st = handle.state.lock().unwrap();
                    (st.piece_size, st.total_size)
                };

                let data = match read_piece(&mut file, index, piece_size, total_size) {
                    Ok(d) => d,
                    Err(e) => {
                        fail(&handle, &logger, &peer, format!("read error at piece {index}: {e}"));
                        return;
                    }
                };

                let msg = AkitaMessage::PieceData(PieceData { piece_index: index, data });
                let send_result = encode_and_send(transport.as_ref(), &peer, &msg);

                {
                    let mut st = handle.state.lock().unwrap();
                    match send_result {
                        Ok(()) => {
                            st.send_error_counts.insert(index, 0);
                            st.last_activity = Instant::now();
                            if is_retransmit {
                                st.pending_retransmit.remove(&index);
                            } else if index == next_initial {
                                next_initial += 1;
                            }
                            logger.log(TransferLog {
                                component: "send",
                                peer: peer.clone(),
                                event: TransferEvent::PieceSent { index },
                            });
                        }
                        Err(_) => {
                            let count = st.send_error_counts.entry(index).or_insert(0);
                            *count += 1;
                            if *count > config.max_send_errors {
                                st.status = SendStatus::Failed;
                                st.failure_reason =
                                    Some(format!("piece {index} exceeded max_send_errors"));
                                drop(st);
                                logger.log(TransferLog {
                                    component: "send",
                                    peer: peer.clone(),
                                    event: TransferEvent::TransferFailed {
                                        reason: format!("piece {index} exceeded max_send_errors"),
                                    },
                                });
                                return;
                            }
                        }
                    }
                }

                let delay = handle.state.lock().unwrap().pacing.current_delay();
                std::thread::sleep(Duration::from_secs_f64(delay));
            }
        });
    }

    /// Apply an inbound `ResumeRequest` and pace the sender accordingly.
    pub fn handle_resume_request(&self, peer: &str, req: ResumeRequest) {
        let registry = self.registry.lock().unwrap();
        let Some(handle) = registry.get(peer) else {
            self.logger.log(TransferLog {
                component: "send",
                peer: peer.to_string(),
                event: TransferEvent::InvalidMessageDropped {
                    reason: "ResumeRequest for unknown send transfer".into(),
                },
            });
            return;
        };
        let handle = handle.clone();
        drop(registry);

        let mut st = handle.state.lock().unwrap();
        if st.is_terminal() {
            return;
        }

        st.acknowledged.extend(req.acknowledged_indices.iter().copied());

        // Ignore out-of-range indices rather than erroring.
        let num_pieces = st.num_pieces;
        let valid_missing: Vec<u32> = req
            .missing_indices
            .iter()
            .copied()
            .filter(|i| *i < num_pieces)
            .collect();

        let missing_is_empty = req.missing_indices.is_empty();
        if missing_is_empty && st.acknowledged.len() as u32 == num_pieces {
            st.status = SendStatus::Complete;
        } else if !valid_missing.is_empty() {
            st.pending_retransmit.extend(valid_missing);
        }

        let backoff = st.pacing.on_resume_request(missing_is_empty);
        st.last_activity = Instant::now();
        drop(st);

        self.logger.log(TransferLog {
            component: "send",
            peer: peer.to_string(),
            event: TransferEvent::ResumeRequestHandled {
                missing_count: req.missing_indices.len(),
            },
        });

        if let Some((old_delay, new_delay)) = backoff {
            self.logger.log(TransferLog {
                component: "send",
                peer: peer.to_string(),
                event: TransferEvent::PacingBackoff { old_delay, new_delay },
            });
        }
    }

    /// Drive timeout detection and reap terminal transfers. Idempotent.
    pub fn tick(&self, now: Instant) {
        let mut registry = self.registry.lock().unwrap();
        let idle_timeout = Duration::from_secs(self.config.send_idle_timeout_secs);
        let mut to_remove = Vec::new();

        for (peer, handle) in registry.iter() {
            let mut st = handle.state.lock().unwrap();
            if st.is_terminal() {
                to_remove.push(peer.clone());
                continue;
            }
            let incomplete = st.acknowledged.len() as u32 != st.num_pieces;
            if incomplete && now.duration_since(st.last_activity) >= idle_timeout {
                st.status = SendStatus::Failed;
                st.failure_reason = Some("send_idle_timeout".into());
                drop(st);
                self.logger.log(TransferLog {
                    component: "send",
                    peer: peer.clone(),
                    event: TransferEvent::TransferFailed {
                        reason: "send_idle_timeout".into(),
                    },
                });
            }
        }

        for peer in to_remove {
            registry.remove(&peer);
        }
    }

    /// Mark a transfer FAILED; cooperative -- the worker notices on its
    /// next iteration and stops. In-flight sends are not aborted.
    pub fn cancel(&self, peer: &str) {
        if let Some(handle) = self.registry.lock().unwrap().get(peer) {
            handle.cancelled.store(true, Ordering::Relaxed);
        }
    }

    pub fn status(&self, peer: &str) -> Option<SendStatus> {
        self.registry
            .lock()
            .unwrap()
            .get(peer)
            .map(|h| h.state.lock().unwrap().status)
    }

    fn send_message(&self, peer: &str, msg: &AkitaMessage) -> Result<()> {
        encode_and_send(self.transport.as_ref(), peer, msg)
    }
}

fn encode_and_send(transport: &dyn Transport, peer: &str, msg: &AkitaMessage) -> Result<()> {
    let bytes = protocol::encode_message(msg)?;
    transport
        .send(peer, &bytes, AKITA_CONTENT_TYPE)
        .map_err(|e| TransferError::Transport {
            peer: peer.to_string(),
            source: e,
        })
}

fn fail(handle: &SendTransferHandle, logger: &Arc<dyn TransferLogger>, peer: &str, reason: String) {
    let mut st = handle.state.lock().unwrap();
    st.status = SendStatus::Failed;
    st.failure_reason = Some(reason.clone());
    drop(st);
    logger.log(TransferLog {
        component: "send",
        peer: peer.to_string(),
        event: TransferEvent::TransferFailed { reason },
    });
}

/// Stream `path` one `piece_size` buffer at a time and hash each piece,
/// never holding the whole file in memory.
fn hash_pieces(path: &Path, total_size: u32, piece_size: u32) -> Result<Vec<String>> {
    if total_size == 0 {
        return Ok(Vec::new());
    }
    let mut file = File::open(path).map_err(|e| TransferError::LocalIo {
        peer: String::new(),
        source: e,
    })?;
    let num_pieces = protocol::num_pieces(total_size, piece_size);
    let mut hashes = Vec::with_capacity(num_pieces as usize);
    let mut buf = vec![0u8; piece_size as usize];

    for idx in 0..num_pieces {
        let len = piece_len(idx, piece_size, total_size);
        file.read_exact(&mut buf[..len as usize])
            .map_err(|e| TransferError::LocalIo {
                peer: String::new(),
                source: e,
            })?;
        hashes.push(piece_hash(&buf[..len as usize]));
    }
    Ok(hashes)
}

fn piece_len(index: u32, piece_size: u32, total_size: u32) -> u32 {
    let offset = index as u64 * piece_size as u64;
    let remaining = total_size as u64 - offset;
    remaining.min(piece_size as u64) as u32
}

fn read_piece(file: &mut File, index: u32, piece_size: u32, total_size: u32) -> std::io::Result<Vec<u8>> {
    let len = piece_len(index, piece_size, total_size);
    let offset = index as u64 * piece_size as u64;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullLogger;
    use std::io::Write;
    use std::sync::Mutex as StdMutex;

    struct RecordingTransport {
        sent: StdMutex<Vec<(String, AkitaMessage)>>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self { sent: StdMutex::new(Vec::new()) }
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, peer_id: &str, payload: &[u8], _port: u16) -> std::io::Result<()> {
            let msg = protocol::decode_message(payload).unwrap();
            self.sent.lock().unwrap().push((peer_id.to_string(), msg));
            Ok(())
        }
    }

    fn write_temp_file(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn start_transfer_rejects_missing_file() {
        let transport = Arc::new(RecordingTransport::new());
        let engine = SendEngine::new(transport, EngineConfig::default(), Arc::new(NullLogger));
        let ok = engine
            .start_transfer("peer1", "/nonexistent/path/xyz", 200, true)
            .unwrap();
        assert!(!ok);
    }

    #[test]
    fn start_transfer_rejects_zero_piece_size_nonempty_file() {
        let file = write_temp_file(b"hello world");
        let transport = Arc::new(RecordingTransport::new());
        let engine = SendEngine::new(transport, EngineConfig::default(), Arc::new(NullLogger));
        let ok = engine.start_transfer("peer1", file.path(), 0, true).unwrap();
        assert!(!ok);
    }

    #[test]
    fn start_transfer_emits_file_start_with_hashes() {
        let data = vec![0u8; 1000];
        let file = write_temp_file(&data);
        let transport = Arc::new(RecordingTransport::new());
        let engine = SendEngine::new(transport.clone(), EngineConfig::default(), Arc::new(NullLogger));
        let ok = engine.start_transfer("peer1", file.path(), 200, true).unwrap();
        assert!(ok);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        match &sent[0].1 {
            AkitaMessage::FileStart(fs) => {
                assert_eq!(fs.total_size, 1000);
                assert_eq!(fs.piece_size, 200);
                assert_eq!(fs.piece_hashes.len(), 5);
                assert!(fs.merkle_root.is_some());
            }
            _ => panic!("expected FileStart"),
        }
        engine.cancel("peer1");
    }

    #[test]
    fn resume_request_with_no_missing_and_full_ack_completes() {
        let data = vec![1u8; 10];
        let file = write_temp_file(&data);
        let transport = Arc::new(RecordingTransport::new());
        let engine = SendEngine::new(transport, EngineConfig::default(), Arc::new(NullLogger));
        engine.start_transfer("peer1", file.path(), 5, false).unwrap();

        engine.handle_resume_request(
            "peer1",
            ResumeRequest {
                missing_indices: vec![],
                acknowledged_indices: vec![0, 1],
            },
        );
        assert_eq!(engine.status("peer1"), Some(SendStatus::Complete));
    }

    #[test]
    fn resume_request_for_unknown_peer_is_dropped() {
        let transport = Arc::new(RecordingTransport::new());
        let engine = SendEngine::new(transport, EngineConfig::default(), Arc::new(NullLogger));
        // Should not panic.
        engine.handle_resume_request(
            "ghost",
            ResumeRequest {
                missing_indices: vec![0],
                acknowledged_indices: vec![],
            },
        );
    }

    #[test]
    fn out_of_range_missing_indices_are_ignored() {
        let data = vec![1u8; 10];
        let file = write_temp_file(&data);
        let transport = Arc::new(RecordingTransport::new());
        let engine = SendEngine::new(transport, EngineConfig::default(), Arc::new(NullLogger));
        engine.start_transfer("peer1", file.path(), 5, false).unwrap();

        engine.handle_resume_request(
            "peer1",
            ResumeRequest {
                missing_indices: vec![99],
                acknowledged_indices: vec![],
            },
        );
        assert_eq!(engine.status("peer1"), Some(SendStatus::InProgress));
        engine.cancel("peer1");
    }

    #[test]
    fn tick_fails_transfer_after_idle_timeout() {
        let data = vec![1u8; 5];
        let file = write_temp_file(&data);
        let transport = Arc::new(RecordingTransport::new());
        let mut config = EngineConfig::default();
        config.send_idle_timeout_secs = 0;
        let engine = SendEngine::new(transport, config, Arc::new(NullLogger));
        engine.start_transfer("peer1", file.path(), 5, false).unwrap();

        std::thread::sleep(Duration::from_millis(10));
        engine.tick(Instant::now());
        assert_eq!(engine.status("peer1"), None); // reaped after going terminal
    }
}

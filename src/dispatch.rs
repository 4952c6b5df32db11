/// Inbound dispatch: routes decoded wire messages to the send or
/// receive engine by message variant.
///
/// The dispatcher itself holds no transfer state -- it is a thin lookup
/// capability in front of the two engines' own registries, kept
/// separate from them so a caller can wire inbound delivery (whatever
/// shape the mesh transport's packet loop takes) without reaching into
/// engine internals.
use std::sync::Arc;

use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::protocol::{self, AkitaMessage};
use crate::receive::ReceiveEngine;
use crate::send::SendEngine;
use crate::transport::InboundDatagram;

/// Routes inbound datagrams addressed to the core's well-known port to
/// the correct engine. Construct one per running node; it borrows both
/// engines for the lifetime of the dispatcher.
pub struct Dispatcher {
    send_engine: Arc<SendEngine>,
    receive_engine: Arc<ReceiveEngine>,
    logger: Arc<dyn TransferLogger>,
}

impl Dispatcher {
    pub fn new(
        send_engine: Arc<SendEngine>,
        receive_engine: Arc<ReceiveEngine>,
        logger: Arc<dyn TransferLogger>,
    ) -> Self {
        Self {
            send_engine,
            receive_engine,
            logger,
        }
    }

    /// Decode and route one inbound datagram. Frames not addressed to
    /// the core's content type are ignored; malformed frames are
    /// dropped and logged at `warn`.
    pub fn handle_inbound(&self, datagram: InboundDatagram) {
        if !datagram.is_for_core() {
            return;
        }

        let msg = match protocol::decode_message(&datagram.payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.logger.log(TransferLog {
                    component: "dispatch",
                    peer: datagram.peer_id.clone(),
                    event: TransferEvent::InvalidMessageDropped {
                        reason: e.to_string(),
                    },
                });
                return;
            }
        };

        match msg {
            AkitaMessage::FileStart(fs) => {
                self.receive_engine
                    .handle_file_start(&datagram.peer_id, fs, datagram.is_broadcast);
            }
            AkitaMessage::PieceData(piece) => {
                self.receive_engine
                    .handle_piece_data(&datagram.peer_id, piece, datagram.is_broadcast);
            }
            AkitaMessage::ResumeRequest(req) => {
                self.send_engine.handle_resume_request(&datagram.peer_id, req);
            }
            AkitaMessage::Acknowledgement(_) => {
                // Reserved variant; the protocol bundles acknowledgement
                // into ResumeRequest instead. Accepted and ignored for
                // forward compatibility.
            }
        }
    }

    /// Drive both engines' timeout/retry/resume logic. Call periodically
    /// from an external scheduler; idempotent under repeated invocation.
    pub fn tick(&self, now: std::time::Instant) {
        self.send_engine.tick(now);
        self.receive_engine.tick(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::hash::{merkle_root, piece_hash};
    use crate::logging::NullLogger;
    use crate::protocol::{FileStart, PieceData, ResumeRequest};
    use crate::sink::MemorySink;
    use crate::transport::{Transport, AKITA_CONTENT_TYPE};
    use std::sync::Mutex;

    struct LoopbackTransport {
        sent: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl LoopbackTransport {
        fn new() -> Self {
            Self { sent: Mutex::new(Vec::new()) }
        }
    }

    impl Transport for LoopbackTransport {
        fn send(&self, peer_id: &str, payload: &[u8], _port: u16) -> std::io::Result<()> {
            self.sent.lock().unwrap().push((peer_id.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    fn make_dispatcher() -> (Arc<LoopbackTransport>, Arc<MemorySink>, Dispatcher) {
        let transport = Arc::new(LoopbackTransport::new());
        let sink = Arc::new(MemorySink::new());
        let send_engine = Arc::new(SendEngine::new(
            transport.clone(),
            EngineConfig::default(),
            Arc::new(NullLogger),
        ));
        let receive_engine = Arc::new(ReceiveEngine::new(
            transport.clone(),
            EngineConfig::default(),
            Arc::new(NullLogger),
            sink.clone(),
        ));
        let dispatcher = Dispatcher::new(send_engine, receive_engine, Arc::new(NullLogger));
        (transport, sink, dispatcher)
    }

    #[test]
    fn file_start_and_piece_data_route_to_receive_engine() {
        let (_transport, sink, dispatcher) = make_dispatcher();
        let data = vec![9u8; 10];
        let hashes = vec![piece_hash(&data[0..5]), piece_hash(&data[5..10])];
        let root = merkle_root(&hashes).unwrap();

        let fs = AkitaMessage::FileStart(FileStart {
            filename: "a.bin".into(),
            total_size: 10,
            piece_size: 5,
            merkle_root: Some(root),
            piece_hashes: hashes,
        });
        dispatcher.handle_inbound(InboundDatagram {
            peer_id: "peer1".into(),
            payload: protocol::encode_message(&fs).unwrap(),
            port: AKITA_CONTENT_TYPE,
            is_broadcast: false,
        });

        for (i, chunk) in data.chunks(5).enumerate() {
            let piece = AkitaMessage::PieceData(PieceData {
                piece_index: i as u32,
                data: chunk.to_vec(),
            });
            dispatcher.handle_inbound(InboundDatagram {
                peer_id: "peer1".into(),
                payload: protocol::encode_message(&piece).unwrap(),
                port: AKITA_CONTENT_TYPE,
                is_broadcast: false,
            });
        }

        assert_eq!(sink.saved.lock().unwrap().len(), 1);
    }

    #[test]
    fn resume_request_routes_to_send_engine() {
        let (_transport, _sink, dispatcher) = make_dispatcher();
        // No send transfer registered for "ghost"; must not panic.
        let req = AkitaMessage::ResumeRequest(ResumeRequest {
            missing_indices: vec![0],
            acknowledged_indices: vec![],
        });
        dispatcher.handle_inbound(InboundDatagram {
            peer_id: "ghost".into(),
            payload: protocol::encode_message(&req).unwrap(),
            port: AKITA_CONTENT_TYPE,
            is_broadcast: false,
        });
    }

    #[test]
    fn frames_on_other_ports_are_ignored() {
        let (_transport, _sink, dispatcher) = make_dispatcher();
        dispatcher.handle_inbound(InboundDatagram {
            peer_id: "peer1".into(),
            payload: vec![1, 2, 3],
            port: 0,
            is_broadcast: false,
        });
    }

    #[test]
    fn garbage_payload_is_dropped_without_panic() {
        let (_transport, _sink, dispatcher) = make_dispatcher();
        dispatcher.handle_inbound(InboundDatagram {
            peer_id: "peer1".into(),
            payload: vec![0xff, 0xff, 0xff, 0xff],
            port: AKITA_CONTENT_TYPE,
            is_broadcast: false,
        });
    }

    #[test]
    fn acknowledgement_is_accepted_and_ignored() {
        let (_transport, _sink, dispatcher) = make_dispatcher();
        let ack = AkitaMessage::Acknowledgement(crate::protocol::Acknowledgement { piece_index: 3 });
        dispatcher.handle_inbound(InboundDatagram {
            peer_id: "peer1".into(),
            payload: protocol::encode_message(&ack).unwrap(),
            port: AKITA_CONTENT_TYPE,
            is_broadcast: false,
        });
    }
}

/// Loss-tolerant, resumable file-transfer protocol engine for
/// low-bandwidth, lossy, high-latency, datagram-oriented mesh links.
///
/// This crate implements the transfer core only: the sender and
/// receiver state machines, the loss-detection/resume protocol, the
/// adaptive pacing controller, and the integrity/Merkle verification
/// layer. The underlying mesh transport, wire codec production, and
/// process startup are external collaborators a caller wires in through
/// the traits in [`transport`] and [`sink`].
///
/// Typical wiring:
/// ```no_run
/// use std::sync::Arc;
/// use akita_transfer::config::EngineConfig;
/// use akita_transfer::dispatch::Dispatcher;
/// use akita_transfer::logging::TracingLogger;
/// use akita_transfer::receive::ReceiveEngine;
/// use akita_transfer::send::SendEngine;
/// use akita_transfer::sink::DirectorySink;
/// use akita_transfer::transport::Transport;
///
/// # struct MyTransport;
/// # impl Transport for MyTransport {
/// #     fn send(&self, _: &str, _: &[u8], _: u16) -> std::io::Result<()> { Ok(()) }
/// # }
/// let config = EngineConfig::default();
/// let transport: Arc<dyn Transport> = Arc::new(MyTransport);
/// let logger = Arc::new(TracingLogger);
/// let sink = Arc::new(DirectorySink::new("received"));
///
/// let send_engine = Arc::new(SendEngine::new(transport.clone(), config.clone(), logger.clone()));
/// let receive_engine = Arc::new(ReceiveEngine::new(transport, config, logger.clone(), sink));
/// let dispatcher = Dispatcher::new(send_engine, receive_engine, logger);
/// ```
pub mod config;
pub mod dispatch;
pub mod error;
pub mod hash;
pub mod logging;
pub mod pacing;
pub mod piece_store;
pub mod protocol;
pub mod receive;
pub mod sanitize;
pub mod send;
pub mod sink;
pub mod transport;

pub use config::EngineConfig;
pub use dispatch::Dispatcher;
pub use error::{Result, TransferError};
pub use receive::{ReceiveEngine, ReceiveStatus};
pub use send::{SendEngine, SendStatus};

/// Transport contract.
///
/// The mesh link itself is out of scope for this crate; callers supply
/// an implementation of `Transport` (UDP, LoRa, a test loopback, ...)
/// and feed inbound datagrams to `Dispatcher::handle_inbound`. The core
/// never opens a socket itself.
use std::io;

/// Well-known port/content-type the core filters inbound traffic on.
pub const AKITA_CONTENT_TYPE: u16 = 0xAC17;

/// Sentinel peer id recognized as "no reply channel" -- a `FileStart`
/// addressed here is a broadcast transfer and never gets a `ResumeRequest`.
pub const BROADCAST_PEER: &str = "*";

pub trait Transport: Send + Sync {
    /// Best-effort datagram send. May fail synchronously; there is no
    /// delivery guarantee even on `Ok`.
    fn send(&self, peer_id: &str, payload: &[u8], port: u16) -> io::Result<()>;
}

/// An inbound datagram as delivered by the mesh dispatcher, before
/// message decoding.
#[derive(Debug, Clone)]
pub struct InboundDatagram {
    pub peer_id: String,
    pub payload: Vec<u8>,
    pub port: u16,
    pub is_broadcast: bool,
}

impl InboundDatagram {
    pub fn is_for_core(&self) -> bool {
        self.port == AKITA_CONTENT_TYPE
    }
}

use bytes::{Bytes, BytesMut};
use mio::Interest;

use crate::{http::ResponseParser, net::Sock, pacer::Pacer};

pub const RECVBUF: usize = 8192;

/// Per-connection state. The slot persists across HTTP keep-alive reuses and
/// reconnects; only the socket and parser state are replaced.
pub struct Connection {
    pub sock: Option<Sock>,
    /// Current reactor registration, `None` when unregistered.
    pub interest: Option<Interest>,
    pub parser: ResponseParser,
    /// Received bytes not yet consumed by the parser.
    pub rx: BytesMut,
    pub recv: Box<[u8; RECVBUF]>,
    pub request: Bytes,
    pub written: usize,
    /// Requests sent in the current batch minus responses received.
    pub pending: u64,
    pub has_pending: bool,
    pub is_connected: bool,
    pub pacer: Pacer,
    /// `pacer.complete` captured when the current batch was first put on the
    /// wire. Corrected latencies are dated from this count, not the running
    /// one; dating pipelined responses individually gifts them time and
    /// produces negative latencies.
    pub complete_at_last_batch_start: u64,
    pub actual_latency_start: u64,
    // Tracking numbers (used purely for debugging):
    pub latest_connect: u64,
    pub latest_write: u64,
}

impl Connection {
    pub fn new(request: Bytes, throughput: f64, capture: bool) -> Self {
        Self {
            sock: None,
            interest: None,
            parser: ResponseParser::new(capture),
            rx: BytesMut::with_capacity(RECVBUF),
            recv: Box::new([0; RECVBUF]),
            request,
            written: 0,
            pending: 0,
            has_pending: false,
            is_connected: false,
            pacer: Pacer::new(throughput),
            complete_at_last_batch_start: 0,
            actual_latency_start: 0,
            latest_connect: 0,
            latest_write: 0,
        }
    }
}

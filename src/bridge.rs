//! In-process connection bridge between the forward proxy and the TLS
//! terminator.
//!
//! [`BridgeListener`] stands in for a network listener so intercepted
//! connections reach the TLS terminator without a loopback socket hop. The
//! bytes carried are exactly those a socket would carry.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::io::DuplexStream;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default number of connections that may wait for the terminator.
pub const DEFAULT_CAPACITY: usize = 100;

/// Buffer size of each direction of a bridged connection.
const PIPE_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge listener is closed")]
    Closed,
}

/// A synthetic listener handing off full-duplex in-process pipes.
#[derive(Debug)]
pub struct BridgeListener {
    sender: mpsc::Sender<DuplexStream>,
    receiver: Mutex<mpsc::Receiver<DuplexStream>>,
    closed: CancellationToken,
}

impl BridgeListener {
    /// Creates a bridge that queues up to `capacity` pending connections.
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(receiver),
            closed: CancellationToken::new(),
        }
    }

    /// Opens a connection to the accepting side and returns the client end.
    ///
    /// Waits while the queue is full.
    pub async fn connect(&self) -> Result<DuplexStream, BridgeError> {
        if self.closed.is_cancelled() {
            return Err(BridgeError::Closed);
        }

        let (client, server) = tokio::io::duplex(PIPE_BUFFER);
        tokio::select! {
            _ = self.closed.cancelled() => Err(BridgeError::Closed),
            sent = self.sender.send(server) => {
                sent.map_err(|_| BridgeError::Closed)?;
                debug!("bridged connection queued");
                Ok(client)
            }
        }
    }

    /// Waits for the next bridged connection.
    ///
    /// Returns `None` once the bridge is closed.
    pub async fn accept(&self) -> Option<(DuplexStream, SocketAddr)> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            stream = async { self.receiver.lock().await.recv().await } => {
                stream.map(|s| (s, self.local_addr()))
            }
        }
    }

    /// Closes the bridge, waking every pending `accept` and `connect`.
    pub fn close(&self) {
        debug!("closing bridge listener");
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// A placeholder address identifying bridged peers in logs.
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }
}

impl Default for BridgeListener {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

//! In-process transport built on tokio mpsc channels.
//!
//! Used by the test suite and by deployments where every unit lives in one process.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::mpsc;
use unitwire::Packet;

use crate::transport;
use crate::transport::Acceptor;
use crate::transport::Channel;

/// A duplex channel transport.
///
/// Packets sent on one end appear on the other end's `recv()`. Dropping one end
/// closes the link: the other end's `recv()` then yields `None`.
pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<Packet>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Packet>>>,
}

impl MemoryChannel {
    /// Creates a pair of channels connected to each other.
    ///
    /// Packets sent on `a` are received by `b` and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self {
            tx: tx_a,
            rx: Arc::new(Mutex::new(rx_b)),
        };

        let b = Self {
            tx: tx_b,
            rx: Arc::new(Mutex::new(rx_a)),
        };

        (a, b)
    }
}

#[async_trait::async_trait]
impl Channel for MemoryChannel {
    async fn send(&self, packet: Packet) -> transport::Result<()> {
        self.tx
            .send(packet)
            .map_err(|_| transport::Error::ConnectionLost("Channel closed".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Packet>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}

/// The hub side of an in-process listener.
pub struct MemoryListener {
    incoming: Mutex<mpsc::UnboundedReceiver<MemoryChannel>>,
}

/// The dialing side of an in-process listener. Cheap to clone.
#[derive(Clone)]
pub struct Connector {
    tx: mpsc::UnboundedSender<MemoryChannel>,
}

/// Creates a listener and the connector that dials it.
///
/// The listener reports end-of-stream once every connector is dropped.
pub fn listener() -> (MemoryListener, Connector) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemoryListener { incoming: Mutex::new(rx) }, Connector { tx })
}

impl Connector {
    /// Opens a new link to the listener and returns the dialing end.
    pub fn connect(&self) -> transport::Result<MemoryChannel> {
        let (local, remote) = MemoryChannel::pair();
        self.tx
            .send(remote)
            .map_err(|_| transport::Error::ConnectionLost("Listener closed".into()))?;
        Ok(local)
    }
}

#[async_trait::async_trait]
impl Acceptor for MemoryListener {
    async fn accept(&self) -> transport::Result<Option<Box<dyn Channel>>> {
        let mut incoming = self.incoming.lock().await;
        Ok(incoming.recv().await.map(|ch| Box::new(ch) as Box<dyn Channel>))
    }
}

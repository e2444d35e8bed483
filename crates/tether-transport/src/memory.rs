//! In-process transport: connection pairs joined by unbounded channels.
//!
//! Frames sent on one end of a [`pair`] arrive, in order, on the other
//! end. [`listener`] adds a [`Dialer`]/[`Transport`] front so a Downend
//! and an Upend can run against each other without sockets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Mutex as StdMutex, PoisonError};

use tokio::sync::{mpsc, Mutex};

use crate::{Connection, ConnectionId, Dialer, Transport, TransportError};

/// One end of an in-memory connection.
pub struct MemoryConnection {
    id: ConnectionId,
    remote: SocketAddr,
    /// `None` once [`close`](Connection::close) ran.
    outbound: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// Creates two connected ends.
pub fn pair() -> (MemoryConnection, MemoryConnection) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);

    let a = MemoryConnection {
        id: ConnectionId::next(),
        remote: SocketAddr::new(loopback, 2),
        outbound: StdMutex::new(Some(b_tx)),
        inbound: Mutex::new(a_rx),
    };
    let b = MemoryConnection {
        id: ConnectionId::next(),
        remote: SocketAddr::new(loopback, 1),
        outbound: StdMutex::new(Some(a_tx)),
        inbound: Mutex::new(b_rx),
    };
    (a, b)
}

impl Connection for MemoryConnection {
    type Error = TransportError;

    async fn send(&self, data: &[u8]) -> Result<(), Self::Error> {
        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) => tx.send(data.to_vec()).map_err(|_| {
                TransportError::ConnectionClosed("peer dropped".into())
            }),
            None => Err(TransportError::ConnectionClosed(
                "closed locally".into(),
            )),
        }
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.inbound.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inbound.lock().await.close();
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }
}

/// Creates a dialer and the listener that accepts what it dials.
pub fn listener() -> (MemoryDialer, MemoryListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemoryDialer { acceptor: tx }, MemoryListener { incoming: rx })
}

/// Client side of [`listener`]. Dialing fails once the listener is dropped.
#[derive(Clone)]
pub struct MemoryDialer {
    acceptor: mpsc::UnboundedSender<MemoryConnection>,
}

impl Dialer for MemoryDialer {
    type Connection = MemoryConnection;

    async fn dial(&self) -> Result<Self::Connection, TransportError> {
        let (client, server) = pair();
        self.acceptor.send(server).map_err(|_| {
            TransportError::ConnectFailed("memory listener dropped".into())
        })?;
        Ok(client)
    }
}

/// Server side of [`listener`].
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<MemoryConnection>,
}

impl Transport for MemoryListener {
    type Connection = MemoryConnection;
    type Error = TransportError;

    async fn accept(&mut self) -> Result<Self::Connection, Self::Error> {
        self.incoming.recv().await.ok_or(TransportError::Shutdown)
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}

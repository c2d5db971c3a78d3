//! Listening-socket demultiplexer.
//!
//! One [`Listener`] owns a UDP socket shared by every inbound
//! association. Datagrams carrying a registered connection id route to
//! that association's driver; a cleartext packet holding exactly one
//! Initiation chunk from an unknown peer spawns a new server-side
//! connection, subject to the accept backlog. Closed associations are
//! swept out of the registry periodically.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::connection::{Connection, ConnectionConfig, State};
use crate::core::constants::{CLOSING_INTERVAL, DEFAULT_BACKLOG};
use crate::core::error::SquallError;
use crate::crypto::suite::SecretKey;
use crate::wire::chunk::Chunk;
use crate::wire::packet::{ChunkList, PacketHeader};

/// Tunables for a [`Listener`].
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Connections accepted but not yet picked up; `0` means unbounded
    /// in spirit but is clamped to one slot.
    pub backlog: usize,
    /// Settings applied to every accepted association.
    pub connection: ConnectionConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            connection: ConnectionConfig::default(),
        }
    }
}

/// One registered association.
struct Route {
    datagram_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    state_rx: watch::Receiver<State>,
}

impl Route {
    fn state(&self) -> State {
        *self.state_rx.borrow()
    }

    fn is_handshaking(&self) -> bool {
        matches!(self.state(), State::Listen | State::InitReceived)
    }
}

struct ListenerInner {
    socket: Arc<UdpSocket>,
    identity_secret: SecretKey,
    config: ListenerConfig,
    routes: Mutex<HashMap<u32, Route>>,
    /// Peer address -> connection id for associations still in their
    /// handshake, so a retransmitted Initiation reuses the pending
    /// connection instead of spawning a sibling.
    pending_by_addr: Mutex<HashMap<SocketAddr, u32>>,
    accept_tx: mpsc::Sender<Connection>,
    next_id: AtomicU32,
}

impl ListenerInner {
    fn route_datagram(&self, datagram: &[u8], addr: SocketAddr) {
        let Ok((header, _)) = PacketHeader::decode(datagram) else {
            return;
        };
        if self.feed(header.connection_id, datagram, addr) {
            return;
        }
        // Unroutable packets only matter if they open a handshake.
        if header.encrypted || !is_lone_initiation(datagram) {
            return;
        }
        let pending = self
            .pending_by_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&addr)
            .copied();
        if let Some(connection_id) = pending {
            if self.feed_pending(connection_id, datagram, addr) {
                return;
            }
            // The earlier handshake moved on or died; this is a new one.
            self.pending_by_addr
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&addr);
        }
        self.spawn_connection(datagram, addr);
    }

    /// Routes to a registered connection id. Returns false when the id is
    /// unknown; a dead route is dropped on the spot.
    fn feed(&self, connection_id: u32, datagram: &[u8], addr: SocketAddr) -> bool {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(route) = routes.get(&connection_id) else {
            return false;
        };
        if route
            .datagram_tx
            .send((datagram.to_vec(), addr))
            .is_err()
        {
            routes.remove(&connection_id);
            return false;
        }
        true
    }

    /// Like [`feed`](Self::feed) but only while the route is still
    /// handshaking, so stale address entries never capture a fresh client.
    fn feed_pending(&self, connection_id: u32, datagram: &[u8], addr: SocketAddr) -> bool {
        {
            let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
            match routes.get(&connection_id) {
                Some(route) if route.is_handshaking() => {}
                _ => return false,
            }
        }
        self.feed(connection_id, datagram, addr)
    }

    fn spawn_connection(&self, datagram: &[u8], addr: SocketAddr) {
        let connection_id = self.allocate_id();
        let (connection, datagram_tx, state_rx) = Connection::spawn_server(
            Arc::clone(&self.socket),
            addr,
            connection_id,
            self.identity_secret.clone(),
            &self.config.connection,
        );
        // Full backlog closes the channel send; the never-registered
        // connection is dropped and its driver unwinds.
        if self.accept_tx.try_send(connection).is_err() {
            return;
        }
        let _ = datagram_tx.send((datagram.to_vec(), addr));
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection_id, Route { datagram_tx, state_rx });
        self.pending_by_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, connection_id);
    }

    /// The next unused nonzero connection id.
    fn allocate_id(&self) -> u32 {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !routes.contains_key(&id) {
                return id;
            }
        }
    }

    /// Drops closed associations and handshake address entries that no
    /// longer point at a handshaking route.
    fn sweep(&self) {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        routes.retain(|_, route| route.state() != State::Closed);
        self.pending_by_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, id| routes.get(id).is_some_and(Route::is_handshaking));
    }
}

/// A cleartext packet whose body is exactly one Initiation chunk.
fn is_lone_initiation(datagram: &[u8]) -> bool {
    let Ok((header, payload)) = PacketHeader::decode(datagram) else {
        return false;
    };
    if header.encrypted {
        return false;
    }
    match ChunkList::decode(payload) {
        Ok(chunks) => matches!(chunks.as_slice(), [Chunk::Initiation(_)]),
        Err(_) => false,
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, inner: Weak<ListenerInner>) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(_) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.route_datagram(&buf[..len], addr);
    }
}

async fn sweep_loop(inner: Weak<ListenerInner>) {
    let mut interval = tokio::time::interval(CLOSING_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.sweep();
    }
}

/// Accepts inbound associations on one shared UDP socket.
pub struct Listener {
    inner: Arc<ListenerInner>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
}

impl Listener {
    /// Binds `addr` and starts demultiplexing. `identity_secret` is the
    /// server's long-term key; clients authenticate the handshake against
    /// its public half.
    pub async fn bind(
        addr: SocketAddr,
        identity_secret: &SecretKey,
        config: ListenerConfig,
    ) -> Result<Self, SquallError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let (accept_tx, accept_rx) = mpsc::channel(config.backlog.max(1));
        let inner = Arc::new(ListenerInner {
            socket: Arc::clone(&socket),
            identity_secret: identity_secret.clone(),
            config,
            routes: Mutex::new(HashMap::new()),
            pending_by_addr: Mutex::new(HashMap::new()),
            accept_tx,
            next_id: AtomicU32::new(1),
        });
        tokio::spawn(recv_loop(socket, Arc::downgrade(&inner)));
        tokio::spawn(sweep_loop(Arc::downgrade(&inner)));
        Ok(Self {
            inner,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        })
    }

    /// Awaits the next inbound association. The connection is handed out
    /// as soon as its first Initiation arrives; [`Connection::recv`]
    /// naturally waits out the rest of the handshake.
    pub async fn accept(&self) -> Option<Connection> {
        self.accept_rx.lock().await.recv().await
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> Result<SocketAddr, SquallError> {
        Ok(self.inner.socket.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lone_initiation_recognition() {
        let init = Chunk::Initiation(crate::wire::chunk::Initiation {
            public_key_a: vec![1; 32],
            public_key_b: vec![2; 32],
            public_key_b_mac: vec![3; 32],
        });
        let mut datagram = Vec::new();
        PacketHeader {
            encrypted: false,
            connection_id: 0,
        }
        .encode(&mut datagram);
        datagram.extend_from_slice(&ChunkList::encode(&[init]));
        assert!(is_lone_initiation(&datagram));

        let mut two = Vec::new();
        PacketHeader {
            encrypted: false,
            connection_id: 0,
        }
        .encode(&mut two);
        two.extend_from_slice(&ChunkList::encode(&[Chunk::Abort, Chunk::Abort]));
        assert!(!is_lone_initiation(&two));
    }
}

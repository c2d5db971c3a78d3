//! The association: a [`Connection`] handle over an async driver.
//!
//! All protocol logic is synchronous and lives in [`core`](self::core)'s
//! `ConnectionCore`, guarded by one mutex. The code here owns the async
//! edges around it: the socket, the timer tasks, and the channels that
//! carry delivered messages and state changes out to the handle. Every
//! entry into the core returns an `Effects` batch which is applied after
//! the lock is released, so nothing async ever runs under the lock.

mod core;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::core::constants::{
    ACK_INTERVAL, DEFAULT_MAX_STREAMS, DEFAULT_MTU, HEARTBEAT_INTERVAL,
};
use crate::core::error::{ConnectionError, SquallError};
use crate::crypto::suite::{PublicKey, SecretKey};
use crate::transport::ReliabilityPolicy;

pub use self::core::State;
use self::core::{ConnectionCore, Effects};

/// Tunables for one association.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum datagram size, header included.
    pub mtu: usize,
    /// Highest usable stream identifier plus one.
    pub max_streams: u16,
    /// Delay before a delayed selective acknowledgement goes out.
    pub ack_interval: Duration,
    /// Idle time between heartbeats; zero disables them.
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            max_streams: DEFAULT_MAX_STREAMS,
            ack_interval: ACK_INTERVAL,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

struct ConnectionInner {
    core: Mutex<ConnectionCore>,
    socket: Arc<UdpSocket>,
    peer: Mutex<SocketAddr>,
    state_tx: watch::Sender<State>,
    /// Dropped when the association closes so `recv` returns `None`.
    message_tx: Mutex<Option<mpsc::UnboundedSender<(u16, Vec<u8>)>>>,
    epoch: Instant,
}

impl ConnectionInner {
    fn new(
        core: ConnectionCore,
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<(u16, Vec<u8>)>,
        watch::Receiver<State>,
    ) {
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(core.state());
        let inner = Arc::new(Self {
            core: Mutex::new(core),
            socket,
            peer: Mutex::new(peer),
            state_tx,
            message_tx: Mutex::new(Some(message_tx)),
            epoch: Instant::now(),
        });
        (inner, message_rx, state_rx)
    }

    fn lock_core(&self) -> MutexGuard<'_, ConnectionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peer(&self) -> SocketAddr {
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_peer(&self, addr: SocketAddr) {
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner) = addr;
    }

    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    /// Applies one `Effects` batch outside the core lock. Datagram sends
    /// are fire-and-forget; a full socket buffer is indistinguishable from
    /// network loss and the retransmission machinery covers it.
    fn apply(inner: &Arc<Self>, effects: Effects) {
        let peer = inner.peer();
        for datagram in &effects.datagrams {
            let _ = inner.socket.try_send_to(datagram, peer);
        }
        {
            let message_tx = inner
                .message_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(tx) = message_tx.as_ref() {
                for message in effects.messages {
                    let _ = tx.send(message);
                }
            }
        }
        for start in effects.timer_starts {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                tokio::time::sleep(start.delay).await;
                let now_ms = inner.now_ms();
                let effects = inner.lock_core().on_timer(start.id, start.generation, now_ms);
                Self::apply(&inner, effects);
            });
        }
        if let Some(state) = effects.state {
            inner.state_tx.send_replace(state);
            if state == State::Closed {
                inner
                    .message_tx
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
            }
        }
    }

    fn handle_datagram(inner: &Arc<Self>, datagram: &[u8]) {
        let now_ms = inner.now_ms();
        let effects = inner.lock_core().handle_datagram(datagram, now_ms);
        Self::apply(inner, effects);
    }

    fn is_closed(&self) -> bool {
        *self.state_tx.borrow() == State::Closed
    }
}

/// Receive loop for a client-owned socket. Datagrams from anyone but the
/// server are dropped unread. Closing can happen with no inbound packet
/// at all (handshake retries exhausted, a local abort), so the loop also
/// watches the state channel to unpark itself.
async fn client_recv_loop(inner: Arc<ConnectionInner>) {
    let mut buf = vec![0u8; 65536];
    let mut state_rx = inner.state_tx.subscribe();
    loop {
        tokio::select! {
            received = inner.socket.recv_from(&mut buf) => {
                let (len, addr) = match received {
                    Ok(received) => received,
                    Err(_) => break,
                };
                if addr != inner.peer() {
                    continue;
                }
                ConnectionInner::handle_datagram(&inner, &buf[..len]);
                if inner.is_closed() {
                    break;
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() || *state_rx.borrow_and_update() == State::Closed {
                    break;
                }
            }
        }
    }
}

/// Receive loop for a server-side association, fed pre-routed datagrams
/// by the listener. The peer address follows the latest datagram.
async fn server_recv_loop(
    inner: Arc<ConnectionInner>,
    mut datagrams: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
) {
    while let Some((datagram, addr)) = datagrams.recv().await {
        inner.set_peer(addr);
        ConnectionInner::handle_datagram(&inner, &datagram);
        if inner.is_closed() {
            break;
        }
    }
}

/// Handle to one association.
///
/// Writes are synchronous (the data is queued and whatever the congestion
/// window admits leaves immediately); receiving awaits the next
/// reassembled message in arrival order across all streams.
pub struct Connection {
    inner: Arc<ConnectionInner>,
    messages: tokio::sync::Mutex<mpsc::UnboundedReceiver<(u16, Vec<u8>)>>,
    state_rx: watch::Receiver<State>,
}

impl Connection {
    /// Connects to `server_addr` from a fresh socket bound to `bind`,
    /// authenticating the server against `server_public_key`. Resolves
    /// once the association is established; fails if it closes first
    /// (handshake retries exhausted or aborted).
    pub async fn connect(
        bind: SocketAddr,
        server_addr: SocketAddr,
        server_public_key: &PublicKey,
        config: ConnectionConfig,
    ) -> Result<Self, SquallError> {
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        let core = ConnectionCore::client(&config);
        let (inner, message_rx, mut state_rx) = ConnectionInner::new(core, socket, server_addr);
        tokio::spawn(client_recv_loop(Arc::clone(&inner)));

        let now_ms = inner.now_ms();
        let effects = inner.lock_core().associate(server_public_key, now_ms);
        ConnectionInner::apply(&inner, effects);

        loop {
            match *state_rx.borrow_and_update() {
                State::Established => break,
                State::Closed => return Err(ConnectionError::Closed.into()),
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(ConnectionError::Closed.into());
            }
        }
        Ok(Self {
            inner,
            messages: tokio::sync::Mutex::new(message_rx),
            state_rx,
        })
    }

    /// Builds the server end of an association and spawns its driver.
    /// The returned sender routes datagrams in; the listener keeps it
    /// together with the state watch for sweeping.
    pub(crate) fn spawn_server(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        connection_id: u32,
        identity_secret: SecretKey,
        config: &ConnectionConfig,
    ) -> (
        Self,
        mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
        watch::Receiver<State>,
    ) {
        let core = ConnectionCore::server(config, connection_id, identity_secret);
        let (inner, message_rx, state_rx) = ConnectionInner::new(core, socket, peer);
        let (datagram_tx, datagram_rx) = mpsc::unbounded_channel();
        tokio::spawn(server_recv_loop(Arc::clone(&inner), datagram_rx));
        let connection = Self {
            inner,
            messages: tokio::sync::Mutex::new(message_rx),
            state_rx: state_rx.clone(),
        };
        (connection, datagram_tx, state_rx)
    }

    /// Queues `message` on stream `sid` under the given reliability
    /// policy and transmits what the window admits. Empty messages are
    /// accepted and silently discarded.
    pub fn write(
        &self,
        sid: u16,
        message: Vec<u8>,
        policy: ReliabilityPolicy,
    ) -> Result<(), SquallError> {
        let now_ms = self.inner.now_ms();
        let effects = self
            .inner
            .lock_core()
            .write(sid, &message, policy, now_ms)?;
        ConnectionInner::apply(&self.inner, effects);
        Ok(())
    }

    /// Switches stream `sid` between ordered and unordered delivery for
    /// messages written after the call.
    pub fn set_unordered(&self, sid: u16, unordered: bool) -> Result<(), SquallError> {
        self.inner.lock_core().set_unordered(sid, unordered)
    }

    /// Awaits the next reassembled message as `(stream id, message)`.
    /// Returns `None` once the association has closed and everything
    /// delivered before that has been drained.
    pub async fn recv(&self) -> Option<(u16, Vec<u8>)> {
        self.messages.lock().await.recv().await
    }

    /// Starts a graceful shutdown: in-flight data is still retransmitted
    /// until acknowledged, then the closing exchange runs. Watch
    /// [`state_changes`](Self::state_changes) for completion.
    pub fn shutdown(&self) -> Result<(), SquallError> {
        let now_ms = self.inner.now_ms();
        let effects = self.inner.lock_core().shutdown(now_ms);
        ConnectionInner::apply(&self.inner, effects);
        Ok(())
    }

    /// Closes immediately, telling the peer once, best-effort.
    pub fn abort(&self) {
        let now_ms = self.inner.now_ms();
        let effects = self.inner.lock_core().abort(now_ms);
        ConnectionInner::apply(&self.inner, effects);
    }

    /// Current association state.
    pub fn state(&self) -> State {
        *self.state_rx.borrow()
    }

    /// A watch on state transitions.
    pub fn state_changes(&self) -> watch::Receiver<State> {
        self.state_rx.clone()
    }

    /// The local socket address.
    pub fn local_addr(&self) -> Result<SocketAddr, SquallError> {
        Ok(self.inner.socket.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_protocol_constants() {
        let config = ConnectionConfig::default();
        assert_eq!(config.mtu, DEFAULT_MTU);
        assert_eq!(config.ack_interval, ACK_INTERVAL);
        assert_eq!(config.heartbeat_interval, HEARTBEAT_INTERVAL);
    }
}

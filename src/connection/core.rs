//! The synchronous heart of an association: the state machine, the chunk
//! handlers, and the timer logic.
//!
//! `ConnectionCore` owns every protocol component and is manipulated
//! under one mutex by the async edges in the parent module. Each entry
//! point returns [`Effects`]: datagrams to send, timers to arm, messages
//! to deliver, and the state entered. Timers are identified by a
//! generation counter so an expired task can detect it was superseded.

use std::time::Duration;

use crate::core::constants::{
    CLIENT_INITIAL_COUNT, MAX_INIT_RETRANSMITS, MAX_SHUTDOWN_RETRANSMITS, SERVER_INITIAL_COUNT,
};
use crate::core::error::{ConnectionError, SquallError};
use crate::crypto::CryptoSession;
use crate::crypto::suite::{
    self, MAC_SIZE, PUBLIC_KEY_SIZE, PublicKey, SecretKey, SharedSecret,
};
use crate::transport::{
    AckScheduler, CongestionController, InDataQueue, OutControlQueue, OutDataQueue, PacketBuilder,
    ReliabilityPolicy, RtoEstimator, StreamManager, ack::AckAction,
};
use crate::wire::chunk::{Chunk, Initiation, InitiationAck, PayloadData, Sack};
use crate::wire::packet::{ChunkList, EncryptedPacketData, PacketHeader};

use super::ConnectionConfig;

/// Association lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No association.
    Closed,
    /// Server side awaiting the first Initiation.
    Listen,
    /// Client sent its Initiation and awaits the acknowledgement.
    InitSent,
    /// Server answered the Initiation and awaits the completion.
    InitReceived,
    /// Handshake done; data flows.
    Established,
    /// Local shutdown requested while data is still in flight.
    ShutdownPending,
    /// ShutdownAssociation sent, awaiting its acknowledgement.
    ShutdownSent,
    /// Peer requested shutdown while our data is still in flight.
    ShutdownReceived,
    /// ShutdownAcknowledgement sent, awaiting the completion.
    ShutdownAckSent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// The five one-shot association timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerId {
    Init,
    Shutdown,
    Rtx,
    Ack,
    Heartbeat,
}

impl TimerId {
    pub(crate) const COUNT: usize = 5;

    const ALL: [TimerId; Self::COUNT] = [
        TimerId::Init,
        TimerId::Shutdown,
        TimerId::Rtx,
        TimerId::Ack,
        TimerId::Heartbeat,
    ];

    fn index(self) -> usize {
        match self {
            TimerId::Init => 0,
            TimerId::Shutdown => 1,
            TimerId::Rtx => 2,
            TimerId::Ack => 3,
            TimerId::Heartbeat => 4,
        }
    }
}

/// A timer the driver must arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerStart {
    pub id: TimerId,
    pub generation: u64,
    pub delay: Duration,
}

/// Side effects of one core entry point, applied by the async layer
/// after the lock is released.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    /// Datagrams to send to the peer.
    pub datagrams: Vec<Vec<u8>>,
    /// Timers to (re)arm; stops need no action because the generation
    /// counter already invalidated the running task.
    pub timer_starts: Vec<TimerStart>,
    /// Reassembled messages to deliver, as `(stream id, message)`.
    pub messages: Vec<(u16, Vec<u8>)>,
    /// The state entered, if any transition happened.
    pub state: Option<State>,
}

/// Synchronous association state.
pub(crate) struct ConnectionCore {
    role: Role,
    state: State,
    connection_id: u32,

    // Handshake scratch.
    temp_agreed: Option<SharedSecret>,
    secret_key_b: Option<SecretKey>,
    stored_init: Option<Initiation>,
    stored_init_ack: Option<InitiationAck>,
    init_retransmits: u32,
    shutdown_retransmits: u32,

    crypto: CryptoSession,
    rto: RtoEstimator,
    congestion: CongestionController,
    ack: AckScheduler,
    in_queue: InDataQueue,
    out_data: OutDataQueue,
    out_control: OutControlQueue,
    streams: StreamManager,
    builder: PacketBuilder,

    timer_generation: [u64; TimerId::COUNT],
    timer_armed: [bool; TimerId::COUNT],
    ack_interval: Duration,
    heartbeat_interval: Duration,
}

impl ConnectionCore {
    /// A client-side core, ready for [`associate`](Self::associate).
    pub(crate) fn client(config: &ConnectionConfig) -> Self {
        let mut core = Self::new(Role::Client, config);
        core.crypto
            .set_initial_counts(CLIENT_INITIAL_COUNT, SERVER_INITIAL_COUNT);
        core
    }

    /// A server-side core in the Listen state, holding a copy of the
    /// server's identity key for the handshake.
    pub(crate) fn server(
        config: &ConnectionConfig,
        connection_id: u32,
        identity_secret: SecretKey,
    ) -> Self {
        let mut core = Self::new(Role::Server, config);
        core.crypto
            .set_initial_counts(SERVER_INITIAL_COUNT, CLIENT_INITIAL_COUNT);
        core.connection_id = connection_id;
        core.secret_key_b = Some(identity_secret);
        core.state = State::Listen;
        core
    }

    fn new(role: Role, config: &ConnectionConfig) -> Self {
        Self {
            role,
            state: State::Closed,
            connection_id: 0,
            temp_agreed: None,
            secret_key_b: None,
            stored_init: None,
            stored_init_ack: None,
            init_retransmits: 0,
            shutdown_retransmits: 0,
            crypto: CryptoSession::default(),
            rto: RtoEstimator::default(),
            congestion: CongestionController::new(config.mtu),
            ack: AckScheduler::default(),
            in_queue: InDataQueue::default(),
            out_data: OutDataQueue::new(),
            out_control: OutControlQueue::default(),
            streams: StreamManager::new(config.max_streams),
            builder: PacketBuilder::new(config.mtu),
            timer_generation: [0; TimerId::COUNT],
            timer_armed: [false; TimerId::COUNT],
            ack_interval: config.ack_interval,
            heartbeat_interval: config.heartbeat_interval,
        }
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    /// Starts the client handshake: derives the temporary secret against
    /// the server's identity key, stores the Initiation for retransmission
    /// and sends it.
    pub(crate) fn associate(&mut self, server_public_key: &PublicKey, now_ms: i64) -> Effects {
        debug_assert_eq!(self.role, Role::Client);
        debug_assert_eq!(self.state, State::Closed);
        let mut effects = Effects::default();

        let keypair_a = suite::generate_keypair_a();
        let temp_agreed = suite::agree_a(&keypair_a.secret, server_public_key);
        let keypair_b = suite::generate_keypair_b();
        let mac = suite::handshake_mac(&temp_agreed, &keypair_b.public);
        let init = Initiation {
            public_key_a: keypair_a.public.to_vec(),
            public_key_b: keypair_b.public.to_vec(),
            public_key_b_mac: mac.to_vec(),
        };
        self.temp_agreed = Some(temp_agreed);
        self.secret_key_b = Some(keypair_b.secret);
        self.stored_init = Some(init.clone());

        self.set_state(State::InitSent, now_ms, &mut effects);
        self.out_control.push(Chunk::Initiation(init));
        self.write_pending(now_ms, &mut effects);
        self.start_timer(TimerId::Init, &mut effects);
        effects
    }

    /// Processes one received datagram.
    pub(crate) fn handle_datagram(&mut self, datagram: &[u8], now_ms: i64) -> Effects {
        let mut effects = Effects::default();
        let Ok((header, payload)) = PacketHeader::decode(datagram) else {
            return effects;
        };
        // Handshake states still see packets without the (not yet known)
        // connection id; a retransmitted Initiation arrives with id zero.
        if !matches!(
            self.state,
            State::Listen | State::InitSent | State::InitReceived
        ) && header.connection_id != self.connection_id
        {
            return effects;
        }
        let chunks = if header.encrypted {
            let Ok((wrapper, ciphertext)) = EncryptedPacketData::decode(payload) else {
                return effects;
            };
            let mut plaintext = ciphertext.to_vec();
            if self.crypto.decrypt(&wrapper, &mut plaintext).is_err() {
                return effects;
            }
            match ChunkList::decode(&plaintext) {
                Ok(chunks) => chunks,
                Err(_) => return effects,
            }
        } else {
            match ChunkList::decode(payload) {
                Ok(chunks) => chunks,
                Err(_) => return effects,
            }
        };
        for chunk in chunks {
            // Everything but the two cleartext handshake chunks must have
            // arrived under the session key.
            if !header.encrypted && chunk.is_encryptable() {
                continue;
            }
            self.handle_chunk(chunk, now_ms, &mut effects);
        }
        self.commit_ack(&mut effects);
        self.write_pending(now_ms, &mut effects);
        effects
    }

    /// Queues a message on `sid` and sends what the window admits.
    pub(crate) fn write(
        &mut self,
        sid: u16,
        message: &[u8],
        policy: ReliabilityPolicy,
        now_ms: i64,
    ) -> Result<Effects, SquallError> {
        match self.state {
            State::Closed | State::Listen => {
                return Err(ConnectionError::InvalidState("connection is not associated").into());
            }
            State::ShutdownPending
            | State::ShutdownSent
            | State::ShutdownReceived
            | State::ShutdownAckSent => {
                return Err(ConnectionError::InvalidState("connection is shutting down").into());
            }
            State::InitSent | State::InitReceived | State::Established => {}
        }
        let fragments = self
            .streams
            .fragment(sid, message, self.builder.max_payload_size())?;
        for fragment in fragments {
            self.out_data.push(fragment, policy);
        }
        let mut effects = Effects::default();
        self.write_pending(now_ms, &mut effects);
        Ok(effects)
    }

    /// Marks a stream's future messages as unordered (or ordered again).
    pub(crate) fn set_unordered(&mut self, sid: u16, unordered: bool) -> Result<(), SquallError> {
        Ok(self.streams.set_unordered(sid, unordered)?)
    }

    /// Begins a graceful shutdown. With data still in flight the request
    /// is deferred until the acknowledgement pipeline drains.
    pub(crate) fn shutdown(&mut self, now_ms: i64) -> Effects {
        let mut effects = Effects::default();
        if self.state == State::Listen {
            self.set_state(State::Closed, now_ms, &mut effects);
            return effects;
        }
        if self.state != State::Established {
            return effects;
        }
        if self.out_data.is_empty() {
            self.out_control.push(Chunk::Shutdown);
            self.write_pending(now_ms, &mut effects);
            self.set_state(State::ShutdownSent, now_ms, &mut effects);
        } else {
            self.set_state(State::ShutdownPending, now_ms, &mut effects);
        }
        effects
    }

    /// Tears the association down immediately, telling the peer once,
    /// best-effort.
    pub(crate) fn abort(&mut self, now_ms: i64) -> Effects {
        let mut effects = Effects::default();
        if self.state == State::Closed {
            return effects;
        }
        if self.state != State::Listen {
            self.out_control.push(Chunk::Abort);
            self.write_pending(now_ms, &mut effects);
        }
        self.set_state(State::Closed, now_ms, &mut effects);
        effects
    }

    /// Runs an expired timer. Stale generations are ignored.
    pub(crate) fn on_timer(&mut self, id: TimerId, generation: u64, now_ms: i64) -> Effects {
        let mut effects = Effects::default();
        let index = id.index();
        if !self.timer_armed[index] || self.timer_generation[index] != generation {
            return effects;
        }
        self.timer_armed[index] = false;
        let restart = match id {
            TimerId::Init => self.on_init_expired(now_ms, &mut effects),
            TimerId::Shutdown => self.on_shutdown_expired(now_ms, &mut effects),
            TimerId::Rtx => self.on_rtx_expired(),
            TimerId::Ack => {
                if self.ack.delay_expired() {
                    self.push_sack();
                }
                false
            }
            TimerId::Heartbeat => self.on_heartbeat_expired(now_ms),
        };
        self.write_pending(now_ms, &mut effects);
        if restart {
            self.start_timer(id, &mut effects);
        }
        effects
    }

    fn handle_chunk(&mut self, chunk: Chunk, now_ms: i64, effects: &mut Effects) {
        match chunk {
            Chunk::Abort => self.handle_abort(now_ms, effects),
            Chunk::Initiation(init) => self.handle_initiation(init, now_ms, effects),
            Chunk::InitiationAck(ack) => self.handle_initiation_ack(ack, now_ms, effects),
            Chunk::InitiationComplete => self.handle_initiation_complete(now_ms, effects),
            Chunk::PayloadData(payload) => self.handle_payload_data(payload, effects),
            Chunk::Sack(sack) => self.handle_sack(sack, now_ms, effects),
            Chunk::HeartbeatRequest(time_value) => {
                self.out_control.push(Chunk::HeartbeatAck(time_value));
            }
            Chunk::HeartbeatAck(time_value) => self.handle_heartbeat_ack(time_value, now_ms),
            Chunk::Shutdown => self.handle_shutdown(now_ms, effects),
            Chunk::ShutdownAck => self.handle_shutdown_ack(now_ms, effects),
            Chunk::ShutdownComplete => self.handle_shutdown_complete(now_ms, effects),
            // Validated but otherwise ignored; abandoned ranges surface
            // through the regular acknowledgement path.
            Chunk::ForwardTsn(_) => {}
        }
    }

    fn handle_abort(&mut self, now_ms: i64, effects: &mut Effects) {
        if self.state == State::Listen {
            return;
        }
        self.set_state(State::Closed, now_ms, effects);
    }

    /// Server side of the handshake. The first valid Initiation derives
    /// the session key and caches the acknowledgement; every receipt
    /// (re)sends the cached acknowledgement so a lost reply is survivable.
    fn handle_initiation(&mut self, init: Initiation, now_ms: i64, effects: &mut Effects) {
        if self.role == Role::Client {
            return;
        }
        if !matches!(self.state, State::Listen | State::InitReceived) {
            return;
        }
        if init.public_key_a.len() != PUBLIC_KEY_SIZE
            || init.public_key_b.len() != PUBLIC_KEY_SIZE
            || init.public_key_b_mac.len() != MAC_SIZE
        {
            return;
        }
        if self.stored_init_ack.is_none() {
            let Ok(public_key_a) = PublicKey::try_from(init.public_key_a.as_slice()) else {
                return;
            };
            let Ok(public_key_b) = PublicKey::try_from(init.public_key_b.as_slice()) else {
                return;
            };
            let Some(identity_secret) = self.secret_key_b.take() else {
                return;
            };
            // The identity key copy is consumed here; a forged MAC leaves
            // this connection unable to ever complete the handshake.
            let temp_agreed = suite::agree_b(&identity_secret, &public_key_a);
            drop(identity_secret);
            if !suite::handshake_mac_verify(&temp_agreed, &public_key_b, &init.public_key_b_mac) {
                return;
            }
            let keypair_a = suite::generate_keypair_a();
            let mac = suite::handshake_mac(&temp_agreed, &keypair_a.public);
            let agreed = suite::agree_a(&keypair_a.secret, &public_key_b);
            let session_key = suite::derive_session_key(&agreed);
            self.crypto.set_key(&session_key);
            self.stored_init_ack = Some(InitiationAck {
                connection_id: self.connection_id,
                public_key_a: keypair_a.public.to_vec(),
                public_key_a_mac: mac.to_vec(),
            });
            self.set_state(State::InitReceived, now_ms, effects);
        }
        if let Some(init_ack) = self.stored_init_ack.clone() {
            self.out_control.push(Chunk::InitiationAck(init_ack));
        }
    }

    /// Client side: verify the server's ephemeral key against the
    /// temporary secret, derive the session key and finish.
    fn handle_initiation_ack(&mut self, ack: InitiationAck, now_ms: i64, effects: &mut Effects) {
        if self.role == Role::Server {
            return;
        }
        if self.state != State::InitSent {
            return;
        }
        if ack.public_key_a.len() != PUBLIC_KEY_SIZE || ack.public_key_a_mac.len() != MAC_SIZE {
            return;
        }
        let Ok(public_key_a) = PublicKey::try_from(ack.public_key_a.as_slice()) else {
            return;
        };
        self.connection_id = ack.connection_id;
        let Some(temp_agreed) = self.temp_agreed.take() else {
            return;
        };
        if !suite::handshake_mac_verify(&temp_agreed, &public_key_a, &ack.public_key_a_mac) {
            return;
        }
        drop(temp_agreed);
        let Some(secret_key_b) = self.secret_key_b.take() else {
            return;
        };
        let agreed = suite::agree_b(&secret_key_b, &public_key_a);
        let session_key = suite::derive_session_key(&agreed);
        self.crypto.set_key(&session_key);
        self.stop_timer(TimerId::Init);
        self.set_state(State::Established, now_ms, effects);
        self.out_control.push(Chunk::InitiationComplete);
    }

    fn handle_initiation_complete(&mut self, now_ms: i64, effects: &mut Effects) {
        if self.role == Role::Client {
            return;
        }
        if self.state != State::InitReceived {
            return;
        }
        self.set_state(State::Established, now_ms, effects);
    }

    fn handle_payload_data(&mut self, payload: PayloadData, effects: &mut Effects) {
        if !matches!(
            self.state,
            State::InitReceived | State::Established | State::ShutdownPending | State::ShutdownSent
        ) {
            return;
        }
        let sid = payload.sid;
        let ssn = payload.ssn;
        let unordered = payload.unordered;
        let result = self.in_queue.push(payload);
        if !result.success || result.has_packet_loss {
            self.ack.trigger_immediate_ack();
        }
        if !result.success {
            return;
        }
        if let Some(message) = result.user_data {
            for message in self.streams.handle_data(unordered, sid, ssn, message) {
                effects.messages.push((sid, message));
            }
        }
        self.ack.trigger_delayed_ack();
    }

    fn handle_sack(&mut self, sack: Sack, now_ms: i64, effects: &mut Effects) {
        if !matches!(
            self.state,
            State::Established | State::ShutdownPending | State::ShutdownReceived
        ) {
            return;
        }
        // A cumulative point behind ours is an old, reordered report.
        if self.out_data.cum_tsn_ack_point().follows(sack.cum_tsn_ack) {
            return;
        }
        let cum_advanced = self.out_data.cum_tsn_ack_point().precedes(sack.cum_tsn_ack);
        let mut bytes_acked = 0;
        if cum_advanced {
            self.stop_timer(TimerId::Rtx);
            bytes_acked += self.out_data.acknowledge(
                sack.cum_tsn_ack,
                now_ms,
                &mut self.rto,
                self.congestion.in_fast_recovery(),
            );
            if self.congestion.in_fast_recovery()
                && sack.cum_tsn_ack.follows(self.congestion.fast_recovery_exit_point())
            {
                self.congestion.exit_fast_recovery();
            }
        }
        let (htna, gap_bytes) =
            self.out_data
                .acknowledge_gaps(&sack.gap_ack_blocks, now_ms, &mut self.rto);
        bytes_acked += gap_bytes;
        self.congestion
            .acknowledged(bytes_acked, cum_advanced, self.out_data.has_pending());

        if self.out_data.is_empty() {
            match self.state {
                State::Established => self.start_timer(TimerId::Heartbeat, effects),
                State::ShutdownPending => {
                    self.out_control.push(Chunk::Shutdown);
                    self.set_state(State::ShutdownSent, now_ms, effects);
                }
                State::ShutdownReceived => {
                    self.out_control.push(Chunk::ShutdownAck);
                    self.set_state(State::ShutdownAckSent, now_ms, effects);
                }
                _ => {}
            }
            return;
        }

        if !self.congestion.in_fast_recovery() {
            self.out_data.inc_miss_indications(htna, &mut self.congestion);
        } else if cum_advanced {
            self.out_data
                .inc_miss_indications(self.out_data.my_next_tsn(), &mut self.congestion);
        }
        if let Some(forward) = self.out_data.advance_peer_ack_point() {
            self.out_control.push(Chunk::ForwardTsn(forward));
        }
        if cum_advanced {
            self.start_timer(TimerId::Rtx, effects);
        }
    }

    fn handle_heartbeat_ack(&mut self, time_value: i64, now_ms: i64) {
        let rtt = now_ms - time_value;
        if rtt < 0 {
            return;
        }
        self.rto.recalculate(rtt as f64);
    }

    fn handle_shutdown(&mut self, now_ms: i64, effects: &mut Effects) {
        if self.state != State::Established {
            return;
        }
        if self.out_data.is_empty() {
            self.out_control.push(Chunk::ShutdownAck);
            self.set_state(State::ShutdownAckSent, now_ms, effects);
        } else {
            self.set_state(State::ShutdownReceived, now_ms, effects);
        }
    }

    fn handle_shutdown_ack(&mut self, now_ms: i64, effects: &mut Effects) {
        if self.state != State::ShutdownSent {
            return;
        }
        self.out_control.push(Chunk::ShutdownComplete);
        self.set_state(State::Closed, now_ms, effects);
    }

    fn handle_shutdown_complete(&mut self, now_ms: i64, effects: &mut Effects) {
        if self.state != State::ShutdownAckSent {
            return;
        }
        self.set_state(State::Closed, now_ms, effects);
    }

    fn on_init_expired(&mut self, now_ms: i64, effects: &mut Effects) -> bool {
        debug_assert_eq!(self.role, Role::Client);
        self.init_retransmits += 1;
        if self.init_retransmits > MAX_INIT_RETRANSMITS {
            self.set_state(State::Closed, now_ms, effects);
            return false;
        }
        let Some(init) = self.stored_init.clone() else {
            return false;
        };
        self.out_control.push(Chunk::Initiation(init));
        self.rto.backoff();
        true
    }

    fn on_shutdown_expired(&mut self, now_ms: i64, effects: &mut Effects) -> bool {
        self.shutdown_retransmits += 1;
        if self.shutdown_retransmits > MAX_SHUTDOWN_RETRANSMITS {
            self.set_state(State::Closed, now_ms, effects);
            return false;
        }
        match self.state {
            State::ShutdownSent => self.out_control.push(Chunk::Shutdown),
            State::ShutdownAckSent => self.out_control.push(Chunk::ShutdownAck),
            _ => return false,
        }
        true
    }

    fn on_rtx_expired(&mut self) -> bool {
        if !self.out_data.has_inflight() {
            return false;
        }
        if let Some(forward) = self.out_data.advance_peer_ack_point() {
            self.out_control.push(Chunk::ForwardTsn(forward));
        }
        self.out_data.mark_all_to_retransmit();
        self.congestion.on_retransmission();
        self.rto.backoff();
        true
    }

    fn on_heartbeat_expired(&mut self, now_ms: i64) -> bool {
        self.congestion.on_long_idle_period();
        self.out_control.push(Chunk::HeartbeatRequest(now_ms));
        self.rto.backoff();
        true
    }

    fn set_state(&mut self, state: State, now_ms: i64, effects: &mut Effects) {
        self.state = state;
        match state {
            State::Closed => self.stop_all_timers(),
            State::Established => {
                self.write_pending(now_ms, effects);
                if self.out_data.is_empty() {
                    self.start_timer(TimerId::Heartbeat, effects);
                }
            }
            State::ShutdownSent | State::ShutdownAckSent => {
                self.stop_timer(TimerId::Heartbeat);
                self.start_timer(TimerId::Shutdown, effects);
            }
            _ => {}
        }
        effects.state = Some(state);
    }

    fn commit_ack(&mut self, effects: &mut Effects) {
        match self.ack.commit() {
            AckAction::None => {}
            AckAction::SendNow => {
                self.stop_timer(TimerId::Ack);
                self.push_sack();
            }
            AckAction::StartTimer => self.start_timer(TimerId::Ack, effects),
        }
    }

    fn push_sack(&mut self) {
        let blocks = self
            .in_queue
            .gap_ack_blocks(self.builder.max_sack_gap_blocks());
        self.out_control.push(Chunk::Sack(Sack {
            cum_tsn_ack: self.in_queue.peer_last_tsn(),
            gap_ack_blocks: blocks,
        }));
    }

    /// Drains everything sendable into datagrams: control chunks always,
    /// data only while the association carries data. Fresh data in flight
    /// with an idle Rtx timer swaps the Heartbeat for the Rtx timer.
    fn write_pending(&mut self, now_ms: i64, effects: &mut Effects) {
        let mut chunks = self.out_control.drain();
        if matches!(
            self.state,
            State::Established | State::ShutdownPending | State::ShutdownReceived
        ) {
            let before = chunks.len();
            let budget = self.builder.max_chunk_data_size(true);
            chunks.extend(
                self.out_data
                    .gather_fast_retransmit(budget, now_ms, &mut self.congestion)
                    .into_iter()
                    .map(Chunk::PayloadData),
            );
            chunks.extend(
                self.out_data
                    .gather_retransmit(now_ms, &mut self.congestion)
                    .into_iter()
                    .map(Chunk::PayloadData),
            );
            chunks.extend(
                self.out_data
                    .gather_unsent(now_ms, &mut self.congestion)
                    .into_iter()
                    .map(Chunk::PayloadData),
            );
            if chunks.len() != before && !self.timer_armed[TimerId::Rtx.index()] {
                self.stop_timer(TimerId::Heartbeat);
                self.start_timer(TimerId::Rtx, effects);
            }
        }
        if chunks.is_empty() {
            return;
        }
        // Without a session key only handshake chunks can leave; anything
        // else would mean a handler bug, so drop the batch.
        match self.builder.build(chunks, &mut self.crypto, self.connection_id) {
            Ok(packets) => effects.datagrams.extend(packets),
            Err(_) => debug_assert!(false, "unsendable chunk batch"),
        }
    }

    fn start_timer(&mut self, id: TimerId, effects: &mut Effects) {
        if id == TimerId::Heartbeat && self.heartbeat_interval.is_zero() {
            return;
        }
        let delay = match id {
            TimerId::Init | TimerId::Shutdown | TimerId::Rtx => self.rto.rto_duration(),
            TimerId::Ack => self.ack_interval,
            TimerId::Heartbeat => self.rto.rto_duration() + self.heartbeat_interval,
        };
        let index = id.index();
        self.timer_generation[index] += 1;
        self.timer_armed[index] = true;
        effects.timer_starts.push(TimerStart {
            id,
            generation: self.timer_generation[index],
            delay,
        });
    }

    fn stop_timer(&mut self, id: TimerId) {
        let index = id.index();
        self.timer_generation[index] += 1;
        self.timer_armed[index] = false;
    }

    fn stop_all_timers(&mut self) {
        for id in TimerId::ALL {
            self.stop_timer(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::suite::ServerIdentity;

    fn client_server() -> (ConnectionCore, ConnectionCore, ServerIdentity) {
        let config = ConnectionConfig::default();
        let identity = ServerIdentity::generate();
        let client = ConnectionCore::client(&config);
        let server = ConnectionCore::server(&config, 7, identity.secret_key().clone());
        (client, server, identity)
    }

    /// Bounces the pending datagrams between the two cores until both
    /// sides go quiet, collecting delivered messages per side.
    fn pump(
        a: &mut ConnectionCore,
        b: &mut ConnectionCore,
        first: Effects,
        now_ms: i64,
    ) -> (Vec<(u16, Vec<u8>)>, Vec<(u16, Vec<u8>)>) {
        let mut to_b = first.datagrams;
        let mut to_a = Vec::new();
        let mut a_messages = Vec::new();
        let mut b_messages = Vec::new();
        for _ in 0..64 {
            if to_a.is_empty() && to_b.is_empty() {
                break;
            }
            for datagram in to_b.drain(..) {
                let effects = b.handle_datagram(&datagram, now_ms);
                to_a.extend(effects.datagrams);
                b_messages.extend(effects.messages);
            }
            for datagram in to_a.drain(..) {
                let effects = a.handle_datagram(&datagram, now_ms);
                to_b.extend(effects.datagrams);
                a_messages.extend(effects.messages);
            }
        }
        (a_messages, b_messages)
    }

    fn establish() -> (ConnectionCore, ConnectionCore) {
        let (mut client, mut server, identity) = client_server();
        let effects = client.associate(identity.public_key(), 0);
        assert_eq!(effects.state, Some(State::InitSent));
        pump(&mut client, &mut server, effects, 0);
        assert_eq!(client.state(), State::Established);
        assert_eq!(server.state(), State::Established);
        (client, server)
    }

    #[test]
    fn handshake_establishes_both_sides() {
        let (client, server) = establish();
        assert_eq!(client.connection_id, 7);
        assert_eq!(server.connection_id, 7);
    }

    #[test]
    fn tampered_initiation_mac_never_establishes() {
        let (mut client, mut server, identity) = client_server();
        let mut effects = client.associate(identity.public_key(), 0);
        // Flip one bit inside the cleartext Initiation body.
        let last = effects.datagrams[0].len() - 1;
        effects.datagrams[0][last] ^= 0x01;
        pump(&mut client, &mut server, effects, 0);
        assert_eq!(server.state(), State::Listen);
        assert_eq!(client.state(), State::InitSent);
    }

    #[test]
    fn wrong_server_key_never_establishes() {
        let (mut client, mut server, _identity) = client_server();
        let other = ServerIdentity::generate();
        let effects = client.associate(other.public_key(), 0);
        pump(&mut client, &mut server, effects, 0);
        assert_eq!(server.state(), State::Listen);
        assert_eq!(client.state(), State::InitSent);
    }

    #[test]
    fn duplicate_initiation_gets_the_cached_ack() {
        let (mut client, mut server, identity) = client_server();
        let effects = client.associate(identity.public_key(), 0);
        let init_datagram = effects.datagrams[0].clone();
        let first = server.handle_datagram(&init_datagram, 0);
        assert_eq!(server.state(), State::InitReceived);
        assert_eq!(first.datagrams.len(), 1);
        // The retransmitted Initiation gets the identical cached answer
        // without a second key derivation.
        let second = server.handle_datagram(&init_datagram, 1);
        assert_eq!(second.datagrams, first.datagrams);
        let (header, _) = PacketHeader::decode(&first.datagrams[0]).unwrap();
        assert!(!header.encrypted);
    }

    #[test]
    fn messages_flow_both_ways() {
        let (mut client, mut server) = establish();
        let effects = client
            .write(3, b"ping", ReliabilityPolicy::Reliable, 10)
            .unwrap();
        let (_, server_messages) = pump(&mut client, &mut server, effects, 10);
        assert_eq!(server_messages, vec![(3, b"ping".to_vec())]);

        let effects = server
            .write(9, b"pong", ReliabilityPolicy::Reliable, 20)
            .unwrap();
        let (_, client_messages) = pump(&mut server, &mut client, effects, 20);
        assert_eq!(client_messages, vec![(9, b"pong".to_vec())]);
    }

    #[test]
    fn large_messages_fragment_and_reassemble() {
        let (mut client, mut server) = establish();
        let message: Vec<u8> = (0..40_000u32).map(|i| i as u8).collect();
        let effects = client
            .write(0, &message, ReliabilityPolicy::Reliable, 10)
            .unwrap();
        let (_, server_messages) = pump(&mut client, &mut server, effects, 10);
        assert_eq!(server_messages.len(), 1);
        assert_eq!(server_messages[0].1, message);
    }

    #[test]
    fn duplicated_datagram_is_delivered_once() {
        let (mut client, mut server) = establish();
        let effects = client
            .write(0, b"once", ReliabilityPolicy::Reliable, 10)
            .unwrap();
        let datagram = effects.datagrams[0].clone();
        let (_, server_messages) = pump(&mut client, &mut server, effects, 10);
        assert_eq!(server_messages.len(), 1);
        // The replay protection rejects the duplicate before the queues
        // ever see it.
        let effects = server.handle_datagram(&datagram, 11);
        assert!(effects.messages.is_empty());
    }

    #[test]
    fn ordered_messages_arrive_in_order() {
        let (mut client, mut server) = establish();
        let first = client
            .write(0, b"first", ReliabilityPolicy::Reliable, 10)
            .unwrap();
        let second = client
            .write(0, b"second", ReliabilityPolicy::Reliable, 11)
            .unwrap();
        let mut combined = first;
        combined.datagrams.extend(second.datagrams);
        let (_, server_messages) = pump(&mut client, &mut server, combined, 11);
        assert_eq!(
            server_messages,
            vec![(0, b"first".to_vec()), (0, b"second".to_vec())]
        );
    }

    #[test]
    fn write_is_rejected_before_association() {
        let config = ConnectionConfig::default();
        let mut core = ConnectionCore::client(&config);
        assert!(core.write(0, b"x", ReliabilityPolicy::Reliable, 0).is_err());
    }

    #[test]
    fn graceful_shutdown_closes_both_sides() {
        let (mut client, mut server) = establish();
        let effects = client.shutdown(100);
        assert_eq!(client.state(), State::ShutdownSent);
        pump(&mut client, &mut server, effects, 100);
        assert_eq!(client.state(), State::Closed);
        assert_eq!(server.state(), State::Closed);
    }

    #[test]
    fn shutdown_waits_for_inflight_data() {
        let (mut client, mut server) = establish();
        let write_effects = client
            .write(0, b"last words", ReliabilityPolicy::Reliable, 10)
            .unwrap();
        let effects = client.shutdown(11);
        assert_eq!(client.state(), State::ShutdownPending);
        assert!(effects.datagrams.is_empty());
        // The data arrives and arms the delayed-ack timer.
        let effects = server.handle_datagram(&write_effects.datagrams[0], 11);
        assert_eq!(effects.messages, vec![(0, b"last words".to_vec())]);
        let ack = effects
            .timer_starts
            .iter()
            .find(|s| s.id == TimerId::Ack)
            .copied()
            .unwrap();
        // The SACK drains the queue and the shutdown completes.
        let sack_effects = server.on_timer(TimerId::Ack, ack.generation, 211);
        assert_eq!(sack_effects.datagrams.len(), 1);
        pump(&mut server, &mut client, sack_effects, 211);
        assert_eq!(client.state(), State::Closed);
        assert_eq!(server.state(), State::Closed);
    }

    #[test]
    fn abort_tears_down_immediately() {
        let (mut client, mut server) = establish();
        let effects = client.abort(50);
        assert_eq!(client.state(), State::Closed);
        assert_eq!(effects.datagrams.len(), 1);
        pump(&mut client, &mut server, effects, 50);
        assert_eq!(server.state(), State::Closed);
    }

    #[test]
    fn init_timer_retransmits_and_eventually_gives_up() {
        let (mut client, _server, identity) = client_server();
        let effects = client.associate(identity.public_key(), 0);
        let mut start = effects.timer_starts[0];
        assert_eq!(start.id, TimerId::Init);
        for _ in 0..MAX_INIT_RETRANSMITS {
            let effects = client.on_timer(TimerId::Init, start.generation, 1_000);
            assert_eq!(effects.datagrams.len(), 1);
            start = effects.timer_starts[0];
            assert_eq!(start.id, TimerId::Init);
        }
        let effects = client.on_timer(TimerId::Init, start.generation, 9_000);
        assert!(effects.timer_starts.is_empty());
        assert_eq!(client.state(), State::Closed);
    }

    #[test]
    fn stale_timer_generations_are_ignored() {
        let (mut client, _server, identity) = client_server();
        let effects = client.associate(identity.public_key(), 0);
        let start = effects.timer_starts[0];
        let first = client.on_timer(TimerId::Init, start.generation, 1_000);
        assert!(!first.datagrams.is_empty());
        // The same generation cannot fire twice.
        let again = client.on_timer(TimerId::Init, start.generation, 2_000);
        assert!(again.datagrams.is_empty());
    }

    #[test]
    fn rtx_timer_resends_unacked_data() {
        let (mut client, mut server) = establish();
        let effects = client
            .write(0, b"lost", ReliabilityPolicy::Reliable, 10)
            .unwrap();
        assert_eq!(effects.datagrams.len(), 1);
        let rtx = effects
            .timer_starts
            .iter()
            .find(|s| s.id == TimerId::Rtx)
            .copied()
            .unwrap();
        // The datagram is dropped; the retransmission timer fires.
        let effects = client.on_timer(TimerId::Rtx, rtx.generation, 5_000);
        assert_eq!(effects.datagrams.len(), 1);
        let (_, server_messages) = pump(&mut client, &mut server, effects, 5_000);
        assert_eq!(server_messages, vec![(0, b"lost".to_vec())]);
    }

    #[test]
    fn heartbeat_round_trip_feeds_the_rto() {
        let (mut client, mut server) = establish();
        // Established with an empty queue arms the heartbeat.
        let effects = client.on_timer(
            TimerId::Heartbeat,
            client.timer_generation[TimerId::Heartbeat.index()],
            1_000,
        );
        assert_eq!(effects.datagrams.len(), 1);
        let reply = server.handle_datagram(&effects.datagrams[0], 1_010);
        assert_eq!(reply.datagrams.len(), 1);
        client.handle_datagram(&reply.datagrams[0], 1_400);
        // One 400 ms sample: srtt 400, rttvar 200, floor-clamped to 1200.
        assert_eq!(client.rto.rto(), 1_200.0);
    }

    #[test]
    fn cleartext_data_chunks_are_ignored() {
        let (client, mut server) = establish();
        // Hand-build a cleartext packet claiming a payload chunk.
        let chunk = Chunk::PayloadData(PayloadData {
            begin: true,
            end: true,
            unordered: false,
            tsn: crate::wire::Tsn(0),
            sid: 0,
            ssn: crate::wire::Ssn(0),
            data: b"forged".to_vec(),
        });
        let mut datagram = Vec::new();
        PacketHeader {
            encrypted: false,
            connection_id: client.connection_id,
        }
        .encode(&mut datagram);
        datagram.extend_from_slice(&ChunkList::encode(&[chunk]));
        let effects = server.handle_datagram(&datagram, 10);
        assert!(effects.messages.is_empty());
    }

    #[test]
    fn packets_for_another_connection_are_dropped() {
        let (mut client, mut server) = establish();
        let effects = client
            .write(0, b"data", ReliabilityPolicy::Reliable, 10)
            .unwrap();
        let mut datagram = effects.datagrams[0].clone();
        // connection_id sits in header bytes 1..5.
        datagram[4] ^= 0xff;
        let effects = server.handle_datagram(&datagram, 10);
        assert!(effects.datagrams.is_empty());
        assert!(effects.messages.is_empty());
    }
}

//! Tick-owning sync session
//!
//! Single-owner actor for every shared structure: the spatial index, the
//! interest coordinator, the stage replicator, and the connection table.
//! Network tasks talk to it through the packet inbox and the command
//! channel; nothing else mutates these structures. Within one tick, index
//! mutation happens before the interest queries, so all queries see a
//! consistent snapshot.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashSet;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::net::connection::{
    Connection, ConnectionManager, ConnectionState, InboundEvent, PacketOutcome,
};
use crate::net::framing::{encode_frame, HEADER_SIZE};
use crate::net::inbox::{PacketInbox, PacketSender, RawPacket};
use crate::net::protocol::{
    deny_reason, EntityDeltaPayload, InterestPayload, JoinAcceptPayload, JoinDenyPayload,
    PacketType, TimePayload, VersionPayload, PROTOCOL_VERSION,
};
use crate::util::vec2::Vec2;
use crate::world::interest::InterestCoordinator;
use crate::world::progression::{QuestRegistry, StageApply, StageReplicator};
use crate::world::spatial::SpatialIndex;
use crate::world::EntityId;

/// Frames buffered between ticks before the inbox starts shedding
const INBOX_CAPACITY: usize = 4096;

/// Ticks between keepalive pings to in-game peers
const PING_INTERVAL_TICKS: u64 = 64;

/// Ticks between stale-connection sweeps
const STALE_SWEEP_INTERVAL_TICKS: u64 = 32;

/// Control messages from the transport and the embedding simulation
#[derive(Debug)]
pub enum SessionCommand {
    /// A transport task accepted a connection; reply carries the new id
    Connect {
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        reply: oneshot::Sender<u64>,
    },
    /// Transport saw EOF or a read error for this connection
    Disconnect { conn_id: u64 },
    /// Simulation refreshed an entity position
    UpsertEntity { id: EntityId, position: Vec2 },
    /// Simulation despawned an entity
    RemoveEntity { id: EntityId },
}

/// The authoritative tick loop and owner of all sync state
pub struct SyncSession {
    index: SpatialIndex,
    interest: InterestCoordinator,
    replicator: StageReplicator,
    connections: ConnectionManager,
    inbox: PacketInbox,
    outbound: HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>,
    /// Entities whose position changed since the last interest pass
    dirty: HashSet<EntityId>,
    metrics: Arc<Metrics>,
    tick_rate: u32,
    max_connections: usize,
    idle_timeout: Duration,
    tick: u64,
    started: Instant,
}

impl SyncSession {
    pub fn new(config: &ServerConfig, registry: QuestRegistry, metrics: Arc<Metrics>) -> Self {
        Self {
            index: SpatialIndex::new(config.world_extent),
            interest: InterestCoordinator::new(config.interest_radius),
            replicator: StageReplicator::new(registry),
            connections: ConnectionManager::new(),
            inbox: PacketInbox::new(INBOX_CAPACITY),
            outbound: HashMap::new(),
            dirty: HashSet::new(),
            metrics,
            tick_rate: config.tick_rate,
            max_connections: config.max_connections,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            tick: 0,
            started: Instant::now(),
        }
    }

    /// Handle for transport read tasks to submit frames
    pub fn inbox_sender(&self) -> PacketSender {
        self.inbox.sender()
    }

    pub fn replicator(&self) -> &StageReplicator {
        &self.replicator
    }

    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    pub fn connection(&self, conn_id: u64) -> Option<&Connection> {
        self.connections.get(conn_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.count()
    }

    /// Register a newly accepted connection and its writer channel
    pub fn connect(&mut self, outbound: mpsc::UnboundedSender<Vec<u8>>) -> u64 {
        let conn_id = self.connections.create();
        self.outbound.insert(conn_id, outbound);
        self.metrics.connections_active.fetch_add(1, Ordering::Relaxed);
        self.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
        conn_id
    }

    /// Refresh an entity position ahead of the next interest pass
    pub fn upsert_entity(&mut self, id: EntityId, position: Vec2) {
        self.index.insert(id, position);
        self.dirty.insert(id);
    }

    pub fn remove_entity(&mut self, id: EntityId) {
        self.index.remove(id);
        self.dirty.remove(&id);
    }

    /// One full tick: drain and process inbound packets, then run the
    /// interest pass and emit replication packets
    pub fn tick(&mut self) {
        let tick_start = Instant::now();

        for raw in self.inbox.drain() {
            self.process_packet(raw);
        }

        self.interest_pass();
        self.dirty.clear();

        if self.tick % PING_INTERVAL_TICKS == 0 {
            self.send_pings();
        }
        if self.tick % STALE_SWEEP_INTERVAL_TICKS == 0 {
            self.sweep_stale();
        }

        self.metrics
            .entities_indexed
            .store(self.index.len() as u64, Ordering::Relaxed);
        self.metrics
            .interest_subscribers
            .store(self.interest.subscriber_count() as u64, Ordering::Relaxed);
        self.metrics.record_tick_time(tick_start.elapsed());
        self.tick += 1;
    }

    /// Drive the session forever; commands interleave between ticks
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        let mut ticker = interval(Duration::from_secs_f64(1.0 / self.tick_rate as f64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("sync session running at {} ticks/sec", self.tick_rate);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(),
                cmd = commands.recv() => match cmd {
                    Some(SessionCommand::Connect { outbound, reply }) => {
                        let conn_id = self.connect(outbound);
                        let _ = reply.send(conn_id);
                    }
                    Some(SessionCommand::Disconnect { conn_id }) => self.teardown(conn_id),
                    Some(SessionCommand::UpsertEntity { id, position }) => {
                        self.upsert_entity(id, position)
                    }
                    Some(SessionCommand::RemoveEntity { id }) => self.remove_entity(id),
                    None => {
                        info!("session command channel closed, stopping");
                        break;
                    }
                },
            }
        }
    }

    fn process_packet(&mut self, raw: RawPacket) {
        let payload_len = raw.frame.payload.len();
        let outcome = match self.connections.get_mut(raw.conn_id) {
            Some(conn) => conn.handle_packet(raw.frame.header, &raw.frame.payload),
            None => {
                debug!("frame for unknown connection {}", raw.conn_id);
                return;
            }
        };

        self.metrics.packets_received.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .bytes_received
            .fetch_add((HEADER_SIZE + payload_len) as u64, Ordering::Relaxed);

        match outcome {
            PacketOutcome::Processed(event) => self.apply_event(raw.conn_id, event),
            PacketOutcome::Unknown { malformed: true, .. }
            | PacketOutcome::FatalMismatch { .. } => {
                self.metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
                self.teardown(raw.conn_id);
            }
            PacketOutcome::Unknown { malformed: false, .. }
            | PacketOutcome::SizeMismatch { .. }
            | PacketOutcome::Undecodable { .. }
            | PacketOutcome::RateLimited
            | PacketOutcome::Discarded => {
                self.metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
            PacketOutcome::Ignored { .. } => {}
        }
    }

    fn apply_event(&mut self, conn_id: u64, event: InboundEvent) {
        match event {
            InboundEvent::HelloReceived { version } => {
                if version != PROTOCOL_VERSION {
                    warn!(
                        "connection {}: protocol version {} unsupported (want {})",
                        conn_id, version, PROTOCOL_VERSION
                    );
                    self.send_packet(
                        conn_id,
                        PacketType::JoinDeny,
                        &JoinDenyPayload {
                            reason: deny_reason::VERSION_MISMATCH,
                        }
                        .encode(),
                    );
                    self.teardown(conn_id);
                    return;
                }
                self.send_packet(
                    conn_id,
                    PacketType::Welcome,
                    &VersionPayload {
                        version: PROTOCOL_VERSION,
                    }
                    .encode(),
                );
            }
            InboundEvent::JoinRequested => {
                if self.connections.count() > self.max_connections {
                    self.send_packet(
                        conn_id,
                        PacketType::JoinDeny,
                        &JoinDenyPayload {
                            reason: deny_reason::SERVER_FULL,
                        }
                        .encode(),
                    );
                    self.teardown(conn_id);
                    return;
                }
                let Some(conn) = self.connections.get_mut(conn_id) else {
                    return;
                };
                let peer_id = conn.peer_id;
                conn.accept_join();
                self.send_packet(
                    conn_id,
                    PacketType::JoinAccept,
                    &JoinAcceptPayload { peer_id }.encode(),
                );
                self.interest.subscribe(peer_id);
                info!("peer {} joined (connection {})", peer_id, conn_id);
            }
            InboundEvent::JoinDenied { reason } => {
                debug!("connection {}: join denied, reason {}", conn_id, reason);
                self.teardown(conn_id);
            }
            InboundEvent::PeerDisconnected => {
                info!("connection {} disconnected", conn_id);
                self.teardown(conn_id);
            }
            InboundEvent::PingReceived { time_ms } => {
                self.send_packet(
                    conn_id,
                    PacketType::Pong,
                    &TimePayload { time_ms }.encode(),
                );
            }
            InboundEvent::PongReceived { time_ms } => {
                let now_ms = self.started.elapsed().as_millis() as u64;
                let rtt = now_ms.saturating_sub(time_ms) as u32;
                if let Some(conn) = self.connections.get_mut(conn_id) {
                    conn.update_rtt(rtt);
                }
            }
            InboundEvent::StageUpdate { hash, stage } => {
                match self.replicator.apply_stage_by_hash(hash, stage) {
                    StageApply::Applied => {
                        self.metrics
                            .stage_updates_applied
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    StageApply::UnknownHash => {
                        self.metrics
                            .stage_updates_rejected
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            InboundEvent::MarkersReceived { count, .. } => {
                debug!("connection {}: {} world markers", conn_id, count);
            }
            InboundEvent::EntityDelta(delta) => {
                // Authoritative peer-side entity state feeds the index
                self.index.insert(delta.id, delta.position);
                self.dirty.insert(delta.id);
            }
            // Scope packets are server-emitted; inbound copies carry no
            // authority here
            InboundEvent::InterestAdded { entity_id } | InboundEvent::InterestRemoved { entity_id } => {
                debug!(
                    "connection {}: ignoring peer-sent interest packet for {}",
                    conn_id, entity_id
                );
            }
            InboundEvent::HandshakeCompleted { .. }
            | InboundEvent::JoinedGame { .. }
            | InboundEvent::AvatarMoved { .. } => {}
        }
    }

    /// Query visibility for every in-game peer and emit scope changes
    fn interest_pass(&mut self) {
        let peers: Vec<(u32, Vec2)> = self
            .connections
            .iter()
            .filter(|conn| conn.state() == ConnectionState::InGame)
            .map(|conn| (conn.peer_id, conn.avatar_pos))
            .collect();
        if peers.is_empty() {
            return;
        }

        let diffs = self.interest.tick(&self.index, &peers);
        for diff in diffs {
            let Some(conn_id) = self.connections.get_by_peer(diff.peer).map(|c| c.id) else {
                continue;
            };

            for &entity_id in &diff.entered {
                self.send_packet(
                    conn_id,
                    PacketType::InterestAdd,
                    &InterestPayload { entity_id }.encode(),
                );
                self.metrics.interest_entered.fetch_add(1, Ordering::Relaxed);
            }
            for &entity_id in &diff.left {
                self.send_packet(
                    conn_id,
                    PacketType::InterestRemove,
                    &InterestPayload { entity_id }.encode(),
                );
                self.metrics.interest_left.fetch_add(1, Ordering::Relaxed);
            }
            // Retained entities only get a delta when they actually moved
            let moved: Vec<EntityId> = diff
                .retained
                .iter()
                .copied()
                .filter(|id| self.dirty.contains(id))
                .collect();
            for entity_id in moved {
                let Some(position) = self.index.position_of(entity_id) else {
                    continue;
                };
                match (EntityDeltaPayload {
                    id: entity_id,
                    position,
                })
                .encode()
                {
                    Ok(body) => {
                        self.send_packet(conn_id, PacketType::EntityDelta, &body);
                        self.metrics.deltas_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => warn!("delta encode failed for entity {}: {}", entity_id, e),
                }
            }
        }
    }

    fn send_pings(&mut self) {
        let time_ms = self.started.elapsed().as_millis() as u64;
        let in_game: Vec<u64> = self
            .connections
            .iter()
            .filter(|conn| conn.state() == ConnectionState::InGame)
            .map(|conn| conn.id)
            .collect();
        for conn_id in in_game {
            self.send_packet(conn_id, PacketType::Ping, &TimePayload { time_ms }.encode());
        }
    }

    fn sweep_stale(&mut self) {
        let stale: Vec<u64> = self
            .connections
            .iter()
            .filter(|conn| conn.idle_time() > self.idle_timeout)
            .map(|conn| conn.id)
            .collect();
        for conn_id in stale {
            warn!("connection {} idle past timeout, dropping", conn_id);
            self.teardown(conn_id);
        }
    }

    /// Drop a connection and everything attached to it. Any frames still
    /// queued for it are discarded by the state machine on the next drain.
    fn teardown(&mut self, conn_id: u64) {
        let Some(mut conn) = self.connections.remove(conn_id) else {
            return;
        };
        conn.disconnect();
        self.interest.unsubscribe(conn.peer_id);
        self.outbound.remove(&conn_id);
        self.metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
        debug!("connection {} torn down", conn_id);
    }

    fn send_packet(&mut self, conn_id: u64, packet_type: PacketType, payload: &[u8]) {
        let Some(sender) = self.outbound.get(&conn_id) else {
            return;
        };
        match encode_frame(packet_type.id(), payload) {
            Ok(bytes) => {
                let len = bytes.len();
                if sender.send(bytes).is_err() {
                    debug!("writer for connection {} is gone", conn_id);
                    return;
                }
                if let Some(conn) = self.connections.get_mut(conn_id) {
                    conn.record_sent(len);
                }
                self.metrics.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .bytes_sent
                    .fetch_add(len as u64, Ordering::Relaxed);
            }
            Err(e) => warn!("frame encode failed for connection {}: {}", conn_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::framing::{Frame, PacketHeader};
    use crate::net::protocol::QuestStagePayload;

    fn test_session() -> SyncSession {
        let registry = QuestRegistry::from_entries([(0x1001u32, "q_intro"), (0x1002, "q_finale")]);
        let config = ServerConfig::default();
        SyncSession::new(&config, registry, Arc::new(Metrics::new()))
    }

    fn submit(session: &SyncSession, conn_id: u64, packet_type: PacketType, payload: Vec<u8>) {
        let header = PacketHeader::new(packet_type.id(), payload.len() as u16);
        assert!(session.inbox_sender().try_submit(RawPacket {
            conn_id,
            frame: Frame { header, payload },
        }));
    }

    fn recv_frame(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Frame {
        let bytes = rx.try_recv().expect("expected an outbound frame");
        Frame::parse(&bytes).expect("outbound frame should parse")
    }

    /// Walk a fresh connection through Hello + JoinRequest into InGame
    fn join(session: &mut SyncSession) -> (u64, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn_id = session.connect(tx);

        submit(
            session,
            conn_id,
            PacketType::Hello,
            VersionPayload { version: 1 }.encode(),
        );
        session.tick();
        let welcome = recv_frame(&mut rx);
        assert_eq!(welcome.header.packet_type, PacketType::Welcome.id());

        submit(session, conn_id, PacketType::JoinRequest, Vec::new());
        session.tick();
        let accept = recv_frame(&mut rx);
        assert_eq!(accept.header.packet_type, PacketType::JoinAccept.id());

        (conn_id, rx)
    }

    #[test]
    fn test_join_flow_subscribes_peer() {
        let mut session = test_session();
        let (conn_id, _rx) = join(&mut session);

        let conn = session.connection(conn_id).expect("connection should exist");
        assert_eq!(conn.state(), ConnectionState::InGame);
        assert_eq!(session.interest.subscriber_count(), 1);
    }

    #[test]
    fn test_entity_near_peer_enters_scope() {
        let mut session = test_session();
        let (_conn_id, mut rx) = join(&mut session);

        // Peer avatar sits at the origin; entity appears 10 units away
        session.upsert_entity(500, Vec2::new(10.0, 0.0));
        session.tick();

        let frame = recv_frame(&mut rx);
        assert_eq!(frame.header.packet_type, PacketType::InterestAdd.id());
        let interest = InterestPayload::decode(&frame.payload).expect("interest payload");
        assert_eq!(interest.entity_id, 500);
    }

    #[test]
    fn test_entity_leaving_radius_exits_scope() {
        let mut session = test_session();
        let (_conn_id, mut rx) = join(&mut session);

        session.upsert_entity(500, Vec2::new(10.0, 0.0));
        session.tick();
        recv_frame(&mut rx); // InterestAdd

        session.upsert_entity(500, Vec2::new(400.0, 0.0));
        session.tick();

        let frame = recv_frame(&mut rx);
        assert_eq!(frame.header.packet_type, PacketType::InterestRemove.id());
    }

    #[test]
    fn test_retained_moving_entity_gets_delta() {
        let mut session = test_session();
        let (_conn_id, mut rx) = join(&mut session);

        session.upsert_entity(500, Vec2::new(10.0, 0.0));
        session.tick();
        recv_frame(&mut rx); // InterestAdd

        // Still in scope, but moved: a delta, not a re-add
        session.upsert_entity(500, Vec2::new(15.0, 5.0));
        session.tick();

        let frame = recv_frame(&mut rx);
        assert_eq!(frame.header.packet_type, PacketType::EntityDelta.id());
        let delta = EntityDeltaPayload::decode(&frame.payload).expect("delta payload");
        assert_eq!(delta.id, 500);
        assert_eq!(delta.position, Vec2::new(15.0, 5.0));

        // Unmoved the next tick: nothing goes out
        session.tick();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_quest_stage_end_to_end() {
        let mut session = test_session();
        let (conn_id, _rx) = join(&mut session);

        submit(
            &session,
            conn_id,
            PacketType::QuestStage,
            QuestStagePayload {
                hash: 0x1001,
                stage: 3,
            }
            .encode(),
        );
        session.tick();
        assert_eq!(session.replicator().stage_of(0x1001), Some(3));

        // Unknown hash leaves the store untouched
        submit(
            &session,
            conn_id,
            PacketType::QuestStage,
            QuestStagePayload {
                hash: 0xDEAD_BEEF,
                stage: 9,
            }
            .encode(),
        );
        session.tick();
        assert_eq!(session.replicator().stage_of(0xDEAD_BEEF), None);
    }

    #[test]
    fn test_malformed_unknown_frame_tears_connection_down() {
        let mut session = test_session();
        let (conn_id, _rx) = join(&mut session);

        let header = PacketHeader::new(9999, 4);
        assert!(session.inbox_sender().try_submit(RawPacket {
            conn_id,
            frame: Frame {
                header,
                payload: vec![1, 2, 3],
            },
        }));
        session.tick();

        assert_eq!(session.connection_count(), 0);
        assert_eq!(session.interest.subscriber_count(), 0);
    }

    #[test]
    fn test_world_markers_mismatch_keeps_connection() {
        let mut session = test_session();
        let (conn_id, _rx) = join(&mut session);

        // 9 actual bytes declared as 10
        let payload = crate::net::protocol::WorldMarkersPayload {
            count: 1,
            blob: vec![0, 0, 0, 0, 0],
        }
        .encode();
        let header = PacketHeader::new(PacketType::WorldMarkers.id(), 10);
        assert!(session.inbox_sender().try_submit(RawPacket {
            conn_id,
            frame: Frame { header, payload },
        }));
        session.tick();

        assert_eq!(session.connection_count(), 1);
        let conn = session.connection(conn_id).expect("connection should exist");
        assert_eq!(conn.state(), ConnectionState::InGame);
    }

    #[test]
    fn test_peer_disconnect_unsubscribes() {
        let mut session = test_session();
        let (conn_id, _rx) = join(&mut session);

        submit(&session, conn_id, PacketType::Disconnect, Vec::new());
        session.tick();

        assert_eq!(session.connection_count(), 0);
        assert_eq!(session.interest.subscriber_count(), 0);
    }

    #[test]
    fn test_ping_gets_pong() {
        let mut session = test_session();
        let (conn_id, mut rx) = join(&mut session);

        submit(
            &session,
            conn_id,
            PacketType::Ping,
            TimePayload { time_ms: 42 }.encode(),
        );
        session.tick();

        let frame = recv_frame(&mut rx);
        assert_eq!(frame.header.packet_type, PacketType::Pong.id());
        let pong = TimePayload::decode(&frame.payload).expect("pong payload");
        assert_eq!(pong.time_ms, 42);
    }

    #[test]
    fn test_version_mismatch_denied() {
        let mut session = test_session();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn_id = session.connect(tx);

        submit(
            &session,
            conn_id,
            PacketType::Hello,
            VersionPayload { version: 99 }.encode(),
        );
        session.tick();

        let frame = recv_frame(&mut rx);
        assert_eq!(frame.header.packet_type, PacketType::JoinDeny.id());
        let deny = JoinDenyPayload::decode(&frame.payload).expect("deny payload");
        assert_eq!(deny.reason, deny_reason::VERSION_MISMATCH);
        assert_eq!(session.connection_count(), 0);
    }
}

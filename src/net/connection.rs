//! Per-connection packet ingestion and lifecycle
//!
//! Each connection walks Handshaking -> Lobby -> InGame, with Disconnected
//! reachable from anywhere as the error exit. Inbound packets are checked
//! against the validator table in `protocol`; unknown types with a frame
//! size lie are fatal, while per-type contract violations follow that
//! type's own policy.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::net::framing::{PacketHeader, HEADER_SIZE};
use crate::net::protocol::{
    descriptor_for, AvatarMovePayload, EntityDeltaPayload, InterestPayload, JoinAcceptPayload,
    JoinDenyPayload, MismatchPolicy, PacketType, QuestStagePayload, TimePayload, VersionPayload,
    WorldMarkersPayload,
};
use crate::util::vec2::Vec2;
use crate::world::progression::{QuestHash, QuestStage};
use crate::world::{EntityId, PeerId};

/// Packets a connection may burst before the limiter kicks in
const RATE_CAPACITY: f32 = 30.0;

/// Sustained packet budget per second
const RATE_REFILL_PER_SEC: f32 = 30.0;

/// RTT samples kept for the rolling average
const RTT_WINDOW: usize = 10;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Terminal, and the sink for any fatal validation failure
    Disconnected,
    /// Version exchange in progress
    Handshaking,
    /// Handshake done, session membership not yet granted
    Lobby,
    /// Established session; normal packet flow
    InGame,
}

/// Validated inbound packet, ready for dispatch by the session
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    HelloReceived { version: u32 },
    HandshakeCompleted { version: u32 },
    JoinRequested,
    JoinedGame { peer_id: u32 },
    JoinDenied { reason: u8 },
    PeerDisconnected,
    PingReceived { time_ms: u64 },
    PongReceived { time_ms: u64 },
    StageUpdate { hash: QuestHash, stage: QuestStage },
    MarkersReceived { count: u32, blob: Vec<u8> },
    InterestAdded { entity_id: EntityId },
    InterestRemoved { entity_id: EntityId },
    AvatarMoved { position: Vec2 },
    EntityDelta(EntityDeltaPayload),
}

/// What `handle_packet` did with a frame
#[derive(Debug, Clone, PartialEq)]
pub enum PacketOutcome {
    /// Validated and decoded; the event is ready for dispatch
    Processed(InboundEvent),
    /// No validator for this type id. If the frame sizes also disagreed,
    /// the connection is now Disconnected.
    Unknown { type_id: u16, malformed: bool },
    /// Known type failed its size contract; packet dropped, connection lives
    SizeMismatch { packet_type: PacketType },
    /// Known type failed its size contract; connection torn down
    FatalMismatch { packet_type: PacketType },
    /// Sizes checked out but the body would not decode; packet dropped
    Undecodable { packet_type: PacketType },
    /// Over the per-connection packet budget; dropped
    RateLimited,
    /// Valid packet with no effect in the current state
    Ignored { packet_type: PacketType },
    /// Connection already Disconnected; in-flight packets are discarded
    Discarded,
}

/// Continuous-refill token bucket for per-connection packet budgets
#[derive(Debug)]
pub struct RateLimiter {
    tokens: f32,
    capacity: f32,
    refill_per_sec: f32,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(capacity: f32, refill_per_sec: f32) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    /// Spend one token if available
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f32();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// A single peer connection and its protocol state machine
#[derive(Debug)]
pub struct Connection {
    pub id: u64,
    pub peer_id: PeerId,
    state: ConnectionState,
    /// Peer's avatar position, fed by AvatarMove packets; interest queries
    /// center here
    pub avatar_pos: Vec2,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub ping_ms: u32,
    rtt_samples: Vec<u32>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    limiter: RateLimiter,
}

impl Connection {
    /// Connections exist only once a handshake begins
    pub fn new(id: u64, peer_id: PeerId) -> Self {
        let now = Instant::now();
        debug!("connection {} (peer {}) handshaking", id, peer_id);
        Self {
            id,
            peer_id,
            state: ConnectionState::Handshaking,
            avatar_pos: Vec2::ZERO,
            created_at: now,
            last_activity: now,
            ping_ms: 0,
            rtt_samples: Vec::with_capacity(RTT_WINDOW),
            bytes_sent: 0,
            bytes_received: 0,
            packets_sent: 0,
            packets_received: 0,
            limiter: RateLimiter::new(RATE_CAPACITY, RATE_REFILL_PER_SEC),
        }
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state != ConnectionState::Disconnected
    }

    /// Server-side join grant: Lobby -> InGame
    pub fn accept_join(&mut self) {
        if self.state == ConnectionState::Lobby {
            self.transition(ConnectionState::InGame);
        }
    }

    /// Force the error exit from any state
    pub fn disconnect(&mut self) {
        self.transition(ConnectionState::Disconnected);
    }

    /// Validate one inbound frame and decode it into an event.
    ///
    /// Processing is strictly sequential per connection: the caller owns
    /// this connection exclusively and feeds frames one at a time.
    pub fn handle_packet(&mut self, header: PacketHeader, payload: &[u8]) -> PacketOutcome {
        if self.state == ConnectionState::Disconnected {
            debug!(
                "connection {}: discarding packet type {} after disconnect",
                self.id, header.packet_type
            );
            return PacketOutcome::Discarded;
        }

        self.record_received(HEADER_SIZE + payload.len());

        if !self.limiter.allow() {
            warn!(
                "connection {}: packet budget exceeded, dropping type {}",
                self.id, header.packet_type
            );
            return PacketOutcome::RateLimited;
        }

        let declared = header.size as usize;
        let actual = payload.len();

        let Some(packet_type) = PacketType::from_u16(header.packet_type) else {
            warn!(
                "connection {}: unhandled packet id={}",
                self.id, header.packet_type
            );
            if declared != actual {
                warn!(
                    "connection {}: malformed packet (declared {} bytes, received {})",
                    self.id, declared, actual
                );
                self.transition(ConnectionState::Disconnected);
                return PacketOutcome::Unknown {
                    type_id: header.packet_type,
                    malformed: true,
                };
            }
            return PacketOutcome::Unknown {
                type_id: header.packet_type,
                malformed: false,
            };
        };

        let descriptor = descriptor_for(packet_type);
        if !descriptor.rule.validate(declared, actual) {
            return match descriptor.on_mismatch {
                MismatchPolicy::DropPacket => {
                    warn!(
                        "connection {}: {} size mismatch (declared {}, received {}), dropping",
                        self.id, descriptor.name, declared, actual
                    );
                    PacketOutcome::SizeMismatch { packet_type }
                }
                MismatchPolicy::Disconnect => {
                    warn!(
                        "connection {}: {} size mismatch (declared {}, received {}), disconnecting",
                        self.id, descriptor.name, declared, actual
                    );
                    self.transition(ConnectionState::Disconnected);
                    PacketOutcome::FatalMismatch { packet_type }
                }
            };
        }

        self.dispatch(packet_type, payload)
    }

    fn dispatch(&mut self, packet_type: PacketType, payload: &[u8]) -> PacketOutcome {
        use PacketOutcome::*;

        match packet_type {
            PacketType::Hello => match VersionPayload::decode(payload) {
                Ok(hello) => {
                    if self.state == ConnectionState::Handshaking {
                        self.transition(ConnectionState::Lobby);
                    }
                    Processed(InboundEvent::HelloReceived {
                        version: hello.version,
                    })
                }
                Err(_) => self.undecodable(packet_type),
            },
            PacketType::Welcome => match VersionPayload::decode(payload) {
                Ok(welcome) => {
                    if self.state == ConnectionState::Handshaking {
                        self.transition(ConnectionState::Lobby);
                        Processed(InboundEvent::HandshakeCompleted {
                            version: welcome.version,
                        })
                    } else {
                        Ignored { packet_type }
                    }
                }
                Err(_) => self.undecodable(packet_type),
            },
            PacketType::Ping => match TimePayload::decode(payload) {
                Ok(ping) => Processed(InboundEvent::PingReceived {
                    time_ms: ping.time_ms,
                }),
                Err(_) => self.undecodable(packet_type),
            },
            PacketType::Pong => match TimePayload::decode(payload) {
                Ok(pong) => Processed(InboundEvent::PongReceived {
                    time_ms: pong.time_ms,
                }),
                Err(_) => self.undecodable(packet_type),
            },
            PacketType::JoinRequest => {
                if self.state == ConnectionState::Lobby {
                    Processed(InboundEvent::JoinRequested)
                } else {
                    debug!(
                        "connection {}: join request ignored in state {:?}",
                        self.id, self.state
                    );
                    Ignored { packet_type }
                }
            }
            PacketType::JoinAccept => match JoinAcceptPayload::decode(payload) {
                Ok(accept) => {
                    if self.state == ConnectionState::Lobby {
                        self.transition(ConnectionState::InGame);
                        Processed(InboundEvent::JoinedGame {
                            peer_id: accept.peer_id,
                        })
                    } else {
                        Ignored { packet_type }
                    }
                }
                Err(_) => self.undecodable(packet_type),
            },
            PacketType::JoinDeny => match JoinDenyPayload::decode(payload) {
                Ok(deny) => {
                    debug!("connection {}: join denied (reason {})", self.id, deny.reason);
                    self.transition(ConnectionState::Disconnected);
                    Processed(InboundEvent::JoinDenied {
                        reason: deny.reason,
                    })
                }
                Err(_) => self.undecodable(packet_type),
            },
            PacketType::Disconnect => {
                self.transition(ConnectionState::Disconnected);
                Processed(InboundEvent::PeerDisconnected)
            }
            PacketType::QuestStage => match QuestStagePayload::decode(payload) {
                Ok(update) => Processed(InboundEvent::StageUpdate {
                    hash: update.hash,
                    stage: update.stage,
                }),
                Err(_) => self.undecodable(packet_type),
            },
            PacketType::WorldMarkers => match WorldMarkersPayload::decode(payload) {
                Ok(markers) => {
                    debug!(
                        "connection {}: WorldMarkers processed ({} markers, {} blob bytes)",
                        self.id,
                        markers.count,
                        markers.blob.len()
                    );
                    Processed(InboundEvent::MarkersReceived {
                        count: markers.count,
                        blob: markers.blob,
                    })
                }
                Err(_) => self.undecodable(packet_type),
            },
            PacketType::InterestAdd => match InterestPayload::decode(payload) {
                Ok(interest) => Processed(InboundEvent::InterestAdded {
                    entity_id: interest.entity_id,
                }),
                Err(_) => self.undecodable(packet_type),
            },
            PacketType::InterestRemove => match InterestPayload::decode(payload) {
                Ok(interest) => Processed(InboundEvent::InterestRemoved {
                    entity_id: interest.entity_id,
                }),
                Err(_) => self.undecodable(packet_type),
            },
            PacketType::AvatarMove => match AvatarMovePayload::decode(payload) {
                Ok(movement) => {
                    self.avatar_pos = movement.position;
                    Processed(InboundEvent::AvatarMoved {
                        position: movement.position,
                    })
                }
                Err(_) => self.undecodable(packet_type),
            },
            PacketType::EntityDelta => match EntityDeltaPayload::decode(payload) {
                Ok(delta) => Processed(InboundEvent::EntityDelta(delta)),
                Err(_) => self.undecodable(packet_type),
            },
        }
    }

    fn undecodable(&mut self, packet_type: PacketType) -> PacketOutcome {
        warn!(
            "connection {}: {} payload would not decode, dropping",
            self.id,
            descriptor_for(packet_type).name
        );
        PacketOutcome::Undecodable { packet_type }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(
                "connection {} state {:?} -> {:?}",
                self.id, self.state, next
            );
            self.state = next;
        }
    }

    /// Update last-activity and inbound counters
    pub fn record_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.packets_received += 1;
        self.last_activity = Instant::now();
    }

    /// Update outbound counters
    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.packets_sent += 1;
    }

    /// Fold a new RTT sample into the rolling average
    pub fn update_rtt(&mut self, rtt_ms: u32) {
        if self.rtt_samples.len() >= RTT_WINDOW {
            self.rtt_samples.remove(0);
        }
        self.rtt_samples.push(rtt_ms);

        let sum: u32 = self.rtt_samples.iter().sum();
        self.ping_ms = sum / self.rtt_samples.len() as u32;
    }

    /// Time since the last inbound packet
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Owns all live connections and the peer-id mapping
pub struct ConnectionManager {
    connections: HashMap<u64, Connection>,
    peer_index: HashMap<PeerId, u64>,
    next_peer_id: PeerId,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            peer_index: HashMap::new(),
            next_peer_id: 1,
        }
    }

    /// Create a connection with a random id and the next peer id
    pub fn create(&mut self) -> u64 {
        let id = loop {
            let candidate = rand::random::<u64>();
            if !self.connections.contains_key(&candidate) {
                break candidate;
            }
        };
        let peer_id = self.next_peer_id;
        self.next_peer_id += 1;

        self.connections.insert(id, Connection::new(id, peer_id));
        self.peer_index.insert(peer_id, id);
        id
    }

    pub fn get(&self, id: u64) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn get_by_peer(&self, peer_id: PeerId) -> Option<&Connection> {
        self.peer_index
            .get(&peer_id)
            .and_then(|id| self.connections.get(id))
    }

    pub fn remove(&mut self, id: u64) -> Option<Connection> {
        let conn = self.connections.remove(&id)?;
        self.peer_index.remove(&conn.peer_id);
        Some(conn)
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.connections.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Drop connections idle past `max_idle`, returning their ids
    pub fn cleanup_stale(&mut self, max_idle: Duration) -> Vec<u64> {
        let stale: Vec<u64> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.idle_time() > max_idle)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.remove(*id);
        }
        stale
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

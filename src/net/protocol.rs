//! Packet types, per-type validation contracts, and payload codecs
//!
//! Each packet type carries its own size contract and failure policy in a
//! descriptor table. The generic frame check (declared size vs bytes
//! received) applies to unknown types and is fatal; per-type contracts
//! decide for themselves whether a violation tears the connection down or
//! just discards the packet.

use serde::{Deserialize, Serialize};

use crate::net::framing::{FrameBuilder, FrameReader};
use crate::util::vec2::Vec2;
use crate::world::progression::{QuestHash, QuestStage};
use crate::world::EntityId;

/// Protocol-level decode failures
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Truncated {0} payload")]
    Truncated(&'static str),
    #[error("Undecodable delta payload: {0}")]
    Delta(#[from] bincode::error::DecodeError),
}

/// Wire identifiers for every packet type this core understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    Hello = 1,
    Welcome = 2,
    Ping = 3,
    Pong = 4,
    JoinRequest = 5,
    JoinAccept = 6,
    JoinDeny = 7,
    Disconnect = 8,
    QuestStage = 9,
    WorldMarkers = 10,
    InterestAdd = 11,
    InterestRemove = 12,
    AvatarMove = 13,
    EntityDelta = 14,
}

impl PacketType {
    pub fn from_u16(value: u16) -> Option<PacketType> {
        match value {
            1 => Some(PacketType::Hello),
            2 => Some(PacketType::Welcome),
            3 => Some(PacketType::Ping),
            4 => Some(PacketType::Pong),
            5 => Some(PacketType::JoinRequest),
            6 => Some(PacketType::JoinAccept),
            7 => Some(PacketType::JoinDeny),
            8 => Some(PacketType::Disconnect),
            9 => Some(PacketType::QuestStage),
            10 => Some(PacketType::WorldMarkers),
            11 => Some(PacketType::InterestAdd),
            12 => Some(PacketType::InterestRemove),
            13 => Some(PacketType::AvatarMove),
            14 => Some(PacketType::EntityDelta),
            _ => None,
        }
    }

    #[inline]
    pub fn id(self) -> u16 {
        self as u16
    }
}

/// Expected-size contract for a packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeRule {
    /// Declared and actual size must both equal this value
    Exact(u16),
    /// Declared and actual must agree and be at least this value
    AtLeast(u16),
    /// Payload is a fixed prefix followed by a variable blob; the declared
    /// size must equal prefix + blob length
    PrefixPlusBlob { prefix: u16 },
}

impl SizeRule {
    pub fn validate(self, declared: usize, actual: usize) -> bool {
        match self {
            SizeRule::Exact(n) => declared == n as usize && actual == n as usize,
            SizeRule::AtLeast(n) => declared == actual && actual >= n as usize,
            SizeRule::PrefixPlusBlob { prefix } => {
                actual >= prefix as usize && declared == actual
            }
        }
    }
}

/// What happens to the connection when a packet fails its size contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchPolicy {
    /// Discard the packet, log, and keep the connection alive
    DropPacket,
    /// Tear the connection down; no retry
    Disconnect,
}

/// Validation descriptor looked up per packet type
#[derive(Debug, Clone, Copy)]
pub struct PacketDescriptor {
    pub name: &'static str,
    pub rule: SizeRule,
    pub on_mismatch: MismatchPolicy,
}

/// Validator table. Handshake frames are load-bearing for the session, so a
/// malformed one is fatal; everything else is dropped and the connection
/// keeps going.
pub fn descriptor_for(packet_type: PacketType) -> PacketDescriptor {
    use PacketType::*;
    match packet_type {
        Hello => PacketDescriptor {
            name: "Hello",
            rule: SizeRule::Exact(4),
            on_mismatch: MismatchPolicy::Disconnect,
        },
        Welcome => PacketDescriptor {
            name: "Welcome",
            rule: SizeRule::Exact(4),
            on_mismatch: MismatchPolicy::Disconnect,
        },
        Ping => PacketDescriptor {
            name: "Ping",
            rule: SizeRule::Exact(8),
            on_mismatch: MismatchPolicy::DropPacket,
        },
        Pong => PacketDescriptor {
            name: "Pong",
            rule: SizeRule::Exact(8),
            on_mismatch: MismatchPolicy::DropPacket,
        },
        JoinRequest => PacketDescriptor {
            name: "JoinRequest",
            rule: SizeRule::Exact(0),
            on_mismatch: MismatchPolicy::DropPacket,
        },
        JoinAccept => PacketDescriptor {
            name: "JoinAccept",
            rule: SizeRule::Exact(4),
            on_mismatch: MismatchPolicy::DropPacket,
        },
        JoinDeny => PacketDescriptor {
            name: "JoinDeny",
            rule: SizeRule::Exact(1),
            on_mismatch: MismatchPolicy::DropPacket,
        },
        Disconnect => PacketDescriptor {
            name: "Disconnect",
            rule: SizeRule::Exact(0),
            on_mismatch: MismatchPolicy::DropPacket,
        },
        QuestStage => PacketDescriptor {
            name: "QuestStage",
            rule: SizeRule::Exact(6),
            on_mismatch: MismatchPolicy::DropPacket,
        },
        WorldMarkers => PacketDescriptor {
            name: "WorldMarkers",
            rule: SizeRule::PrefixPlusBlob { prefix: 4 },
            on_mismatch: MismatchPolicy::DropPacket,
        },
        InterestAdd => PacketDescriptor {
            name: "InterestAdd",
            rule: SizeRule::Exact(4),
            on_mismatch: MismatchPolicy::DropPacket,
        },
        InterestRemove => PacketDescriptor {
            name: "InterestRemove",
            rule: SizeRule::Exact(4),
            on_mismatch: MismatchPolicy::DropPacket,
        },
        AvatarMove => PacketDescriptor {
            name: "AvatarMove",
            rule: SizeRule::Exact(8),
            on_mismatch: MismatchPolicy::DropPacket,
        },
        EntityDelta => PacketDescriptor {
            name: "EntityDelta",
            rule: SizeRule::AtLeast(1),
            on_mismatch: MismatchPolicy::DropPacket,
        },
    }
}

// ============================================================================
// Payload codecs
// ============================================================================

/// Protocol version exchanged during the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Hello / Welcome body: the sender's protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionPayload {
    pub version: u32,
}

impl VersionPayload {
    pub fn encode(&self) -> Vec<u8> {
        FrameBuilder::new().write_u32(self.version).build()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = FrameReader::new(payload);
        let version = reader.read_u32().ok_or(ProtocolError::Truncated("version"))?;
        Ok(Self { version })
    }
}

/// Ping / Pong body: sender timestamp in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimePayload {
    pub time_ms: u64,
}

impl TimePayload {
    pub fn encode(&self) -> Vec<u8> {
        FrameBuilder::new().write_u64(self.time_ms).build()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = FrameReader::new(payload);
        let time_ms = reader.read_u64().ok_or(ProtocolError::Truncated("time"))?;
        Ok(Self { time_ms })
    }
}

/// JoinAccept body: the peer id the server assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinAcceptPayload {
    pub peer_id: u32,
}

impl JoinAcceptPayload {
    pub fn encode(&self) -> Vec<u8> {
        FrameBuilder::new().write_u32(self.peer_id).build()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = FrameReader::new(payload);
        let peer_id = reader.read_u32().ok_or(ProtocolError::Truncated("join accept"))?;
        Ok(Self { peer_id })
    }
}

/// JoinDeny body: a one-byte reason code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinDenyPayload {
    pub reason: u8,
}

pub mod deny_reason {
    pub const SERVER_FULL: u8 = 1;
    pub const VERSION_MISMATCH: u8 = 2;
}

impl JoinDenyPayload {
    pub fn encode(&self) -> Vec<u8> {
        FrameBuilder::new().write_u8(self.reason).build()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = FrameReader::new(payload);
        let reason = reader.read_u8().ok_or(ProtocolError::Truncated("join deny"))?;
        Ok(Self { reason })
    }
}

/// Progression update: quest hash plus target stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuestStagePayload {
    pub hash: QuestHash,
    pub stage: QuestStage,
}

impl QuestStagePayload {
    pub fn encode(&self) -> Vec<u8> {
        FrameBuilder::new()
            .write_u32(self.hash)
            .write_u16(self.stage)
            .build()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = FrameReader::new(payload);
        let hash = reader.read_u32().ok_or(ProtocolError::Truncated("quest stage"))?;
        let stage = reader.read_u16().ok_or(ProtocolError::Truncated("quest stage"))?;
        Ok(Self { hash, stage })
    }
}

/// World markers: a 4-byte marker count followed by an opaque blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldMarkersPayload {
    pub count: u32,
    pub blob: Vec<u8>,
}

impl WorldMarkersPayload {
    pub fn encode(&self) -> Vec<u8> {
        FrameBuilder::new()
            .write_u32(self.count)
            .write(&self.blob)
            .build()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = FrameReader::new(payload);
        let count = reader.read_u32().ok_or(ProtocolError::Truncated("world markers"))?;
        Ok(Self {
            count,
            blob: reader.remaining().to_vec(),
        })
    }
}

/// InterestAdd / InterestRemove body: the entity entering or leaving scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterestPayload {
    pub entity_id: EntityId,
}

impl InterestPayload {
    pub fn encode(&self) -> Vec<u8> {
        FrameBuilder::new().write_u32(self.entity_id).build()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = FrameReader::new(payload);
        let entity_id = reader.read_u32().ok_or(ProtocolError::Truncated("interest"))?;
        Ok(Self { entity_id })
    }
}

/// AvatarMove body: the peer's own avatar position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AvatarMovePayload {
    pub position: Vec2,
}

impl AvatarMovePayload {
    pub fn encode(&self) -> Vec<u8> {
        FrameBuilder::new()
            .write_f32(self.position.x)
            .write_f32(self.position.y)
            .build()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = FrameReader::new(payload);
        let x = reader.read_f32().ok_or(ProtocolError::Truncated("avatar move"))?;
        let y = reader.read_f32().ok_or(ProtocolError::Truncated("avatar move"))?;
        Ok(Self {
            position: Vec2::new(x, y),
        })
    }
}

/// Per-entity state carried to peers that already have the entity in scope
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntityDeltaPayload {
    pub id: EntityId,
    pub position: Vec2,
}

impl EntityDeltaPayload {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::serde::encode_to_vec(self, bincode::config::legacy())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (delta, _) = bincode::serde::decode_from_slice(payload, bincode::config::legacy())?;
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_round_trip() {
        for id in 1..=14u16 {
            let pt = PacketType::from_u16(id).unwrap();
            assert_eq!(pt.id(), id);
        }
        assert_eq!(PacketType::from_u16(0), None);
        assert_eq!(PacketType::from_u16(9999), None);
    }

    #[test]
    fn test_exact_rule() {
        let rule = SizeRule::Exact(6);
        assert!(rule.validate(6, 6));
        assert!(!rule.validate(6, 5));
        assert!(!rule.validate(7, 6));
    }

    #[test]
    fn test_at_least_rule() {
        let rule = SizeRule::AtLeast(4);
        assert!(rule.validate(4, 4));
        assert!(rule.validate(16, 16));
        assert!(!rule.validate(3, 3));
        assert!(!rule.validate(16, 12));
    }

    #[test]
    fn test_world_markers_rule() {
        let rule = descriptor_for(PacketType::WorldMarkers).rule;
        // Declared 9 with a 5-byte blob after the 4-byte count: valid
        assert!(rule.validate(9, 9));
        // Declared 10 with the same 9 actual bytes: mismatch
        assert!(!rule.validate(10, 9));
        // Too short to even hold the count field
        assert!(!rule.validate(2, 2));
    }

    #[test]
    fn test_policy_split() {
        assert_eq!(
            descriptor_for(PacketType::WorldMarkers).on_mismatch,
            MismatchPolicy::DropPacket
        );
        assert_eq!(
            descriptor_for(PacketType::Hello).on_mismatch,
            MismatchPolicy::Disconnect
        );
    }

    #[test]
    fn test_quest_stage_codec() {
        let payload = QuestStagePayload {
            hash: 0xDEAD_BEEF,
            stage: 7,
        };
        let bytes = payload.encode();
        assert_eq!(bytes.len(), 6);
        assert_eq!(QuestStagePayload::decode(&bytes).unwrap(), payload);

        assert!(QuestStagePayload::decode(&bytes[..4]).is_err());
    }

    #[test]
    fn test_world_markers_codec() {
        let payload = WorldMarkersPayload {
            count: 3,
            blob: vec![1, 2, 3, 4, 5],
        };
        let bytes = payload.encode();
        assert_eq!(bytes.len(), 9);
        assert_eq!(WorldMarkersPayload::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn test_scalar_codecs() {
        let v = VersionPayload { version: 3 };
        assert_eq!(VersionPayload::decode(&v.encode()).unwrap(), v);

        let t = TimePayload { time_ms: 123_456 };
        assert_eq!(TimePayload::decode(&t.encode()).unwrap(), t);

        let j = JoinAcceptPayload { peer_id: 9 };
        assert_eq!(JoinAcceptPayload::decode(&j.encode()).unwrap(), j);

        let d = JoinDenyPayload {
            reason: deny_reason::SERVER_FULL,
        };
        assert_eq!(JoinDenyPayload::decode(&d.encode()).unwrap(), d);

        let i = InterestPayload { entity_id: 77 };
        assert_eq!(InterestPayload::decode(&i.encode()).unwrap(), i);

        let m = AvatarMovePayload {
            position: Vec2::new(12.5, -3.0),
        };
        assert_eq!(AvatarMovePayload::decode(&m.encode()).unwrap(), m);
    }

    #[test]
    fn test_entity_delta_bincode_round_trip() {
        let delta = EntityDeltaPayload {
            id: 501,
            position: Vec2::new(101.0, -44.5),
        };
        let bytes = delta.encode().unwrap();
        assert_eq!(EntityDeltaPayload::decode(&bytes).unwrap(), delta);
    }

    #[test]
    fn test_empty_payload_decode_fails() {
        assert!(VersionPayload::decode(&[]).is_err());
        assert!(QuestStagePayload::decode(&[]).is_err());
        assert!(WorldMarkersPayload::decode(&[1, 2]).is_err());
    }
}

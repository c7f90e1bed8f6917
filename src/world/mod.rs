pub mod interest;
pub mod progression;
pub mod spatial;

/// Stable identifier for a replicated world entity
pub type EntityId = u32;

/// Identifier for a connected peer
pub type PeerId = u32;

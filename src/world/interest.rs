//! Interest management: decides which entities each peer hears about
//!
//! Once per tick every subscribed peer gets one spatial query around its
//! position. The result is diffed against the previous tick's visible set
//! to produce enter/leave events; entities present in both sets are delta
//! candidates rather than full re-transmissions. Replication volume scales
//! with what each peer can see, not with world population.

use hashbrown::{HashMap, HashSet};
use smallvec::SmallVec;

use crate::util::vec2::Vec2;
use crate::world::spatial::SpatialIndex;
use crate::world::{EntityId, PeerId};

/// Default visibility radius in world units
pub const DEFAULT_INTEREST_RADIUS: f32 = 80.0;

/// Visibility change for one peer over one tick
#[derive(Debug)]
pub struct InterestDiff {
    pub peer: PeerId,
    /// Visible now, not visible last tick: needs a full spawn/state send
    pub entered: SmallVec<[EntityId; 8]>,
    /// Visible last tick, gone now: needs a despawn notice
    pub left: SmallVec<[EntityId; 8]>,
    /// Visible both ticks: candidate for a state delta
    pub retained: SmallVec<[EntityId; 8]>,
}

impl InterestDiff {
    pub fn is_unchanged(&self) -> bool {
        self.entered.is_empty() && self.left.is_empty()
    }
}

/// Composes spatial queries with per-peer subscriptions
pub struct InterestCoordinator {
    radius: f32,
    subscriptions: HashMap<PeerId, HashSet<EntityId>>,
    query_buf: Vec<EntityId>,
}

impl InterestCoordinator {
    pub fn new(radius: f32) -> Self {
        Self {
            radius,
            subscriptions: HashMap::new(),
            query_buf: Vec::with_capacity(64),
        }
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    /// Begin tracking visibility for a peer with an empty visible set
    pub fn subscribe(&mut self, peer: PeerId) {
        self.subscriptions.entry(peer).or_default();
    }

    /// Stop tracking a peer. Returns false if it was not subscribed.
    pub fn unsubscribe(&mut self, peer: PeerId) -> bool {
        self.subscriptions.remove(&peer).is_some()
    }

    pub fn is_subscribed(&self, peer: PeerId) -> bool {
        self.subscriptions.contains_key(&peer)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Currently-visible entity set for a peer
    pub fn visible(&self, peer: PeerId) -> Option<&HashSet<EntityId>> {
        self.subscriptions.get(&peer)
    }

    /// Run the per-tick visibility pass: one spatial query per subscribed
    /// peer in `peer_positions`, diffed against the prior visible set.
    /// Peers without a subscription are skipped.
    pub fn tick(
        &mut self,
        index: &SpatialIndex,
        peer_positions: &[(PeerId, Vec2)],
    ) -> Vec<InterestDiff> {
        let mut diffs = Vec::with_capacity(peer_positions.len());

        for &(peer, pos) in peer_positions {
            if !self.subscriptions.contains_key(&peer) {
                continue;
            }
            index.query_into(pos, self.radius, &mut self.query_buf);
            let now: HashSet<EntityId> = self.query_buf.iter().copied().collect();

            let Some(prev) = self.subscriptions.get_mut(&peer) else {
                continue;
            };

            let mut diff = InterestDiff {
                peer,
                entered: SmallVec::new(),
                left: SmallVec::new(),
                retained: SmallVec::new(),
            };
            for &id in &now {
                if prev.contains(&id) {
                    diff.retained.push(id);
                } else {
                    diff.entered.push(id);
                }
            }
            for &id in prev.iter() {
                if !now.contains(&id) {
                    diff.left.push(id);
                }
            }

            *prev = now;
            diffs.push(diff);
        }

        diffs
    }
}

impl Default for InterestCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_INTEREST_RADIUS)
    }
}

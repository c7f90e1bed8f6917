//! Quadtree spatial index for interest-based replication culling
//!
//! Maps entity ids to 2D positions and answers circular range queries.
//! Nodes live in an arena and reference their children by index, so
//! subdivision moves ids between slots without any owning links back
//! up the tree.

use hashbrown::HashMap;

use crate::util::vec2::Vec2;
use crate::world::EntityId;

/// Ids a leaf holds before it subdivides
pub const NODE_CAPACITY: usize = 32;

/// Maximum subdivision depth; a node at this depth accepts unbounded ids
pub const MAX_DEPTH: u8 = 6;

/// Half-extent of the default world bounds (world units)
pub const DEFAULT_WORLD_EXTENT: f32 = 512.0;

/// Axis-aligned bounding box, inclusive on all edges
#[derive(Debug, Clone, Copy)]
struct Aabb {
    min_x: f32,
    min_y: f32,
    max_x: f32,
    max_y: f32,
}

impl Aabb {
    #[inline]
    fn contains(&self, p: Vec2) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }

    /// Circle/box overlap test: clamp the circle center to the box and
    /// compare the clamped point's squared distance to the squared radius
    #[inline]
    fn intersects_circle(&self, center: Vec2, radius_sq: f32) -> bool {
        let x = center.x.clamp(self.min_x, self.max_x);
        let y = center.y.clamp(self.min_y, self.max_y);
        let dx = center.x - x;
        let dy = center.y - y;
        dx * dx + dy * dy <= radius_sq
    }

    /// One of the four equal sub-quadrants (0 = min/min, 1 = max/min,
    /// 2 = min/max, 3 = max/max)
    fn quadrant(&self, index: usize) -> Aabb {
        let half_x = (self.max_x - self.min_x) * 0.5;
        let half_y = (self.max_y - self.min_y) * 0.5;
        let off_x = if index % 2 == 1 { half_x } else { 0.0 };
        let off_y = if index >= 2 { half_y } else { 0.0 };
        Aabb {
            min_x: self.min_x + off_x,
            min_y: self.min_y + off_y,
            max_x: self.min_x + off_x + half_x,
            max_y: self.min_y + off_y + half_y,
        }
    }
}

/// A single arena slot: leaf until `children` is set, after which `ids`
/// holds only residual entries that fit no single child
#[derive(Debug)]
struct QuadNode {
    bounds: Aabb,
    depth: u8,
    ids: Vec<EntityId>,
    children: Option<[usize; 4]>,
}

impl QuadNode {
    fn new(bounds: Aabb, depth: u8) -> Self {
        Self {
            bounds,
            depth,
            ids: Vec::new(),
            children: None,
        }
    }
}

/// Bounded-depth quadtree over entity positions
///
/// Holds a non-owning id -> position association; the simulation owns the
/// entities themselves. Re-inserting an id that is already present replaces
/// the prior entry rather than duplicating it.
pub struct SpatialIndex {
    nodes: Vec<QuadNode>,
    positions: HashMap<EntityId, Vec2>,
}

impl SpatialIndex {
    /// Create an index covering `[-half_extent, half_extent]` on both axes.
    /// Positions outside the bounds are still stored; they accumulate as
    /// residual entries on the root once it subdivides.
    pub fn new(half_extent: f32) -> Self {
        let bounds = Aabb {
            min_x: -half_extent,
            min_y: -half_extent,
            max_x: half_extent,
            max_y: half_extent,
        };
        Self {
            nodes: vec![QuadNode::new(bounds, 0)],
            positions: HashMap::new(),
        }
    }

    /// Number of entities currently stored
    #[inline]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Stored position for an id, if present
    #[inline]
    pub fn position_of(&self, id: EntityId) -> Option<Vec2> {
        self.positions.get(&id).copied()
    }

    /// Insert an entity, replacing any prior entry for the same id
    pub fn insert(&mut self, id: EntityId, pos: Vec2) {
        if self.positions.contains_key(&id) {
            self.remove(id);
        }
        self.positions.insert(id, pos);
        self.insert_at(0, id, pos);
    }

    /// Remove an entity. Returns false if the id was not present.
    pub fn remove(&mut self, id: EntityId) -> bool {
        let Some(pos) = self.positions.remove(&id) else {
            return false;
        };
        self.remove_at(0, id, pos)
    }

    /// Collect every id whose position lies within `radius` of `center`
    /// (inclusive) into `out`, clearing it first
    pub fn query_into(&self, center: Vec2, radius: f32, out: &mut Vec<EntityId>) {
        out.clear();
        self.query_at(0, center, radius * radius, out);
    }

    /// Convenience wrapper around [`query_into`](Self::query_into)
    pub fn query(&self, center: Vec2, radius: f32) -> Vec<EntityId> {
        let mut out = Vec::new();
        self.query_into(center, radius, &mut out);
        out
    }

    fn insert_at(&mut self, node_idx: usize, id: EntityId, pos: Vec2) {
        let node = &self.nodes[node_idx];
        if node.depth >= MAX_DEPTH
            || (node.children.is_none() && node.ids.len() < NODE_CAPACITY)
        {
            self.nodes[node_idx].ids.push(id);
            return;
        }
        if self.nodes[node_idx].children.is_none() {
            self.subdivide(node_idx);
        }
        let children = self.nodes[node_idx].children;
        match children {
            Some(children) => {
                for child_idx in children {
                    if self.nodes[child_idx].bounds.contains(pos) {
                        self.insert_at(child_idx, id, pos);
                        return;
                    }
                }
                // No single child contains the point; keep it here
                self.nodes[node_idx].ids.push(id);
            }
            None => self.nodes[node_idx].ids.push(id),
        }
    }

    /// Split a full leaf into four children and redistribute its ids by
    /// recursive re-insertion; entries that fit no single child stay behind
    fn subdivide(&mut self, node_idx: usize) {
        let bounds = self.nodes[node_idx].bounds;
        let depth = self.nodes[node_idx].depth;
        let mut children = [0usize; 4];
        for (i, slot) in children.iter_mut().enumerate() {
            *slot = self.nodes.len();
            self.nodes.push(QuadNode::new(bounds.quadrant(i), depth + 1));
        }
        self.nodes[node_idx].children = Some(children);

        let stored = std::mem::take(&mut self.nodes[node_idx].ids);
        for id in stored {
            if let Some(&pos) = self.positions.get(&id) {
                self.insert_at(node_idx, id, pos);
            }
        }
    }

    fn remove_at(&mut self, node_idx: usize, id: EntityId, pos: Vec2) -> bool {
        if let Some(i) = self.nodes[node_idx].ids.iter().position(|&e| e == id) {
            self.nodes[node_idx].ids.swap_remove(i);
            return true;
        }
        if let Some(children) = self.nodes[node_idx].children {
            for child_idx in children {
                if self.nodes[child_idx].bounds.contains(pos)
                    && self.remove_at(child_idx, id, pos)
                {
                    return true;
                }
            }
        }
        false
    }

    fn query_at(&self, node_idx: usize, center: Vec2, radius_sq: f32, out: &mut Vec<EntityId>) {
        let node = &self.nodes[node_idx];
        if !node.bounds.intersects_circle(center, radius_sq) {
            return;
        }
        // Residual ids at internal nodes are tested exactly like leaf ids
        for &id in &node.ids {
            if let Some(&pos) = self.positions.get(&id) {
                if pos.distance_sq_to(center) <= radius_sq {
                    out.push(id);
                }
            }
        }
        if let Some(children) = node.children {
            for child_idx in children {
                self.query_at(child_idx, center, radius_sq, out);
            }
        }
    }
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new(DEFAULT_WORLD_EXTENT)
    }
}

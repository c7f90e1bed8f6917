//! Authoritative quest-stage replication
//!
//! Stage updates arrive from peers and are applied against a read-only
//! registry of known quest hashes supplied by game content. Updates for
//! hashes the registry does not know are rejected without touching the
//! stage store.

use std::path::Path;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

/// Errors loading a quest registry from content data
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed registry entry on line {0}")]
    Parse(usize),
}

/// FNV-style 32-bit quest identifier supplied by game content
pub type QuestHash = u32;

/// Current stage of a quest
pub type QuestStage = u16;

/// Read-only mapping from quest hash to a descriptive name.
///
/// Built once at startup from content data; this core only ever queries
/// membership.
#[derive(Debug, Default)]
pub struct QuestRegistry {
    names: FxHashMap<QuestHash, String>,
}

impl QuestRegistry {
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (QuestHash, S)>,
        S: Into<String>,
    {
        Self {
            names: entries
                .into_iter()
                .map(|(hash, name)| (hash, name.into()))
                .collect(),
        }
    }

    /// Load registry entries from a content file: one `<hex-hash> <name>`
    /// pair per line, `#` for comments
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let text = std::fs::read_to_string(path)?;
        let mut names = FxHashMap::default();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (hash_str, name) = line
                .split_once(char::is_whitespace)
                .ok_or(RegistryError::Parse(idx + 1))?;
            let hash_str = hash_str.trim_start_matches("0x").trim_start_matches("0X");
            let hash = QuestHash::from_str_radix(hash_str, 16)
                .map_err(|_| RegistryError::Parse(idx + 1))?;
            names.insert(hash, name.trim().to_string());
        }
        Ok(Self { names })
    }

    #[inline]
    pub fn contains(&self, hash: QuestHash) -> bool {
        self.names.contains_key(&hash)
    }

    pub fn name_of(&self, hash: QuestHash) -> Option<&str> {
        self.names.get(&hash).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Result of a stage application attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageApply {
    /// Stage map entry created or overwritten
    Applied,
    /// Hash absent from the registry; stage map untouched
    UnknownHash,
}

/// Applies authoritative progression updates to the quest stage store
pub struct StageReplicator {
    registry: QuestRegistry,
    stages: FxHashMap<QuestHash, QuestStage>,
}

impl StageReplicator {
    pub fn new(registry: QuestRegistry) -> Self {
        Self {
            registry,
            stages: FxHashMap::default(),
        }
    }

    /// Apply a stage update. Last-write-wins, unconditionally: there is no
    /// ordering or staleness guard, so an update arriving out of order
    /// overwrites a newer stage with an older one. Known limitation.
    pub fn apply_stage_by_hash(&mut self, hash: QuestHash, stage: QuestStage) -> StageApply {
        if !self.registry.contains(hash) {
            warn!("ignoring stage update for unknown quest hash {:#010x}", hash);
            return StageApply::UnknownHash;
        }
        self.stages.insert(hash, stage);
        debug!(
            "quest {} ({:#010x}) -> stage {}",
            self.registry.name_of(hash).unwrap_or("?"),
            hash,
            stage
        );
        StageApply::Applied
    }

    /// Current stage for a quest, if any update has been applied
    #[inline]
    pub fn stage_of(&self, hash: QuestHash) -> Option<QuestStage> {
        self.stages.get(&hash).copied()
    }

    pub fn registry(&self) -> &QuestRegistry {
        &self.registry
    }

    /// Number of quests with a recorded stage
    pub fn tracked_count(&self) -> usize {
        self.stages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replicator() -> StageReplicator {
        StageReplicator::new(QuestRegistry::from_entries([
            (0x0000_1001, "q_watson_gig"),
            (0x0000_1002, "q_heist"),
        ]))
    }

    #[test]
    fn test_unknown_hash_is_rejected() {
        let mut rep = replicator();

        let result = rep.apply_stage_by_hash(0xDEAD_BEEF, 3);

        assert_eq!(result, StageApply::UnknownHash);
        assert_eq!(rep.stage_of(0xDEAD_BEEF), None);
        assert_eq!(rep.tracked_count(), 0);
    }

    #[test]
    fn test_registered_hash_is_applied() {
        let mut rep = replicator();

        assert_eq!(rep.apply_stage_by_hash(0x0000_1001, 3), StageApply::Applied);
        assert_eq!(rep.stage_of(0x0000_1001), Some(3));
    }

    #[test]
    fn test_last_write_wins_even_when_stale() {
        let mut rep = replicator();

        rep.apply_stage_by_hash(0x0000_1002, 5);
        // An out-of-order update silently rolls the stage back
        rep.apply_stage_by_hash(0x0000_1002, 2);

        assert_eq!(rep.stage_of(0x0000_1002), Some(2));
        assert_eq!(rep.tracked_count(), 1);
    }

    #[test]
    fn test_registry_load_from_file() {
        let path = std::env::temp_dir().join("tandem_registry_test.txt");
        std::fs::write(
            &path,
            "# content export\n0x00001001 q_watson_gig\n1002 q_heist\n\n",
        )
        .expect("write temp registry");

        let registry = QuestRegistry::load_from_file(&path).expect("registry should load");
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(0x1001));
        assert_eq!(registry.name_of(0x1002), Some("q_heist"));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_registry_load_rejects_garbage() {
        let path = std::env::temp_dir().join("tandem_registry_bad_test.txt");
        std::fs::write(&path, "not-a-hash q_thing\n").expect("write temp registry");

        assert!(matches!(
            QuestRegistry::load_from_file(&path),
            Err(RegistryError::Parse(1))
        ));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_registry_lookup() {
        let rep = replicator();

        assert!(rep.registry().contains(0x0000_1001));
        assert_eq!(rep.registry().name_of(0x0000_1002), Some("q_heist"));
        assert!(!rep.registry().contains(0x9999_9999));
        assert_eq!(rep.registry().len(), 2);
    }
}

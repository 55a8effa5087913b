//! Legacy id to target id maps for one migration run.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Per-run identity maps for users and letters.
///
/// Each legacy id maps to at most one target id. Remapping a legacy id to a different target id
/// means the stages ran out of order and panics.
#[derive(Debug, Default)]
pub struct IdentityMap {
    users: HashMap<i64, i64>,
    letters: HashMap<i64, i64>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_user(&mut self, legacy_id: i64, target_id: i64) {
        record(&mut self.users, "user", legacy_id, target_id);
    }

    pub fn record_letter(&mut self, legacy_id: i64, target_id: i64) {
        record(&mut self.letters, "letter", legacy_id, target_id);
    }

    pub fn target_user_id(&self, legacy_id: i64) -> Option<i64> {
        self.users.get(&legacy_id).copied()
    }

    pub fn target_letter_id(&self, legacy_id: i64) -> Option<i64> {
        self.letters.get(&legacy_id).copied()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn letter_count(&self) -> usize {
        self.letters.len()
    }
}

fn record(map: &mut HashMap<i64, i64>, kind: &str, legacy_id: i64, target_id: i64) {
    match map.entry(legacy_id) {
        Entry::Vacant(slot) => {
            slot.insert(target_id);
        }
        Entry::Occupied(existing) => {
            assert_eq!(
                *existing.get(),
                target_id,
                "legacy {kind} {legacy_id} already mapped to a different target id"
            );
        }
    }
}

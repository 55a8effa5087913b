//! In-memory target store enforcing the same uniqueness and reference rules as the real schema.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use journal_core::{LookupCategory, LookupRecord, NewChange, NewLetter, NewUser};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{StoreError, TargetEntity, TargetStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stored<T> {
    pub id: i64,
    pub row: T,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    roles: Vec<(i64, String)>,
    users: Vec<Stored<NewUser>>,
    lookups: BTreeMap<LookupCategory, Vec<Stored<LookupRecord>>>,
    letters: Vec<Stored<NewLetter>>,
    changes: Vec<Stored<NewChange>>,
    marker: Option<(Uuid, DateTime<Utc>)>,
    letter_writes_left: Option<usize>,
    rejected_keys: HashSet<String>,
    writes: usize,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn user_exists(&self, id: i64) -> bool {
        self.users.iter().any(|u| u.id == id)
    }
}

/// Target store kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryTargetStore {
    state: Mutex<MemoryState>,
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Target with the role every migrated user is attached to.
    pub fn with_authenticated_role() -> Self {
        let mut state = MemoryState::default();
        let id = state.allocate_id();
        state.roles.push((id, "authenticated".to_string()));
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn add_role(&self, role_type: &str) -> i64 {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        state.roles.push((id, role_type.to_string()));
        id
    }

    /// Lets `count` more letter inserts succeed, then rejects every following one.
    #[cfg(any(test, feature = "testing"))]
    pub async fn fail_letters_after(&self, count: usize) {
        self.state.lock().await.letter_writes_left = Some(count);
    }

    /// Rejects inserts of any lookup or user with this natural key.
    #[cfg(any(test, feature = "testing"))]
    pub async fn reject_key(&self, key: &str) {
        self.state.lock().await.rejected_keys.insert(key.to_string());
    }

    pub async fn users(&self) -> Vec<Stored<NewUser>> {
        self.state.lock().await.users.clone()
    }

    pub async fn letters(&self) -> Vec<Stored<NewLetter>> {
        self.state.lock().await.letters.clone()
    }

    pub async fn changes(&self) -> Vec<Stored<NewChange>> {
        self.state.lock().await.changes.clone()
    }

    pub async fn lookups(&self, category: LookupCategory) -> Vec<Stored<LookupRecord>> {
        self.state
            .lock()
            .await
            .lookups
            .get(&category)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of successful inserts of any kind.
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }

    pub async fn run_marker(&self) -> Option<Uuid> {
        self.state.lock().await.marker.map(|(run_id, _)| run_id)
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn count(&self, entity: TargetEntity) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        let count = match entity {
            TargetEntity::Users => state.users.len(),
            TargetEntity::Letters => state.letters.len(),
            TargetEntity::Changes => state.changes.len(),
            TargetEntity::Lookup(category) => state.lookups.get(&category).map_or(0, Vec::len),
        };
        Ok(count as u64)
    }

    async fn delete_all(&self, entity: TargetEntity) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let removed = match entity {
            TargetEntity::Users => std::mem::take(&mut state.users).len(),
            TargetEntity::Letters => {
                if !state.changes.is_empty() {
                    return Err(StoreError::Rejected(
                        "letters still referenced by changes".to_string(),
                    ));
                }
                std::mem::take(&mut state.letters).len()
            }
            TargetEntity::Changes => std::mem::take(&mut state.changes).len(),
            TargetEntity::Lookup(category) => state.lookups.remove(&category).map_or(0, |v| v.len()),
        };
        Ok(removed as u64)
    }

    async fn find_role_id(&self, role_type: &str) -> Result<Option<i64>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .roles
            .iter()
            .find(|(_, t)| t == role_type)
            .map(|(id, _)| *id))
    }

    async fn existing_users(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .iter()
            .map(|u| (u.row.username.clone(), u.id))
            .collect())
    }

    async fn create_user(&self, user: &NewUser) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        if state.rejected_keys.contains(&user.username) {
            return Err(StoreError::Rejected(format!("user {}", user.username)));
        }
        if state.users.iter().any(|u| u.row.username == user.username) {
            return Err(StoreError::Duplicate {
                entity: TargetEntity::Users,
                field: "username",
                value: user.username.clone(),
            });
        }
        if !state.roles.iter().any(|(id, _)| *id == user.role_id) {
            return Err(StoreError::MissingReference {
                entity: TargetEntity::Users,
                field: "role_id",
                id: user.role_id,
            });
        }
        let id = state.allocate_id();
        state.users.push(Stored {
            id,
            row: user.clone(),
        });
        state.writes += 1;
        Ok(id)
    }

    async fn lookup_keys(&self, category: LookupCategory) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .lookups
            .get(&category)
            .map(|rows| rows.iter().map(|r| r.row.key.clone()).collect())
            .unwrap_or_default())
    }

    async fn create_lookup(&self, record: &LookupRecord) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        if state.rejected_keys.contains(&record.key) {
            return Err(StoreError::Rejected(format!("{} {}", record.category, record.key)));
        }
        let entity = TargetEntity::Lookup(record.category);
        if state
            .lookups
            .get(&record.category)
            .is_some_and(|rows| rows.iter().any(|r| r.row.key == record.key))
        {
            return Err(StoreError::Duplicate {
                entity,
                field: record.category.natural_key_field(),
                value: record.key.clone(),
            });
        }
        let id = state.allocate_id();
        state.lookups.entry(record.category).or_default().push(Stored {
            id,
            row: record.clone(),
        });
        state.writes += 1;
        Ok(id)
    }

    async fn create_letter(&self, letter: &NewLetter) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(left) = state.letter_writes_left {
            if left == 0 {
                return Err(StoreError::Rejected(format!("letter {}", letter.letter_number)));
            }
            state.letter_writes_left = Some(left - 1);
        }
        for (field, user_id) in [("created_by", letter.created_by), ("updated_by", letter.updated_by)] {
            if let Some(id) = user_id.filter(|id| !state.user_exists(*id)) {
                return Err(StoreError::MissingReference {
                    entity: TargetEntity::Letters,
                    field,
                    id,
                });
            }
        }
        let id = state.allocate_id();
        state.letters.push(Stored {
            id,
            row: letter.clone(),
        });
        state.writes += 1;
        Ok(id)
    }

    async fn create_change(&self, change: &NewChange) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        if !state.letters.iter().any(|l| l.id == change.letter_id) {
            return Err(StoreError::MissingReference {
                entity: TargetEntity::Changes,
                field: "letter",
                id: change.letter_id,
            });
        }
        if let Some(id) = change.changed_by.filter(|id| !state.user_exists(*id)) {
            return Err(StoreError::MissingReference {
                entity: TargetEntity::Changes,
                field: "changed_by",
                id,
            });
        }
        let id = state.allocate_id();
        state.changes.push(Stored {
            id,
            row: change.clone(),
        });
        state.writes += 1;
        Ok(id)
    }

    async fn acquire_run_marker(&self, run_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some((holder, started_at)) = state.marker {
            return Err(StoreError::RunInProgress {
                run_id: holder,
                started_at,
            });
        }
        state.marker = Some((run_id, Utc::now()));
        Ok(())
    }

    async fn release_run_marker(&self, run_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.marker.is_some_and(|(holder, _)| holder == run_id) {
            state.marker = None;
        }
        Ok(())
    }

    async fn clear_run_marker(&self) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.marker.take().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use journal_core::Direction;

    fn letter(number: &str) -> NewLetter {
        NewLetter {
            letter_number: number.to_string(),
            incoming_number: None,
            outgoing_number: None,
            fio: "Ivanov".to_string(),
            region: None,
            direction: Direction::Incoming,
            arrival_date: None,
            send_date: None,
            transfer: None,
            mkb: Default::default(),
            operation: Default::default(),
            department: Default::default(),
            help_type: None,
            incoming_content: None,
            outgoing_content: None,
            subject: None,
            content: None,
            created_by: None,
            updated_by: None,
        }
    }

    #[tokio::test]
    async fn lookup_natural_keys_are_unique_per_category() {
        let store = MemoryTargetStore::new();
        let region = LookupRecord::named(LookupCategory::Regions, "North", Some(0));
        store.create_lookup(&region).await.expect("first insert");

        let err = store.create_lookup(&region).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));

        let same_key_other_category = LookupRecord::named(LookupCategory::Departments, "North", None);
        store
            .create_lookup(&same_key_other_category)
            .await
            .expect("keys are scoped per category");
    }

    #[tokio::test]
    async fn changes_must_reference_existing_letters() {
        let store = MemoryTargetStore::new();
        let letter_id = store.create_letter(&letter("L-1")).await.expect("letter");
        let change = NewChange {
            letter_id: letter_id + 100,
            changed_by: None,
            field_name: "fio".to_string(),
            old_value: None,
            new_value: None,
            changed_at: "2024-01-01 00:00:00".to_string(),
        };
        let err = store.create_change(&change).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingReference { field: "letter", .. }));

        store
            .delete_all(TargetEntity::Changes)
            .await
            .expect("delete changes");
        assert_eq!(store.delete_all(TargetEntity::Letters).await.expect("delete"), 1);
    }

    #[tokio::test]
    async fn run_marker_is_exclusive_until_released() {
        let store = MemoryTargetStore::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        store.acquire_run_marker(first).await.expect("first run");
        let err = store.acquire_run_marker(second).await.unwrap_err();
        assert!(matches!(err, StoreError::RunInProgress { run_id, .. } if run_id == first));

        store.release_run_marker(second).await.expect("foreign release is a no-op");
        assert_eq!(store.run_marker().await, Some(first));

        store.release_run_marker(first).await.expect("release");
        store.acquire_run_marker(second).await.expect("second run");
        assert!(store.clear_run_marker().await.expect("clear"));
    }

    #[tokio::test]
    async fn letter_failure_injection_counts_down() {
        let store = MemoryTargetStore::new();
        store.fail_letters_after(1).await;
        store.create_letter(&letter("L-1")).await.expect("first allowed");
        assert!(store.create_letter(&letter("L-2")).await.is_err());
    }

    #[tokio::test]
    async fn rejected_keys_fail_without_counting_a_write() {
        let store = MemoryTargetStore::new();
        store.reject_key("South").await;

        let south = LookupRecord::named(LookupCategory::Regions, "South", None);
        assert!(matches!(
            store.create_lookup(&south).await,
            Err(StoreError::Rejected(_))
        ));
        assert_eq!(store.write_count().await, 0);
    }
}

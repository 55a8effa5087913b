//! Create-or-skip by natural key, with target keys loaded once per run.

use std::collections::{HashMap, HashSet};

use journal_core::{LookupCategory, LookupRecord, NewUser};
use journal_storage::{StoreError, TargetStore};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(i64),
    /// Natural key already present in the target.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserOutcome {
    Created(i64),
    /// An existing target user with the same username, left untouched.
    Reused(i64),
}

impl UserOutcome {
    pub fn target_id(self) -> i64 {
        match self {
            UserOutcome::Created(id) | UserOutcome::Reused(id) => id,
        }
    }
}

pub struct Upserter<'a> {
    store: &'a dyn TargetStore,
    lookup_keys: HashMap<LookupCategory, HashSet<String>>,
    usernames: Option<HashMap<String, i64>>,
}

impl<'a> Upserter<'a> {
    pub fn new(store: &'a dyn TargetStore) -> Self {
        Self {
            store,
            lookup_keys: HashMap::new(),
            usernames: None,
        }
    }

    /// Loads the existing natural keys for `category` unless already cached.
    pub async fn load_category(&mut self, category: LookupCategory) -> Result<usize, StoreError> {
        if let Some(keys) = self.lookup_keys.get(&category) {
            return Ok(keys.len());
        }
        let keys: HashSet<String> = self.store.lookup_keys(category).await?.into_iter().collect();
        let count = keys.len();
        debug!(%category, existing = count, "cached target natural keys");
        self.lookup_keys.insert(category, keys);
        Ok(count)
    }

    pub async fn upsert_lookup(&mut self, record: &LookupRecord) -> Result<UpsertOutcome, StoreError> {
        self.load_category(record.category).await?;
        if self
            .lookup_keys
            .get(&record.category)
            .is_some_and(|keys| keys.contains(&record.key))
        {
            return Ok(UpsertOutcome::Skipped);
        }
        let id = self.store.create_lookup(record).await?;
        self.lookup_keys
            .entry(record.category)
            .or_default()
            .insert(record.key.clone());
        Ok(UpsertOutcome::Created(id))
    }

    pub async fn load_users(&mut self) -> Result<usize, StoreError> {
        if let Some(users) = &self.usernames {
            return Ok(users.len());
        }
        let users: HashMap<String, i64> = self.store.existing_users().await?.into_iter().collect();
        let count = users.len();
        debug!(existing = count, "cached target usernames");
        self.usernames = Some(users);
        Ok(count)
    }

    pub async fn upsert_user(&mut self, user: &NewUser) -> Result<UserOutcome, StoreError> {
        self.load_users().await?;
        if let Some(id) = self
            .usernames
            .as_ref()
            .and_then(|users| users.get(&user.username))
        {
            return Ok(UserOutcome::Reused(*id));
        }
        let id = self.store.create_user(user).await?;
        self.usernames
            .get_or_insert_with(HashMap::new)
            .insert(user.username.clone(), id);
        Ok(UserOutcome::Created(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use journal_storage::{MemoryTargetStore, TargetEntity};

    fn user(username: &str, role_id: i64) -> NewUser {
        NewUser {
            username: username.to_string(),
            email: format!("{username}@local"),
            provider: "local".to_string(),
            password_hash: Some("$2a$10$x".to_string()),
            confirmed: true,
            blocked: false,
            role_id,
            display_name: None,
        }
    }

    #[tokio::test]
    async fn existing_keys_are_skipped_and_new_ones_cached() {
        let store = MemoryTargetStore::new();
        store
            .create_lookup(&LookupRecord::named(LookupCategory::Regions, "North", Some(0)))
            .await
            .unwrap();

        let mut upserter = Upserter::new(&store);
        assert_eq!(upserter.load_category(LookupCategory::Regions).await.unwrap(), 1);

        let north = LookupRecord::named(LookupCategory::Regions, "North", Some(0));
        let south = LookupRecord::named(LookupCategory::Regions, "South", Some(1));
        assert_eq!(upserter.upsert_lookup(&north).await.unwrap(), UpsertOutcome::Skipped);
        assert!(matches!(
            upserter.upsert_lookup(&south).await.unwrap(),
            UpsertOutcome::Created(_)
        ));
        assert_eq!(upserter.upsert_lookup(&south).await.unwrap(), UpsertOutcome::Skipped);

        assert_eq!(
            store
                .count(TargetEntity::Lookup(LookupCategory::Regions))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn existing_users_are_reused_without_writes() {
        let store = MemoryTargetStore::with_authenticated_role();
        let role_id = store.find_role_id("authenticated").await.unwrap().unwrap();
        let existing = store.create_user(&user("alice", role_id)).await.unwrap();

        let mut upserter = Upserter::new(&store);
        let before = store.write_count().await;
        assert_eq!(
            upserter.upsert_user(&user("alice", role_id)).await.unwrap(),
            UserOutcome::Reused(existing)
        );
        assert_eq!(store.write_count().await, before);

        let bob = upserter.upsert_user(&user("bob", role_id)).await.unwrap();
        assert!(matches!(bob, UserOutcome::Created(_)));
        assert_eq!(
            upserter.upsert_user(&user("bob", role_id)).await.unwrap(),
            UserOutcome::Reused(bob.target_id())
        );
    }
}

// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::AppError;
use crate::model::{FeatureFlag, UsageRecord, UsageSummary};
use crate::store::{FlagStore, UpdateOutcome, UsageEvent, RECENT_USAGE_LIMIT};

/// Process-local flag store
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<String, StoredFlag>>>,
}

struct StoredFlag {
    flag: FeatureFlag,
    users: HashSet<String>,
    recent: VecDeque<UsageRecord>,
}

impl StoredFlag {
    fn new(mut flag: FeatureFlag) -> Self {
        flag.usage_count = 0;
        flag.last_used_at = None;
        Self {
            flag,
            users: HashSet::new(),
            recent: VecDeque::new(),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[async_trait]
impl FlagStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<FeatureFlag>, AppError> {
        let guard = self.inner.read().await;
        Ok(guard.get(key).map(|stored| stored.flag.clone()))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<FeatureFlag>, AppError> {
        let guard = self.inner.read().await;
        Ok(keys
            .iter()
            .filter_map(|key| guard.get(key))
            .map(|stored| stored.flag.clone())
            .collect())
    }

    async fn list(&self) -> Result<Vec<FeatureFlag>, AppError> {
        let guard = self.inner.read().await;
        Ok(guard.values().map(|stored| stored.flag.clone()).collect())
    }

    async fn insert(&self, flag: FeatureFlag) -> Result<bool, AppError> {
        let mut guard = self.inner.write().await;
        if guard.contains_key(&flag.key) {
            return Ok(false);
        }
        guard.insert(flag.key.clone(), StoredFlag::new(flag));
        Ok(true)
    }

    async fn update(
        &self,
        mut flag: FeatureFlag,
        read_at: DateTime<Utc>,
    ) -> Result<UpdateOutcome, AppError> {
        let mut guard = self.inner.write().await;
        let Some(stored) = guard.get_mut(&flag.key) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if stored.flag.updated_at != read_at {
            return Ok(UpdateOutcome::Stale);
        }
        flag.usage_count = stored.flag.usage_count;
        flag.last_used_at = stored.flag.last_used_at;
        stored.flag = flag;
        Ok(UpdateOutcome::Updated)
    }

    async fn delete(&self, key: &str) -> Result<bool, AppError> {
        let mut guard = self.inner.write().await;
        Ok(guard.remove(key).is_some())
    }

    async fn record_usage(&self, event: &UsageEvent) -> Result<(), AppError> {
        let mut guard = self.inner.write().await;
        let Some(stored) = guard.get_mut(&event.flag_key) else {
            tracing::debug!(flag = %event.flag_key, "usage for deleted flag dropped");
            return Ok(());
        };

        stored.flag.usage_count += 1;
        stored.flag.last_used_at = Some(event.recorded_at);

        if let Some(user_id) = &event.user_id {
            stored.users.insert(user_id.clone());
            stored.recent.push_front(UsageRecord {
                flag_key: event.flag_key.clone(),
                user_id: user_id.clone(),
                recorded_at: event.recorded_at,
            });
            stored.recent.truncate(RECENT_USAGE_LIMIT);
        }

        Ok(())
    }

    async fn usage_summary(&self, key: &str) -> Result<UsageSummary, AppError> {
        let guard = self.inner.read().await;
        let Some(stored) = guard.get(key) else {
            return Ok(UsageSummary::default());
        };

        Ok(UsageSummary {
            usage_count: stored.flag.usage_count,
            last_used_at: stored.flag.last_used_at,
            unique_users: stored.users.len() as u64,
            recent: stored.recent.iter().cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FlagStatus;
    use chrono::{Duration, Utc};
    use tokio_test::assert_ok;

    fn usage(key: &str, user: Option<&str>) -> UsageEvent {
        UsageEvent {
            flag_key: key.to_string(),
            user_id: user.map(str::to_string),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let store = MemoryStore::new();
        let flag = FeatureFlag::new("routes.optimizer", Utc::now());

        assert!(assert_ok!(store.insert(flag.clone()).await));
        assert!(!assert_ok!(store.insert(flag).await));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_keeps_usage_counters() {
        let store = MemoryStore::new();
        let flag = FeatureFlag::new("routes.optimizer", Utc::now());
        store.insert(flag.clone()).await.unwrap();
        store.record_usage(&usage("routes.optimizer", Some("u-1"))).await.unwrap();

        let mut edited = flag.clone();
        edited.rollout_percentage = 10;
        edited.updated_at = flag.updated_at + Duration::seconds(1);
        assert_eq!(
            store.update(edited, flag.updated_at).await.unwrap(),
            UpdateOutcome::Updated
        );

        let stored = store.get("routes.optimizer").await.unwrap().unwrap();
        assert_eq!(stored.rollout_percentage, 10);
        assert_eq!(stored.usage_count, 1);
    }

    #[tokio::test]
    async fn test_update_rejects_stale_read() {
        let store = MemoryStore::new();
        let original = FeatureFlag::new("routes.optimizer", Utc::now());
        store.insert(original.clone()).await.unwrap();

        let mut first = original.clone();
        first.status = FlagStatus::Enabled;
        first.updated_at = original.updated_at + Duration::seconds(1);
        assert_eq!(
            store.update(first, original.updated_at).await.unwrap(),
            UpdateOutcome::Updated
        );

        let mut second = original.clone();
        second.rollout_percentage = 5;
        second.updated_at = original.updated_at + Duration::seconds(2);
        assert_eq!(
            store.update(second, original.updated_at).await.unwrap(),
            UpdateOutcome::Stale
        );

        let stored = store.get("routes.optimizer").await.unwrap().unwrap();
        assert!(stored.is_active());
        assert_eq!(stored.rollout_percentage, 100);
    }

    #[tokio::test]
    async fn test_update_unknown_flag() {
        let store = MemoryStore::new();
        let flag = FeatureFlag::new("routes.optimizer", Utc::now());
        let read_at = flag.updated_at;
        assert_eq!(
            store.update(flag, read_at).await.unwrap(),
            UpdateOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_get_many_skips_unknown_keys() {
        let store = MemoryStore::new();
        store
            .insert(FeatureFlag::new("routes.optimizer", Utc::now()))
            .await
            .unwrap();

        let keys = vec!["ghost".to_string(), "routes.optimizer".to_string()];
        let flags = assert_ok!(store.get_many(&keys).await);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].key, "routes.optimizer");
    }

    #[tokio::test]
    async fn test_usage_summary_counts_users() {
        let store = MemoryStore::new();
        store
            .insert(FeatureFlag::new("routes.optimizer", Utc::now()))
            .await
            .unwrap();

        for user in [Some("u-1"), Some("u-2"), Some("u-1"), None] {
            store.record_usage(&usage("routes.optimizer", user)).await.unwrap();
        }

        let summary = store.usage_summary("routes.optimizer").await.unwrap();
        assert_eq!(summary.usage_count, 4);
        assert_eq!(summary.unique_users, 2);
        assert_eq!(summary.recent.len(), 3);
        assert_eq!(summary.recent[0].user_id, "u-1");
        assert!(summary.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_recent_usage_is_capped() {
        let store = MemoryStore::new();
        store
            .insert(FeatureFlag::new("routes.optimizer", Utc::now()))
            .await
            .unwrap();

        let start = Utc::now();
        for i in 0..(RECENT_USAGE_LIMIT + 20) {
            let event = UsageEvent {
                flag_key: "routes.optimizer".to_string(),
                user_id: Some(format!("u-{i}")),
                recorded_at: start + Duration::seconds(i as i64),
            };
            store.record_usage(&event).await.unwrap();
        }

        let summary = store.usage_summary("routes.optimizer").await.unwrap();
        assert_eq!(summary.recent.len(), RECENT_USAGE_LIMIT);
        assert_eq!(summary.usage_count, (RECENT_USAGE_LIMIT + 20) as u64);
    }

    #[tokio::test]
    async fn test_usage_for_missing_flag_is_ignored() {
        let store = MemoryStore::new();
        assert_ok!(store.record_usage(&usage("ghost", Some("u-1"))).await);
        assert_eq!(store.usage_summary("ghost").await.unwrap(), UsageSummary::default());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        store
            .insert(FeatureFlag::new("routes.optimizer", Utc::now()))
            .await
            .unwrap();

        assert!(store.delete("routes.optimizer").await.unwrap());
        assert!(!store.delete("routes.optimizer").await.unwrap());
        assert!(store.get("routes.optimizer").await.unwrap().is_none());
    }
}

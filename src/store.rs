// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Flag definition storage.
//!
//! [`FlagStore`] is the persistence seam: an in-memory backend for single-node
//! deployments and tests, and a Redis backend for shared state. The
//! [`FlagRegistry`] wrapper adds the read paths the evaluator needs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::AppError;
use crate::evaluator::FlagLookup;
use crate::model::{FeatureFlag, UsageRecord, UsageSummary};

/// Number of individual usage records kept per flag.
pub const RECENT_USAGE_LIMIT: usize = 100;

/// A single usage event emitted after an evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageEvent {
    pub flag_key: String,
    pub user_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Result of a conditional definition write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    NotFound,
    /// The stored definition changed since it was read.
    Stale,
}

/// Trait for flag storage backends
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<FeatureFlag>, AppError>;
    /// Fetch several definitions in one round trip. Unknown keys are skipped.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<FeatureFlag>, AppError>;
    async fn list(&self) -> Result<Vec<FeatureFlag>, AppError>;
    /// Store a new flag. Returns `false` when the key is already taken.
    async fn insert(&self, flag: FeatureFlag) -> Result<bool, AppError>;
    /// Replace a definition only if its stored `updated_at` still equals `read_at`.
    /// Usage counters are owned by [`FlagStore::record_usage`] and are not overwritten.
    async fn update(
        &self,
        flag: FeatureFlag,
        read_at: DateTime<Utc>,
    ) -> Result<UpdateOutcome, AppError>;
    async fn delete(&self, key: &str) -> Result<bool, AppError>;
    async fn record_usage(&self, event: &UsageEvent) -> Result<(), AppError>;
    async fn usage_summary(&self, key: &str) -> Result<UsageSummary, AppError>;
}

/// Immutable set of definitions handed to the evaluator
#[derive(Debug, Clone, Default)]
pub struct FlagSnapshot {
    flags: HashMap<String, FeatureFlag>,
}

impl FlagSnapshot {
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&FeatureFlag> {
        self.flags.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeatureFlag> {
        self.flags.values()
    }
}

impl FromIterator<FeatureFlag> for FlagSnapshot {
    fn from_iter<I: IntoIterator<Item = FeatureFlag>>(iter: I) -> Self {
        Self {
            flags: iter.into_iter().map(|f| (f.key.clone(), f)).collect(),
        }
    }
}

impl FlagLookup for FlagSnapshot {
    fn lookup(&self, key: &str) -> Option<&FeatureFlag> {
        self.flags.get(key)
    }
}

/// Store wrapper shared by handlers and the usage writer
#[derive(Clone)]
pub struct FlagRegistry {
    backend: Arc<dyn FlagStore>,
}

impl FlagRegistry {
    pub fn new(backend: impl FlagStore + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn from_shared(backend: Arc<dyn FlagStore>) -> Self {
        Self { backend }
    }

    pub async fn get(&self, key: &str) -> Result<Option<FeatureFlag>, AppError> {
        self.backend.get(key).await
    }

    pub async fn list(&self) -> Result<Vec<FeatureFlag>, AppError> {
        let mut flags = self.backend.list().await?;
        flags.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(flags)
    }

    pub async fn insert(&self, flag: FeatureFlag) -> Result<bool, AppError> {
        self.backend.insert(flag).await
    }

    pub async fn update(
        &self,
        flag: FeatureFlag,
        read_at: DateTime<Utc>,
    ) -> Result<UpdateOutcome, AppError> {
        self.backend.update(flag, read_at).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, AppError> {
        self.backend.delete(key).await
    }

    pub async fn usage_summary(&self, key: &str) -> Result<UsageSummary, AppError> {
        self.backend.usage_summary(key).await
    }

    /// Load the requested flags plus everything they transitively depend on.
    /// Each dependency level is one backend round trip.
    pub async fn snapshot_for(&self, keys: &[String]) -> Result<FlagSnapshot, AppError> {
        let mut flags = HashMap::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut level: Vec<String> = keys
            .iter()
            .filter(|key| seen.insert((*key).clone()))
            .cloned()
            .collect();

        while !level.is_empty() {
            let mut next = Vec::new();
            for flag in self.backend.get_many(&level).await? {
                for dependency in &flag.dependencies {
                    if seen.insert(dependency.clone()) {
                        next.push(dependency.clone());
                    }
                }
                flags.insert(flag.key.clone(), flag);
            }
            level = next;
        }

        Ok(FlagSnapshot { flags })
    }

    pub async fn snapshot_all(&self) -> Result<FlagSnapshot, AppError> {
        Ok(self.backend.list().await?.into_iter().collect())
    }
}

/// Replaces a definition only while its stored `updated_at` matches the caller's read.
const COMPARE_AND_SET_SCRIPT: &str = r#"
    local current = redis.call("get", KEYS[1])
    if not current then
        return 0
    end
    if cjson.decode(current)["updated_at"] ~= ARGV[1] then
        return -1
    end
    redis.call("set", KEYS[1], ARGV[2])
    return 1
"#;

/// Redis-based flag store
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    pub async fn new(redis_url: &str, prefix: impl Into<String>) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::internal("Failed to create Redis client", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::internal("Redis connection failed", e))?;

        Ok(Self {
            conn,
            prefix: prefix.into(),
        })
    }

    /// Test the Redis connection
    pub async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self.connection();

        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| AppError::internal("Redis PING failed", e))?;

        Ok(())
    }

    fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    fn flag_key(&self, key: &str) -> String {
        format!("{}flag:{}", self.prefix, key)
    }

    fn usage_count_key(&self, key: &str) -> String {
        format!("{}usage:count:{}", self.prefix, key)
    }

    fn usage_last_key(&self, key: &str) -> String {
        format!("{}usage:last:{}", self.prefix, key)
    }

    fn usage_users_key(&self, key: &str) -> String {
        format!("{}usage:users:{}", self.prefix, key)
    }

    fn usage_log_key(&self, key: &str) -> String {
        format!("{}usage:log:{}", self.prefix, key)
    }

    /// Definition, usage count and last use for each key, pipelined on one connection.
    async fn fetch(
        &self,
        conn: &mut ConnectionManager,
        keys: &[String],
    ) -> Result<Vec<FeatureFlag>, AppError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in keys {
            pipe.get(self.flag_key(key))
                .get(self.usage_count_key(key))
                .get(self.usage_last_key(key));
        }

        let replies: Vec<Option<String>> = pipe
            .query_async(conn)
            .await
            .map_err(|e| AppError::internal("Redis GET failed", e))?;

        let mut flags = Vec::with_capacity(keys.len());
        for reply in replies.chunks(3) {
            let [data, count, last] = reply else {
                return Err(AppError::internal("Redis GET failed", "short pipeline reply"));
            };
            // A flag deleted between SCAN and GET is simply skipped.
            if let Some(json) = data {
                let count = count.as_deref().and_then(|raw| raw.parse().ok());
                flags.push(Self::decode_flag(json, count, last.as_deref())?);
            }
        }

        Ok(flags)
    }

    fn decode_flag(
        json: &str,
        usage_count: Option<u64>,
        last_used_at: Option<&str>,
    ) -> Result<FeatureFlag, AppError> {
        let mut flag: FeatureFlag = serde_json::from_str(json)
            .map_err(|e| AppError::internal("Failed to deserialize flag", e))?;
        flag.usage_count = usage_count.unwrap_or(0);
        flag.last_used_at = last_used_at.and_then(parse_timestamp);
        Ok(flag)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
}

#[async_trait]
impl FlagStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<FeatureFlag>, AppError> {
        let mut conn = self.connection();
        let flags = self.fetch(&mut conn, &[key.to_string()]).await?;
        Ok(flags.into_iter().next())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<FeatureFlag>, AppError> {
        let mut conn = self.connection();
        self.fetch(&mut conn, keys).await
    }

    async fn list(&self) -> Result<Vec<FeatureFlag>, AppError> {
        let mut conn = self.connection();

        let pattern = self.flag_key("*");
        let flag_prefix = self.flag_key("");
        let mut keys = Vec::new();
        let mut cursor = 0u64;

        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| AppError::internal("Redis SCAN failed", e))?;

            keys.extend(
                batch
                    .iter()
                    .filter_map(|k| k.strip_prefix(&flag_prefix))
                    .map(str::to_string),
            );

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        // SCAN may repeat keys across batches.
        keys.sort();
        keys.dedup();

        self.fetch(&mut conn, &keys).await
    }

    async fn insert(&self, flag: FeatureFlag) -> Result<bool, AppError> {
        let mut conn = self.connection();

        let json = serde_json::to_string(&flag)
            .map_err(|e| AppError::internal("Failed to serialize flag", e))?;

        let created: bool = conn
            .set_nx(self.flag_key(&flag.key), json)
            .await
            .map_err(|e| AppError::internal("Redis SETNX failed", e))?;

        Ok(created)
    }

    async fn update(
        &self,
        flag: FeatureFlag,
        read_at: DateTime<Utc>,
    ) -> Result<UpdateOutcome, AppError> {
        let mut conn = self.connection();

        let json = serde_json::to_string(&flag)
            .map_err(|e| AppError::internal("Failed to serialize flag", e))?;
        let expected = serde_json::to_value(read_at)
            .map_err(|e| AppError::internal("Failed to serialize timestamp", e))?;
        let expected = expected.as_str().unwrap_or_default().to_string();

        let result: i32 = redis::Script::new(COMPARE_AND_SET_SCRIPT)
            .key(self.flag_key(&flag.key))
            .arg(expected)
            .arg(json)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AppError::internal("Redis compare-and-set failed", e))?;

        Ok(match result {
            1 => UpdateOutcome::Updated,
            0 => UpdateOutcome::NotFound,
            _ => UpdateOutcome::Stale,
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, AppError> {
        let mut conn = self.connection();

        let (deleted,): (i64,) = redis::pipe()
            .atomic()
            .del(self.flag_key(key))
            .del(vec![
                self.usage_count_key(key),
                self.usage_last_key(key),
                self.usage_users_key(key),
                self.usage_log_key(key),
            ])
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::internal("Redis DEL failed", e))?;

        Ok(deleted > 0)
    }

    async fn record_usage(&self, event: &UsageEvent) -> Result<(), AppError> {
        let mut conn = self.connection();
        let key = event.flag_key.as_str();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .incr(self.usage_count_key(key), 1u64)
            .ignore()
            .set(self.usage_last_key(key), event.recorded_at.to_rfc3339())
            .ignore();

        if let Some(user_id) = &event.user_id {
            let record = UsageRecord {
                flag_key: key.to_string(),
                user_id: user_id.clone(),
                recorded_at: event.recorded_at,
            };
            let json = serde_json::to_string(&record)
                .map_err(|e| AppError::internal("Failed to serialize usage record", e))?;

            pipe.sadd(self.usage_users_key(key), user_id)
                .ignore()
                .lpush(self.usage_log_key(key), json)
                .ignore()
                .ltrim(self.usage_log_key(key), 0, RECENT_USAGE_LIMIT as isize - 1)
                .ignore();
        }

        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| AppError::internal("Redis usage write failed", e))?;

        Ok(())
    }

    async fn usage_summary(&self, key: &str) -> Result<UsageSummary, AppError> {
        let mut conn = self.connection();

        let (count, last, unique_users, log): (Option<u64>, Option<String>, u64, Vec<String>) =
            redis::pipe()
                .get(self.usage_count_key(key))
                .get(self.usage_last_key(key))
                .scard(self.usage_users_key(key))
                .lrange(self.usage_log_key(key), 0, RECENT_USAGE_LIMIT as isize - 1)
                .query_async(&mut conn)
                .await
                .map_err(|e| AppError::internal("Redis usage read failed", e))?;

        let recent = log
            .iter()
            .filter_map(|entry| match serde_json::from_str::<UsageRecord>(entry) {
                Ok(record) => Some(record),
                Err(error) => {
                    tracing::warn!(flag = key, %error, "skipping unreadable usage record");
                    None
                }
            })
            .collect();

        Ok(UsageSummary {
            usage_count: count.unwrap_or(0),
            last_used_at: last.as_deref().and_then(parse_timestamp),
            unique_users,
            recent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn flag_with_deps(key: &str, deps: &[&str]) -> FeatureFlag {
        let mut flag = FeatureFlag::new(key, Utc::now());
        flag.dependencies = deps.iter().map(|d| d.to_string()).collect();
        flag
    }

    #[tokio::test]
    async fn test_snapshot_follows_dependencies() {
        let registry = FlagRegistry::new(MemoryStore::new());
        for flag in [
            flag_with_deps("a", &["b"]),
            flag_with_deps("b", &["c", "ghost"]),
            flag_with_deps("c", &[]),
            flag_with_deps("unrelated", &[]),
        ] {
            assert!(registry.insert(flag).await.unwrap());
        }

        let snapshot = registry.snapshot_for(&["a".to_string()]).await.unwrap();

        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.lookup("c").is_some());
        assert!(snapshot.lookup("unrelated").is_none());
        assert!(snapshot.lookup("ghost").is_none());
    }

    #[tokio::test]
    async fn test_snapshot_tolerates_cycles() {
        let registry = FlagRegistry::new(MemoryStore::new());
        registry.insert(flag_with_deps("a", &["b"])).await.unwrap();
        registry.insert(flag_with_deps("b", &["a"])).await.unwrap();

        let snapshot = registry.snapshot_for(&["a".to_string()]).await.unwrap();
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let registry = FlagRegistry::new(MemoryStore::new());
        for key in ["c", "a", "b"] {
            registry.insert(flag_with_deps(key, &[])).await.unwrap();
        }

        let keys: Vec<String> = registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.key)
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_snapshot_fetches_one_level_per_round_trip() {
        let mut store = MockFlagStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_get_many()
            .withf(|keys| keys.to_vec() == ["a", "x"])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![flag_with_deps("a", &["b", "c"]), flag_with_deps("x", &["c"])]));
        store
            .expect_get_many()
            .withf(|keys| keys.to_vec() == ["b", "c"])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![flag_with_deps("b", &["a"]), flag_with_deps("c", &[])]));

        let registry = FlagRegistry::new(store);
        let snapshot = registry
            .snapshot_for(&["a".to_string(), "x".to_string(), "a".to_string()])
            .await
            .unwrap();

        assert_eq!(snapshot.len(), 4);
    }

    #[test]
    fn test_decode_flag_overlays_usage_counters() {
        let mut stored = FeatureFlag::new("routes.optimizer", Utc::now());
        stored.usage_count = 3;
        let json = serde_json::to_string(&stored).unwrap();

        let flag = RedisStore::decode_flag(&json, Some(7), Some("2025-06-15T11:30:00+02:00")).unwrap();
        assert_eq!(flag.key, "routes.optimizer");
        assert_eq!(flag.usage_count, 7);
        assert_eq!(
            flag.last_used_at.map(|ts| ts.to_rfc3339()),
            Some("2025-06-15T09:30:00+00:00".to_string())
        );

        let flag = RedisStore::decode_flag(&json, None, Some("yesterday")).unwrap();
        assert_eq!(flag.usage_count, 0);
        assert_eq!(flag.last_used_at, None);

        assert!(matches!(
            RedisStore::decode_flag("{not json", None, None),
            Err(AppError::Internal(_))
        ));
    }

    #[test]
    fn test_parse_timestamp_normalises_to_utc() {
        let parsed = parse_timestamp("2025-01-01T00:00:00-05:00").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2025-01-01T05:00:00+00:00");
        assert!(parse_timestamp("").is_none());
    }

    #[tokio::test]
    async fn test_snapshot_propagates_store_errors() {
        let mut store = MockFlagStore::new();
        store
            .expect_get_many()
            .returning(|_| Err(AppError::internal("Redis GET failed", "connection refused")));

        let registry = FlagRegistry::new(store);
        let result = registry.snapshot_for(&["a".to_string()]).await;
        assert!(matches!(result, Err(AppError::Internal(_))));
    }
}

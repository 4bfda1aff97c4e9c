// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Boot-time loading of flag definitions from a JSON file.
//!
//! The file holds an array of definitions in the same shape as the create
//! request, plus an optional `status`. Flags already present in the store are
//! left untouched.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::model::{CreateFlagRequest, FeatureFlag, FlagStatus};
use crate::store::{FlagRegistry, FlagSnapshot};
use crate::validation::{validate_definition, validate_references};

#[derive(Debug, Deserialize)]
struct SeedFlag {
    #[serde(flatten)]
    definition: CreateFlagRequest,
    #[serde(default)]
    status: FlagStatus,
}

/// Parse and validate seed definitions. References may point at other seeds or at `existing`.
///
/// Seeds whose key is already stored are not written, so references are checked
/// against the stored definitions plus the seeds that will actually be inserted.
pub fn parse_seed(raw: &str, existing: &FlagSnapshot, now: DateTime<Utc>) -> Result<Vec<FeatureFlag>> {
    let seeds: Vec<SeedFlag> = serde_json::from_str(raw).context("seed file is not a JSON array of flags")?;

    let flags: Vec<FeatureFlag> = seeds
        .into_iter()
        .map(|seed| {
            let mut flag = seed.definition.into_flag(now);
            if seed.status == FlagStatus::Enabled {
                flag.enable(Some("seed".to_string()), now);
            }
            flag
        })
        .collect();

    for flag in &flags {
        validate_definition(flag).with_context(|| format!("invalid seed flag {}", flag.key))?;
    }

    let fresh: Vec<&FeatureFlag> = flags
        .iter()
        .filter(|flag| existing.get(&flag.key).is_none())
        .collect();
    let combined: FlagSnapshot = existing
        .iter()
        .cloned()
        .chain(fresh.iter().map(|flag| (*flag).clone()))
        .collect();
    for flag in fresh {
        validate_references(flag, &combined)
            .with_context(|| format!("invalid seed flag {}", flag.key))?;
    }

    Ok(flags)
}

/// Insert seed flags that are not stored yet. Returns how many were added.
pub async fn apply_seed(registry: &FlagRegistry, flags: Vec<FeatureFlag>) -> Result<usize> {
    let mut inserted = 0;
    for flag in flags {
        let key = flag.key.clone();
        if registry.insert(flag).await? {
            inserted += 1;
        } else {
            tracing::debug!(flag = %key, "seed flag already stored, keeping stored definition");
        }
    }
    Ok(inserted)
}

pub async fn load_seed_file(path: &Path, registry: &FlagRegistry) -> Result<usize> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    let existing = registry.snapshot_all().await?;
    let flags = parse_seed(&raw, &existing, Utc::now())?;
    let inserted = apply_seed(registry, flags).await?;

    tracing::info!(path = %path.display(), inserted, "loaded seed flags");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    const SEED: &str = r#"[
        {"key": "subscriptions.v2", "dependencies": ["billing.v2"], "status": "enabled"},
        {"key": "billing.v2", "rollout_percentage": 20,
         "variants": [{"name": "stripe", "percentage": 50}, {"name": "adyen", "percentage": 50}],
         "default_variant": "stripe"}
    ]"#;

    #[test]
    fn test_seed_allows_forward_references() {
        let flags = parse_seed(SEED, &FlagSnapshot::default(), Utc::now()).unwrap();

        assert_eq!(flags.len(), 2);
        assert!(flags[0].is_active());
        assert_eq!(flags[0].enabled_by.as_deref(), Some("seed"));
        assert!(!flags[1].is_active());
        assert_eq!(flags[1].variants.len(), 2);
    }

    #[test]
    fn test_seed_rejects_invalid_definitions() {
        let raw = r#"[{"key": "a", "rollout_percentage": 120}]"#;
        let error = parse_seed(raw, &FlagSnapshot::default(), Utc::now()).unwrap_err();
        assert!(error.to_string().contains("invalid seed flag a"));

        let raw = r#"[{"key": "a", "dependencies": ["b"]}, {"key": "b", "dependencies": ["a"]}]"#;
        assert!(parse_seed(raw, &FlagSnapshot::default(), Utc::now()).is_err());

        assert!(parse_seed("{}", &FlagSnapshot::default(), Utc::now()).is_err());
    }

    #[test]
    fn test_stored_definitions_win_during_reference_checks() {
        let now = Utc::now();
        let existing: FlagSnapshot = [FeatureFlag::new("billing.v2", now)].into_iter().collect();

        // The seeded billing.v2 would close a loop, but the stored one is kept.
        let raw = r#"[
            {"key": "billing.v2", "dependencies": ["subscriptions.v2"]},
            {"key": "subscriptions.v2", "dependencies": ["billing.v2"]}
        ]"#;
        let flags = parse_seed(raw, &existing, now).unwrap();
        assert_eq!(flags.len(), 2);

        let mut stored = FeatureFlag::new("subscriptions.v2", now);
        stored.dependencies.insert("billing.v2".to_string());
        let existing: FlagSnapshot = [stored].into_iter().collect();

        let raw = r#"[{"key": "billing.v2", "dependencies": ["subscriptions.v2"]}]"#;
        let error = parse_seed(raw, &existing, now).unwrap_err();
        assert!(format!("{error:#}").contains("dependency cycle"));
    }

    #[tokio::test]
    async fn test_apply_keeps_stored_flags() {
        let registry = FlagRegistry::new(MemoryStore::new());
        let mut stored = FeatureFlag::new("billing.v2", Utc::now());
        stored.rollout_percentage = 90;
        registry.insert(stored).await.unwrap();

        let existing = registry.snapshot_all().await.unwrap();
        let flags = parse_seed(SEED, &existing, Utc::now()).unwrap();
        let inserted = apply_seed(&registry, flags).await.unwrap();

        assert_eq!(inserted, 1);
        let billing = registry.get("billing.v2").await.unwrap().unwrap();
        assert_eq!(billing.rollout_percentage, 90);
    }
}

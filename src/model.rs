// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Data models for feature flag definitions and the evaluation API.
//!
//! Defines the stored flag record, the evaluation context, and the request and
//! response bodies used by the HTTP layer.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

fn default_rollout() -> u8 {
    100
}

/// Authoritative on/off switch for a flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagStatus {
    Enabled,
    #[default]
    Disabled,
}

/// A named experiment arm and the share of enabled traffic it receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub percentage: u8,
}

impl Variant {
    pub fn new(name: impl Into<String>, percentage: u8) -> Self {
        Self {
            name: name.into(),
            percentage,
        }
    }
}

/// A stored feature flag definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: FlagStatus,
    #[serde(default = "default_rollout")]
    pub rollout_percentage: u8,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub target_users: BTreeSet<String>,
    #[serde(default)]
    pub target_tenants: BTreeSet<String>,
    #[serde(default)]
    pub exclude_users: BTreeSet<String>,
    #[serde(default)]
    pub exclude_tenants: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub default_variant: Option<String>,
    #[serde(default)]
    pub parent_key: Option<String>,
    #[serde(default)]
    pub track_usage: bool,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub enabled_by: Option<String>,
    #[serde(default)]
    pub enabled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disabled_by: Option<String>,
    #[serde(default)]
    pub disabled_at: Option<DateTime<Utc>>,
}

impl FeatureFlag {
    /// A disabled flag with full rollout and no targeting.
    pub fn new(key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            name: None,
            description: None,
            status: FlagStatus::Disabled,
            rollout_percentage: 100,
            start_date: None,
            end_date: None,
            target_users: BTreeSet::new(),
            target_tenants: BTreeSet::new(),
            exclude_users: BTreeSet::new(),
            exclude_tenants: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            variants: Vec::new(),
            default_variant: None,
            parent_key: None,
            track_usage: false,
            usage_count: 0,
            last_used_at: None,
            created_at: now,
            updated_at: now,
            enabled_by: None,
            enabled_at: None,
            disabled_by: None,
            disabled_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == FlagStatus::Enabled
    }

    pub fn enable(&mut self, actor: Option<String>, now: DateTime<Utc>) {
        self.status = FlagStatus::Enabled;
        self.enabled_by = actor;
        self.enabled_at = Some(now);
        self.updated_at = now;
    }

    pub fn disable(&mut self, actor: Option<String>, now: DateTime<Utc>) {
        self.status = FlagStatus::Disabled;
        self.disabled_by = actor;
        self.disabled_at = Some(now);
        self.updated_at = now;
    }

    /// Copy this definition under a new key. The copy starts disabled with no usage history.
    pub fn duplicate(&self, new_key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            key: new_key.into(),
            status: FlagStatus::Disabled,
            usage_count: 0,
            last_used_at: None,
            created_at: now,
            updated_at: now,
            enabled_by: None,
            enabled_at: None,
            disabled_by: None,
            disabled_at: None,
            ..self.clone()
        }
    }
}

/// Identifiers a flag is evaluated against; both may be absent
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EvaluationContext {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

impl EvaluationContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            tenant_id: None,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }
}

/// Result of a single flag check as seen by API clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagCheckResponse {
    pub enabled: bool,
    pub variant: Option<String>,
}

impl FlagCheckResponse {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            variant: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    pub key: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BulkCheckRequest {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

pub type BulkCheckResponse = BTreeMap<String, FlagCheckResponse>;

/// Body for creating a flag. Status and audit stamps are not client-settable.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateFlagRequest {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_rollout")]
    pub rollout_percentage: u8,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub target_users: BTreeSet<String>,
    #[serde(default)]
    pub target_tenants: BTreeSet<String>,
    #[serde(default)]
    pub exclude_users: BTreeSet<String>,
    #[serde(default)]
    pub exclude_tenants: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub default_variant: Option<String>,
    #[serde(default)]
    pub parent_key: Option<String>,
    #[serde(default)]
    pub track_usage: bool,
}

impl CreateFlagRequest {
    pub fn into_flag(self, now: DateTime<Utc>) -> FeatureFlag {
        FeatureFlag {
            name: self.name,
            description: self.description,
            rollout_percentage: self.rollout_percentage,
            start_date: self.start_date,
            end_date: self.end_date,
            target_users: self.target_users,
            target_tenants: self.target_tenants,
            exclude_users: self.exclude_users,
            exclude_tenants: self.exclude_tenants,
            dependencies: self.dependencies,
            variants: self.variants,
            default_variant: self.default_variant,
            parent_key: self.parent_key,
            track_usage: self.track_usage,
            ..FeatureFlag::new(self.key, now)
        }
    }
}

/// Distinguishes an absent field from an explicit `null`.
fn nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Partial update. Omitted fields are left alone; `null` clears nullable fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateFlagRequest {
    #[serde(default, deserialize_with = "nullable")]
    pub name: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub description: Option<Option<String>>,
    #[serde(default)]
    pub rollout_percentage: Option<u8>,
    #[serde(default, deserialize_with = "nullable")]
    pub start_date: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "nullable")]
    pub end_date: Option<Option<DateTime<Utc>>>,
    #[serde(default)]
    pub target_users: Option<BTreeSet<String>>,
    #[serde(default)]
    pub target_tenants: Option<BTreeSet<String>>,
    #[serde(default)]
    pub exclude_users: Option<BTreeSet<String>>,
    #[serde(default)]
    pub exclude_tenants: Option<BTreeSet<String>>,
    #[serde(default)]
    pub dependencies: Option<BTreeSet<String>>,
    #[serde(default)]
    pub variants: Option<Vec<Variant>>,
    #[serde(default, deserialize_with = "nullable")]
    pub default_variant: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub parent_key: Option<Option<String>>,
    #[serde(default)]
    pub track_usage: Option<bool>,
}

impl UpdateFlagRequest {
    pub fn apply(self, flag: &mut FeatureFlag, now: DateTime<Utc>) {
        if let Some(name) = self.name {
            flag.name = name;
        }
        if let Some(description) = self.description {
            flag.description = description;
        }
        if let Some(rollout) = self.rollout_percentage {
            flag.rollout_percentage = rollout;
        }
        if let Some(start_date) = self.start_date {
            flag.start_date = start_date;
        }
        if let Some(end_date) = self.end_date {
            flag.end_date = end_date;
        }
        if let Some(users) = self.target_users {
            flag.target_users = users;
        }
        if let Some(tenants) = self.target_tenants {
            flag.target_tenants = tenants;
        }
        if let Some(users) = self.exclude_users {
            flag.exclude_users = users;
        }
        if let Some(tenants) = self.exclude_tenants {
            flag.exclude_tenants = tenants;
        }
        if let Some(dependencies) = self.dependencies {
            flag.dependencies = dependencies;
        }
        if let Some(variants) = self.variants {
            flag.variants = variants;
        }
        if let Some(default_variant) = self.default_variant {
            flag.default_variant = default_variant;
        }
        if let Some(parent_key) = self.parent_key {
            flag.parent_key = parent_key;
        }
        if let Some(track_usage) = self.track_usage {
            flag.track_usage = track_usage;
        }
        flag.updated_at = now;
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusChangeRequest {
    #[serde(default)]
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CloneFlagRequest {
    pub new_key: String,
    #[serde(default)]
    pub actor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteFlagResponse {
    pub key: String,
    pub deleted: bool,
}

/// One recorded evaluation of a tracked flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub flag_key: String,
    pub user_id: String,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregated usage bookkeeping kept by a store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub unique_users: u64,
    pub recent: Vec<UsageRecord>,
}

#[derive(Debug, Serialize)]
pub struct FlagStatistics {
    pub key: String,
    pub status: FlagStatus,
    pub rollout_percentage: u8,
    pub track_usage: bool,
    pub usage_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub unique_users: u64,
    pub recent_usage: Vec<UsageRecord>,
    pub variant_count: usize,
    pub dependency_count: usize,
    pub dependents: Vec<String>,
    pub children: Vec<String>,
}

// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Feature flag targeting, rollout and variant evaluation.
//!
//! Evaluation is a pure function of the flag, the flags it depends on, the
//! evaluation context and the evaluation instant. Nothing here performs I/O or
//! mutates shared state; callers hand in a [`FlagLookup`] for dependency
//! resolution and the current time.
//!
//! Rules are checked in a fixed order and the first failing rule decides the
//! outcome:
//!
//! 1. status
//! 2. start date, then end date
//! 3. user exclusion, then tenant exclusion
//! 4. user targeting, then tenant targeting
//! 5. percentage rollout
//! 6. dependencies (recursive, cycle-checked)

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use xxhash_rust::xxh3::xxh3_64;

use crate::model::{EvaluationContext, FeatureFlag, FlagCheckResponse};

/// Upper bound on nested dependency evaluation.
pub const DEFAULT_MAX_DEPENDENCY_DEPTH: usize = 16;

const BUCKET_COUNT: u64 = 100;
const VARIANT_SALT: &str = "variant";

/// Resolves flag keys to definitions during dependency evaluation
pub trait FlagLookup {
    fn lookup(&self, key: &str) -> Option<&FeatureFlag>;
}

impl FlagLookup for HashMap<String, FeatureFlag> {
    fn lookup(&self, key: &str) -> Option<&FeatureFlag> {
        self.get(key)
    }
}

/// Why an evaluation ended the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationReason {
    Enabled,
    FlagNotFound,
    FlagDisabled,
    NotStarted,
    Expired,
    UserExcluded,
    TenantExcluded,
    UserNotTargeted,
    TenantNotTargeted,
    OutOfRollout,
    DependencyUnsatisfied,
    DependencyCycle,
    DependencyTooDeep,
}

impl EvaluationReason {
    pub fn is_enabled(self) -> bool {
        self == EvaluationReason::Enabled
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EvaluationReason::Enabled => "enabled",
            EvaluationReason::FlagNotFound => "flag_not_found",
            EvaluationReason::FlagDisabled => "flag_disabled",
            EvaluationReason::NotStarted => "not_started",
            EvaluationReason::Expired => "expired",
            EvaluationReason::UserExcluded => "user_excluded",
            EvaluationReason::TenantExcluded => "tenant_excluded",
            EvaluationReason::UserNotTargeted => "user_not_targeted",
            EvaluationReason::TenantNotTargeted => "tenant_not_targeted",
            EvaluationReason::OutOfRollout => "out_of_rollout",
            EvaluationReason::DependencyUnsatisfied => "dependency_unsatisfied",
            EvaluationReason::DependencyCycle => "dependency_cycle",
            EvaluationReason::DependencyTooDeep => "dependency_too_deep",
        }
    }
}

/// Outcome of evaluating one flag for one context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagEvaluation {
    pub key: String,
    pub enabled: bool,
    pub variant: Option<String>,
    pub reason: EvaluationReason,
    /// Set when the variant table could not be used and the default variant was served.
    pub malformed_variants: bool,
}

impl FlagEvaluation {
    fn off(key: &str, reason: EvaluationReason) -> Self {
        Self {
            key: key.to_string(),
            enabled: false,
            variant: None,
            reason,
            malformed_variants: false,
        }
    }

    pub fn to_response(&self) -> FlagCheckResponse {
        FlagCheckResponse {
            enabled: self.enabled,
            variant: self.variant.clone(),
        }
    }
}

/// Evaluates flags against a fixed lookup and a fixed instant
pub struct Evaluator<'a> {
    flags: &'a dyn FlagLookup,
    now: DateTime<Utc>,
    max_depth: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(flags: &'a dyn FlagLookup, now: DateTime<Utc>) -> Self {
        Self {
            flags,
            now,
            max_depth: DEFAULT_MAX_DEPENDENCY_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Whether `flag` is on for `context`.
    pub fn is_enabled(&self, flag: &FeatureFlag, context: &EvaluationContext) -> bool {
        self.check(flag, context).is_enabled()
    }

    /// Run the rule chain and report the deciding reason.
    pub fn check(&self, flag: &FeatureFlag, context: &EvaluationContext) -> EvaluationReason {
        let mut path = vec![flag.key.clone()];
        self.check_with_path(flag, context, &mut path)
    }

    /// Evaluate a flag by key. Unknown keys evaluate to disabled.
    pub fn evaluate_key(&self, key: &str, context: &EvaluationContext) -> FlagEvaluation {
        match self.flags.lookup(key) {
            Some(flag) => self.evaluate(flag, context),
            None => {
                tracing::debug!(flag = key, "flag not found, failing closed");
                FlagEvaluation::off(key, EvaluationReason::FlagNotFound)
            }
        }
    }

    /// Decide on/off and, when on, pick the variant.
    pub fn evaluate(&self, flag: &FeatureFlag, context: &EvaluationContext) -> FlagEvaluation {
        let reason = self.check(flag, context);
        if !reason.is_enabled() {
            tracing::debug!(flag = %flag.key, reason = reason.as_str(), "flag evaluated off");
            return FlagEvaluation::off(&flag.key, reason);
        }

        let malformed = variant_table_is_malformed(flag);
        let variant = select_variant(flag, context.user_id());
        tracing::debug!(flag = %flag.key, variant = ?variant, "flag evaluated on");

        FlagEvaluation {
            key: flag.key.clone(),
            enabled: true,
            variant,
            reason,
            malformed_variants: malformed,
        }
    }

    fn check_with_path(
        &self,
        flag: &FeatureFlag,
        context: &EvaluationContext,
        path: &mut Vec<String>,
    ) -> EvaluationReason {
        if !flag.is_active() {
            return EvaluationReason::FlagDisabled;
        }

        if flag.start_date.is_some_and(|start| start > self.now) {
            return EvaluationReason::NotStarted;
        }

        if flag.end_date.is_some_and(|end| end < self.now) {
            return EvaluationReason::Expired;
        }

        if let Some(user_id) = context.user_id() {
            if flag.exclude_users.contains(user_id) {
                return EvaluationReason::UserExcluded;
            }
        }

        if let Some(tenant_id) = context.tenant_id() {
            if flag.exclude_tenants.contains(tenant_id) {
                return EvaluationReason::TenantExcluded;
            }
        }

        if !flag.target_users.is_empty() {
            let targeted = context
                .user_id()
                .is_some_and(|user_id| flag.target_users.contains(user_id));
            if !targeted {
                return EvaluationReason::UserNotTargeted;
            }
        }

        if !flag.target_tenants.is_empty() {
            let targeted = context
                .tenant_id()
                .is_some_and(|tenant_id| flag.target_tenants.contains(tenant_id));
            if !targeted {
                return EvaluationReason::TenantNotTargeted;
            }
        }

        if flag.rollout_percentage < 100
            && rollout_bucket(context.user_id(), &flag.key) >= u64::from(flag.rollout_percentage)
        {
            return EvaluationReason::OutOfRollout;
        }

        for dependency_key in &flag.dependencies {
            if path.iter().any(|visited| visited == dependency_key) {
                tracing::error!(
                    flag = %flag.key,
                    dependency = %dependency_key,
                    path = %path.join(" -> "),
                    "dependency cycle in flag configuration"
                );
                return EvaluationReason::DependencyCycle;
            }

            if path.len() > self.max_depth {
                tracing::warn!(
                    flag = %flag.key,
                    depth = path.len(),
                    max_depth = self.max_depth,
                    "dependency chain too deep"
                );
                return EvaluationReason::DependencyTooDeep;
            }

            let Some(dependency) = self.flags.lookup(dependency_key) else {
                tracing::debug!(flag = %flag.key, dependency = %dependency_key, "dependency not found");
                return EvaluationReason::DependencyUnsatisfied;
            };

            path.push(dependency_key.clone());
            let outcome = self.check_with_path(dependency, context, path);
            path.pop();

            match outcome {
                EvaluationReason::Enabled => {}
                EvaluationReason::DependencyCycle | EvaluationReason::DependencyTooDeep => {
                    return outcome
                }
                _ => return EvaluationReason::DependencyUnsatisfied,
            }
        }

        EvaluationReason::Enabled
    }
}

/// Bucket in `0..100` used for percentage rollout.
///
/// Anonymous contexts hash the flag key alone, so every anonymous caller lands
/// in the same bucket and a partial rollout is all-or-nothing for them.
pub fn rollout_bucket(user_id: Option<&str>, flag_key: &str) -> u64 {
    bucket(&[user_id.unwrap_or_default(), flag_key])
}

/// Bucket in `0..100` used for variant assignment, salted apart from the rollout bucket.
pub fn variant_bucket(user_id: Option<&str>, flag_key: &str) -> u64 {
    bucket(&[user_id.unwrap_or_default(), flag_key, VARIANT_SALT])
}

fn bucket(parts: &[&str]) -> u64 {
    let input = parts.concat();
    xxh3_64(input.as_bytes()) % BUCKET_COUNT
}

/// A table whose arms cannot all be reached within 100 buckets.
pub fn variant_table_is_malformed(flag: &FeatureFlag) -> bool {
    let total: u32 = flag.variants.iter().map(|v| u32::from(v.percentage)).sum();
    total > 100
}

/// Pick the experiment arm for `user_id`. Only meaningful for an enabled flag.
///
/// Arms are matched by walking cumulative percentages against the variant
/// bucket. A table summing past 100 is not walked at all: every caller gets
/// `default_variant`, whereas a plain walk would still hand the leading arms
/// their buckets and starve the trailing ones.
pub fn select_variant(flag: &FeatureFlag, user_id: Option<&str>) -> Option<String> {
    if flag.variants.is_empty() {
        return flag.default_variant.clone();
    }

    if variant_table_is_malformed(flag) {
        tracing::warn!(flag = %flag.key, "variant percentages exceed 100, serving default variant");
        return flag.default_variant.clone();
    }

    let bucket = variant_bucket(user_id, &flag.key);
    let mut cumulative = 0u64;
    for variant in &flag.variants {
        cumulative += u64::from(variant.percentage);
        if cumulative > bucket {
            return Some(variant.name.clone());
        }
    }

    flag.default_variant.clone()
}

// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Validation of flag definitions submitted through the admin API.
//!
//! The evaluator tolerates malformed definitions and fails closed; this module
//! is where they get rejected before they are stored.

use std::collections::HashSet;

use thiserror::Error;

use crate::evaluator::FlagLookup;
use crate::model::FeatureFlag;

pub const MAX_KEY_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("flag key must not be empty")]
    EmptyKey,
    #[error("flag key {0:?} is longer than {} characters", MAX_KEY_LEN)]
    KeyTooLong(String),
    #[error("flag key {0:?} may only contain letters, digits, '_', '-', '.' and ':'")]
    InvalidKey(String),
    #[error("flag {0} already exists")]
    DuplicateKey(String),
    #[error("rollout_percentage must be between 0 and 100, got {0}")]
    RolloutOutOfRange(u8),
    #[error("variant {name} percentage must be between 0 and 100, got {percentage}")]
    VariantPercentageOutOfRange { name: String, percentage: u8 },
    #[error("variant percentages add up to {0}, more than 100")]
    VariantTotalExceeded(u32),
    #[error("variant name must not be empty")]
    EmptyVariantName,
    #[error("variant {0} is listed more than once")]
    DuplicateVariant(String),
    #[error("default_variant {0} is not one of the flag's variants")]
    UnknownDefaultVariant(String),
    #[error("start_date must not be after end_date")]
    InvertedWindow,
    #[error("flag {0} cannot depend on itself")]
    SelfDependency(String),
    #[error("flag {0} cannot be its own parent")]
    SelfParent(String),
    #[error("dependency {0} does not exist")]
    UnknownDependency(String),
    #[error("parent flag {0} does not exist")]
    UnknownParent(String),
    #[error("dependency cycle: {0}")]
    DependencyCycle(String),
}

pub fn validate_key(key: &str) -> Result<(), ValidationError> {
    if key.trim().is_empty() {
        return Err(ValidationError::EmptyKey);
    }
    if key.chars().count() > MAX_KEY_LEN {
        return Err(ValidationError::KeyTooLong(key.to_string()));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':');
    if !key.chars().all(allowed) {
        return Err(ValidationError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Checks that only need the flag itself.
pub fn validate_definition(flag: &FeatureFlag) -> Result<(), ValidationError> {
    validate_key(&flag.key)?;

    if flag.rollout_percentage > 100 {
        return Err(ValidationError::RolloutOutOfRange(flag.rollout_percentage));
    }

    let mut names = HashSet::new();
    let mut total = 0u32;
    for variant in &flag.variants {
        if variant.name.trim().is_empty() {
            return Err(ValidationError::EmptyVariantName);
        }
        if variant.percentage > 100 {
            return Err(ValidationError::VariantPercentageOutOfRange {
                name: variant.name.clone(),
                percentage: variant.percentage,
            });
        }
        if !names.insert(variant.name.as_str()) {
            return Err(ValidationError::DuplicateVariant(variant.name.clone()));
        }
        total += u32::from(variant.percentage);
    }
    if total > 100 {
        return Err(ValidationError::VariantTotalExceeded(total));
    }

    if let Some(default_variant) = &flag.default_variant {
        if !flag.variants.is_empty() && !names.contains(default_variant.as_str()) {
            return Err(ValidationError::UnknownDefaultVariant(default_variant.clone()));
        }
    }

    if let (Some(start), Some(end)) = (flag.start_date, flag.end_date) {
        if start > end {
            return Err(ValidationError::InvertedWindow);
        }
    }

    if flag.dependencies.contains(&flag.key) {
        return Err(ValidationError::SelfDependency(flag.key.clone()));
    }

    if flag.parent_key.as_deref() == Some(flag.key.as_str()) {
        return Err(ValidationError::SelfParent(flag.key.clone()));
    }

    Ok(())
}

/// Checks against the other stored flags: references exist and no dependency loop is introduced.
pub fn validate_references(
    flag: &FeatureFlag,
    flags: &dyn FlagLookup,
) -> Result<(), ValidationError> {
    for dependency in &flag.dependencies {
        if flags.lookup(dependency).is_none() {
            return Err(ValidationError::UnknownDependency(dependency.clone()));
        }
    }

    if let Some(parent) = &flag.parent_key {
        if flags.lookup(parent).is_none() {
            return Err(ValidationError::UnknownParent(parent.clone()));
        }
    }

    let mut visited = HashSet::new();
    for dependency in &flag.dependencies {
        let mut path = vec![flag.key.clone(), dependency.clone()];
        if reaches(&flag.key, dependency, flags, &mut visited, &mut path) {
            return Err(ValidationError::DependencyCycle(path.join(" -> ")));
        }
    }

    Ok(())
}

fn reaches(
    target: &str,
    current: &str,
    flags: &dyn FlagLookup,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> bool {
    if current == target {
        return true;
    }
    if !visited.insert(current.to_string()) {
        return false;
    }
    let Some(flag) = flags.lookup(current) else {
        return false;
    };
    for dependency in &flag.dependencies {
        path.push(dependency.clone());
        if reaches(target, dependency, flags, visited, path) {
            return true;
        }
        path.pop();
    }
    false
}

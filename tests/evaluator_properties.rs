//! Property tests for flag evaluation.
//!
//! Randomised flags and contexts checked against the invariants request
//! handlers rely on: disabled and excluded always lose, full rollout always
//! wins, and nothing depends on hidden state.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use fleet_flags::{
    select_variant, EvaluationContext, EvaluationReason, Evaluator, FeatureFlag, FlagStatus,
    Variant,
};
use proptest::collection::{btree_set, vec};
use proptest::option;
use proptest::prelude::*;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap()
}

fn identifier() -> impl Strategy<Value = String> {
    "[a-z0-9-]{1,12}"
}

fn context() -> impl Strategy<Value = EvaluationContext> {
    (option::of(identifier()), option::of(identifier()))
        .prop_map(|(user_id, tenant_id)| EvaluationContext { user_id, tenant_id })
}

fn flag() -> impl Strategy<Value = FeatureFlag> {
    (
        "[a-z.]{1,16}",
        any::<bool>(),
        0u8..=100,
        btree_set(identifier(), 0..4),
        btree_set(identifier(), 0..4),
        btree_set(identifier(), 0..4),
        btree_set(identifier(), 0..4),
    )
        .prop_map(
            |(key, enabled, rollout, target_users, target_tenants, exclude_users, exclude_tenants)| {
                let mut flag = FeatureFlag::new(key, now());
                flag.status = if enabled {
                    FlagStatus::Enabled
                } else {
                    FlagStatus::Disabled
                };
                flag.rollout_percentage = rollout;
                flag.target_users = target_users;
                flag.target_tenants = target_tenants;
                flag.exclude_users = exclude_users;
                flag.exclude_tenants = exclude_tenants;
                flag
            },
        )
}

proptest! {
    /// A disabled flag is off whatever else it says.
    #[test]
    fn disabled_flags_are_never_on(mut flag in flag(), ctx in context()) {
        flag.status = FlagStatus::Disabled;
        let flags: HashMap<String, FeatureFlag> = HashMap::new();
        let evaluator = Evaluator::new(&flags, now());

        prop_assert!(!evaluator.is_enabled(&flag, &ctx));
    }

    /// Exclusion beats a full rollout.
    #[test]
    fn excluded_users_are_never_on(mut flag in flag(), user in identifier()) {
        flag.status = FlagStatus::Enabled;
        flag.rollout_percentage = 100;
        flag.exclude_users.insert(user.clone());
        let flags: HashMap<String, FeatureFlag> = HashMap::new();
        let evaluator = Evaluator::new(&flags, now());

        let ctx = EvaluationContext::for_user(user);
        prop_assert_eq!(evaluator.check(&flag, &ctx), EvaluationReason::UserExcluded);
    }

    /// Full rollout with no lists and no dependencies is on for everybody.
    #[test]
    fn open_full_rollout_is_always_on(key in "[a-z.]{1,16}", ctx in context()) {
        let mut flag = FeatureFlag::new(key, now());
        flag.status = FlagStatus::Enabled;
        let flags: HashMap<String, FeatureFlag> = HashMap::new();
        let evaluator = Evaluator::new(&flags, now());

        prop_assert!(evaluator.is_enabled(&flag, &ctx));
    }

    /// Zero rollout is off for everybody.
    #[test]
    fn zero_rollout_is_always_off(mut flag in flag(), ctx in context()) {
        flag.rollout_percentage = 0;
        let flags: HashMap<String, FeatureFlag> = HashMap::new();
        let evaluator = Evaluator::new(&flags, now());

        prop_assert!(!evaluator.is_enabled(&flag, &ctx));
    }

    /// Same inputs, same answer.
    #[test]
    fn evaluation_is_deterministic(flag in flag(), ctx in context()) {
        let flags: HashMap<String, FeatureFlag> = HashMap::new();
        let first = Evaluator::new(&flags, now()).evaluate(&flag, &ctx);
        let second = Evaluator::new(&flags, now()).evaluate(&flag, &ctx);

        prop_assert_eq!(first, second);
    }

    /// Variant assignment is sticky and stays inside the table.
    #[test]
    fn variants_are_stable_and_known(
        key in "[a-z.]{1,16}",
        user in identifier(),
        weights in vec(0u8..=25, 1..5),
    ) {
        let mut flag = FeatureFlag::new(key, now());
        flag.variants = weights
            .iter()
            .enumerate()
            .map(|(i, w)| Variant::new(format!("arm-{i}"), *w))
            .collect();
        flag.default_variant = Some("arm-0".to_string());

        let chosen = select_variant(&flag, Some(&user));
        prop_assert_eq!(&chosen, &select_variant(&flag, Some(&user)));

        let name = chosen.unwrap_or_default();
        prop_assert!(flag.variants.iter().any(|v| v.name == name));
    }
}

// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Feature flag evaluation for fleet tenants.
//!
//! The [`evaluator`] decides whether a flag is on for a user/tenant and which
//! variant they get. Everything else here is the service around it: flag
//! storage, usage bookkeeping and the HTTP API.

pub mod api;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod seed;
pub mod store;
pub mod usage;
pub mod validation;

pub use evaluator::{
    rollout_bucket, select_variant, variant_bucket, EvaluationReason, Evaluator, FlagEvaluation,
    FlagLookup,
};
pub use model::{EvaluationContext, FeatureFlag, FlagStatus, Variant};

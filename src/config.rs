// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::evaluator::DEFAULT_MAX_DEPENDENCY_DEPTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" | "plain" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => bail!("unknown log format {other:?}, expected text or json"),
        }
    }
}

pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub redis_prefix: String,
    pub seed_file: Option<PathBuf>,
    pub usage_queue_capacity: usize,
    pub max_dependency_depth: usize,
    pub shutdown_grace: Duration,
    pub log_format: LogFormat,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let listen_addr: SocketAddr = env::var("FLAGS_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:9090".to_string())
            .parse()
            .context("invalid FLAGS_ADDR")?;

        let redis_url = optional("FLAGS_REDIS_URL");
        let redis_prefix = optional("FLAGS_REDIS_PREFIX").unwrap_or_else(|| "fleetflags:".to_string());
        let seed_file = optional("FLAGS_SEED_FILE").map(PathBuf::from);

        let usage_queue_capacity = parse_number("FLAGS_USAGE_QUEUE_CAPACITY", 10_000)?;
        let max_dependency_depth =
            parse_number("FLAGS_MAX_DEPENDENCY_DEPTH", DEFAULT_MAX_DEPENDENCY_DEPTH)?;
        let shutdown_grace = parse_duration("FLAGS_SHUTDOWN_GRACE_SECONDS", 5)?;

        let log_format = optional("FLAGS_LOG_FORMAT")
            .map(|raw| raw.parse::<LogFormat>())
            .transpose()
            .context("invalid FLAGS_LOG_FORMAT")?
            .unwrap_or(LogFormat::Text);

        Ok(Self {
            listen_addr,
            redis_url,
            redis_prefix,
            seed_file,
            usage_queue_capacity,
            max_dependency_depth,
            shutdown_grace,
            log_format,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }
}

fn optional(env_key: &str) -> Option<String> {
    env::var(env_key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_number(env_key: &str, default: usize) -> Result<usize> {
    match optional(env_key) {
        Some(raw) => parse_value(env_key, &raw),
        None => Ok(default),
    }
}

fn parse_duration(env_key: &str, default_secs: u64) -> Result<Duration> {
    let raw = env::var(env_key).unwrap_or_else(|_| default_secs.to_string());
    let secs: u64 = parse_value(env_key, &raw)?;

    Ok(Duration::from_secs(secs))
}

fn parse_value<T: FromStr>(env_key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{env_key} must be a non-negative integer, got {raw:?}"))
}

// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Fire-and-forget usage recording.
//!
//! Handlers push [`UsageEvent`]s onto a bounded channel without waiting; a
//! single writer task drains the channel into the store. Being the only writer
//! keeps counter increments from racing. When the queue is full the event is
//! dropped and counted rather than slowing down evaluation.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::metrics::Metrics;
use crate::model::FeatureFlag;
use crate::store::{FlagStore, UsageEvent};

/// Sending half of the usage queue
#[derive(Clone)]
pub struct UsageRecorder {
    tx: mpsc::Sender<UsageEvent>,
    metrics: Metrics,
}

impl UsageRecorder {
    pub fn channel(capacity: usize, metrics: Metrics) -> (Self, mpsc::Receiver<UsageEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, metrics }, rx)
    }

    /// Queue a usage event for `flag` if it tracks usage. Never waits.
    pub fn record(&self, flag: &FeatureFlag, user_id: Option<&str>) {
        if !flag.track_usage {
            return;
        }

        let event = UsageEvent {
            flag_key: flag.key.clone(),
            user_id: user_id.map(str::to_string),
            recorded_at: Utc::now(),
        };

        match self.tx.try_send(event) {
            Ok(()) => self.metrics.record_usage_enqueued(),
            Err(TrySendError::Full(event)) => {
                self.metrics.record_usage_dropped();
                tracing::warn!(flag = %event.flag_key, "usage queue full, dropping event");
            }
            Err(TrySendError::Closed(event)) => {
                self.metrics.record_usage_dropped();
                tracing::warn!(flag = %event.flag_key, "usage writer stopped, dropping event");
            }
        }
    }
}

/// Start the writer. It exits once every [`UsageRecorder`] has been dropped and the queue is empty.
pub fn spawn_usage_writer(
    store: Arc<dyn FlagStore>,
    rx: mpsc::Receiver<UsageEvent>,
    metrics: Metrics,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("usage writer started");
        run_writer(store, rx, metrics).await;
        tracing::info!("usage writer drained");
    })
}

async fn run_writer(store: Arc<dyn FlagStore>, mut rx: mpsc::Receiver<UsageEvent>, metrics: Metrics) {
    while let Some(event) = rx.recv().await {
        match store.record_usage(&event).await {
            Ok(()) => metrics.record_usage_written(),
            Err(error) => {
                metrics.record_usage_write_failure();
                tracing::error!(flag = %event.flag_key, error = %error, "failed to record usage");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::store::MockFlagStore;

    fn tracked(key: &str) -> FeatureFlag {
        let mut flag = FeatureFlag::new(key, Utc::now());
        flag.track_usage = true;
        flag
    }

    #[tokio::test]
    async fn test_writer_persists_queued_events() {
        let metrics = Metrics::new().unwrap();
        let mut store = MockFlagStore::new();
        store
            .expect_record_usage()
            .withf(|event| event.flag_key == "fleet.geofences")
            .times(2)
            .returning(|_| Ok(()));

        let (recorder, rx) = UsageRecorder::channel(16, metrics.clone());
        let writer = spawn_usage_writer(Arc::new(store), rx, metrics.clone());

        let flag = tracked("fleet.geofences");
        recorder.record(&flag, Some("u-1"));
        recorder.record(&flag, None);
        drop(recorder);

        writer.await.unwrap();
        assert_eq!(metrics.usage_enqueued.get(), 2);
        assert_eq!(metrics.usage_written.get(), 2);
    }

    #[tokio::test]
    async fn test_untracked_flags_are_not_queued() {
        let metrics = Metrics::new().unwrap();
        let (recorder, mut rx) = UsageRecorder::channel(4, metrics.clone());

        let flag = FeatureFlag::new("fleet.geofences", Utc::now());
        recorder.record(&flag, Some("u-1"));

        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.usage_enqueued.get(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let metrics = Metrics::new().unwrap();
        let (recorder, mut rx) = UsageRecorder::channel(1, metrics.clone());

        let flag = tracked("fleet.geofences");
        recorder.record(&flag, Some("u-1"));
        recorder.record(&flag, Some("u-2"));

        assert_eq!(metrics.usage_enqueued.get(), 1);
        assert_eq!(metrics.usage_dropped.get(), 1);
        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.user_id.as_deref(), Some("u-1"));
    }

    #[tokio::test]
    async fn test_write_failures_are_counted() {
        let metrics = Metrics::new().unwrap();
        let mut store = MockFlagStore::new();
        store
            .expect_record_usage()
            .times(1)
            .returning(|_| Err(AppError::internal("Redis usage write failed", "timeout")));

        let (recorder, rx) = UsageRecorder::channel(4, metrics.clone());
        let writer = spawn_usage_writer(Arc::new(store), rx, metrics.clone());

        recorder.record(&tracked("fleet.geofences"), Some("u-1"));
        drop(recorder);
        writer.await.unwrap();

        assert_eq!(metrics.usage_write_failures.get(), 1);
        assert_eq!(metrics.usage_written.get(), 0);
    }
}

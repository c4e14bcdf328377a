//! The publisher loop: claim, fan out, commit.
//!
//! Each batch is claimed exclusively (skip-locked), delivered by a bounded
//! worker pool (one job per event, all subscribers concurrently per event),
//! and committed in `global_seq` order: a full ack is `mark_published`, any
//! failure is `mark_retry`, an exhausted budget is `move_to_dlq`. The claim's
//! outcomes only land on `complete`, so a crash mid-batch releases the rows
//! untouched and a restart re-delivers: at-least-once by construction.
//!
//! Shutdown is cooperative: the signal stops the poller between batches;
//! the in-flight batch drains to a deterministic state first.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use mnx_events::Delivery;
use mnx_observability::{Histogram, MetricsRegistry};
use mnx_store::{EventStore, EventStoreError, RetryDisposition};

use crate::config::{PublisherConfig, SubscriberEndpoint};
use crate::delivery::{DeliveryFailure, SubscriberClient};

async fn deliver_one(
    client: Arc<SubscriberClient>,
    endpoints: Vec<SubscriberEndpoint>,
    histogram: Arc<Histogram>,
    delivery: Delivery,
) -> (u64, Result<(), Vec<DeliveryFailure>>) {
    let started = Instant::now();
    let results = join_all(
        endpoints
            .iter()
            .map(|endpoint| client.deliver(endpoint, &delivery)),
    )
    .await;
    histogram.observe(started.elapsed().as_secs_f64());

    let failures: Vec<DeliveryFailure> = results.into_iter().filter_map(Result::err).collect();
    let outcome = if failures.is_empty() {
        Ok(())
    } else {
        Err(failures)
    };
    (delivery.global_seq, outcome)
}

#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("store error: {0}")]
    Store(#[from] EventStoreError),
}

pub struct Publisher {
    store: Arc<dyn EventStore>,
    client: Arc<SubscriberClient>,
    config: PublisherConfig,
    metrics: Arc<MetricsRegistry>,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn EventStore>,
        config: PublisherConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let client = Arc::new(SubscriberClient::new(
            config.publisher_id.clone(),
            config.delivery_timeout,
        ));
        Self {
            store,
            client,
            config,
            metrics,
        }
    }

    /// Poll/deliver until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            publisher_id = %self.config.publisher_id,
            batch_size = self.config.batch_size,
            poll_interval_ms = %self.config.poll_interval.as_millis(),
            subscribers = self.config.endpoints.len(),
            "publisher starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delivered = match self.process_batch().await {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "batch processing failed");
                    0
                }
            };

            if delivered == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!(publisher_id = %self.config.publisher_id, "publisher drained and stopped");
    }

    /// Claim and process one batch. Returns the number of events handled.
    pub async fn process_batch(&self) -> Result<usize, PublisherError> {
        let mut claim = self.store.claim_unpublished(self.config.batch_size).await?;
        let entries = claim.entries().to_vec();
        if entries.is_empty() {
            claim.complete().await?;
            return Ok(0);
        }

        self.refresh_lag_gauges().await;

        // Fan-out: one delivery job per event, started in global_seq order
        // with bounded concurrency (`buffered` both starts and yields in
        // order, so a single-worker configuration is strictly sequential
        // per subscriber). Within one event, all subscribers are posted
        // concurrently.
        let mut jobs = Vec::with_capacity(entries.len());
        for entry in entries.iter() {
            let delivery = entry.record.to_delivery();
            let client = self.client.clone();
            let endpoints = self.config.endpoints.clone();
            let histogram = self.metrics.histogram("publish_duration_seconds");

            jobs.push(deliver_one(client, endpoints, histogram, delivery));
        }

        let outcomes: Vec<(u64, Result<(), Vec<DeliveryFailure>>)> = stream::iter(jobs)
            .buffered(self.config.worker_concurrency.max(1))
            .collect()
            .await;

        // Committer: apply outcomes in global_seq order, then commit the claim.
        for (seq, outcome) in &outcomes {
            match outcome {
                Ok(()) => {
                    claim.mark_published(*seq).await?;
                    self.metrics.counter("events_published_total").inc();
                }
                Err(failures) => {
                    for failure in failures {
                        self.metrics
                            .counter_with(
                                "events_failed_total",
                                &[("error_type", failure.kind.label().as_str())],
                            )
                            .inc();
                    }
                    let detail = failures
                        .iter()
                        .map(|f| f.to_string())
                        .collect::<Vec<_>>()
                        .join("; ");

                    match claim.mark_retry(*seq, &detail).await? {
                        RetryDisposition::Retryable { next_retry_at } => {
                            warn!(global_seq = seq, next_retry_at = %next_retry_at, "delivery failed, scheduled retry");
                        }
                        RetryDisposition::Exhausted => {
                            warn!(global_seq = seq, "retry budget exhausted, quarantining");
                            claim
                                .move_to_dlq(
                                    *seq,
                                    &format!("max retries exceeded: {detail}"),
                                    &self.config.publisher_id,
                                )
                                .await?;
                        }
                    }
                }
            }
        }
        claim.complete().await?;

        self.refresh_lag_gauges().await;
        Ok(outcomes.len())
    }

    async fn refresh_lag_gauges(&self) {
        match self.store.outbox_lag().await {
            Ok(lags) => {
                for lag in lags {
                    let world = lag.scope.world_id.to_string();
                    self.metrics
                        .gauge_with(
                            "outbox_lag_seconds",
                            &[("world_id", world.as_str()), ("branch", lag.scope.branch.as_str())],
                        )
                        .set(lag.lag_seconds);
                }
            }
            Err(e) => warn!(error = %e, "failed to compute outbox lag"),
        }
    }
}

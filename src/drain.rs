// ============================================================================
// Queue Drainer
// ============================================================================
//
// One invocation: check queue size, take the distributed lock, pull batches,
// deliver each message through the rate limiter, remove every processed entry
// exactly once, then flush running counters and per-campaign tallies. The
// lock is released on every exit path; failures local to one message never
// abort the batch.

use crate::campaign::CampaignAggregator;
use crate::config::DrainConfig;
use crate::limiter::RateLimiter;
use crate::message::{decode, Decoded};
use crate::queue::QueueStore;
use crate::telegram::Transport;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

/// Result of one drain invocation
#[derive(Debug)]
pub enum DrainOutcome {
    /// Nothing was done: empty queue or another worker holds the lock
    Skipped { reason: &'static str },
    Finished(DrainSummary),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainSummary {
    /// Messages delivered successfully
    pub processed: u64,
    /// Messages whose delivery the transport rejected
    pub failed: u64,
    /// Entries still queued when the loop exited
    pub remaining: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Default)]
struct BatchTally {
    sent: i32,
    failed: i32,
}

pub struct Drainer {
    queue: Arc<dyn QueueStore>,
    transport: Arc<dyn Transport>,
    aggregator: CampaignAggregator,
    config: DrainConfig,
}

impl Drainer {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        transport: Arc<dyn Transport>,
        aggregator: CampaignAggregator,
        config: DrainConfig,
    ) -> Self {
        Self {
            queue,
            transport,
            aggregator,
            config,
        }
    }

    /// Run one drain invocation.
    ///
    /// Errors from the queue store are fatal for this invocation; the TTL on
    /// the lock self-heals an aborted run.
    pub async fn drain(&self) -> Result<DrainOutcome> {
        let started = Instant::now();

        // Size fast path: skip the lock entirely when there is nothing to do
        let queued = self.queue.len().await?;
        if queued == 0 {
            return Ok(DrainOutcome::Skipped {
                reason: "Queue is empty",
            });
        }

        let token = match self
            .queue
            .try_acquire_lock(self.config.lock_ttl_seconds)
            .await?
        {
            Some(token) => token,
            None => {
                tracing::info!("Drain lock contended; another worker is processing");
                return Ok(DrainOutcome::Skipped {
                    reason: "Another worker is processing",
                });
            }
        };

        let result = self.drain_locked(&token, started).await;

        // Unconditional release; a failure here is survivable because the TTL
        // expires the lock on its own
        match self.queue.release_lock(&token).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("Drain lock was no longer ours at release"),
            Err(e) => tracing::warn!(error = %e, "Failed to release drain lock"),
        }

        result.map(DrainOutcome::Finished)
    }

    async fn drain_locked(&self, token: &str, started: Instant) -> Result<DrainSummary> {
        let budget = Duration::from_millis(self.config.max_duration_ms);
        let extend_every = Duration::from_millis(self.config.lock_extend_interval_ms);
        let delay = Duration::from_millis(self.config.message_delay_ms);

        // Fresh limiter per invocation; windowing state never outlives a drain
        let mut limiter = RateLimiter::new(self.config.messages_per_second);
        let mut last_extend = started;
        let mut processed: u64 = 0;
        let mut failed: u64 = 0;
        let mut tallies: HashMap<String, BatchTally> = HashMap::new();

        'drain: while started.elapsed() < budget {
            if last_extend.elapsed() >= extend_every {
                if !self
                    .queue
                    .extend_lock(token, self.config.lock_ttl_seconds)
                    .await?
                {
                    tracing::warn!("Drain lock ownership lost mid-drain; stopping");
                    break;
                }
                last_extend = Instant::now();
            }

            let batch = self.queue.peek_batch(self.config.batch_size).await?;
            if batch.is_empty() {
                break;
            }

            let mut decodable_in_batch = 0usize;
            for raw in batch {
                if started.elapsed() >= budget {
                    break 'drain;
                }

                let message = match decode(&raw) {
                    Decoded::Message(m) => m,
                    Decoded::Malformed => {
                        // Can never succeed; drop it without retry
                        tracing::warn!(
                            entry_prefix = %raw.chars().take(40).collect::<String>(),
                            "Discarding malformed queue entry"
                        );
                        self.queue.remove(&raw).await?;
                        continue;
                    }
                };
                decodable_in_batch += 1;

                limiter.wait().await;
                let outcome = self.transport.send(&message).await;

                // Processed-once: the entry leaves the queue whether or not
                // the delivery succeeded
                self.queue.remove(&raw).await?;

                if outcome.success {
                    processed += 1;
                } else {
                    failed += 1;
                }

                if let Some(batch_id) = &message.batch_id {
                    let tally = tallies.entry(batch_id.clone()).or_default();
                    if outcome.success {
                        tally.sent += 1;
                    } else {
                        tally.failed += 1;
                    }

                    // Accounting failures are logged and swallowed: the
                    // message is already sent and must stay counted locally
                    if let Err(e) = self
                        .aggregator
                        .update_recipient_status(batch_id, &message.chat_id, &outcome)
                        .await
                    {
                        tracing::warn!(
                            error = %e,
                            batch_id = %batch_id,
                            chat_id = %message.chat_id,
                            "Failed to record recipient status"
                        );
                    }
                }

                // Courtesy throttle on top of the rate limiter
                sleep(delay).await;
            }

            if decodable_in_batch == 0 {
                // Whole batch was malformed (and discarded); leave the rest
                // of the queue to the next invocation
                break;
            }
        }

        if processed + failed > 0 {
            self.queue
                .record_stats(processed, failed, Utc::now().timestamp_millis())
                .await?;
        }

        for (batch_id, tally) in &tallies {
            if let Err(e) = self
                .aggregator
                .apply_delta(batch_id, tally.sent, tally.failed)
                .await
            {
                tracing::warn!(
                    error = %e,
                    batch_id = %batch_id,
                    "Failed to flush campaign tally"
                );
            }
        }

        let remaining = self.queue.len().await?;
        let summary = DrainSummary {
            processed,
            failed,
            remaining,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            processed = summary.processed,
            failed = summary.failed,
            remaining = summary.remaining,
            duration_ms = summary.duration_ms,
            "Drain finished"
        );
        Ok(summary)
    }
}

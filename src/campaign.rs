// ============================================================================
// Campaign Aggregation (Postgres)
// ============================================================================
//
// Applies drain outcomes to campaign and recipient rows. Campaign completion
// is monotonic: once sent + failed reaches queued, the status never reverts.
// Recipient updates are scoped to status=pending so a stale duplicate attempt
// cannot overwrite a terminal row.

use crate::db::DbPool;
use crate::telegram::{DeliveryResult, FailureReason};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Pending => "pending",
            CampaignStatus::Processing => "processing",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "pending" => CampaignStatus::Pending,
            "processing" => CampaignStatus::Processing,
            "completed" => CampaignStatus::Completed,
            _ => CampaignStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientStatus {
    Sent,
    Failed,
}

impl RecipientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientStatus::Sent => "sent",
            RecipientStatus::Failed => "failed",
        }
    }
}

/// Aggregate state of one broadcast campaign
#[derive(Debug, Clone)]
pub struct CampaignRecord {
    pub batch_id: String,
    pub queued_count: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    pub status: CampaignStatus,
}

/// Persistence boundary for campaign and recipient rows
#[async_trait]
pub trait CampaignRepo: Send + Sync {
    async fn fetch_campaign(&self, batch_id: &str) -> Result<Option<CampaignRecord>>;

    /// Write back the new counters and status; `completed_now` stamps
    /// completedAt exactly once, on the pending→completed transition
    async fn store_progress(
        &self,
        batch_id: &str,
        sent_count: i32,
        failed_count: i32,
        status: CampaignStatus,
        completed_now: bool,
    ) -> Result<()>;

    /// Update the recipient row scoped to status=pending. Returns whether a
    /// row actually changed; false means the row was already terminal.
    async fn mark_recipient(
        &self,
        batch_id: &str,
        chat_id: &str,
        status: RecipientStatus,
        error_message: Option<&str>,
        failure_reason: Option<&str>,
    ) -> Result<bool>;
}

pub struct CampaignAggregator {
    repo: Arc<dyn CampaignRepo>,
}

impl CampaignAggregator {
    pub fn new(repo: Arc<dyn CampaignRepo>) -> Self {
        Self { repo }
    }

    /// Fold one drain's tallies into the campaign row.
    ///
    /// A missing campaign is a no-op: the batch may belong to another system
    /// or have been purged.
    pub async fn apply_delta(&self, batch_id: &str, sent_delta: i32, failed_delta: i32) -> Result<()> {
        let campaign = match self.repo.fetch_campaign(batch_id).await? {
            Some(c) => c,
            None => {
                tracing::debug!(batch_id = %batch_id, "Campaign not found; skipping delta");
                return Ok(());
            }
        };

        let new_sent = campaign.sent_count + sent_delta;
        let new_failed = campaign.failed_count + failed_delta;
        let reached_total = new_sent + new_failed >= campaign.queued_count;
        let already_completed = campaign.status == CampaignStatus::Completed;

        let status = if reached_total || already_completed {
            CampaignStatus::Completed
        } else {
            CampaignStatus::Processing
        };

        self.repo
            .store_progress(
                batch_id,
                new_sent,
                new_failed,
                status,
                reached_total && !already_completed,
            )
            .await?;

        tracing::info!(
            batch_id = %batch_id,
            sent = new_sent,
            failed = new_failed,
            status = status.as_str(),
            "Updated campaign progress"
        );
        Ok(())
    }

    /// Record one recipient's terminal state. The failure reason is derived
    /// from the transport error text; sentAt is stamped only on success.
    pub async fn update_recipient_status(
        &self,
        batch_id: &str,
        chat_id: &str,
        outcome: &DeliveryResult,
    ) -> Result<bool> {
        let (status, error_message, failure_reason) = if outcome.success {
            (RecipientStatus::Sent, None, None)
        } else {
            let error_text = outcome.error_text.as_deref().unwrap_or("unknown error");
            (
                RecipientStatus::Failed,
                Some(error_text),
                Some(FailureReason::classify(error_text).as_str()),
            )
        };

        self.repo
            .mark_recipient(batch_id, chat_id, status, error_message, failure_reason)
            .await
    }
}

// ============================================================================
// Postgres implementation
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct CampaignRow {
    batch_id: String,
    queued_count: i32,
    sent_count: i32,
    failed_count: i32,
    status: String,
}

pub struct PgCampaignRepo {
    pool: DbPool,
}

impl PgCampaignRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignRepo for PgCampaignRepo {
    async fn fetch_campaign(&self, batch_id: &str) -> Result<Option<CampaignRecord>> {
        let row = sqlx::query_as::<_, CampaignRow>(
            r#"
            SELECT batch_id, queued_count, sent_count, failed_count, status
            FROM broadcast_campaigns
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch campaign")?;

        Ok(row.map(|r| CampaignRecord {
            batch_id: r.batch_id,
            queued_count: r.queued_count,
            sent_count: r.sent_count,
            failed_count: r.failed_count,
            status: CampaignStatus::parse(&r.status),
        }))
    }

    async fn store_progress(
        &self,
        batch_id: &str,
        sent_count: i32,
        failed_count: i32,
        status: CampaignStatus,
        completed_now: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE broadcast_campaigns
            SET sent_count = $2,
                failed_count = $3,
                status = $4,
                completed_at = CASE WHEN $5 THEN NOW() ELSE completed_at END
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .bind(sent_count)
        .bind(failed_count)
        .bind(status.as_str())
        .bind(completed_now)
        .execute(&self.pool)
        .await
        .context("Failed to store campaign progress")?;
        Ok(())
    }

    async fn mark_recipient(
        &self,
        batch_id: &str,
        chat_id: &str,
        status: RecipientStatus,
        error_message: Option<&str>,
        failure_reason: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE broadcast_recipients
            SET status = $3,
                error_message = $4,
                failure_reason = $5,
                sent_at = CASE WHEN $3 = 'sent' THEN NOW() ELSE sent_at END
            WHERE batch_id = $1 AND chat_id = $2 AND status = 'pending'
            "#,
        )
        .bind(batch_id)
        .bind(chat_id)
        .bind(status.as_str())
        .bind(error_message)
        .bind(failure_reason)
        .execute(&self.pool)
        .await
        .context("Failed to mark recipient")?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct RecipientRow {
        status: String,
        failure_reason: Option<String>,
        sent_at_set: bool,
    }

    #[derive(Default)]
    struct MemoryRepo {
        campaigns: Mutex<HashMap<String, CampaignRecord>>,
        recipients: Mutex<HashMap<(String, String), RecipientRow>>,
        completed_stamps: Mutex<HashMap<String, u32>>,
    }

    impl MemoryRepo {
        fn with_campaign(batch_id: &str, queued: i32) -> Self {
            let repo = Self::default();
            repo.campaigns.lock().unwrap().insert(
                batch_id.to_string(),
                CampaignRecord {
                    batch_id: batch_id.to_string(),
                    queued_count: queued,
                    sent_count: 0,
                    failed_count: 0,
                    status: CampaignStatus::Pending,
                },
            );
            repo
        }

        fn add_pending_recipient(&self, batch_id: &str, chat_id: &str) {
            self.recipients.lock().unwrap().insert(
                (batch_id.to_string(), chat_id.to_string()),
                RecipientRow {
                    status: "pending".to_string(),
                    failure_reason: None,
                    sent_at_set: false,
                },
            );
        }
    }

    #[async_trait]
    impl CampaignRepo for MemoryRepo {
        async fn fetch_campaign(&self, batch_id: &str) -> Result<Option<CampaignRecord>> {
            Ok(self.campaigns.lock().unwrap().get(batch_id).cloned())
        }

        async fn store_progress(
            &self,
            batch_id: &str,
            sent_count: i32,
            failed_count: i32,
            status: CampaignStatus,
            completed_now: bool,
        ) -> Result<()> {
            let mut campaigns = self.campaigns.lock().unwrap();
            let record = campaigns
                .get_mut(batch_id)
                .ok_or_else(|| anyhow::anyhow!("campaign missing"))?;
            record.sent_count = sent_count;
            record.failed_count = failed_count;
            record.status = status;
            if completed_now {
                *self
                    .completed_stamps
                    .lock()
                    .unwrap()
                    .entry(batch_id.to_string())
                    .or_insert(0) += 1;
            }
            Ok(())
        }

        async fn mark_recipient(
            &self,
            batch_id: &str,
            chat_id: &str,
            status: RecipientStatus,
            _error_message: Option<&str>,
            failure_reason: Option<&str>,
        ) -> Result<bool> {
            let mut recipients = self.recipients.lock().unwrap();
            let key = (batch_id.to_string(), chat_id.to_string());
            match recipients.get_mut(&key) {
                Some(row) if row.status == "pending" => {
                    row.status = status.as_str().to_string();
                    row.failure_reason = failure_reason.map(|r| r.to_string());
                    row.sent_at_set = status == RecipientStatus::Sent;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    #[tokio::test]
    async fn completes_when_counts_reach_queued() {
        let repo = Arc::new(MemoryRepo::with_campaign("b1", 10));
        let aggregator = CampaignAggregator::new(repo.clone());

        aggregator.apply_delta("b1", 6, 0).await.unwrap();
        assert_eq!(
            repo.campaigns.lock().unwrap()["b1"].status,
            CampaignStatus::Processing
        );

        aggregator.apply_delta("b1", 3, 1).await.unwrap();
        let record = repo.campaigns.lock().unwrap()["b1"].clone();
        assert_eq!(record.status, CampaignStatus::Completed);
        assert_eq!(record.sent_count, 9);
        assert_eq!(record.failed_count, 1);
    }

    #[tokio::test]
    async fn completion_is_monotonic() {
        let repo = Arc::new(MemoryRepo::with_campaign("b1", 2));
        let aggregator = CampaignAggregator::new(repo.clone());

        aggregator.apply_delta("b1", 2, 0).await.unwrap();
        assert_eq!(
            repo.campaigns.lock().unwrap()["b1"].status,
            CampaignStatus::Completed
        );

        // A late partial update must not revert the terminal status,
        // and completedAt must not be stamped twice
        aggregator.apply_delta("b1", 1, 0).await.unwrap();
        assert_eq!(
            repo.campaigns.lock().unwrap()["b1"].status,
            CampaignStatus::Completed
        );
        assert_eq!(repo.completed_stamps.lock().unwrap()["b1"], 1);
    }

    #[tokio::test]
    async fn absent_campaign_is_a_noop() {
        let repo = Arc::new(MemoryRepo::default());
        let aggregator = CampaignAggregator::new(repo.clone());

        aggregator.apply_delta("ghost", 5, 5).await.unwrap();
        assert!(repo.campaigns.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn recipient_update_is_idempotent() {
        let repo = Arc::new(MemoryRepo::with_campaign("b1", 1));
        repo.add_pending_recipient("b1", "42");
        let aggregator = CampaignAggregator::new(repo.clone());

        let failure = DeliveryResult::failed("Forbidden: bot was blocked by the user");
        let first = aggregator
            .update_recipient_status("b1", "42", &failure)
            .await
            .unwrap();
        assert!(first);

        // The second attempt finds no pending row and changes nothing
        let second = aggregator
            .update_recipient_status("b1", "42", &DeliveryResult::ok())
            .await
            .unwrap();
        assert!(!second);

        let row = repo.recipients.lock().unwrap()[&("b1".to_string(), "42".to_string())].clone();
        assert_eq!(row.status, "failed");
        assert_eq!(row.failure_reason.as_deref(), Some("blocked_bot"));
        assert!(!row.sent_at_set);
    }

    #[tokio::test]
    async fn successful_recipient_gets_sent_at() {
        let repo = Arc::new(MemoryRepo::with_campaign("b1", 1));
        repo.add_pending_recipient("b1", "7");
        let aggregator = CampaignAggregator::new(repo.clone());

        let updated = aggregator
            .update_recipient_status("b1", "7", &DeliveryResult::ok())
            .await
            .unwrap();
        assert!(updated);

        let row = repo.recipients.lock().unwrap()[&("b1".to_string(), "7".to_string())].clone();
        assert_eq!(row.status, "sent");
        assert!(row.sent_at_set);
        assert!(row.failure_reason.is_none());
    }
}

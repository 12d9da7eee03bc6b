// ============================================================================
// HTTP Handlers
// ============================================================================
//
// POST /broadcast/process  trigger one drain invocation
// GET  /broadcast/status   read-only queue + counter snapshot
// GET  /health             Redis + Postgres reachability

use crate::config::Config;
use crate::db::DbPool;
use crate::drain::{DrainOutcome, Drainer};
use crate::error::{AppError, AppResult};
use crate::queue::{QueueStore, RedisQueue};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming as IncomingBody;
use hyper::{Request, Response, StatusCode};
use serde_json::json;
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub queue: Arc<RedisQueue>,
    pub drainer: Arc<Drainer>,
    pub db_pool: DbPool,
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("Content-Type", hyper::header::HeaderValue::from_static("application/json"));
    response
}

/// Trigger one drain. The shared-secret header is a policy point: its absence
/// is logged, not rejected.
pub async fn process_broadcast(
    req: &Request<IncomingBody>,
    state: &AppState,
) -> Response<Full<Bytes>> {
    if let Some(expected) = &state.config.queue_secret {
        let presented = req
            .headers()
            .get("x-queue-secret")
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            tracing::warn!(
                header_present = presented.is_some(),
                "Trigger called without a valid queue secret"
            );
        }
    }

    match state.drainer.drain().await {
        Ok(DrainOutcome::Skipped { reason }) => json_response(
            StatusCode::OK,
            json!({ "success": true, "skipped": true, "reason": reason }),
        ),
        Ok(DrainOutcome::Finished(summary)) => json_response(
            StatusCode::OK,
            json!({
                "success": true,
                "processed": summary.processed,
                "failed": summary.failed,
                "remaining": summary.remaining,
                "durationMs": summary.duration_ms,
            }),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Drain invocation failed");
            let err = AppError::from(e);
            json_response(
                err.status_code(),
                json!({ "error": err.user_message(), "processed": 0 }),
            )
        }
    }
}

/// Read-only snapshot of the queue store; mutates nothing
pub async fn broadcast_status(state: &AppState) -> Response<Full<Bytes>> {
    let snapshot: AppResult<_> = async {
        let queued = state.queue.len().await?;
        let stats = state.queue.fetch_stats().await?;
        let is_processing = state.queue.is_locked().await?;
        Ok((queued, stats, is_processing))
    }
    .await;

    match snapshot {
        Ok((queued, stats, is_processing)) => json_response(
            StatusCode::OK,
            json!({
                "queued": queued,
                "totalSent": stats.total_sent,
                "totalFailed": stats.total_failed,
                "lastProcessedAt": stats.last_processed_at,
                "isProcessing": is_processing,
            }),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Status read failed");
            json_response(e.status_code(), json!({ "error": e.user_message() }))
        }
    }
}

pub async fn health_check(state: &AppState) -> Response<Full<Bytes>> {
    let check = async {
        sqlx::query("SELECT 1").execute(&state.db_pool).await?;
        state.queue.ping().await?;
        anyhow::Ok(())
    }
    .await;

    match check {
        Ok(()) => Response::new(Full::new(Bytes::from("OK"))),
        Err(e) => {
            tracing::error!(error = %e, "Health check failed");
            let mut response = Response::new(Full::new(Bytes::from("Service Unavailable")));
            *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            response
        }
    }
}

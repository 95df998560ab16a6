//! Notification Outbox Processor
//!
//! Drains the persistent notification outbox and delivers each payload to
//! the collaborator endpoint with retry accounting. Delivery is
//! best-effort by design: a failed notification never touches the settled
//! state that produced it.

use serde_json::Value;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Claim a batch of deliverable notifications and mark them `processing`
/// in one atomic statement, so two worker instances cannot take the same
/// rows. Rows stuck in `processing` (a worker died mid-delivery) are
/// reclaimed after a timeout.
async fn claim_batch(pool: &PgPool) -> sqlx::Result<Vec<(Uuid, String, Value, i32, i32)>> {
    sqlx::query_as(
        r#"
        UPDATE notification_outbox
        SET status = 'processing', last_attempt_at = NOW(), attempts = attempts + 1
        WHERE id IN (
            SELECT id
            FROM notification_outbox
            WHERE (status = 'pending'
                       AND (last_attempt_at IS NULL
                            OR last_attempt_at < NOW() - INTERVAL '5 minutes'))
               OR (status = 'failed'
                       AND attempts < max_attempts
                       AND last_attempt_at < NOW() - INTERVAL '5 minutes')
               OR (status = 'processing'
                       AND last_attempt_at < NOW() - INTERVAL '10 minutes')
            ORDER BY created_at ASC
            LIMIT 10
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, kind, payload, attempts, max_attempts
        "#,
    )
    .fetch_all(pool)
    .await
}

/// Deliver pending notifications from the outbox
pub async fn process_outbox(pool: &PgPool, http_client: &reqwest::Client, notify_url: &str) {
    let notifications = match claim_batch(pool).await {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "Failed to claim notifications from outbox");
            return;
        }
    };

    if notifications.is_empty() {
        return; // No work to do
    }

    info!(count = notifications.len(), "Delivering notifications from outbox");

    // `attempts` already reflects this attempt: the claim incremented it
    for (outbox_id, kind, payload, attempts, max_attempts) in notifications {
        let result = deliver(http_client, notify_url, &kind, &payload).await;

        match result {
            Ok(_) => {
                if let Err(e) = sqlx::query(
                    "UPDATE notification_outbox SET status = 'delivered', delivered_at = NOW() WHERE id = $1"
                )
                .bind(outbox_id)
                .execute(pool)
                .await
                {
                    error!(outbox_id = %outbox_id, error = %e, "Failed to mark notification as delivered");
                }
                info!(outbox_id = %outbox_id, kind = %kind, "Notification delivered");
            }
            Err(e) => {
                let error_msg = e.to_string();

                if let Err(e) = sqlx::query(
                    "UPDATE notification_outbox SET status = 'failed', last_error = $1 WHERE id = $2",
                )
                .bind(&error_msg)
                .bind(outbox_id)
                .execute(pool)
                .await
                {
                    error!(outbox_id = %outbox_id, error = %e, "Failed to mark notification as failed");
                }

                if attempts >= max_attempts {
                    error!(
                        outbox_id = %outbox_id,
                        kind = %kind,
                        attempts = attempts,
                        error = %error_msg,
                        "Notification permanently failed after max retries"
                    );
                } else {
                    warn!(
                        outbox_id = %outbox_id,
                        kind = %kind,
                        attempts = attempts,
                        max_attempts = max_attempts,
                        error = %error_msg,
                        "Notification delivery failed, will retry"
                    );
                }
            }
        }
    }
}

/// POST one notification to the collaborator endpoint
async fn deliver(
    http_client: &reqwest::Client,
    notify_url: &str,
    kind: &str,
    payload: &Value,
) -> anyhow::Result<()> {
    let response = http_client
        .post(notify_url)
        .timeout(Duration::from_secs(10))
        .json(&serde_json::json!({
            "kind": kind,
            "payload": payload,
        }))
        .send()
        .await?;

    if !response.status().is_success() {
        anyhow::bail!("collaborator responded with status {}", response.status());
    }

    Ok(())
}

/// Cleanup old delivered/failed notifications (for maintenance job)
pub async fn cleanup_old_notifications(pool: &PgPool, retention_days: i32) {
    let result = sqlx::query(
        r#"
        DELETE FROM notification_outbox
        WHERE created_at < NOW() - make_interval(days => $1)
          AND status IN ('delivered', 'failed')
        "#,
    )
    .bind(retention_days)
    .execute(pool)
    .await;

    match result {
        Ok(rows) => {
            if rows.rows_affected() > 0 {
                info!(
                    deleted = rows.rows_affected(),
                    retention_days = retention_days,
                    "Cleaned up old outbox entries"
                );
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to cleanup old notifications");
        }
    }
}

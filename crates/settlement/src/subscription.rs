//! Subscription Lifecycle Manager
//!
//! Owns the subscription state machine:
//! `none → active → active(extended)* → expired | lifetime`.
//!
//! Every write path preserves the invariant of at most one active row per
//! member. Lifetime grants carry a far-future sentinel end timestamp and
//! are kept out of the expiry sweep by comparing against a threshold well
//! below the sentinel.

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::format_description::well_known::Rfc3339;
use time::macros::datetime;
use time::OffsetDateTime;
use tracing::info;

use clubkit_shared::{MemberId, SubscriptionId};

use crate::error::SettlementResult;
use crate::events::{self, ActorType, SettlementEventBuilder, SettlementEventType};

/// Sentinel end timestamp for unlimited-duration grants
pub const LIFETIME_SENTINEL: OffsetDateTime = datetime!(9999-01-01 0:00 UTC);

/// Expiry scans ignore anything at or beyond this threshold, which keeps
/// sentinel-ended subscriptions out of the sweep
pub const EXPIRY_SCAN_THRESHOLD: OffsetDateTime = datetime!(9000-01-01 0:00 UTC);

/// A subscription row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub member_id: MemberId,
    pub starts_at: OffsetDateTime,
    pub ends_at: OffsetDateTime,
    pub is_active: bool,
    pub origin: String,
    pub applied_discount_kind: Option<String>,
    pub applied_discount_percent: Option<i32>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub fn is_lifetime(&self) -> bool {
        self.ends_at >= EXPIRY_SCAN_THRESHOLD
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, member_id, starts_at, ends_at, is_active, origin, \
     applied_discount_kind, applied_discount_percent, created_at, updated_at";

/// Result of applying a paid duration
#[derive(Debug, Clone)]
pub enum AppliedDuration {
    Created(Subscription),
    Extended(Subscription),
}

impl AppliedDuration {
    pub fn subscription(&self) -> &Subscription {
        match self {
            AppliedDuration::Created(s) | AppliedDuration::Extended(s) => s,
        }
    }

    pub fn into_subscription(self) -> Subscription {
        match self {
            AppliedDuration::Created(s) | AppliedDuration::Extended(s) => s,
        }
    }
}

/// Apply a paid duration to a member: extend the currently active,
/// non-expired subscription if one exists, otherwise create a new one
/// starting now. Runs inside the caller's transaction.
pub async fn apply_payment(
    conn: &mut PgConnection,
    member_id: MemberId,
    days: i32,
    origin: &str,
) -> SettlementResult<AppliedDuration> {
    // Flip stale active rows first so the single-active-row invariant
    // holds before we decide between extend and create
    sqlx::query(
        r#"
        UPDATE subscriptions
        SET is_active = FALSE, updated_at = NOW()
        WHERE member_id = $1 AND is_active AND ends_at <= NOW() AND ends_at < $2
        "#,
    )
    .bind(member_id)
    .bind(EXPIRY_SCAN_THRESHOLD)
    .execute(&mut *conn)
    .await?;

    let extended: Option<Subscription> = sqlx::query_as(&format!(
        r#"
        UPDATE subscriptions
        SET ends_at = ends_at + make_interval(days => $2), updated_at = NOW()
        WHERE id = (
            SELECT id FROM subscriptions
            WHERE member_id = $1 AND is_active AND ends_at > NOW()
            ORDER BY ends_at DESC
            LIMIT 1
            FOR UPDATE
        )
        RETURNING {SUBSCRIPTION_COLUMNS}
        "#
    ))
    .bind(member_id)
    .bind(days)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(subscription) = extended {
        info!(
            member_id = %member_id,
            subscription_id = %subscription.id,
            days = days,
            ends_at = %subscription.ends_at,
            "Extended active subscription"
        );
        return Ok(AppliedDuration::Extended(subscription));
    }

    let created: Subscription = sqlx::query_as(&format!(
        r#"
        INSERT INTO subscriptions (member_id, starts_at, ends_at, is_active, origin)
        VALUES ($1, NOW(), NOW() + make_interval(days => $2), TRUE, $3)
        RETURNING {SUBSCRIPTION_COLUMNS}
        "#
    ))
    .bind(member_id)
    .bind(days)
    .bind(origin)
    .fetch_one(&mut *conn)
    .await?;

    info!(
        member_id = %member_id,
        subscription_id = %created.id,
        days = days,
        ends_at = %created.ends_at,
        "Created subscription"
    );

    Ok(AppliedDuration::Created(created))
}

/// Grant an unlimited-duration subscription (sentinel end timestamp).
/// Deactivates any previous active row so only the grant stays active.
pub async fn grant_lifetime(
    conn: &mut PgConnection,
    member_id: MemberId,
    origin: &str,
) -> SettlementResult<Subscription> {
    sqlx::query(
        r#"
        UPDATE subscriptions
        SET is_active = FALSE, updated_at = NOW()
        WHERE member_id = $1 AND is_active
        "#,
    )
    .bind(member_id)
    .execute(&mut *conn)
    .await?;

    let granted: Subscription = sqlx::query_as(&format!(
        r#"
        INSERT INTO subscriptions (member_id, starts_at, ends_at, is_active, origin)
        VALUES ($1, NOW(), $2, TRUE, $3)
        RETURNING {SUBSCRIPTION_COLUMNS}
        "#
    ))
    .bind(member_id)
    .bind(LIFETIME_SENTINEL)
    .bind(origin)
    .fetch_one(&mut *conn)
    .await?;

    events::record(
        &mut *conn,
        SettlementEventBuilder::new(member_id, SettlementEventType::LifetimeGranted)
            .data(serde_json::json!({
                "subscription_id": granted.id,
                "origin": origin,
            }))
            .actor(ActorType::System),
    )
    .await?;

    info!(
        member_id = %member_id,
        subscription_id = %granted.id,
        "Granted lifetime subscription"
    );

    Ok(granted)
}

/// Record which discount was reflected in the settled amount, for audit
pub async fn record_applied_discount(
    conn: &mut PgConnection,
    subscription_id: SubscriptionId,
    kind: &str,
    percent: i32,
) -> SettlementResult<()> {
    sqlx::query(
        r#"
        UPDATE subscriptions
        SET applied_discount_kind = $2, applied_discount_percent = $3, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(subscription_id)
    .bind(kind)
    .bind(percent)
    .execute(conn)
    .await?;

    Ok(())
}

/// Check whether a member currently holds an active, non-expired subscription
pub async fn has_active(conn: &mut PgConnection, member_id: MemberId) -> SettlementResult<bool> {
    let (exists,): (bool,) = sqlx::query_as(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM subscriptions
            WHERE member_id = $1 AND is_active AND ends_at > NOW()
        )
        "#,
    )
    .bind(member_id)
    .fetch_one(conn)
    .await?;

    Ok(exists)
}

/// Expiry sweep: deactivate subscriptions whose end has passed. The
/// sentinel comparison excludes lifetime grants. Used by the worker.
/// Each deactivation leaves an audit event in the same transaction.
pub async fn deactivate_expired(pool: &PgPool) -> SettlementResult<u64> {
    let mut tx = pool.begin().await?;

    let expired: Vec<(SubscriptionId, MemberId, OffsetDateTime)> = sqlx::query_as(
        r#"
        UPDATE subscriptions
        SET is_active = FALSE, updated_at = NOW()
        WHERE is_active AND ends_at < NOW() AND ends_at < $1
        RETURNING id, member_id, ends_at
        "#,
    )
    .bind(EXPIRY_SCAN_THRESHOLD)
    .fetch_all(&mut *tx)
    .await?;

    for (subscription_id, member_id, ends_at) in &expired {
        events::record(
            &mut tx,
            SettlementEventBuilder::new(*member_id, SettlementEventType::SubscriptionExpired)
                .data(serde_json::json!({
                    "subscription_id": subscription_id,
                    "ended_at": ends_at.format(&Rfc3339).ok(),
                }))
                .actor(ActorType::System),
        )
        .await?;
    }

    tx.commit().await?;

    Ok(expired.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_is_beyond_scan_threshold() {
        assert!(LIFETIME_SENTINEL >= EXPIRY_SCAN_THRESHOLD);
    }

    #[test]
    fn test_lifetime_detection() {
        let base = datetime!(2026-03-01 0:00 UTC);
        let sub = Subscription {
            id: SubscriptionId::new(),
            member_id: MemberId::new(),
            starts_at: base,
            ends_at: LIFETIME_SENTINEL,
            is_active: true,
            origin: "admin_grant".to_string(),
            applied_discount_kind: None,
            applied_discount_percent: None,
            created_at: base,
            updated_at: base,
        };
        assert!(sub.is_lifetime());

        let finite = Subscription {
            ends_at: datetime!(2026-04-01 0:00 UTC),
            ..sub
        };
        assert!(!finite.is_lifetime());
    }
}

//! Idempotency Guard
//!
//! Gateways deliver notifications at-least-once, so every delivery must
//! pass through `admit` before it can produce effects. The guard takes a
//! row-level lock on the payment event (inserting a pending row when the
//! key is new) and hands back a tagged admission decision, so concurrent
//! deliveries of the same key cannot both observe "not settled".
//!
//! Duplicate delivery is routine traffic here, not an error: an already
//! settled event is acknowledged as a no-op so the gateway stops retrying.

use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use time::OffsetDateTime;
use tracing::warn;

use clubkit_shared::{MemberId, PaymentEventId, PaymentNotification, SubscriptionId};

use crate::error::{SettlementError, SettlementResult};

/// A durable payment event row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentEvent {
    pub id: PaymentEventId,
    pub idempotency_key: String,
    pub member_id: MemberId,
    pub amount_minor: i64,
    pub currency: String,
    pub status: String,
    pub subscription_id: Option<SubscriptionId>,
    pub occurred_at: OffsetDateTime,
    pub settlement_confirmed: bool,
    pub purchased_days: i32,
    pub expected_amount_minor: Option<i64>,
    pub paid_from_referral_balance: bool,
    pub created_at: OffsetDateTime,
    pub settled_at: Option<OffsetDateTime>,
}

/// Decision for one inbound delivery of an idempotency key
#[derive(Debug)]
pub enum Admission {
    /// New or reprocessable event; the row is locked by the caller's transaction
    Proceed(PaymentEvent),
    /// Event fully settled earlier; acknowledge without effects
    AlreadySettled(PaymentEvent),
    /// Key reused with a payload that disagrees with the stored event
    Conflict { key: String, reason: String },
}

const SELECT_FOR_UPDATE: &str = r#"
    SELECT id, idempotency_key, member_id, amount_minor, currency, status,
           subscription_id, occurred_at, settlement_confirmed, purchased_days,
           expected_amount_minor, paid_from_referral_balance, created_at, settled_at
    FROM payment_events
    WHERE idempotency_key = $1
    FOR UPDATE
"#;

async fn lock_by_key(
    conn: &mut PgConnection,
    idempotency_key: &str,
) -> SettlementResult<Option<PaymentEvent>> {
    let event = sqlx::query_as(SELECT_FOR_UPDATE)
        .bind(idempotency_key)
        .fetch_optional(conn)
        .await?;
    Ok(event)
}

/// Admit one notification delivery. Must run inside the settlement
/// transaction: the `FOR UPDATE` lock (or the freshly inserted row's lock)
/// is what serializes concurrent deliveries of the same key.
pub async fn admit(
    conn: &mut PgConnection,
    notification: &PaymentNotification,
) -> SettlementResult<Admission> {
    let mut existing = lock_by_key(&mut *conn, &notification.idempotency_key).await?;

    if existing.is_none() {
        // First delivery of this key, as far as this transaction can see.
        // Concurrent first deliveries all reach this branch, so the insert
        // must tolerate losing the race: ON CONFLICT DO NOTHING blocks on
        // the in-flight winner and returns no row once it commits.
        let inserted: Option<PaymentEvent> = sqlx::query_as(
            r#"
            INSERT INTO payment_events (
                idempotency_key, member_id, amount_minor, currency, status,
                occurred_at, purchased_days, expected_amount_minor,
                paid_from_referral_balance
            )
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id, idempotency_key, member_id, amount_minor, currency, status,
                      subscription_id, occurred_at, settlement_confirmed, purchased_days,
                      expected_amount_minor, paid_from_referral_balance, created_at,
                      settled_at
            "#,
        )
        .bind(&notification.idempotency_key)
        .bind(notification.payer_ref)
        .bind(notification.amount_minor)
        .bind(&notification.currency)
        .bind(notification.occurred_at)
        .bind(notification.metadata.purchased_days)
        .bind(notification.metadata.expected_amount_minor)
        .bind(notification.metadata.paid_from_referral_balance)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(inserted) = inserted {
            return Ok(Admission::Proceed(inserted));
        }

        // Lost the insert race. The winner's row is committed now, so the
        // lock re-acquire lands on it and the delivery is branched like any
        // other duplicate.
        existing = lock_by_key(&mut *conn, &notification.idempotency_key).await?;
    }

    let Some(event) = existing else {
        // The racing insert aborted between our two statements. The gateway
        // retries transient failures with the same key.
        return Err(SettlementError::TransientStore(format!(
            "payment event for key {} vanished during admission",
            notification.idempotency_key
        )));
    };

    // An idempotency key is bound forever to the payload that created it
    if let Some(reason) = payload_divergence(&event, notification) {
        warn!(
            idempotency_key = %notification.idempotency_key,
            reason = %reason,
            "Idempotency key reused with divergent payload"
        );
        return Ok(Admission::Conflict {
            key: notification.idempotency_key.clone(),
            reason,
        });
    }

    match event.status.as_str() {
        "settled" if event.subscription_id.is_some() => Ok(Admission::AlreadySettled(event)),
        "settled" => {
            // Settled flag without a subscription link means a crash tore the
            // pipeline mid-write. The event is reprocessable, not trusted.
            warn!(
                payment_event_id = %event.id,
                idempotency_key = %event.idempotency_key,
                "Settled event with missing subscription link, reprocessing"
            );
            Ok(Admission::Proceed(event))
        }
        // 'pending' (first delivery, or an aborted attempt) and 'failed'
        // (retry permitted) both proceed
        _ => Ok(Admission::Proceed(event)),
    }
}

/// Compare the immutable identity of a stored event against a delivery
fn payload_divergence(event: &PaymentEvent, notification: &PaymentNotification) -> Option<String> {
    if event.member_id != notification.payer_ref {
        return Some(format!(
            "payer mismatch: stored {} vs delivered {}",
            event.member_id, notification.payer_ref
        ));
    }
    if event.amount_minor != notification.amount_minor {
        return Some(format!(
            "amount mismatch: stored {} vs delivered {}",
            event.amount_minor, notification.amount_minor
        ));
    }
    if event.currency != notification.currency {
        return Some(format!(
            "currency mismatch: stored {} vs delivered {}",
            event.currency, notification.currency
        ));
    }
    None
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use clubkit_shared::PaymentMetadata;
    use time::macros::datetime;
    use uuid::Uuid;

    fn event_for(notification: &PaymentNotification) -> PaymentEvent {
        PaymentEvent {
            id: PaymentEventId(Uuid::new_v4()),
            idempotency_key: notification.idempotency_key.clone(),
            member_id: notification.payer_ref,
            amount_minor: notification.amount_minor,
            currency: notification.currency.clone(),
            status: "pending".to_string(),
            subscription_id: None,
            occurred_at: notification.occurred_at,
            settlement_confirmed: false,
            purchased_days: notification.metadata.purchased_days,
            expected_amount_minor: notification.metadata.expected_amount_minor,
            paid_from_referral_balance: false,
            created_at: notification.occurred_at,
            settled_at: None,
        }
    }

    fn notification() -> PaymentNotification {
        PaymentNotification {
            idempotency_key: "gw_evt_1".to_string(),
            amount_minor: 1500,
            currency: "EUR".to_string(),
            payer_ref: MemberId::new(),
            occurred_at: datetime!(2026-02-01 09:30 UTC),
            metadata: PaymentMetadata {
                purchased_days: 30,
                expected_amount_minor: Some(1500),
                paid_from_referral_balance: false,
            },
        }
    }

    #[test]
    fn test_matching_payload_has_no_divergence() {
        let n = notification();
        let event = event_for(&n);
        assert!(payload_divergence(&event, &n).is_none());
    }

    #[test]
    fn test_divergent_amount_is_conflict() {
        let n = notification();
        let mut event = event_for(&n);
        event.amount_minor = 999;
        let reason = payload_divergence(&event, &n).expect("must diverge");
        assert!(reason.contains("amount mismatch"));
    }

    #[test]
    fn test_divergent_payer_is_conflict() {
        let n = notification();
        let mut event = event_for(&n);
        event.member_id = MemberId::new();
        assert!(payload_divergence(&event, &n).is_some());
    }

    #[test]
    fn test_divergent_currency_is_conflict() {
        let n = notification();
        let mut event = event_for(&n);
        event.currency = "USD".to_string();
        let reason = payload_divergence(&event, &n).expect("must diverge");
        assert!(reason.contains("currency mismatch"));
    }
}

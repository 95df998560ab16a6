//! Settlement Coordinator
//!
//! Orchestrates one payment notification end to end inside a single
//! database transaction: admission, amount re-validation, the atomic
//! `pending → settled` flip, subscription lifecycle, loyalty discount
//! consumption, the referral offer step, audit, and the notification
//! outbox. Any error aborts the whole transaction, leaving the event
//! `pending` and safely retryable; there are no partial effects.
//!
//! Correctness never relies on in-process state. All coordination runs
//! through row locks and conditional updates, so any number of api
//! instances can settle concurrently.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use clubkit_shared::{MemberId, OfferId, PaymentNotification};

use crate::error::{SettlementError, SettlementResult};
use crate::events::{self, ActorType, SettlementEventBuilder, SettlementEventType};
use crate::idempotency::{self, Admission, PaymentEvent};
use crate::loyalty::{self, AppliedDiscount};
use crate::outbox::{self, NotificationKind};
use crate::referral;
use crate::subscription::{self, AppliedDuration};

/// Divergence between the delivered and expected amount tolerated before
/// a settlement is rejected, in minor units. Covers gateway rounding of
/// converted amounts; anything larger is an amount mismatch.
pub const AMOUNT_TOLERANCE_MINOR: i64 = 1;

/// Outcome of settling one notification
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    /// The payment produced durable effects in this call
    Settled {
        member_id: MemberId,
        subscription_end: OffsetDateTime,
        applied_discount_percent: i32,
        offer_id: Option<OfferId>,
    },
    /// A previous (or concurrent) delivery already settled this key
    AlreadySettled,
    /// Amount mismatch; the event is terminally failed and must not be retried
    Rejected { reason: String },
    /// Idempotency key reused with a divergent payload; nothing processed
    KeyConflict { reason: String },
}

/// Drives settlement transactions against the ledger store
pub struct SettlementCoordinator {
    pool: PgPool,
}

impl SettlementCoordinator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Settle one notification delivery. Safe to call any number of times
    /// with the same idempotency key; exactly one call produces effects.
    pub async fn settle(
        &self,
        notification: &PaymentNotification,
    ) -> SettlementResult<SettlementOutcome> {
        notification
            .validate()
            .map_err(SettlementError::Validation)?;

        let mut tx = self.pool.begin().await?;

        let event = match idempotency::admit(&mut tx, notification).await? {
            Admission::Proceed(event) => event,
            Admission::AlreadySettled(event) => {
                tx.rollback().await.ok();
                info!(
                    payment_event_id = %event.id,
                    idempotency_key = %event.idempotency_key,
                    "Duplicate delivery of settled event, acknowledging"
                );
                return Ok(SettlementOutcome::AlreadySettled);
            }
            Admission::Conflict { key, reason } => {
                tx.rollback().await.ok();
                warn!(idempotency_key = %key, reason = %reason, "Settlement admission conflict");
                return Ok(SettlementOutcome::KeyConflict { reason });
            }
        };

        // Re-validate the settled amount against the value recorded when
        // the charge was initiated
        if let Some(reason) = amount_mismatch(&event) {
            return self.reject(tx, &event, reason).await;
        }

        // Atomic flip. The admission lock already serializes same-key
        // deliveries, but the affected-row check stands on its own: zero
        // rows means a concurrent settler won and this call is a no-op.
        let flipped = sqlx::query(
            r#"
            UPDATE payment_events
            SET status = 'settled', settled_at = NOW()
            WHERE id = $1
              AND (status IN ('pending', 'failed')
                   OR (status = 'settled' AND subscription_id IS NULL))
            "#,
        )
        .bind(event.id)
        .execute(&mut *tx)
        .await?;

        if flipped.rows_affected() == 0 {
            tx.rollback().await.ok();
            info!(
                payment_event_id = %event.id,
                "Lost settlement race, exiting as no-op"
            );
            return Ok(SettlementOutcome::AlreadySettled);
        }

        let payer = loyalty::load_profile_for_update(&mut tx, event.member_id)
            .await?
            .ok_or_else(|| {
                SettlementError::InvariantViolation(format!(
                    "payer {} not found for payment {}",
                    event.member_id, event.id
                ))
            })?;

        let now = OffsetDateTime::now_utc();

        // Subscription lifecycle
        let origin = format!("payment:{}", event.idempotency_key);
        let applied = subscription::apply_payment(
            &mut tx,
            event.member_id,
            event.purchased_days,
            &origin,
        )
        .await?;
        let sub = applied.subscription().clone();

        sqlx::query(
            r#"
            UPDATE payment_events
            SET subscription_id = $2, settlement_confirmed = TRUE
            WHERE id = $1
            "#,
        )
        .bind(event.id)
        .bind(sub.id)
        .execute(&mut *tx)
        .await?;

        // Loyalty discount consumption, recorded for audit
        let discount = loyalty::consume(&mut tx, &payer, now).await?;
        if let (Some(kind), percent) = (discount.kind_str(), discount.percent()) {
            subscription::record_applied_discount(&mut tx, sub.id, kind, percent).await?;
        }

        // Referral offer step
        let offer = referral::offer_for_payment(&mut tx, &event, &payer, now).await?;

        let lifecycle_event = match &applied {
            AppliedDuration::Created(_) => SettlementEventType::SubscriptionCreated,
            AppliedDuration::Extended(_) => SettlementEventType::SubscriptionExtended,
        };
        events::record(
            &mut tx,
            SettlementEventBuilder::new(event.member_id, lifecycle_event)
                .data(serde_json::json!({
                    "subscription_id": sub.id,
                    "days": event.purchased_days,
                    "ends_at": sub.ends_at.to_string(),
                }))
                .payment(event.id)
                .actor(ActorType::Gateway),
        )
        .await?;

        if discount != AppliedDiscount::None {
            events::record(
                &mut tx,
                SettlementEventBuilder::new(event.member_id, SettlementEventType::DiscountApplied)
                    .data(serde_json::to_value(&discount).unwrap_or_default())
                    .payment(event.id)
                    .actor(ActorType::Gateway),
            )
            .await?;
        }

        events::record(
            &mut tx,
            SettlementEventBuilder::new(event.member_id, SettlementEventType::PaymentSettled)
                .data(serde_json::json!({
                    "amount_minor": event.amount_minor,
                    "currency": event.currency,
                    "idempotency_key": event.idempotency_key,
                }))
                .payment(event.id)
                .actor(ActorType::Gateway),
        )
        .await?;

        outbox::enqueue(
            &mut tx,
            NotificationKind::MemberOutcome,
            outbox::member_outcome_payload(
                event.member_id,
                "settled",
                Some(sub.ends_at),
                Some(discount.percent()),
            ),
        )
        .await?;

        tx.commit().await?;

        info!(
            payment_event_id = %event.id,
            member_id = %event.member_id,
            subscription_id = %sub.id,
            subscription_end = %sub.ends_at,
            applied_discount_percent = discount.percent(),
            offer_created = offer.is_some(),
            "Payment settled"
        );

        Ok(SettlementOutcome::Settled {
            member_id: event.member_id,
            subscription_end: sub.ends_at,
            applied_discount_percent: discount.percent(),
            offer_id: offer.map(|o| o.id),
        })
    }

    /// Terminally fail an event whose amount diverged from the recorded
    /// expectation. This is a committed business outcome, not an abort:
    /// the gateway must be acknowledged so it stops retrying.
    async fn reject(
        &self,
        mut tx: sqlx::Transaction<'_, sqlx::Postgres>,
        event: &PaymentEvent,
        reason: String,
    ) -> SettlementResult<SettlementOutcome> {
        let flipped = sqlx::query(
            r#"
            UPDATE payment_events
            SET status = 'failed'
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(event.id)
        .execute(&mut *tx)
        .await?;

        // Redeliveries of an already-failed event land here with zero rows
        // affected; the audit row and member notification were written by
        // the delivery that performed the transition
        if flipped.rows_affected() > 0 {
            events::record(
                &mut tx,
                SettlementEventBuilder::new(event.member_id, SettlementEventType::PaymentRejected)
                    .data(serde_json::json!({
                        "reason": reason,
                        "amount_minor": event.amount_minor,
                        "expected_amount_minor": event.expected_amount_minor,
                    }))
                    .payment(event.id)
                    .actor(ActorType::Gateway),
            )
            .await?;

            outbox::enqueue(
                &mut tx,
                NotificationKind::MemberOutcome,
                outbox::member_outcome_payload(event.member_id, "rejected", None, None),
            )
            .await?;
        }

        tx.commit().await?;

        error!(
            payment_event_id = %event.id,
            member_id = %event.member_id,
            reason = %reason,
            "Settlement rejected"
        );

        Ok(SettlementOutcome::Rejected { reason })
    }
}

/// Check the delivered amount against the expectation recorded at
/// initiation. Returns the rejection reason on divergence beyond tolerance.
fn amount_mismatch(event: &PaymentEvent) -> Option<String> {
    let expected = event.expected_amount_minor?;
    if (event.amount_minor - expected).abs() > AMOUNT_TOLERANCE_MINOR {
        Some(format!(
            "amount {} diverges from expected {} beyond tolerance of {}",
            event.amount_minor, expected, AMOUNT_TOLERANCE_MINOR
        ))
    } else {
        None
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use clubkit_shared::PaymentEventId;
    use time::macros::datetime;

    fn event(amount: i64, expected: Option<i64>) -> PaymentEvent {
        PaymentEvent {
            id: PaymentEventId::new(),
            idempotency_key: "gw_evt_42".to_string(),
            member_id: MemberId::new(),
            amount_minor: amount,
            currency: "EUR".to_string(),
            status: "pending".to_string(),
            subscription_id: None,
            occurred_at: datetime!(2026-05-01 8:00 UTC),
            settlement_confirmed: false,
            purchased_days: 30,
            expected_amount_minor: expected,
            paid_from_referral_balance: false,
            created_at: datetime!(2026-05-01 8:00 UTC),
            settled_at: None,
        }
    }

    #[test]
    fn test_exact_amount_passes() {
        assert!(amount_mismatch(&event(1000, Some(1000))).is_none());
    }

    #[test]
    fn test_within_tolerance_passes() {
        assert!(amount_mismatch(&event(1001, Some(1000))).is_none());
        assert!(amount_mismatch(&event(999, Some(1000))).is_none());
    }

    #[test]
    fn test_beyond_tolerance_rejects() {
        assert!(amount_mismatch(&event(1002, Some(1000))).is_some());
        assert!(amount_mismatch(&event(900, Some(1000))).is_some());
    }

    #[test]
    fn test_no_expectation_passes() {
        assert!(amount_mismatch(&event(1000, None)).is_none());
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let outcome = SettlementOutcome::AlreadySettled;
        let json = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(json["outcome"], "already_settled");
    }
}

//! Notification outbox
//!
//! Settlement results are pushed to an out-of-scope collaborator that
//! talks to members. Delivery is best-effort and must never affect a
//! committed settlement, so notifications are enqueued through the
//! settlement transaction itself and drained after commit by the worker.
//! A timed-out caller loses nothing: the settlement is durable and the
//! outbox row will be delivered on the next drain.

use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use clubkit_shared::MemberId;

use crate::error::SettlementResult;
use crate::referral::ReferralRewardOffer;

/// Kinds of outbound notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// Settlement outcome for the paying member
    MemberOutcome,
    /// New reward offer for the referrer
    ReferrerOffer,
    /// Reward offer resolved into a credit for the referrer
    RewardCredited,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationKind::MemberOutcome => write!(f, "member_outcome"),
            NotificationKind::ReferrerOffer => write!(f, "referrer_offer"),
            NotificationKind::RewardCredited => write!(f, "reward_credited"),
        }
    }
}

/// Enqueue a notification through the caller's transaction
pub async fn enqueue(
    conn: &mut PgConnection,
    kind: NotificationKind,
    payload: serde_json::Value,
) -> SettlementResult<Uuid> {
    let id: (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO notification_outbox (kind, payload)
        VALUES ($1, $2)
        RETURNING id
        "#,
    )
    .bind(kind.to_string())
    .bind(&payload)
    .fetch_one(conn)
    .await?;

    Ok(id.0)
}

/// Payload for the paying member's settlement outcome
pub fn member_outcome_payload(
    member_ref: MemberId,
    outcome: &str,
    new_subscription_end: Option<OffsetDateTime>,
    applied_discount_percent: Option<i32>,
) -> serde_json::Value {
    serde_json::json!({
        "member_ref": member_ref,
        "outcome": outcome,
        "new_subscription_end": new_subscription_end
            .and_then(|t| t.format(&Rfc3339).ok()),
        "applied_discount_percent": applied_discount_percent,
    })
}

/// Payload for the referrer's new reward offer
pub fn referrer_offer_payload(offer: &ReferralRewardOffer) -> serde_json::Value {
    serde_json::json!({
        "referrer_ref": offer.referrer_id,
        "offer_id": offer.id,
        "money_amount": offer.money_amount_minor,
        "days_amount": offer.days_amount,
        "tier": offer.tier,
    })
}

/// Payload for the referrer's credited reward
pub fn reward_credited_payload(offer: &ReferralRewardOffer, choice: &str) -> serde_json::Value {
    serde_json::json!({
        "referrer_ref": offer.referrer_id,
        "offer_id": offer.id,
        "choice": choice,
        "money_amount": offer.money_amount_minor,
        "days_amount": offer.days_amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clubkit_shared::{OfferId, PaymentEventId};
    use time::macros::datetime;

    #[test]
    fn test_kind_display() {
        assert_eq!(NotificationKind::MemberOutcome.to_string(), "member_outcome");
        assert_eq!(NotificationKind::ReferrerOffer.to_string(), "referrer_offer");
        assert_eq!(NotificationKind::RewardCredited.to_string(), "reward_credited");
    }

    #[test]
    fn test_member_outcome_payload_shape() {
        let member = MemberId::new();
        let payload = member_outcome_payload(
            member,
            "settled",
            Some(datetime!(2026-04-15 10:00 UTC)),
            Some(15),
        );
        assert_eq!(payload["outcome"], "settled");
        assert_eq!(payload["applied_discount_percent"], 15);
        assert_eq!(
            payload["new_subscription_end"],
            "2026-04-15T10:00:00Z"
        );
    }

    #[test]
    fn test_rejected_payload_has_null_end() {
        let payload = member_outcome_payload(MemberId::new(), "rejected", None, None);
        assert_eq!(payload["outcome"], "rejected");
        assert!(payload["new_subscription_end"].is_null());
        assert!(payload["applied_discount_percent"].is_null());
    }

    #[test]
    fn test_referrer_offer_payload_shape() {
        let offer = ReferralRewardOffer {
            id: OfferId::new(),
            payment_event_id: PaymentEventId::new(),
            referrer_id: MemberId::new(),
            referee_id: MemberId::new(),
            money_amount_minor: 200,
            days_amount: 7,
            tier: "gold".to_string(),
            percent: 20,
            state: "offered".to_string(),
            created_at: datetime!(2026-04-01 0:00 UTC),
            resolved_at: None,
        };
        let payload = referrer_offer_payload(&offer);
        assert_eq!(payload["money_amount"], 200);
        assert_eq!(payload["days_amount"], 7);
        assert_eq!(payload["tier"], "gold");

        let credited = reward_credited_payload(&offer, "money");
        assert_eq!(credited["choice"], "money");
        assert_eq!(credited["money_amount"], 200);
        assert_eq!(credited["offer_id"], serde_json::json!(offer.id));
    }
}

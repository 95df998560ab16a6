//! Settlement Events Module
//!
//! Append-only audit logging for the settlement engine. Events capture
//! every durable business effect and can be used to:
//! - Answer "why does this member have this subscription end?" questions
//! - Reconstruct settlement history for a payment
//! - Compliance and manual-review workflows
//!
//! Rows are written through the caller's transaction so the audit trail
//! commits atomically with the effects it describes.

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use clubkit_shared::{MemberId, OfferId, PaymentEventId};

use crate::error::SettlementResult;

/// Types of settlement events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementEventType {
    // Payment lifecycle
    PaymentSettled,
    PaymentRejected,

    // Subscription lifecycle
    SubscriptionCreated,
    SubscriptionExtended,
    LifetimeGranted,
    SubscriptionExpired,

    // Loyalty
    DiscountApplied,

    // Referral saga
    RewardOffered,
    RewardCredited,
    RewardOfferExpired,
}

impl std::fmt::Display for SettlementEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SettlementEventType::PaymentSettled => "PAYMENT_SETTLED",
            SettlementEventType::PaymentRejected => "PAYMENT_REJECTED",
            SettlementEventType::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            SettlementEventType::SubscriptionExtended => "SUBSCRIPTION_EXTENDED",
            SettlementEventType::LifetimeGranted => "LIFETIME_GRANTED",
            SettlementEventType::SubscriptionExpired => "SUBSCRIPTION_EXPIRED",
            SettlementEventType::DiscountApplied => "DISCOUNT_APPLIED",
            SettlementEventType::RewardOffered => "REWARD_OFFERED",
            SettlementEventType::RewardCredited => "REWARD_CREDITED",
            SettlementEventType::RewardOfferExpired => "REWARD_OFFER_EXPIRED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// Payment gateway notification
    Gateway,
    /// Member action (reward choice)
    Member,
    /// System automation (worker sweeps)
    System,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::Gateway => write!(f, "gateway"),
            ActorType::Member => write!(f, "member"),
            ActorType::System => write!(f, "system"),
        }
    }
}

/// A settlement event record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SettlementEvent {
    pub id: Uuid,
    pub member_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub payment_event_id: Option<Uuid>,
    pub offer_id: Option<Uuid>,
    pub actor_type: String,
    pub created_at: OffsetDateTime,
}

/// Builder for creating settlement events
pub struct SettlementEventBuilder {
    member_id: MemberId,
    event_type: SettlementEventType,
    event_data: serde_json::Value,
    payment_event_id: Option<PaymentEventId>,
    offer_id: Option<OfferId>,
    actor_type: ActorType,
}

impl SettlementEventBuilder {
    pub fn new(member_id: MemberId, event_type: SettlementEventType) -> Self {
        Self {
            member_id,
            event_type,
            event_data: serde_json::json!({}),
            payment_event_id: None,
            offer_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    pub fn payment(mut self, payment_event_id: PaymentEventId) -> Self {
        self.payment_event_id = Some(payment_event_id);
        self
    }

    pub fn offer(mut self, offer_id: OfferId) -> Self {
        self.offer_id = Some(offer_id);
        self
    }

    pub fn actor(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }
}

/// Record a settlement event through the caller's transaction
pub async fn record(
    conn: &mut PgConnection,
    builder: SettlementEventBuilder,
) -> SettlementResult<Uuid> {
    let event_id: (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO settlement_events (
            member_id,
            event_type,
            event_data,
            payment_event_id,
            offer_id,
            actor_type
        )
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        "#,
    )
    .bind(builder.member_id)
    .bind(builder.event_type.to_string())
    .bind(&builder.event_data)
    .bind(builder.payment_event_id)
    .bind(builder.offer_id)
    .bind(builder.actor_type.to_string())
    .fetch_one(conn)
    .await?;

    Ok(event_id.0)
}

/// Get recent events for a member
pub async fn events_for_member(
    pool: &PgPool,
    member_id: MemberId,
    limit: i64,
) -> SettlementResult<Vec<SettlementEvent>> {
    let events: Vec<SettlementEvent> = sqlx::query_as(
        r#"
        SELECT id, member_id, event_type, event_data, payment_event_id, offer_id,
               actor_type, created_at
        FROM settlement_events
        WHERE member_id = $1
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(member_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(events)
}

/// Get all events recorded for one payment
pub async fn events_for_payment(
    pool: &PgPool,
    payment_event_id: PaymentEventId,
) -> SettlementResult<Vec<SettlementEvent>> {
    let events: Vec<SettlementEvent> = sqlx::query_as(
        r#"
        SELECT id, member_id, event_type, event_data, payment_event_id, offer_id,
               actor_type, created_at
        FROM settlement_events
        WHERE payment_event_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(payment_event_id)
    .fetch_all(pool)
    .await?;

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_display() {
        assert_eq!(
            SettlementEventType::PaymentSettled.to_string(),
            "PAYMENT_SETTLED"
        );
        assert_eq!(
            SettlementEventType::RewardOffered.to_string(),
            "REWARD_OFFERED"
        );
        assert_eq!(
            SettlementEventType::SubscriptionExtended.to_string(),
            "SUBSCRIPTION_EXTENDED"
        );
    }

    #[test]
    fn test_actor_type_display() {
        assert_eq!(ActorType::Gateway.to_string(), "gateway");
        assert_eq!(ActorType::Member.to_string(), "member");
        assert_eq!(ActorType::System.to_string(), "system");
    }

    #[test]
    fn test_event_builder() {
        let member_id = MemberId::new();
        let payment_id = PaymentEventId::new();
        let builder = SettlementEventBuilder::new(member_id, SettlementEventType::PaymentSettled)
            .data(serde_json::json!({"amount_minor": 1000}))
            .payment(payment_id)
            .actor(ActorType::Gateway);

        assert_eq!(builder.member_id, member_id);
        assert_eq!(builder.event_type, SettlementEventType::PaymentSettled);
        assert_eq!(builder.payment_event_id, Some(payment_id));
        assert_eq!(builder.actor_type, ActorType::Gateway);
    }
}

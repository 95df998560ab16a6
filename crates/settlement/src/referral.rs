//! Referral Reward Saga
//!
//! Two independent transactions linked by the originating payment
//! reference. The offer phase runs inside the settlement transaction and
//! persists a pending `ReferralRewardOffer`; the resolution phase is a
//! later, separately-triggered transaction that finalizes the offer into
//! a credited reward (balance money or subscription days).
//!
//! The offer table is unique on the payment reference, so the coordinator
//! firing twice for one payment trips a unique violation instead of
//! double-offering. Resolving an offer twice is routine (double-click)
//! and reported as a success-no-op.

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use tracing::{debug, info};

use clubkit_shared::{LoyaltyLevel, MemberId, OfferId, PaymentEventId};

use crate::error::{SettlementError, SettlementResult};
use crate::events::{self, ActorType, SettlementEventBuilder, SettlementEventType};
use crate::idempotency::PaymentEvent;
use crate::loyalty::MemberProfile;
use crate::outbox::{self, NotificationKind};
use crate::subscription;

/// Flat days-reward attached to every offer
pub const REFERRAL_REWARD_DAYS: i32 = 7;

/// A persisted referral reward offer
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReferralRewardOffer {
    pub id: OfferId,
    pub payment_event_id: PaymentEventId,
    pub referrer_id: MemberId,
    pub referee_id: MemberId,
    pub money_amount_minor: i64,
    pub days_amount: i32,
    pub tier: String,
    pub percent: i32,
    pub state: String,
    pub created_at: OffsetDateTime,
    pub resolved_at: Option<OffsetDateTime>,
}

/// The referrer's choice of reward form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardChoice {
    Money,
    Days,
}

impl RewardChoice {
    fn target_state(&self) -> &'static str {
        match self {
            RewardChoice::Money => "chosen_money",
            RewardChoice::Days => "chosen_days",
        }
    }
}

impl std::fmt::Display for RewardChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RewardChoice::Money => write!(f, "money"),
            RewardChoice::Days => write!(f, "days"),
        }
    }
}

/// Result of a resolution attempt
#[derive(Debug)]
pub enum ResolutionOutcome {
    /// Offer finalized; the reward is durably credited
    Credited {
        offer: ReferralRewardOffer,
        choice: RewardChoice,
    },
    /// Offer already carries a terminal state; no effects (double-click)
    AlreadyResolved,
    NotFound,
}

/// Money reward in minor units: floor of amount x percent
pub fn money_reward(amount_minor: i64, percent: i64) -> i64 {
    amount_minor * percent / 100
}

const OFFER_COLUMNS: &str = "id, payment_event_id, referrer_id, referee_id, money_amount_minor, \
     days_amount, tier, percent, state, created_at, resolved_at";

/// Offer phase. Runs inside the settlement transaction; returns `None`
/// when the payment is not reward-eligible. Eligibility: the payer has a
/// referrer, the referrer holds an active subscription, and the payment
/// was not itself funded from a referral balance.
pub async fn offer_for_payment(
    conn: &mut PgConnection,
    event: &PaymentEvent,
    payer: &MemberProfile,
    now: OffsetDateTime,
) -> SettlementResult<Option<ReferralRewardOffer>> {
    let referrer_id = match payer.referrer_id {
        Some(id) => id,
        None => return Ok(None),
    };

    if event.paid_from_referral_balance {
        debug!(
            payment_event_id = %event.id,
            "Payment funded from referral balance, no reward offer"
        );
        return Ok(None);
    }

    if !subscription::has_active(&mut *conn, referrer_id).await? {
        debug!(
            payment_event_id = %event.id,
            referrer_id = %referrer_id,
            "Referrer has no active subscription, no reward offer"
        );
        return Ok(None);
    }

    let referrer_first_payment: Option<(Option<OffsetDateTime>,)> =
        sqlx::query_as("SELECT first_payment_at FROM members WHERE id = $1")
            .bind(referrer_id)
            .fetch_optional(&mut *conn)
            .await?;

    let referrer_first_payment = referrer_first_payment
        .ok_or_else(|| {
            SettlementError::InvariantViolation(format!(
                "referrer {} of payer {} does not exist",
                referrer_id, payer.id
            ))
        })?
        .0;

    let level = LoyaltyLevel::from_first_payment(referrer_first_payment, now);
    let percent = level.reward_percent();
    let money = money_reward(event.amount_minor, percent);

    // Unique on payment_event_id: a second insert for the same payment is
    // a 23505, surfaced loudly as an invariant violation
    let offer: ReferralRewardOffer = sqlx::query_as(&format!(
        r#"
        INSERT INTO referral_reward_offers (
            payment_event_id, referrer_id, referee_id, money_amount_minor,
            days_amount, tier, percent, state
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'offered')
        RETURNING {OFFER_COLUMNS}
        "#
    ))
    .bind(event.id)
    .bind(referrer_id)
    .bind(payer.id)
    .bind(money)
    .bind(REFERRAL_REWARD_DAYS)
    .bind(level.to_string())
    .bind(percent as i32)
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query("UPDATE members SET pending_reward_choice = TRUE WHERE id = $1")
        .bind(referrer_id)
        .execute(&mut *conn)
        .await?;

    events::record(
        &mut *conn,
        SettlementEventBuilder::new(referrer_id, SettlementEventType::RewardOffered)
            .data(serde_json::json!({
                "money_amount_minor": offer.money_amount_minor,
                "days_amount": offer.days_amount,
                "tier": offer.tier,
                "percent": offer.percent,
                "referee_id": payer.id,
            }))
            .payment(event.id)
            .offer(offer.id)
            .actor(ActorType::Gateway),
    )
    .await?;

    outbox::enqueue(
        &mut *conn,
        NotificationKind::ReferrerOffer,
        outbox::referrer_offer_payload(&offer),
    )
    .await?;

    info!(
        offer_id = %offer.id,
        payment_event_id = %event.id,
        referrer_id = %referrer_id,
        money_amount_minor = offer.money_amount_minor,
        tier = %offer.tier,
        "Referral reward offered"
    );

    Ok(Some(offer))
}

/// Resolution phase of the saga: an independent, idempotent transaction
pub struct ReferralSaga {
    pool: PgPool,
}

impl ReferralSaga {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Finalize an offer into a credited reward. A conditional update
    /// carries the race: zero affected rows with an existing offer means
    /// someone else resolved it first, which is a success-no-op.
    pub async fn resolve(
        &self,
        offer_id: OfferId,
        choice: RewardChoice,
    ) -> SettlementResult<ResolutionOutcome> {
        let mut tx = self.pool.begin().await?;

        let resolved: Option<ReferralRewardOffer> = sqlx::query_as(&format!(
            r#"
            UPDATE referral_reward_offers
            SET state = $2, resolved_at = NOW()
            WHERE id = $1 AND state = 'offered'
            RETURNING {OFFER_COLUMNS}
            "#
        ))
        .bind(offer_id)
        .bind(choice.target_state())
        .fetch_optional(&mut *tx)
        .await?;

        let offer = match resolved {
            Some(offer) => offer,
            None => {
                let (exists,): (bool,) = sqlx::query_as(
                    "SELECT EXISTS (SELECT 1 FROM referral_reward_offers WHERE id = $1)",
                )
                .bind(offer_id)
                .fetch_one(&mut *tx)
                .await?;
                tx.rollback().await.ok();

                return if exists {
                    debug!(offer_id = %offer_id, "Reward offer already resolved");
                    Ok(ResolutionOutcome::AlreadyResolved)
                } else {
                    Ok(ResolutionOutcome::NotFound)
                };
            }
        };

        match choice {
            RewardChoice::Money => {
                sqlx::query(
                    r#"
                    UPDATE members
                    SET referral_balance_minor = referral_balance_minor + $2,
                        pending_reward_choice = FALSE
                    WHERE id = $1
                    "#,
                )
                .bind(offer.referrer_id)
                .bind(offer.money_amount_minor)
                .execute(&mut *tx)
                .await?;
            }
            RewardChoice::Days => {
                subscription::apply_payment(
                    &mut tx,
                    offer.referrer_id,
                    offer.days_amount,
                    &format!("referral_reward:{}", offer.id),
                )
                .await?;

                sqlx::query("UPDATE members SET pending_reward_choice = FALSE WHERE id = $1")
                    .bind(offer.referrer_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        events::record(
            &mut tx,
            SettlementEventBuilder::new(offer.referrer_id, SettlementEventType::RewardCredited)
                .data(serde_json::json!({
                    "choice": choice.to_string(),
                    "money_amount_minor": offer.money_amount_minor,
                    "days_amount": offer.days_amount,
                }))
                .payment(offer.payment_event_id)
                .offer(offer.id)
                .actor(ActorType::Member),
        )
        .await?;

        outbox::enqueue(
            &mut tx,
            NotificationKind::RewardCredited,
            outbox::reward_credited_payload(&offer, &choice.to_string()),
        )
        .await?;

        tx.commit().await?;

        info!(
            offer_id = %offer.id,
            referrer_id = %offer.referrer_id,
            choice = %choice,
            "Referral reward credited"
        );

        Ok(ResolutionOutcome::Credited { offer, choice })
    }

    /// Expire stale offers that were never resolved. Conditional update,
    /// so a concurrent resolution always wins over expiry. Each expiry
    /// leaves an audit event in the same transaction.
    pub async fn expire_stale_offers(&self, older_than_days: i32) -> SettlementResult<u64> {
        let mut tx = self.pool.begin().await?;

        let expired: Vec<(OfferId, MemberId, PaymentEventId)> = sqlx::query_as(
            r#"
            UPDATE referral_reward_offers
            SET state = 'expired', resolved_at = NOW()
            WHERE state = 'offered'
              AND created_at < NOW() - make_interval(days => $1)
            RETURNING id, referrer_id, payment_event_id
            "#,
        )
        .bind(older_than_days)
        .fetch_all(&mut *tx)
        .await?;

        for (offer_id, referrer_id, payment_event_id) in &expired {
            events::record(
                &mut tx,
                SettlementEventBuilder::new(*referrer_id, SettlementEventType::RewardOfferExpired)
                    .payment(*payment_event_id)
                    .offer(*offer_id)
                    .actor(ActorType::System),
            )
            .await?;
        }

        // Members whose only pending offer just expired get the flag cleared
        sqlx::query(
            r#"
            UPDATE members
            SET pending_reward_choice = FALSE
            WHERE pending_reward_choice
              AND NOT EXISTS (
                  SELECT 1 FROM referral_reward_offers
                  WHERE referrer_id = members.id AND state = 'offered'
              )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(expired.len() as u64)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_money_reward_gold_scenario() {
        // Referrer at gold (20%), referee pays 1000 units
        assert_eq!(money_reward(1000, LoyaltyLevel::Gold.reward_percent()), 200);
    }

    #[test]
    fn test_money_reward_floors() {
        assert_eq!(money_reward(999, 10), 99);
        assert_eq!(money_reward(1, 25), 0);
    }

    #[test]
    fn test_choice_target_state() {
        assert_eq!(RewardChoice::Money.target_state(), "chosen_money");
        assert_eq!(RewardChoice::Days.target_state(), "chosen_days");
    }

    #[test]
    fn test_choice_deserializes_lowercase() {
        let money: RewardChoice = serde_json::from_str("\"money\"").expect("parse");
        let days: RewardChoice = serde_json::from_str("\"days\"").expect("parse");
        assert_eq!(money, RewardChoice::Money);
        assert_eq!(days, RewardChoice::Days);
    }
}

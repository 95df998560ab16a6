//! Loyalty Discount Consumer
//!
//! The charged price is computed upstream by the collaborator that
//! initiates the payment; this module only reconciles which discount was
//! spent against the settled amount and records it for audit.
//!
//! Two discount kinds live on the member row: a one-time percent that is
//! zeroed after the payment that reflects it, and a lifetime percent that
//! applies to every payment and is never zeroed. The effective discount
//! at initiation is `max(one_time, lifetime)`, so the kind reflected in
//! the settled amount is the larger of the two.

use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use time::OffsetDateTime;
use tracing::debug;

use clubkit_shared::{LoyaltyLevel, MemberId};

use crate::error::SettlementResult;

/// Loyalty fields on a member row, locked by the settlement transaction
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MemberProfile {
    pub id: MemberId,
    pub referrer_id: Option<MemberId>,
    pub first_payment_at: Option<OffsetDateTime>,
    pub one_time_discount_percent: i32,
    pub lifetime_discount_percent: i32,
    pub pending_reward_choice: bool,
    pub referral_balance_minor: i64,
}

/// Which discount the settled amount reflected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppliedDiscount {
    None,
    OneTime { percent: i32, level: LoyaltyLevel },
    Lifetime { percent: i32, level: LoyaltyLevel },
}

impl AppliedDiscount {
    pub fn percent(&self) -> i32 {
        match self {
            AppliedDiscount::None => 0,
            AppliedDiscount::OneTime { percent, .. } => *percent,
            AppliedDiscount::Lifetime { percent, .. } => *percent,
        }
    }

    pub fn kind_str(&self) -> Option<&'static str> {
        match self {
            AppliedDiscount::None => None,
            AppliedDiscount::OneTime { .. } => Some("one_time"),
            AppliedDiscount::Lifetime { .. } => Some("lifetime"),
        }
    }
}

/// Pure selection of the consumed discount. On a tie the lifetime kind
/// wins: the amounts are identical either way, and treating the payment
/// as lifetime-discounted preserves the one-time grant for a later
/// payment where it buys something.
pub fn select_applied(one_time: i32, lifetime: i32, level: LoyaltyLevel) -> AppliedDiscount {
    if one_time <= 0 && lifetime <= 0 {
        AppliedDiscount::None
    } else if one_time > lifetime {
        AppliedDiscount::OneTime {
            percent: one_time,
            level,
        }
    } else {
        AppliedDiscount::Lifetime {
            percent: lifetime,
            level,
        }
    }
}

/// Load and lock a member's loyalty profile inside the caller's transaction
pub async fn load_profile_for_update(
    conn: &mut PgConnection,
    member_id: MemberId,
) -> SettlementResult<Option<MemberProfile>> {
    let profile: Option<MemberProfile> = sqlx::query_as(
        r#"
        SELECT id, referrer_id, first_payment_at, one_time_discount_percent,
               lifetime_discount_percent, pending_reward_choice, referral_balance_minor
        FROM members
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(member_id)
    .fetch_optional(conn)
    .await?;

    Ok(profile)
}

/// Consume the discount reflected in this settlement. Stamps the
/// first-qualifying-payment timestamp once, zeroes a consumed one-time
/// discount, and leaves a lifetime discount untouched.
pub async fn consume(
    conn: &mut PgConnection,
    profile: &MemberProfile,
    now: OffsetDateTime,
) -> SettlementResult<AppliedDiscount> {
    // Set-once: only the first qualifying payment stamps tenure
    sqlx::query(
        r#"
        UPDATE members SET first_payment_at = $2
        WHERE id = $1 AND first_payment_at IS NULL
        "#,
    )
    .bind(profile.id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    // Tenure (and level) is measured from the pre-existing first payment;
    // a brand-new payer starts at bronze
    let level = LoyaltyLevel::from_first_payment(profile.first_payment_at, now);

    let applied = select_applied(
        profile.one_time_discount_percent,
        profile.lifetime_discount_percent,
        level,
    );

    if let AppliedDiscount::OneTime { percent, .. } = applied {
        sqlx::query(
            r#"
            UPDATE members SET one_time_discount_percent = 0
            WHERE id = $1
            "#,
        )
        .bind(profile.id)
        .execute(&mut *conn)
        .await?;

        debug!(
            member_id = %profile.id,
            percent = percent,
            "Consumed one-time discount"
        );
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_no_discounts_selects_none() {
        let applied = select_applied(0, 0, LoyaltyLevel::Bronze);
        assert_eq!(applied, AppliedDiscount::None);
        assert_eq!(applied.percent(), 0);
        assert_eq!(applied.kind_str(), None);
    }

    #[test]
    fn test_one_time_wins_when_larger() {
        let applied = select_applied(30, 10, LoyaltyLevel::Silver);
        assert_eq!(
            applied,
            AppliedDiscount::OneTime {
                percent: 30,
                level: LoyaltyLevel::Silver
            }
        );
        assert_eq!(applied.kind_str(), Some("one_time"));
    }

    #[test]
    fn test_lifetime_wins_when_larger() {
        let applied = select_applied(5, 15, LoyaltyLevel::Gold);
        assert_eq!(
            applied,
            AppliedDiscount::Lifetime {
                percent: 15,
                level: LoyaltyLevel::Gold
            }
        );
        assert_eq!(applied.kind_str(), Some("lifetime"));
    }

    #[test]
    fn test_tie_preserves_one_time() {
        // Amounts are identical either way; the one-time grant survives
        let applied = select_applied(20, 20, LoyaltyLevel::Gold);
        assert_eq!(
            applied,
            AppliedDiscount::Lifetime {
                percent: 20,
                level: LoyaltyLevel::Gold
            }
        );
    }

    #[test]
    fn test_level_uses_pre_stamp_tenure() {
        let now = datetime!(2026-06-01 0:00 UTC);
        let first = datetime!(2025-01-01 0:00 UTC); // 516 days of tenure
        let level = LoyaltyLevel::from_first_payment(Some(first), now);
        assert_eq!(level, LoyaltyLevel::Gold);
    }
}

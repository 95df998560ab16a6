//! Common types used across Clubkit

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Member ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct MemberId(pub Uuid);

impl MemberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MemberId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payment event ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct PaymentEventId(pub Uuid);

impl PaymentEventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PaymentEventId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for PaymentEventId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PaymentEventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscription ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SubscriptionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Referral reward offer ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct OfferId(pub Uuid);

impl OfferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OfferId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for OfferId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for OfferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Loyalty
// =============================================================================

/// Loyalty level derived from tenure (time since first qualifying payment)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoyaltyLevel {
    Bronze,
    Silver,
    Gold,
    Platinum,
}

impl LoyaltyLevel {
    /// Derive the level from tenure in whole days
    pub fn from_tenure_days(days: i64) -> Self {
        // Month boundaries approximated at 30 days
        match days {
            d if d < 90 => LoyaltyLevel::Bronze,
            d if d < 270 => LoyaltyLevel::Silver,
            d if d < 540 => LoyaltyLevel::Gold,
            _ => LoyaltyLevel::Platinum,
        }
    }

    /// Derive the level from the first qualifying payment timestamp
    pub fn from_first_payment(first_payment_at: Option<OffsetDateTime>, now: OffsetDateTime) -> Self {
        match first_payment_at {
            Some(first) => Self::from_tenure_days((now - first).whole_days()),
            None => LoyaltyLevel::Bronze,
        }
    }

    /// Referral reward percent for this level
    pub fn reward_percent(&self) -> i64 {
        match self {
            LoyaltyLevel::Bronze => 10,
            LoyaltyLevel::Silver => 15,
            LoyaltyLevel::Gold => 20,
            LoyaltyLevel::Platinum => 25,
        }
    }
}

impl std::fmt::Display for LoyaltyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoyaltyLevel::Bronze => write!(f, "bronze"),
            LoyaltyLevel::Silver => write!(f, "silver"),
            LoyaltyLevel::Gold => write!(f, "gold"),
            LoyaltyLevel::Platinum => write!(f, "platinum"),
        }
    }
}

impl std::str::FromStr for LoyaltyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bronze" => Ok(LoyaltyLevel::Bronze),
            "silver" => Ok(LoyaltyLevel::Silver),
            "gold" => Ok(LoyaltyLevel::Gold),
            "platinum" => Ok(LoyaltyLevel::Platinum),
            _ => Err(format!("Unknown loyalty level: {}", s)),
        }
    }
}

// =============================================================================
// Inbound gateway payload
// =============================================================================

/// Metadata attached to a gateway payment notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMetadata {
    /// Subscription duration purchased, in days
    pub purchased_days: i32,
    /// Amount recorded when the charge was initiated, in minor units
    pub expected_amount_minor: Option<i64>,
    /// Whether the payment was funded from the member's referral balance
    #[serde(default)]
    pub paid_from_referral_balance: bool,
}

/// A payment notification as delivered by the gateway collaborator.
///
/// Delivery is at-least-once and unordered; the idempotency key is the
/// only identity the engine trusts. Validated at the boundary before it
/// reaches the settlement transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentNotification {
    pub idempotency_key: String,
    /// Integer minor units, never floating point
    pub amount_minor: i64,
    pub currency: String,
    pub payer_ref: MemberId,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    pub metadata: PaymentMetadata,
}

impl PaymentNotification {
    /// Validate the payload shape before it enters the settlement pipeline
    pub fn validate(&self) -> Result<(), String> {
        if self.idempotency_key.trim().is_empty() {
            return Err("idempotency_key must not be empty".to_string());
        }
        if self.idempotency_key.len() > 255 {
            return Err("idempotency_key exceeds 255 characters".to_string());
        }
        if self.amount_minor <= 0 {
            return Err("amount_minor must be positive".to_string());
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(format!("invalid currency code: {}", self.currency));
        }
        if self.metadata.purchased_days <= 0 {
            return Err("purchased_days must be positive".to_string());
        }
        if let Some(expected) = self.metadata.expected_amount_minor {
            if expected <= 0 {
                return Err("expected_amount_minor must be positive".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sample_notification() -> PaymentNotification {
        PaymentNotification {
            idempotency_key: "gw_evt_123".to_string(),
            amount_minor: 1000,
            currency: "EUR".to_string(),
            payer_ref: MemberId::new(),
            occurred_at: datetime!(2026-01-15 12:00 UTC),
            metadata: PaymentMetadata {
                purchased_days: 30,
                expected_amount_minor: Some(1000),
                paid_from_referral_balance: false,
            },
        }
    }

    #[test]
    fn test_loyalty_level_from_tenure() {
        assert_eq!(LoyaltyLevel::from_tenure_days(0), LoyaltyLevel::Bronze);
        assert_eq!(LoyaltyLevel::from_tenure_days(89), LoyaltyLevel::Bronze);
        assert_eq!(LoyaltyLevel::from_tenure_days(90), LoyaltyLevel::Silver);
        assert_eq!(LoyaltyLevel::from_tenure_days(269), LoyaltyLevel::Silver);
        assert_eq!(LoyaltyLevel::from_tenure_days(270), LoyaltyLevel::Gold);
        assert_eq!(LoyaltyLevel::from_tenure_days(539), LoyaltyLevel::Gold);
        assert_eq!(LoyaltyLevel::from_tenure_days(540), LoyaltyLevel::Platinum);
    }

    #[test]
    fn test_loyalty_level_reward_percent() {
        assert_eq!(LoyaltyLevel::Bronze.reward_percent(), 10);
        assert_eq!(LoyaltyLevel::Silver.reward_percent(), 15);
        assert_eq!(LoyaltyLevel::Gold.reward_percent(), 20);
        assert_eq!(LoyaltyLevel::Platinum.reward_percent(), 25);
    }

    #[test]
    fn test_loyalty_level_display_round_trip() {
        for level in [
            LoyaltyLevel::Bronze,
            LoyaltyLevel::Silver,
            LoyaltyLevel::Gold,
            LoyaltyLevel::Platinum,
        ] {
            let parsed: LoyaltyLevel = level.to_string().parse().expect("round trip");
            assert_eq!(parsed, level);
        }
        assert!("diamond".parse::<LoyaltyLevel>().is_err());
    }

    #[test]
    fn test_no_first_payment_is_bronze() {
        let now = datetime!(2026-01-15 12:00 UTC);
        assert_eq!(
            LoyaltyLevel::from_first_payment(None, now),
            LoyaltyLevel::Bronze
        );
    }

    #[test]
    fn test_notification_validation_accepts_well_formed() {
        assert!(sample_notification().validate().is_ok());
    }

    #[test]
    fn test_notification_validation_rejects_bad_payloads() {
        let mut n = sample_notification();
        n.idempotency_key = "  ".to_string();
        assert!(n.validate().is_err());

        let mut n = sample_notification();
        n.amount_minor = 0;
        assert!(n.validate().is_err());

        let mut n = sample_notification();
        n.currency = "EURO".to_string();
        assert!(n.validate().is_err());

        let mut n = sample_notification();
        n.metadata.purchased_days = 0;
        assert!(n.validate().is_err());

        let mut n = sample_notification();
        n.metadata.expected_amount_minor = Some(-5);
        assert!(n.validate().is_err());
    }
}

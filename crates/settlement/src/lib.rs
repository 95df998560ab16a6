//! Clubkit Settlement Engine
//!
//! Converts at-least-once payment gateway notifications into exactly-once
//! business effects: subscription extension/creation, loyalty discount
//! consumption, and referral reward offers. All correctness is enforced
//! through store-level row locks and conditional updates inside single
//! transactions; nothing depends on in-process state, so the engine runs
//! on any number of instances without external coordination.

pub mod coordinator;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod loyalty;
pub mod outbox;
pub mod referral;
pub mod subscription;

pub use coordinator::{SettlementCoordinator, SettlementOutcome, AMOUNT_TOLERANCE_MINOR};
pub use error::{SettlementError, SettlementResult};
pub use idempotency::{Admission, PaymentEvent};
pub use loyalty::AppliedDiscount;
pub use referral::{
    ReferralRewardOffer, ReferralSaga, ResolutionOutcome, RewardChoice, REFERRAL_REWARD_DAYS,
};
pub use subscription::{Subscription, EXPIRY_SCAN_THRESHOLD, LIFETIME_SENTINEL};

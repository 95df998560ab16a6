//! Scheduled subscription maintenance

use sqlx::PgPool;
use tracing::{error, info};

use clubkit_settlement::{subscription, ReferralSaga};

/// Offers left unresolved this long are expired
const OFFER_EXPIRY_DAYS: i32 = 30;

/// Deactivate subscriptions whose end has passed. Lifetime grants carry a
/// sentinel end and are excluded by the sweep's threshold comparison.
pub async fn sweep_expired_subscriptions(pool: &PgPool) {
    match subscription::deactivate_expired(pool).await {
        Ok(0) => {}
        Ok(count) => {
            info!(deactivated = count, "Expired subscriptions deactivated");
        }
        Err(e) => {
            error!(error = %e, "Subscription expiry sweep failed");
        }
    }
}

/// Expire referral reward offers that were never resolved
pub async fn sweep_stale_offers(pool: &PgPool) {
    let saga = ReferralSaga::new(pool.clone());
    match saga.expire_stale_offers(OFFER_EXPIRY_DAYS).await {
        Ok(0) => {}
        Ok(count) => {
            info!(expired = count, "Stale reward offers expired");
        }
        Err(e) => {
            error!(error = %e, "Reward offer expiry sweep failed");
        }
    }
}

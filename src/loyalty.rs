//! Loyalty points ledger. Same shape as the credit ledger: the balance is the
//! sum of signed entries, accruals positive and redemptions negative.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::credit::idempotency_key;
use crate::error::{AppError, AppResult};
use crate::model::{LoyaltyEntry, LoyaltyEntryKind};
use crate::store::{LoyaltyDraft, PointsPosted, Store};

/// Balance after redeeming `points` from `balance`, or `InvalidInput` when
/// the customer does not hold enough points.
pub fn check_redemption(balance: i64, points: i64) -> AppResult<i64> {
    if points > balance {
        return Err(AppError::invalid("points", "Insufficient points"));
    }
    Ok(balance - points)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoyaltySummary {
    pub customer_id: String,
    pub balance: i64,
    pub recent_entries: Vec<LoyaltyEntry>,
}

pub struct LoyaltyLedger {
    store: Arc<dyn Store>,
    recent: i64,
}

fn validate_customer(customer_id: &str) -> AppResult<String> {
    let trimmed = customer_id.trim();
    if trimmed.is_empty() {
        return Err(AppError::invalid("customerId", "must not be empty"));
    }
    Ok(trimmed.to_string())
}

fn validate_points(points: i64) -> AppResult<()> {
    if points <= 0 {
        return Err(AppError::invalid("points", "must be a positive integer"));
    }
    Ok(())
}

impl LoyaltyLedger {
    pub fn new(store: Arc<dyn Store>, recent: u32) -> Self {
        Self {
            store,
            recent: i64::from(recent),
        }
    }

    pub async fn balance(&self, tenant_id: Uuid, customer_id: &str) -> AppResult<LoyaltySummary> {
        let customer_id = validate_customer(customer_id)?;
        let account = self
            .store
            .find_loyalty_account(tenant_id, &customer_id)
            .await?
            .ok_or_else(|| AppError::not_found("loyalty account not found"))?;
        let balance = self
            .store
            .loyalty_balance(tenant_id, account.loyalty_id)
            .await?;
        let recent_entries = self
            .store
            .recent_loyalty_entries(tenant_id, account.loyalty_id, self.recent)
            .await?;
        Ok(LoyaltySummary {
            customer_id,
            balance,
            recent_entries,
        })
    }

    pub async fn accrue(
        &self,
        tenant_id: Uuid,
        customer_id: &str,
        points: i64,
        reason: Option<String>,
        key: Option<String>,
    ) -> AppResult<PointsPosted> {
        let customer_id = validate_customer(customer_id)?;
        validate_points(points)?;
        let posted = self
            .store
            .post_points(LoyaltyDraft {
                tenant_id,
                customer_id,
                kind: LoyaltyEntryKind::Accrual,
                points,
                reason,
                idempotency_key: idempotency_key(tenant_id, key)?,
            })
            .await?;
        info!(%tenant_id, loyalty_id = %posted.entry.loyalty_id, points, balance = posted.balance, replayed = posted.replayed, "loyalty points accrued");
        Ok(posted)
    }

    /// Redeem `points`, returning the new balance.
    pub async fn redeem(&self, tenant_id: Uuid, customer_id: &str, points: i64) -> AppResult<i64> {
        let customer_id = validate_customer(customer_id)?;
        validate_points(points)?;
        let posted = self
            .store
            .post_points(LoyaltyDraft {
                tenant_id,
                customer_id,
                kind: LoyaltyEntryKind::Redemption,
                points: -points,
                reason: None,
                idempotency_key: idempotency_key(tenant_id, None)?,
            })
            .await?;
        info!(%tenant_id, loyalty_id = %posted.entry.loyalty_id, points, balance = posted.balance, "loyalty points redeemed");
        Ok(posted.balance)
    }
}

//! Persistence capability.
//!
//! Every query is scoped by `tenant_id`. Writes that read a balance before
//! inserting run under a per-account lock and call the ledger policy
//! functions inside that critical section, so both adapters enforce the same
//! rules with the same ordering guarantees.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AppResult;
use crate::model::{
    CreditAccount, CreditStatus, CreditTransaction, LoyaltyAccount, LoyaltyEntry,
    LoyaltyEntryKind, Membership, Role, Tenant, TransactionStatus, TransactionType, User,
};

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub tenant_id: Uuid,
    pub customer_id: String,
    pub credit_limit: i64,
    pub status: CreditStatus,
    pub payment_method_ref: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AccountPatch {
    pub credit_limit: Option<i64>,
    pub status: Option<CreditStatus>,
    pub payment_method_ref: Option<String>,
}

impl AccountPatch {
    pub fn is_empty(&self) -> bool {
        self.credit_limit.is_none() && self.status.is_none() && self.payment_method_ref.is_none()
    }
}

/// A validated, signed transaction ready to be appended.
#[derive(Debug, Clone)]
pub struct TransactionDraft {
    pub tenant_id: Uuid,
    pub credit_id: Uuid,
    pub transaction_type: TransactionType,
    pub amount: i64,
    pub status: TransactionStatus,
    pub idempotency_key: String,
    pub description: Option<String>,
    pub due_date: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Created(CreditTransaction),
    Replayed(CreditTransaction),
}

impl RecordOutcome {
    pub fn transaction(&self) -> &CreditTransaction {
        match self {
            RecordOutcome::Created(t) | RecordOutcome::Replayed(t) => t,
        }
    }

    pub fn into_transaction(self) -> CreditTransaction {
        match self {
            RecordOutcome::Created(t) | RecordOutcome::Replayed(t) => t,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, RecordOutcome::Replayed(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub credit_id: Option<Uuid>,
    pub status: Option<TransactionStatus>,
    pub transaction_type: Option<TransactionType>,
}

impl TransactionFilter {
    pub fn matches(&self, tx: &CreditTransaction) -> bool {
        self.credit_id.is_none_or(|id| tx.credit_id == id)
            && self.status.is_none_or(|s| tx.status == s)
            && self.transaction_type.is_none_or(|t| tx.transaction_type == t)
    }
}

/// Normalized limit/offset pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

/// A role grant or removal checked against the last-owner rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Assign(Role),
    Remove,
}

#[derive(Debug, Clone)]
pub struct LoyaltyDraft {
    pub tenant_id: Uuid,
    pub customer_id: String,
    pub kind: LoyaltyEntryKind,
    pub points: i64,
    pub reason: Option<String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointsPosted {
    pub entry: LoyaltyEntry,
    pub balance: i64,
    pub replayed: bool,
}

#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn insert_tenant(&self, name: &str) -> AppResult<Tenant>;
    async fn find_tenant_by_name(&self, name: &str) -> AppResult<Option<Tenant>>;
    async fn insert_user(
        &self,
        email: &str,
        password_hash: &str,
        display_name: &str,
    ) -> AppResult<User>;
    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<User>>;
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn find_membership(&self, tenant_id: Uuid, user_id: Uuid)
    -> AppResult<Option<Membership>>;
    async fn list_memberships(&self, tenant_id: Uuid) -> AppResult<Vec<Membership>>;
    /// Insert or change the single membership for `(tenant_id, user_id)`
    /// without the owner guard. Used for seeding.
    async fn upsert_membership(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        role: &Role,
    ) -> AppResult<Membership>;
    /// Apply `change` while holding the tenant's membership rows, refusing any
    /// change that leaves the tenant without an owner. Returns the resulting
    /// membership, or `None` after a removal.
    async fn change_membership(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        change: MembershipChange,
    ) -> AppResult<Option<Membership>>;
}

#[async_trait]
pub trait CreditStore: Send + Sync {
    async fn find_account(&self, tenant_id: Uuid, credit_id: Uuid)
    -> AppResult<Option<CreditAccount>>;
    /// The non-closed account for a customer, if any.
    async fn find_open_account(
        &self,
        tenant_id: Uuid,
        customer_id: &str,
    ) -> AppResult<Option<CreditAccount>>;
    async fn list_open_accounts(&self, tenant_id: Uuid) -> AppResult<Vec<CreditAccount>>;
    /// Fails with `Conflict` when the customer already has an open account.
    async fn insert_account(&self, account: NewAccount) -> AppResult<CreditAccount>;
    async fn update_account(
        &self,
        tenant_id: Uuid,
        credit_id: Uuid,
        patch: AccountPatch,
    ) -> AppResult<CreditAccount>;

    /// Sum of completed transaction amounts.
    async fn completed_balance(&self, tenant_id: Uuid, credit_id: Uuid) -> AppResult<i64>;
    async fn recent_transactions(
        &self,
        tenant_id: Uuid,
        credit_id: Uuid,
        limit: i64,
    ) -> AppResult<Vec<CreditTransaction>>;
    async fn list_transactions(
        &self,
        tenant_id: Uuid,
        filter: &TransactionFilter,
        page: Page,
    ) -> AppResult<Vec<CreditTransaction>>;
    async fn find_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> AppResult<Option<CreditTransaction>>;

    /// Append under the account lock, replaying on a known idempotency key.
    async fn append_transaction(&self, draft: TransactionDraft) -> AppResult<RecordOutcome>;
    /// Move a pending transaction to `completed` or `failed`.
    async fn settle_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
        outcome: TransactionStatus,
    ) -> AppResult<CreditTransaction>;
    /// Mark a completed transaction reversed and append its compensating
    /// entry. Returns the compensating entry.
    async fn reverse_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
        description: Option<String>,
    ) -> AppResult<CreditTransaction>;
}

#[async_trait]
pub trait LoyaltyStore: Send + Sync {
    async fn find_loyalty_account(
        &self,
        tenant_id: Uuid,
        customer_id: &str,
    ) -> AppResult<Option<LoyaltyAccount>>;
    async fn loyalty_balance(&self, tenant_id: Uuid, loyalty_id: Uuid) -> AppResult<i64>;
    async fn recent_loyalty_entries(
        &self,
        tenant_id: Uuid,
        loyalty_id: Uuid,
        limit: i64,
    ) -> AppResult<Vec<LoyaltyEntry>>;
    /// Append under the account lock. Accruals create the account on first
    /// use; redemptions require it and are checked against the balance.
    async fn post_points(&self, draft: LoyaltyDraft) -> AppResult<PointsPosted>;
}

#[async_trait]
pub trait Store: DirectoryStore + MembershipStore + CreditStore + LoyaltyStore {
    /// Cheap round trip used by the readiness check.
    async fn ping(&self) -> AppResult<()>;
}

/// Key prefix reserved for compensating entries. Callers may not use it.
pub const REVERSAL_KEY_PREFIX: &str = "reversal:";

/// Idempotency key of the compensating entry for `original`.
pub fn reversal_key(original: Uuid) -> String {
    format!("{REVERSAL_KEY_PREFIX}{original}")
}

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::{
    AccountPatch, CreditStore, DirectoryStore, LoyaltyDraft, LoyaltyStore, MembershipChange,
    MembershipStore, NewAccount, Page, PointsPosted, RecordOutcome, Store, TransactionDraft,
    TransactionFilter, reversal_key,
};
use crate::authz::check_owner_retained;
use crate::credit::{check_balance_increase, check_writable};
use crate::db;
use crate::error::{AppError, AppResult};
use crate::loyalty::check_redemption;
use crate::model::{
    CreditAccount, CreditTransaction, LoyaltyAccount, LoyaltyEntry, LoyaltyEntryKind, Membership,
    Role, Tenant, TransactionStatus, TransactionType, User,
};

const MEMBERSHIP_COLUMNS: &str = "tenant_id, user_id, role, created_at, updated_at";
const ACCOUNT_COLUMNS: &str = "credit_id, tenant_id, customer_id, credit_limit, status, \
     payment_method_ref, created_at, updated_at";
const TRANSACTION_COLUMNS: &str = "transaction_id, credit_id, tenant_id, transaction_type, \
     amount, status, idempotency_key, description, due_date, reversal_of, created_at";
const LOYALTY_ACCOUNT_COLUMNS: &str = "loyalty_id, tenant_id, customer_id, created_at";
const LOYALTY_ENTRY_COLUMNS: &str = "entry_id, loyalty_id, tenant_id, kind, points, reason, \
     idempotency_key, created_at";

type Tx = Transaction<'static, Postgres>;

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// sqlx/Postgres adapter. Tenant-scoped work runs in a transaction that
/// first sets the row-level-security tenant context.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn scoped(&self, tenant_id: Uuid) -> AppResult<Tx> {
        let mut tx = self.pool.begin().await?;
        db::set_transaction_tenant_context(&mut tx, tenant_id).await?;
        Ok(tx)
    }

    async fn assign_membership_in(
        tx: &mut Tx,
        tenant_id: Uuid,
        user_id: Uuid,
        role: &Role,
    ) -> AppResult<Membership> {
        Ok(sqlx::query_as::<_, Membership>(&format!(
            "INSERT INTO crm.membership (tenant_id, user_id, role) VALUES ($1, $2, $3)
             ON CONFLICT (tenant_id, user_id)
             DO UPDATE SET role = EXCLUDED.role, updated_at = now()
             RETURNING {MEMBERSHIP_COLUMNS}"
        ))
        .bind(tenant_id)
        .bind(user_id)
        .bind(role.as_str())
        .fetch_one(&mut **tx)
        .await?)
    }

    async fn lock_account(tx: &mut Tx, tenant_id: Uuid, credit_id: Uuid) -> AppResult<CreditAccount> {
        sqlx::query_as::<_, CreditAccount>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM crm.credit_account
             WHERE tenant_id = $1 AND credit_id = $2 FOR UPDATE"
        ))
        .bind(tenant_id)
        .bind(credit_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::not_found("credit account not found"))
    }

    async fn balance_in(tx: &mut Tx, tenant_id: Uuid, credit_id: Uuid) -> AppResult<i64> {
        let balance: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM crm.credit_transaction
             WHERE tenant_id = $1 AND credit_id = $2 AND status = 'completed'",
        )
        .bind(tenant_id)
        .bind(credit_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(balance)
    }

    async fn transaction_by_key(
        tx: &mut Tx,
        tenant_id: Uuid,
        key: &str,
    ) -> AppResult<Option<CreditTransaction>> {
        Ok(sqlx::query_as::<_, CreditTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM crm.credit_transaction
             WHERE tenant_id = $1 AND idempotency_key = $2"
        ))
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?)
    }

    async fn transaction_in(
        tx: &mut Tx,
        tenant_id: Uuid,
        transaction_id: Uuid,
        for_update: bool,
    ) -> AppResult<CreditTransaction> {
        let lock = if for_update { " FOR UPDATE" } else { "" };
        sqlx::query_as::<_, CreditTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM crm.credit_transaction
             WHERE tenant_id = $1 AND transaction_id = $2{lock}"
        ))
        .bind(tenant_id)
        .bind(transaction_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::not_found("credit transaction not found"))
    }

    async fn loyalty_balance_in(tx: &mut Tx, tenant_id: Uuid, loyalty_id: Uuid) -> AppResult<i64> {
        let balance: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(points), 0)::BIGINT FROM crm.loyalty_entry
             WHERE tenant_id = $1 AND loyalty_id = $2",
        )
        .bind(tenant_id)
        .bind(loyalty_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(balance)
    }

    async fn loyalty_entry_by_key(
        tx: &mut Tx,
        tenant_id: Uuid,
        key: &str,
    ) -> AppResult<Option<LoyaltyEntry>> {
        Ok(sqlx::query_as::<_, LoyaltyEntry>(&format!(
            "SELECT {LOYALTY_ENTRY_COLUMNS} FROM crm.loyalty_entry
             WHERE tenant_id = $1 AND idempotency_key = $2"
        ))
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?)
    }

    async fn replay_points(tx: &mut Tx, existing: LoyaltyEntry) -> AppResult<PointsPosted> {
        let balance = Self::loyalty_balance_in(tx, existing.tenant_id, existing.loyalty_id).await?;
        Ok(PointsPosted {
            entry: existing,
            balance,
            replayed: true,
        })
    }
}

#[async_trait]
impl DirectoryStore for PgStore {
    async fn insert_tenant(&self, name: &str) -> AppResult<Tenant> {
        let tenant = sqlx::query_as::<_, Tenant>(
            "INSERT INTO crm.tenant (tenant_id, name) VALUES ($1, $2)
             RETURNING tenant_id, name, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(tenant)
    }

    async fn find_tenant_by_name(&self, name: &str) -> AppResult<Option<Tenant>> {
        Ok(sqlx::query_as::<_, Tenant>(
            "SELECT tenant_id, name, created_at FROM crm.tenant WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn insert_user(
        &self,
        email: &str,
        password_hash: &str,
        display_name: &str,
    ) -> AppResult<User> {
        let user = sqlx::query_as::<_, User>(
            "INSERT INTO crm.usr (user_id, email, password_hash, display_name)
             VALUES ($1, $2, $3, $4)
             RETURNING user_id, email, password_hash, display_name, is_active, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(password_hash)
        .bind(display_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<User>> {
        Ok(sqlx::query_as::<_, User>(
            "SELECT user_id, email, password_hash, display_name, is_active, created_at
             FROM crm.usr WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?)
    }
}

#[async_trait]
impl MembershipStore for PgStore {
    async fn find_membership(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<Membership>> {
        let mut tx = self.scoped(tenant_id).await?;
        let membership = sqlx::query_as::<_, Membership>(&format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM crm.membership WHERE tenant_id = $1 AND user_id = $2"
        ))
        .bind(tenant_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(membership)
    }

    async fn list_memberships(&self, tenant_id: Uuid) -> AppResult<Vec<Membership>> {
        let mut tx = self.scoped(tenant_id).await?;
        let members = sqlx::query_as::<_, Membership>(&format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM crm.membership WHERE tenant_id = $1
             ORDER BY created_at, user_id"
        ))
        .bind(tenant_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(members)
    }

    async fn upsert_membership(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        role: &Role,
    ) -> AppResult<Membership> {
        let mut tx = self.scoped(tenant_id).await?;
        let membership = Self::assign_membership_in(&mut tx, tenant_id, user_id, role).await?;
        tx.commit().await?;
        Ok(membership)
    }

    async fn change_membership(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        change: MembershipChange,
    ) -> AppResult<Option<Membership>> {
        let mut tx = self.scoped(tenant_id).await?;
        // Every membership row of the tenant stays locked until commit, so two
        // owners leaving at once serialize and the second sees the first gone.
        let members = sqlx::query_as::<_, Membership>(&format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM crm.membership WHERE tenant_id = $1
             ORDER BY user_id FOR UPDATE"
        ))
        .bind(tenant_id)
        .fetch_all(&mut *tx)
        .await?;
        let current = members
            .iter()
            .find(|m| m.user_id == user_id)
            .map(|m| m.role.clone());
        let other_owners = members
            .iter()
            .filter(|m| m.user_id != user_id && m.role == Role::Owner)
            .count();
        check_owner_retained(current.as_ref(), &change, other_owners)?;

        let changed = match change {
            MembershipChange::Assign(role) => {
                Some(Self::assign_membership_in(&mut tx, tenant_id, user_id, &role).await?)
            }
            MembershipChange::Remove => {
                let result = sqlx::query(
                    "DELETE FROM crm.membership WHERE tenant_id = $1 AND user_id = $2",
                )
                .bind(tenant_id)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(AppError::not_found("membership not found"));
                }
                None
            }
        };
        tx.commit().await?;
        debug!(%tenant_id, %user_id, removed = changed.is_none(), "membership changed");
        Ok(changed)
    }
}

#[async_trait]
impl CreditStore for PgStore {
    async fn find_account(
        &self,
        tenant_id: Uuid,
        credit_id: Uuid,
    ) -> AppResult<Option<CreditAccount>> {
        let mut tx = self.scoped(tenant_id).await?;
        let account = sqlx::query_as::<_, CreditAccount>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM crm.credit_account WHERE tenant_id = $1 AND credit_id = $2"
        ))
        .bind(tenant_id)
        .bind(credit_id)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(account)
    }

    async fn find_open_account(
        &self,
        tenant_id: Uuid,
        customer_id: &str,
    ) -> AppResult<Option<CreditAccount>> {
        let mut tx = self.scoped(tenant_id).await?;
        let account = sqlx::query_as::<_, CreditAccount>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM crm.credit_account
             WHERE tenant_id = $1 AND customer_id = $2 AND status <> 'closed'"
        ))
        .bind(tenant_id)
        .bind(customer_id)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(account)
    }

    async fn list_open_accounts(&self, tenant_id: Uuid) -> AppResult<Vec<CreditAccount>> {
        let mut tx = self.scoped(tenant_id).await?;
        let accounts = sqlx::query_as::<_, CreditAccount>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM crm.credit_account
             WHERE tenant_id = $1 AND status <> 'closed' ORDER BY created_at"
        ))
        .bind(tenant_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(accounts)
    }

    async fn insert_account(&self, account: NewAccount) -> AppResult<CreditAccount> {
        let mut tx = self.scoped(account.tenant_id).await?;
        let created = sqlx::query_as::<_, CreditAccount>(&format!(
            "INSERT INTO crm.credit_account
                 (credit_id, tenant_id, customer_id, credit_limit, status, payment_method_ref)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(account.tenant_id)
        .bind(&account.customer_id)
        .bind(account.credit_limit)
        .bind(account.status.as_str())
        .bind(&account.payment_method_ref)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::conflict("a credit account already exists for this customer")
            } else {
                e.into()
            }
        })?;
        tx.commit().await?;
        Ok(created)
    }

    async fn update_account(
        &self,
        tenant_id: Uuid,
        credit_id: Uuid,
        patch: AccountPatch,
    ) -> AppResult<CreditAccount> {
        let mut tx = self.scoped(tenant_id).await?;
        let current = Self::lock_account(&mut tx, tenant_id, credit_id).await?;
        check_writable(&current)?;
        let updated = sqlx::query_as::<_, CreditAccount>(&format!(
            "UPDATE crm.credit_account SET
                 credit_limit = COALESCE($3, credit_limit),
                 status = COALESCE($4, status),
                 payment_method_ref = COALESCE($5, payment_method_ref),
                 updated_at = now()
             WHERE tenant_id = $1 AND credit_id = $2
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(tenant_id)
        .bind(credit_id)
        .bind(patch.credit_limit)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.payment_method_ref)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn completed_balance(&self, tenant_id: Uuid, credit_id: Uuid) -> AppResult<i64> {
        let mut tx = self.scoped(tenant_id).await?;
        let balance = Self::balance_in(&mut tx, tenant_id, credit_id).await?;
        tx.commit().await?;
        Ok(balance)
    }

    async fn recent_transactions(
        &self,
        tenant_id: Uuid,
        credit_id: Uuid,
        limit: i64,
    ) -> AppResult<Vec<CreditTransaction>> {
        let mut tx = self.scoped(tenant_id).await?;
        let rows = sqlx::query_as::<_, CreditTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM crm.credit_transaction
             WHERE tenant_id = $1 AND credit_id = $2
             ORDER BY created_at DESC, transaction_id DESC LIMIT $3"
        ))
        .bind(tenant_id)
        .bind(credit_id)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(rows)
    }

    async fn list_transactions(
        &self,
        tenant_id: Uuid,
        filter: &TransactionFilter,
        page: Page,
    ) -> AppResult<Vec<CreditTransaction>> {
        let mut tx = self.scoped(tenant_id).await?;
        let rows = sqlx::query_as::<_, CreditTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM crm.credit_transaction
             WHERE tenant_id = $1
               AND ($2::UUID IS NULL OR credit_id = $2)
               AND ($3::TEXT IS NULL OR status = $3)
               AND ($4::TEXT IS NULL OR transaction_type = $4)
             ORDER BY created_at DESC, transaction_id DESC
             LIMIT $5 OFFSET $6"
        ))
        .bind(tenant_id)
        .bind(filter.credit_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.transaction_type.map(|t| t.as_str()))
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(rows)
    }

    async fn find_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> AppResult<Option<CreditTransaction>> {
        let mut tx = self.scoped(tenant_id).await?;
        let found = match Self::transaction_in(&mut tx, tenant_id, transaction_id, false).await {
            Ok(t) => Some(t),
            Err(AppError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        tx.commit().await?;
        Ok(found)
    }

    async fn append_transaction(&self, draft: TransactionDraft) -> AppResult<RecordOutcome> {
        let tenant_id = draft.tenant_id;
        let mut tx = self.scoped(tenant_id).await?;
        if let Some(existing) = Self::transaction_by_key(&mut tx, tenant_id, &draft.idempotency_key).await? {
            return Ok(RecordOutcome::Replayed(existing));
        }

        let account = Self::lock_account(&mut tx, tenant_id, draft.credit_id).await?;
        // a concurrent writer on this account may have committed the key while we waited
        if let Some(existing) = Self::transaction_by_key(&mut tx, tenant_id, &draft.idempotency_key).await? {
            return Ok(RecordOutcome::Replayed(existing));
        }
        check_writable(&account)?;
        if draft.status == TransactionStatus::Completed {
            let balance = Self::balance_in(&mut tx, tenant_id, draft.credit_id).await?;
            check_balance_increase(&account, balance, draft.amount)?;
        }

        let inserted = sqlx::query_as::<_, CreditTransaction>(&format!(
            "INSERT INTO crm.credit_transaction
                 (transaction_id, credit_id, tenant_id, transaction_type, amount, status,
                  idempotency_key, description, due_date)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(draft.credit_id)
        .bind(tenant_id)
        .bind(draft.transaction_type.as_str())
        .bind(draft.amount)
        .bind(draft.status.as_str())
        .bind(&draft.idempotency_key)
        .bind(&draft.description)
        .bind(draft.due_date)
        .fetch_one(&mut *tx)
        .await;

        match inserted {
            Ok(created) => {
                tx.commit().await?;
                Ok(RecordOutcome::Created(created))
            }
            Err(e) if is_unique_violation(&e) => {
                // same key committed against another account
                tx.rollback().await?;
                debug!(%tenant_id, key = %draft.idempotency_key, "idempotency key raced, replaying");
                let mut tx = self.scoped(tenant_id).await?;
                let existing = Self::transaction_by_key(&mut tx, tenant_id, &draft.idempotency_key)
                    .await?
                    .ok_or_else(|| AppError::conflict("idempotency key already used"))?;
                tx.commit().await?;
                Ok(RecordOutcome::Replayed(existing))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn settle_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
        outcome: TransactionStatus,
    ) -> AppResult<CreditTransaction> {
        let mut tx = self.scoped(tenant_id).await?;
        let found = Self::transaction_in(&mut tx, tenant_id, transaction_id, false).await?;
        let account = Self::lock_account(&mut tx, tenant_id, found.credit_id).await?;
        let pending = Self::transaction_in(&mut tx, tenant_id, transaction_id, true).await?;
        if pending.status != TransactionStatus::Pending {
            return Err(AppError::conflict(format!(
                "transaction is {}, only pending transactions settle",
                pending.status
            )));
        }
        if outcome == TransactionStatus::Completed {
            let balance = Self::balance_in(&mut tx, tenant_id, pending.credit_id).await?;
            check_balance_increase(&account, balance, pending.amount)?;
        }
        let settled = sqlx::query_as::<_, CreditTransaction>(&format!(
            "UPDATE crm.credit_transaction SET status = $3
             WHERE tenant_id = $1 AND transaction_id = $2
             RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(tenant_id)
        .bind(transaction_id)
        .bind(outcome.as_str())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(settled)
    }

    async fn reverse_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
        description: Option<String>,
    ) -> AppResult<CreditTransaction> {
        let mut tx = self.scoped(tenant_id).await?;
        let found = Self::transaction_in(&mut tx, tenant_id, transaction_id, false).await?;
        Self::lock_account(&mut tx, tenant_id, found.credit_id).await?;
        let original = Self::transaction_in(&mut tx, tenant_id, transaction_id, true).await?;
        if original.reversal_of.is_some() {
            return Err(AppError::conflict("reversal entries cannot be reversed"));
        }
        if original.status != TransactionStatus::Completed {
            return Err(AppError::conflict(format!(
                "transaction is {}, only completed transactions can be reversed",
                original.status
            )));
        }
        let amount = original
            .amount
            .checked_neg()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("reversal amount overflowed")))?;

        sqlx::query(
            "UPDATE crm.credit_transaction SET status = 'reversed'
             WHERE tenant_id = $1 AND transaction_id = $2",
        )
        .bind(tenant_id)
        .bind(transaction_id)
        .execute(&mut *tx)
        .await?;

        let compensating = sqlx::query_as::<_, CreditTransaction>(&format!(
            "INSERT INTO crm.credit_transaction
                 (transaction_id, credit_id, tenant_id, transaction_type, amount, status,
                  idempotency_key, description, reversal_of)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(original.credit_id)
        .bind(tenant_id)
        .bind(TransactionType::Adjustment.as_str())
        .bind(amount)
        .bind(TransactionStatus::Reversed.as_str())
        .bind(reversal_key(original.transaction_id))
        .bind(description)
        .bind(original.transaction_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(compensating)
    }
}

#[async_trait]
impl LoyaltyStore for PgStore {
    async fn find_loyalty_account(
        &self,
        tenant_id: Uuid,
        customer_id: &str,
    ) -> AppResult<Option<LoyaltyAccount>> {
        let mut tx = self.scoped(tenant_id).await?;
        let account = sqlx::query_as::<_, LoyaltyAccount>(&format!(
            "SELECT {LOYALTY_ACCOUNT_COLUMNS} FROM crm.loyalty_account
             WHERE tenant_id = $1 AND customer_id = $2"
        ))
        .bind(tenant_id)
        .bind(customer_id)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(account)
    }

    async fn loyalty_balance(&self, tenant_id: Uuid, loyalty_id: Uuid) -> AppResult<i64> {
        let mut tx = self.scoped(tenant_id).await?;
        let balance = Self::loyalty_balance_in(&mut tx, tenant_id, loyalty_id).await?;
        tx.commit().await?;
        Ok(balance)
    }

    async fn recent_loyalty_entries(
        &self,
        tenant_id: Uuid,
        loyalty_id: Uuid,
        limit: i64,
    ) -> AppResult<Vec<LoyaltyEntry>> {
        let mut tx = self.scoped(tenant_id).await?;
        let rows = sqlx::query_as::<_, LoyaltyEntry>(&format!(
            "SELECT {LOYALTY_ENTRY_COLUMNS} FROM crm.loyalty_entry
             WHERE tenant_id = $1 AND loyalty_id = $2
             ORDER BY created_at DESC, entry_id DESC LIMIT $3"
        ))
        .bind(tenant_id)
        .bind(loyalty_id)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(rows)
    }

    async fn post_points(&self, draft: LoyaltyDraft) -> AppResult<PointsPosted> {
        let tenant_id = draft.tenant_id;
        let mut tx = self.scoped(tenant_id).await?;
        if let Some(existing) = Self::loyalty_entry_by_key(&mut tx, tenant_id, &draft.idempotency_key).await? {
            return Self::replay_points(&mut tx, existing).await;
        }

        if draft.kind == LoyaltyEntryKind::Accrual {
            sqlx::query(
                "INSERT INTO crm.loyalty_account (loyalty_id, tenant_id, customer_id)
                 VALUES ($1, $2, $3) ON CONFLICT (tenant_id, customer_id) DO NOTHING",
            )
            .bind(Uuid::new_v4())
            .bind(tenant_id)
            .bind(&draft.customer_id)
            .execute(&mut *tx)
            .await?;
        }
        let account = sqlx::query_as::<_, LoyaltyAccount>(&format!(
            "SELECT {LOYALTY_ACCOUNT_COLUMNS} FROM crm.loyalty_account
             WHERE tenant_id = $1 AND customer_id = $2 FOR UPDATE"
        ))
        .bind(tenant_id)
        .bind(&draft.customer_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::not_found("loyalty account not found"))?;
        if let Some(existing) = Self::loyalty_entry_by_key(&mut tx, tenant_id, &draft.idempotency_key).await? {
            return Self::replay_points(&mut tx, existing).await;
        }

        let balance = Self::loyalty_balance_in(&mut tx, tenant_id, account.loyalty_id).await?;
        let new_balance = match draft.kind {
            LoyaltyEntryKind::Redemption => check_redemption(balance, -draft.points)?,
            LoyaltyEntryKind::Accrual => balance
                .checked_add(draft.points)
                .ok_or_else(|| AppError::invalid("points", "points value is too large"))?,
        };

        let entry = sqlx::query_as::<_, LoyaltyEntry>(&format!(
            "INSERT INTO crm.loyalty_entry
                 (entry_id, loyalty_id, tenant_id, kind, points, reason, idempotency_key)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {LOYALTY_ENTRY_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(account.loyalty_id)
        .bind(tenant_id)
        .bind(draft.kind.as_str())
        .bind(draft.points)
        .bind(&draft.reason)
        .bind(&draft.idempotency_key)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(PointsPosted {
            entry,
            balance: new_balance,
            replayed: false,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AccountPatch, CreditStore, DirectoryStore, LoyaltyDraft, LoyaltyStore, MembershipChange,
    MembershipStore, NewAccount, Page, PointsPosted, RecordOutcome, Store, TransactionDraft,
    TransactionFilter, reversal_key,
};
use crate::authz::check_owner_retained;
use crate::credit::{check_balance_increase, check_writable, sum_completed};
use crate::error::{AppError, AppResult};
use crate::loyalty::check_redemption;
use crate::model::{
    CreditAccount, CreditStatus, CreditTransaction, LoyaltyAccount, LoyaltyEntry,
    LoyaltyEntryKind, Membership, Role, Tenant, TransactionStatus, TransactionType, User,
};

#[derive(Default)]
struct State {
    tenants: Vec<Tenant>,
    users: Vec<User>,
    memberships: HashMap<(Uuid, Uuid), Membership>,
    accounts: HashMap<Uuid, CreditAccount>,
    // insertion order is creation order
    transactions: Vec<CreditTransaction>,
    loyalty_accounts: Vec<LoyaltyAccount>,
    loyalty_entries: Vec<LoyaltyEntry>,
}

impl State {
    fn account(&self, tenant_id: Uuid, credit_id: Uuid) -> AppResult<&CreditAccount> {
        self.accounts
            .get(&credit_id)
            .filter(|a| a.tenant_id == tenant_id)
            .ok_or_else(|| AppError::not_found("credit account not found"))
    }

    fn balance(&self, tenant_id: Uuid, credit_id: Uuid) -> AppResult<i64> {
        sum_completed(
            self.transactions
                .iter()
                .filter(|t| t.tenant_id == tenant_id && t.credit_id == credit_id),
        )
    }

    fn transaction_by_key(&self, tenant_id: Uuid, key: &str) -> Option<&CreditTransaction> {
        self.transactions
            .iter()
            .find(|t| t.tenant_id == tenant_id && t.idempotency_key == key)
    }

    fn transaction_index(&self, tenant_id: Uuid, transaction_id: Uuid) -> AppResult<usize> {
        self.transactions
            .iter()
            .position(|t| t.tenant_id == tenant_id && t.transaction_id == transaction_id)
            .ok_or_else(|| AppError::not_found("credit transaction not found"))
    }

    fn assign_membership(&mut self, tenant_id: Uuid, user_id: Uuid, role: &Role) -> Membership {
        let now = OffsetDateTime::now_utc();
        self.memberships
            .entry((tenant_id, user_id))
            .and_modify(|m| {
                m.role = role.clone();
                m.updated_at = now;
            })
            .or_insert_with(|| Membership {
                tenant_id,
                user_id,
                role: role.clone(),
                created_at: now,
                updated_at: now,
            })
            .clone()
    }

    fn loyalty_account(&self, tenant_id: Uuid, customer_id: &str) -> Option<&LoyaltyAccount> {
        self.loyalty_accounts
            .iter()
            .find(|a| a.tenant_id == tenant_id && a.customer_id == customer_id)
    }

    fn loyalty_balance(&self, tenant_id: Uuid, loyalty_id: Uuid) -> AppResult<i64> {
        self.loyalty_entries
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.loyalty_id == loyalty_id)
            .try_fold(0i64, |acc, e| acc.checked_add(e.points))
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("loyalty balance overflowed i64")))
    }
}

/// Process-local store behind a single async mutex. Used by tests and
/// database-less demos; holding the one lock serializes every account.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of credit transactions across all tenants.
    pub async fn transaction_count(&self) -> usize {
        self.state.lock().await.transactions.len()
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn insert_tenant(&self, name: &str) -> AppResult<Tenant> {
        let mut state = self.state.lock().await;
        if state.tenants.iter().any(|t| t.name == name) {
            return Err(AppError::conflict("tenant already exists"));
        }
        let tenant = Tenant {
            tenant_id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };
        state.tenants.push(tenant.clone());
        Ok(tenant)
    }

    async fn find_tenant_by_name(&self, name: &str) -> AppResult<Option<Tenant>> {
        let state = self.state.lock().await;
        Ok(state.tenants.iter().find(|t| t.name == name).cloned())
    }

    async fn insert_user(
        &self,
        email: &str,
        password_hash: &str,
        display_name: &str,
    ) -> AppResult<User> {
        let mut state = self.state.lock().await;
        if state.users.iter().any(|u| u.email == email) {
            return Err(AppError::conflict("user already exists"));
        }
        let user = User {
            user_id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            display_name: display_name.to_string(),
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
        };
        state.users.push(user.clone());
        Ok(user)
    }

    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<User>> {
        let state = self.state.lock().await;
        Ok(state.users.iter().find(|u| u.email == email).cloned())
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn find_membership(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<Membership>> {
        let state = self.state.lock().await;
        Ok(state.memberships.get(&(tenant_id, user_id)).cloned())
    }

    async fn list_memberships(&self, tenant_id: Uuid) -> AppResult<Vec<Membership>> {
        let state = self.state.lock().await;
        let mut members: Vec<_> = state
            .memberships
            .values()
            .filter(|m| m.tenant_id == tenant_id)
            .cloned()
            .collect();
        members.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.user_id.cmp(&b.user_id)));
        Ok(members)
    }

    async fn upsert_membership(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        role: &Role,
    ) -> AppResult<Membership> {
        let mut state = self.state.lock().await;
        Ok(state.assign_membership(tenant_id, user_id, role))
    }

    async fn change_membership(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        change: MembershipChange,
    ) -> AppResult<Option<Membership>> {
        let mut state = self.state.lock().await;
        let current = state
            .memberships
            .get(&(tenant_id, user_id))
            .map(|m| m.role.clone());
        let other_owners = state
            .memberships
            .values()
            .filter(|m| m.tenant_id == tenant_id && m.user_id != user_id && m.role == Role::Owner)
            .count();
        check_owner_retained(current.as_ref(), &change, other_owners)?;
        match change {
            MembershipChange::Assign(role) => {
                Ok(Some(state.assign_membership(tenant_id, user_id, &role)))
            }
            MembershipChange::Remove => state
                .memberships
                .remove(&(tenant_id, user_id))
                .map(|_| None)
                .ok_or_else(|| AppError::not_found("membership not found")),
        }
    }
}

#[async_trait]
impl CreditStore for MemoryStore {
    async fn find_account(
        &self,
        tenant_id: Uuid,
        credit_id: Uuid,
    ) -> AppResult<Option<CreditAccount>> {
        let state = self.state.lock().await;
        Ok(state.account(tenant_id, credit_id).ok().cloned())
    }

    async fn find_open_account(
        &self,
        tenant_id: Uuid,
        customer_id: &str,
    ) -> AppResult<Option<CreditAccount>> {
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .values()
            .find(|a| {
                a.tenant_id == tenant_id
                    && a.customer_id == customer_id
                    && a.status != CreditStatus::Closed
            })
            .cloned())
    }

    async fn list_open_accounts(&self, tenant_id: Uuid) -> AppResult<Vec<CreditAccount>> {
        let state = self.state.lock().await;
        let mut open: Vec<_> = state
            .accounts
            .values()
            .filter(|a| a.tenant_id == tenant_id && a.status != CreditStatus::Closed)
            .cloned()
            .collect();
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(open)
    }

    async fn insert_account(&self, account: NewAccount) -> AppResult<CreditAccount> {
        let mut state = self.state.lock().await;
        let duplicate = state.accounts.values().any(|a| {
            a.tenant_id == account.tenant_id
                && a.customer_id == account.customer_id
                && a.status != CreditStatus::Closed
        });
        if duplicate {
            return Err(AppError::conflict(
                "a credit account already exists for this customer",
            ));
        }
        let now = OffsetDateTime::now_utc();
        let created = CreditAccount {
            credit_id: Uuid::new_v4(),
            tenant_id: account.tenant_id,
            customer_id: account.customer_id,
            credit_limit: account.credit_limit,
            status: account.status,
            payment_method_ref: account.payment_method_ref,
            created_at: now,
            updated_at: now,
        };
        state.accounts.insert(created.credit_id, created.clone());
        Ok(created)
    }

    async fn update_account(
        &self,
        tenant_id: Uuid,
        credit_id: Uuid,
        patch: AccountPatch,
    ) -> AppResult<CreditAccount> {
        let mut state = self.state.lock().await;
        check_writable(state.account(tenant_id, credit_id)?)?;
        let account = state
            .accounts
            .get_mut(&credit_id)
            .ok_or_else(|| AppError::not_found("credit account not found"))?;
        if let Some(limit) = patch.credit_limit {
            account.credit_limit = limit;
        }
        if let Some(status) = patch.status {
            account.status = status;
        }
        if let Some(reference) = patch.payment_method_ref {
            account.payment_method_ref = Some(reference);
        }
        account.updated_at = OffsetDateTime::now_utc();
        Ok(account.clone())
    }

    async fn completed_balance(&self, tenant_id: Uuid, credit_id: Uuid) -> AppResult<i64> {
        let state = self.state.lock().await;
        state.balance(tenant_id, credit_id)
    }

    async fn recent_transactions(
        &self,
        tenant_id: Uuid,
        credit_id: Uuid,
        limit: i64,
    ) -> AppResult<Vec<CreditTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|t| t.tenant_id == tenant_id && t.credit_id == credit_id)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn list_transactions(
        &self,
        tenant_id: Uuid,
        filter: &TransactionFilter,
        page: Page,
    ) -> AppResult<Vec<CreditTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|t| t.tenant_id == tenant_id && filter.matches(t))
            .skip(usize::try_from(page.offset).unwrap_or(0))
            .take(usize::try_from(page.limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn find_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> AppResult<Option<CreditTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transaction_index(tenant_id, transaction_id)
            .ok()
            .map(|i| state.transactions[i].clone()))
    }

    async fn append_transaction(&self, draft: TransactionDraft) -> AppResult<RecordOutcome> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.transaction_by_key(draft.tenant_id, &draft.idempotency_key) {
            return Ok(RecordOutcome::Replayed(existing.clone()));
        }
        let account = state.account(draft.tenant_id, draft.credit_id)?;
        check_writable(account)?;
        if draft.status == TransactionStatus::Completed {
            let balance = state.balance(draft.tenant_id, draft.credit_id)?;
            check_balance_increase(account, balance, draft.amount)?;
        }
        let created = CreditTransaction {
            transaction_id: Uuid::new_v4(),
            credit_id: draft.credit_id,
            tenant_id: draft.tenant_id,
            transaction_type: draft.transaction_type,
            amount: draft.amount,
            status: draft.status,
            idempotency_key: draft.idempotency_key,
            description: draft.description,
            due_date: draft.due_date,
            reversal_of: None,
            created_at: OffsetDateTime::now_utc(),
        };
        state.transactions.push(created.clone());
        Ok(RecordOutcome::Created(created))
    }

    async fn settle_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
        outcome: TransactionStatus,
    ) -> AppResult<CreditTransaction> {
        let mut state = self.state.lock().await;
        let idx = state.transaction_index(tenant_id, transaction_id)?;
        let pending = &state.transactions[idx];
        if pending.status != TransactionStatus::Pending {
            return Err(AppError::conflict(format!(
                "transaction is {}, only pending transactions settle",
                pending.status
            )));
        }
        if outcome == TransactionStatus::Completed {
            let account = state.account(tenant_id, pending.credit_id)?;
            let balance = state.balance(tenant_id, pending.credit_id)?;
            check_balance_increase(account, balance, pending.amount)?;
        }
        let settled = &mut state.transactions[idx];
        settled.status = outcome;
        Ok(settled.clone())
    }

    async fn reverse_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
        description: Option<String>,
    ) -> AppResult<CreditTransaction> {
        let mut state = self.state.lock().await;
        let idx = state.transaction_index(tenant_id, transaction_id)?;
        let original = state.transactions[idx].clone();
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

        let key = reversal_key(original.transaction_id);
        if state.transaction_by_key(tenant_id, &key).is_some() {
            return Err(AppError::conflict("idempotency key already used"));
        }

        state.transactions[idx].status = TransactionStatus::Reversed;
        let compensating = CreditTransaction {
            transaction_id: Uuid::new_v4(),
            credit_id: original.credit_id,
            tenant_id,
            transaction_type: TransactionType::Adjustment,
            amount,
            status: TransactionStatus::Reversed,
            idempotency_key: key,
            description,
            due_date: None,
            reversal_of: Some(original.transaction_id),
            created_at: OffsetDateTime::now_utc(),
        };
        state.transactions.push(compensating.clone());
        Ok(compensating)
    }
}

#[async_trait]
impl LoyaltyStore for MemoryStore {
    async fn find_loyalty_account(
        &self,
        tenant_id: Uuid,
        customer_id: &str,
    ) -> AppResult<Option<LoyaltyAccount>> {
        let state = self.state.lock().await;
        Ok(state.loyalty_account(tenant_id, customer_id).cloned())
    }

    async fn loyalty_balance(&self, tenant_id: Uuid, loyalty_id: Uuid) -> AppResult<i64> {
        let state = self.state.lock().await;
        state.loyalty_balance(tenant_id, loyalty_id)
    }

    async fn recent_loyalty_entries(
        &self,
        tenant_id: Uuid,
        loyalty_id: Uuid,
        limit: i64,
    ) -> AppResult<Vec<LoyaltyEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .loyalty_entries
            .iter()
            .rev()
            .filter(|e| e.tenant_id == tenant_id && e.loyalty_id == loyalty_id)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn post_points(&self, draft: LoyaltyDraft) -> AppResult<PointsPosted> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .loyalty_entries
            .iter()
            .find(|e| e.tenant_id == draft.tenant_id && e.idempotency_key == draft.idempotency_key)
            .cloned()
        {
            let balance = state.loyalty_balance(draft.tenant_id, existing.loyalty_id)?;
            return Ok(PointsPosted {
                entry: existing,
                balance,
                replayed: true,
            });
        }

        let existing_id = state
            .loyalty_account(draft.tenant_id, &draft.customer_id)
            .map(|a| a.loyalty_id);
        let loyalty_id = match (existing_id, draft.kind) {
            (Some(id), _) => id,
            (None, LoyaltyEntryKind::Redemption) => {
                return Err(AppError::not_found("loyalty account not found"));
            }
            (None, LoyaltyEntryKind::Accrual) => {
                let account = LoyaltyAccount {
                    loyalty_id: Uuid::new_v4(),
                    tenant_id: draft.tenant_id,
                    customer_id: draft.customer_id.clone(),
                    created_at: OffsetDateTime::now_utc(),
                };
                let id = account.loyalty_id;
                state.loyalty_accounts.push(account);
                id
            }
        };

        let balance = state.loyalty_balance(draft.tenant_id, loyalty_id)?;
        let new_balance = match draft.kind {
            LoyaltyEntryKind::Redemption => check_redemption(balance, -draft.points)?,
            LoyaltyEntryKind::Accrual => balance
                .checked_add(draft.points)
                .ok_or_else(|| AppError::invalid("points", "points value is too large"))?,
        };
        let entry = LoyaltyEntry {
            entry_id: Uuid::new_v4(),
            loyalty_id,
            tenant_id: draft.tenant_id,
            kind: draft.kind,
            points: draft.points,
            reason: draft.reason,
            idempotency_key: draft.idempotency_key,
            created_at: OffsetDateTime::now_utc(),
        };
        state.loyalty_entries.push(entry.clone());
        Ok(PointsPosted {
            entry,
            balance: new_balance,
            replayed: false,
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}

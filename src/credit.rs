//! Credit ledger.
//!
//! An account's balance is never stored. It is the sum of the amounts of its
//! `completed` transactions, and every balance change is an appended row.

use std::sync::Arc;

use anyhow::anyhow;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::LedgerSettings;
use crate::error::{AppError, AppResult, FieldError};
use crate::model::{
    CreditAccount, CreditStatus, CreditTransaction, TransactionStatus, TransactionType,
};
use crate::store::{
    AccountPatch, NewAccount, Page, REVERSAL_KEY_PREFIX, RecordOutcome, Store, TransactionDraft,
    TransactionFilter,
};

const MAX_KEY_LEN: usize = 255;
const MAX_DESCRIPTION_LEN: usize = 1_000;

/// Checked sum of completed amounts.
pub fn sum_completed<'a, I>(transactions: I) -> AppResult<i64>
where
    I: IntoIterator<Item = &'a CreditTransaction>,
{
    transactions
        .into_iter()
        .filter(|t| t.status == TransactionStatus::Completed)
        .try_fold(0i64, |acc, t| acc.checked_add(t.amount))
        .ok_or_else(|| AppError::Internal(anyhow!("credit balance overflowed i64")))
}

/// Rejects any write to a closed account.
pub fn check_writable(account: &CreditAccount) -> AppResult<()> {
    if account.status == CreditStatus::Closed {
        return Err(AppError::conflict("credit account is closed"));
    }
    Ok(())
}

/// Over-limit policy applied when a completed amount lands on the balance.
///
/// Amounts that lower the balance are always accepted. Amounts that raise it
/// need an active account and must leave `credit_limit - balance >= 0`.
pub fn check_balance_increase(account: &CreditAccount, balance: i64, amount: i64) -> AppResult<()> {
    check_writable(account)?;
    if amount <= 0 {
        return Ok(());
    }
    if account.status != CreditStatus::Active {
        return Err(AppError::conflict(format!(
            "credit account is {}",
            account.status
        )));
    }
    let new_balance = balance
        .checked_add(amount)
        .ok_or_else(|| AppError::invalid("amount", "amount is too large"))?;
    if account.credit_limit < new_balance {
        return Err(AppError::invalid("amount", "credit limit exceeded"));
    }
    Ok(())
}

/// Fallback idempotency key: `{tenant}:{unix nanos}:{random}`.
pub fn synthesize_key(tenant_id: Uuid) -> String {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    format!("{tenant_id}:{nanos}:{:016x}", rand::random::<u64>())
}

/// Validates a caller-supplied idempotency key, or synthesizes one.
pub(crate) fn idempotency_key(tenant_id: Uuid, supplied: Option<String>) -> AppResult<String> {
    match supplied.map(|k| k.trim().to_string()) {
        Some(k) if k.is_empty() => Err(AppError::invalid("idempotencyKey", "must not be empty")),
        Some(k) if k.len() > MAX_KEY_LEN => Err(AppError::invalid(
            "idempotencyKey",
            format!("must be at most {MAX_KEY_LEN} characters"),
        )),
        Some(k) if k.starts_with(REVERSAL_KEY_PREFIX) => Err(AppError::invalid(
            "idempotencyKey",
            format!("the {REVERSAL_KEY_PREFIX} prefix is reserved"),
        )),
        Some(k) => Ok(k),
        None => Ok(synthesize_key(tenant_id)),
    }
}

/// Which account a summary or update addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountSelector {
    Credit(Uuid),
    Customer(String),
    /// The tenant's only open account.
    Sole,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub credit_id: Uuid,
    pub customer_id: String,
    pub credit_limit: i64,
    pub current_balance: i64,
    pub available_credit: i64,
    pub status: CreditStatus,
    pub recent_transactions: Vec<CreditTransaction>,
}

#[derive(Debug, Clone, Default)]
pub struct AccountChanges {
    pub customer_id: Option<String>,
    pub credit_limit: Option<i64>,
    pub status: Option<CreditStatus>,
    pub payment_method_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub credit_id: Uuid,
    pub transaction_type: TransactionType,
    /// Magnitude for charges, fees and payments; signed for adjustments.
    pub amount: i64,
    pub description: Option<String>,
    pub due_date: Option<OffsetDateTime>,
    pub idempotency_key: Option<String>,
    pub status: Option<TransactionStatus>,
}

pub struct CreditLedger {
    store: Arc<dyn Store>,
    settings: LedgerSettings,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn Store>, settings: LedgerSettings) -> Self {
        Self { store, settings }
    }

    async fn resolve_account(
        &self,
        tenant_id: Uuid,
        selector: &AccountSelector,
    ) -> AppResult<Option<CreditAccount>> {
        match selector {
            AccountSelector::Credit(id) => self.store.find_account(tenant_id, *id).await,
            AccountSelector::Customer(customer) => {
                self.store.find_open_account(tenant_id, customer).await
            }
            AccountSelector::Sole => {
                let mut open = self.store.list_open_accounts(tenant_id).await?;
                match open.len() {
                    0 => Ok(None),
                    1 => Ok(open.pop()),
                    _ => Err(AppError::invalid(
                        "customerId",
                        "tenant has several credit accounts; customerId or creditId is required",
                    )),
                }
            }
        }
    }

    pub async fn get_account_summary(
        &self,
        tenant_id: Uuid,
        selector: &AccountSelector,
    ) -> AppResult<AccountSummary> {
        let account = self
            .resolve_account(tenant_id, selector)
            .await?
            .ok_or_else(|| AppError::not_found("credit account not found"))?;

        let current_balance = self
            .store
            .completed_balance(tenant_id, account.credit_id)
            .await?;
        let available_credit = account
            .credit_limit
            .checked_sub(current_balance)
            .ok_or_else(|| AppError::Internal(anyhow!("available credit overflowed i64")))?;
        let recent_transactions = self
            .store
            .recent_transactions(
                tenant_id,
                account.credit_id,
                i64::from(self.settings.recent_transactions),
            )
            .await?;

        Ok(AccountSummary {
            credit_id: account.credit_id,
            customer_id: account.customer_id,
            credit_limit: account.credit_limit,
            current_balance,
            available_credit,
            status: account.status,
            recent_transactions,
        })
    }

    pub async fn create_or_update_account(
        &self,
        tenant_id: Uuid,
        changes: AccountChanges,
    ) -> AppResult<CreditAccount> {
        let mut problems = Vec::new();
        let customer_id = match changes.customer_id.as_deref().map(str::trim) {
            Some("") => {
                problems.push(FieldError::new("customerId", "must not be empty"));
                None
            }
            other => other.map(str::to_string),
        };
        if changes.credit_limit.is_some_and(|l| l < 0) {
            problems.push(FieldError::new("creditLimit", "must be non-negative"));
        }
        if !problems.is_empty() {
            return Err(AppError::invalid_fields(problems));
        }

        let selector = match &customer_id {
            Some(c) => AccountSelector::Customer(c.clone()),
            None => AccountSelector::Sole,
        };

        match self.resolve_account(tenant_id, &selector).await? {
            Some(existing) => {
                let patch = AccountPatch {
                    credit_limit: changes.credit_limit,
                    status: changes.status,
                    payment_method_ref: changes.payment_method_ref,
                };
                if patch.is_empty() {
                    return Ok(existing);
                }
                let updated = self
                    .store
                    .update_account(tenant_id, existing.credit_id, patch)
                    .await?;
                info!(%tenant_id, credit_id = %updated.credit_id, status = %updated.status, credit_limit = updated.credit_limit, "credit account updated");
                Ok(updated)
            }
            None => {
                let customer_id = customer_id.ok_or_else(|| {
                    AppError::invalid("customerId", "customerId is required to create a credit account")
                })?;
                let status = changes.status.unwrap_or(CreditStatus::Active);
                if status == CreditStatus::Closed {
                    return Err(AppError::invalid("status", "cannot open a closed account"));
                }
                let created = self
                    .store
                    .insert_account(NewAccount {
                        tenant_id,
                        customer_id,
                        credit_limit: changes.credit_limit.unwrap_or(0),
                        status,
                        payment_method_ref: changes.payment_method_ref,
                    })
                    .await?;
                info!(%tenant_id, credit_id = %created.credit_id, customer_id = %created.customer_id, "credit account created");
                Ok(created)
            }
        }
    }

    pub async fn record_transaction(
        &self,
        tenant_id: Uuid,
        input: NewTransaction,
    ) -> AppResult<RecordOutcome> {
        let mut problems = Vec::new();
        let amount = input.transaction_type.signed_amount(input.amount);
        if amount.is_none() {
            let msg = match input.transaction_type {
                TransactionType::Adjustment => "must be non-zero",
                _ => "must be a positive amount in minor units",
            };
            problems.push(FieldError::new("amount", msg));
        }
        let status = input.status.unwrap_or(TransactionStatus::Completed);
        if !matches!(status, TransactionStatus::Pending | TransactionStatus::Completed) {
            problems.push(FieldError::new("status", "must be pending or completed"));
        }
        if input
            .description
            .as_ref()
            .is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN)
        {
            problems.push(FieldError::new(
                "description",
                format!("must be at most {MAX_DESCRIPTION_LEN} characters"),
            ));
        }
        let key = match idempotency_key(tenant_id, input.idempotency_key) {
            Ok(k) => Some(k),
            Err(AppError::InvalidInput { details, .. }) => {
                problems.extend(details);
                None
            }
            Err(e) => return Err(e),
        };
        let (Some(amount), Some(key), true) = (amount, key, problems.is_empty()) else {
            return Err(AppError::invalid_fields(problems));
        };

        let outcome = self
            .store
            .append_transaction(TransactionDraft {
                tenant_id,
                credit_id: input.credit_id,
                transaction_type: input.transaction_type,
                amount,
                status,
                idempotency_key: key,
                description: input.description,
                due_date: input.due_date,
            })
            .await;

        match &outcome {
            Ok(RecordOutcome::Created(t)) => {
                info!(%tenant_id, credit_id = %t.credit_id, transaction_id = %t.transaction_id, kind = %t.transaction_type, amount = t.amount, "credit transaction recorded")
            }
            Ok(RecordOutcome::Replayed(t)) => {
                info!(%tenant_id, transaction_id = %t.transaction_id, "idempotent replay of credit transaction")
            }
            Err(AppError::InvalidInput { message, .. }) => {
                warn!(%tenant_id, credit_id = %input.credit_id, %message, "credit transaction rejected")
            }
            Err(_) => {}
        }
        outcome
    }

    /// Clamp `limit` into `[1, max_page_size]`; a missing limit uses the
    /// default page size.
    pub fn page(&self, limit: Option<i64>, offset: Option<i64>) -> AppResult<Page> {
        let max = i64::from(self.settings.max_page_size.max(1));
        let limit = limit
            .unwrap_or(i64::from(self.settings.default_page_size))
            .clamp(1, max);
        let offset = offset.unwrap_or(0);
        if offset < 0 {
            return Err(AppError::invalid("offset", "must be non-negative"));
        }
        Ok(Page { limit, offset })
    }

    pub async fn list_transactions(
        &self,
        tenant_id: Uuid,
        filter: &TransactionFilter,
        page: Page,
    ) -> AppResult<Vec<CreditTransaction>> {
        if let Some(credit_id) = filter.credit_id {
            self.store
                .find_account(tenant_id, credit_id)
                .await?
                .ok_or_else(|| AppError::not_found("credit account not found"))?;
        }
        self.store.list_transactions(tenant_id, filter, page).await
    }

    pub async fn settle_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
        outcome: TransactionStatus,
    ) -> AppResult<CreditTransaction> {
        if !matches!(outcome, TransactionStatus::Completed | TransactionStatus::Failed) {
            return Err(AppError::invalid("outcome", "must be completed or failed"));
        }
        let settled = self
            .store
            .settle_transaction(tenant_id, transaction_id, outcome)
            .await?;
        info!(%tenant_id, %transaction_id, status = %settled.status, "credit transaction settled");
        Ok(settled)
    }

    pub async fn reverse_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
        reason: Option<String>,
    ) -> AppResult<CreditTransaction> {
        if reason.as_ref().is_some_and(|r| r.len() > MAX_DESCRIPTION_LEN) {
            return Err(AppError::invalid(
                "reason",
                format!("must be at most {MAX_DESCRIPTION_LEN} characters"),
            ));
        }
        let compensating = self
            .store
            .reverse_transaction(tenant_id, transaction_id, reason)
            .await?;
        info!(%tenant_id, %transaction_id, reversal_id = %compensating.transaction_id, amount = compensating.amount, "credit transaction reversed");
        Ok(compensating)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CreditStore, MemoryStore, reversal_key};

    fn ledger() -> (CreditLedger, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            CreditLedger::new(store.clone(), LedgerSettings::default()),
            store,
        )
    }

    async fn open(ledger: &CreditLedger, tenant: Uuid, limit: i64) -> CreditAccount {
        ledger
            .create_or_update_account(
                tenant,
                AccountChanges {
                    customer_id: Some("cus_123".into()),
                    credit_limit: Some(limit),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }

    fn tx(credit_id: Uuid, kind: TransactionType, amount: i64) -> NewTransaction {
        NewTransaction {
            credit_id,
            transaction_type: kind,
            amount,
            description: None,
            due_date: None,
            idempotency_key: None,
            status: None,
        }
    }

    #[tokio::test]
    async fn balance_is_sum_of_completed_transactions() {
        let (ledger, _) = ledger();
        let tenant = Uuid::new_v4();
        let account = open(&ledger, tenant, 10_000).await;

        ledger
            .record_transaction(tenant, tx(account.credit_id, TransactionType::Charge, 4_000))
            .await
            .unwrap();
        ledger
            .record_transaction(tenant, tx(account.credit_id, TransactionType::Fee, 150))
            .await
            .unwrap();
        ledger
            .record_transaction(tenant, tx(account.credit_id, TransactionType::Payment, 1_000))
            .await
            .unwrap();
        let mut pending = tx(account.credit_id, TransactionType::Charge, 2_500);
        pending.status = Some(TransactionStatus::Pending);
        ledger.record_transaction(tenant, pending).await.unwrap();

        let summary = ledger
            .get_account_summary(tenant, &AccountSelector::Credit(account.credit_id))
            .await
            .unwrap();
        assert_eq!(summary.current_balance, 3_150);
        assert_eq!(summary.available_credit, 6_850);
        assert_eq!(summary.recent_transactions.len(), 4);

        let all = ledger
            .list_transactions(tenant, &TransactionFilter::default(), ledger.page(None, None).unwrap())
            .await
            .unwrap();
        assert_eq!(sum_completed(&all).unwrap(), summary.current_balance);
    }

    #[tokio::test]
    async fn summary_reports_negative_available_credit_without_clamping() {
        let (ledger, _) = ledger();
        let tenant = Uuid::new_v4();
        let account = open(&ledger, tenant, 1_000).await;
        ledger
            .record_transaction(tenant, tx(account.credit_id, TransactionType::Charge, 900))
            .await
            .unwrap();
        ledger
            .create_or_update_account(
                tenant,
                AccountChanges {
                    credit_limit: Some(500),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let summary = ledger
            .get_account_summary(tenant, &AccountSelector::Sole)
            .await
            .unwrap();
        assert_eq!(summary.available_credit, -400);
    }

    #[tokio::test]
    async fn idempotent_replay_returns_same_transaction_once() {
        let (ledger, _) = ledger();
        let tenant = Uuid::new_v4();
        let account = open(&ledger, tenant, 10_000).await;

        let mut input = tx(account.credit_id, TransactionType::Charge, 700);
        input.idempotency_key = Some("order-42".into());
        let first = ledger.record_transaction(tenant, input.clone()).await.unwrap();
        let second = ledger.record_transaction(tenant, input).await.unwrap();

        assert!(!first.is_replay());
        assert!(second.is_replay());
        assert_eq!(
            first.transaction().transaction_id,
            second.transaction().transaction_id
        );
        let summary = ledger
            .get_account_summary(tenant, &AccountSelector::Credit(account.credit_id))
            .await
            .unwrap();
        assert_eq!(summary.current_balance, 700);
    }

    #[tokio::test]
    async fn idempotency_keys_are_scoped_per_tenant() {
        let (ledger, _) = ledger();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let acc_a = open(&ledger, a, 1_000).await;
        let acc_b = open(&ledger, b, 1_000).await;

        let mut in_a = tx(acc_a.credit_id, TransactionType::Charge, 100);
        in_a.idempotency_key = Some("shared".into());
        let mut in_b = tx(acc_b.credit_id, TransactionType::Charge, 100);
        in_b.idempotency_key = Some("shared".into());

        let ta = ledger.record_transaction(a, in_a).await.unwrap();
        let tb = ledger.record_transaction(b, in_b).await.unwrap();
        assert!(!tb.is_replay());
        assert_ne!(ta.transaction().transaction_id, tb.transaction().transaction_id);
    }

    #[tokio::test]
    async fn over_limit_charges_are_rejected() {
        let (ledger, _) = ledger();
        let tenant = Uuid::new_v4();
        let account = open(&ledger, tenant, 1_000).await;

        ledger
            .record_transaction(tenant, tx(account.credit_id, TransactionType::Charge, 1_000))
            .await
            .unwrap();
        let err = ledger
            .record_transaction(tenant, tx(account.credit_id, TransactionType::Fee, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput { .. }));

        // payments always land
        ledger
            .record_transaction(tenant, tx(account.credit_id, TransactionType::Payment, 400))
            .await
            .unwrap();
        ledger
            .record_transaction(tenant, tx(account.credit_id, TransactionType::Charge, 400))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn suspended_accounts_take_payments_but_not_charges() {
        let (ledger, _) = ledger();
        let tenant = Uuid::new_v4();
        let account = open(&ledger, tenant, 1_000).await;
        ledger
            .record_transaction(tenant, tx(account.credit_id, TransactionType::Charge, 300))
            .await
            .unwrap();
        ledger
            .create_or_update_account(
                tenant,
                AccountChanges {
                    status: Some(CreditStatus::Suspended),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = ledger
            .record_transaction(tenant, tx(account.credit_id, TransactionType::Charge, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        ledger
            .record_transaction(tenant, tx(account.credit_id, TransactionType::Payment, 300))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn malformed_input_is_rejected_before_any_write() {
        let (ledger, store) = ledger();
        let tenant = Uuid::new_v4();
        let account = open(&ledger, tenant, 1_000).await;

        let mut bad = tx(account.credit_id, TransactionType::Payment, -5);
        bad.idempotency_key = Some("   ".into());
        match ledger.record_transaction(tenant, bad).await.unwrap_err() {
            AppError::InvalidInput { details, .. } => {
                let fields: Vec<_> = details.iter().map(|d| d.field.as_str()).collect();
                assert_eq!(fields, vec!["amount", "idempotencyKey"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.transaction_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_account_is_not_found() {
        let (ledger, _) = ledger();
        let tenant = Uuid::new_v4();
        let err = ledger
            .record_transaction(tenant, tx(Uuid::new_v4(), TransactionType::Charge, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let other_tenant = Uuid::new_v4();
        let account = open(&ledger, tenant, 100).await;
        let err = ledger
            .get_account_summary(other_tenant, &AccountSelector::Credit(account.credit_id))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn creation_requires_customer_and_update_reuses_the_row() {
        let (ledger, _) = ledger();
        let tenant = Uuid::new_v4();

        let err = ledger
            .create_or_update_account(
                tenant,
                AccountChanges {
                    credit_limit: Some(100),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput { .. }));

        let created = open(&ledger, tenant, 100).await;
        let updated = open(&ledger, tenant, 250).await;
        assert_eq!(created.credit_id, updated.credit_id);
        assert_eq!(updated.credit_limit, 250);

        let err = ledger
            .create_or_update_account(
                tenant,
                AccountChanges {
                    credit_limit: Some(-1),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creation_persists_exactly_one_account() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(CreditLedger::new(store.clone(), LedgerSettings::default()));
        let tenant = Uuid::new_v4();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let mut handles = Vec::new();
        for limit in [100, 200] {
            let ledger = ledger.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                ledger
                    .create_or_update_account(
                        tenant,
                        AccountChanges {
                            customer_id: Some("cus_race".into()),
                            credit_limit: Some(limit),
                            ..Default::default()
                        },
                    )
                    .await
            }));
        }
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) | Err(AppError::Conflict(_)) => {}
                Err(other) => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(store.list_open_accounts(tenant).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_charges_never_overdraw_the_limit() {
        let (ledger, store) = ledger();
        let ledger = Arc::new(ledger);
        let tenant = Uuid::new_v4();
        let account = open(&ledger, tenant, 1_000).await;
        let barrier = Arc::new(tokio::sync::Barrier::new(8));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            let barrier = barrier.clone();
            let credit_id = account.credit_id;
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                ledger
                    .record_transaction(tenant, tx(credit_id, TransactionType::Charge, 300))
                    .await
            }));
        }

        let (mut accepted, mut rejected) = (0, 0);
        for handle in handles {
            match handle.await.unwrap() {
                Ok(RecordOutcome::Created(_)) => accepted += 1,
                Err(AppError::InvalidInput { details, .. }) => {
                    assert_eq!(details[0].field, "amount");
                    rejected += 1;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!((accepted, rejected), (3, 5));
        let balance = store.completed_balance(tenant, account.credit_id).await.unwrap();
        assert_eq!(balance, 900);
        assert!(balance <= account.credit_limit);
    }

    #[tokio::test]
    async fn caller_keys_cannot_use_the_reversal_prefix() {
        let (ledger, _) = ledger();
        let tenant = Uuid::new_v4();
        let account = open(&ledger, tenant, 1_000).await;
        let charge = ledger
            .record_transaction(tenant, tx(account.credit_id, TransactionType::Charge, 100))
            .await
            .unwrap()
            .into_transaction();

        let mut squatter = tx(account.credit_id, TransactionType::Charge, 50);
        squatter.idempotency_key = Some(reversal_key(charge.transaction_id));
        match ledger.record_transaction(tenant, squatter).await.unwrap_err() {
            AppError::InvalidInput { details, .. } => assert_eq!(details[0].field, "idempotencyKey"),
            other => panic!("unexpected {other:?}"),
        }

        ledger
            .reverse_transaction(tenant, charge.transaction_id, None)
            .await
            .unwrap();
        let all = ledger
            .list_transactions(tenant, &TransactionFilter::default(), ledger.page(None, None).unwrap())
            .await
            .unwrap();
        let mut keys: Vec<_> = all.iter().map(|t| t.idempotency_key.clone()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), all.len());
    }

    #[tokio::test]
    async fn reversal_refuses_a_taken_key_without_duplicating_it() {
        let (ledger, store) = ledger();
        let tenant = Uuid::new_v4();
        let account = open(&ledger, tenant, 1_000).await;
        let charge = ledger
            .record_transaction(tenant, tx(account.credit_id, TransactionType::Charge, 100))
            .await
            .unwrap()
            .into_transaction();
        // written straight to the store, past key validation
        store
            .append_transaction(TransactionDraft {
                tenant_id: tenant,
                credit_id: account.credit_id,
                transaction_type: TransactionType::Fee,
                amount: 5,
                status: TransactionStatus::Completed,
                idempotency_key: reversal_key(charge.transaction_id),
                description: None,
                due_date: None,
            })
            .await
            .unwrap();

        let err = store
            .reverse_transaction(tenant, charge.transaction_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        let original = store
            .find_transaction(tenant, charge.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(original.status, TransactionStatus::Completed);
        assert_eq!(store.transaction_count().await, 2);
    }

    #[tokio::test]
    async fn losing_insert_surfaces_conflict() {
        let store = Arc::new(MemoryStore::new());
        let tenant = Uuid::new_v4();
        let new = NewAccount {
            tenant_id: tenant,
            customer_id: "cus_dup".into(),
            credit_limit: 0,
            status: CreditStatus::Active,
            payment_method_ref: None,
        };
        store.insert_account(new.clone()).await.unwrap();
        let err = store.insert_account(new).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn reversal_appends_compensating_entry_and_restores_balance() {
        let (ledger, _) = ledger();
        let tenant = Uuid::new_v4();
        let account = open(&ledger, tenant, 5_000).await;
        let charge = ledger
            .record_transaction(tenant, tx(account.credit_id, TransactionType::Charge, 1_200))
            .await
            .unwrap()
            .into_transaction();

        let compensating = ledger
            .reverse_transaction(tenant, charge.transaction_id, Some("duplicate order".into()))
            .await
            .unwrap();
        assert_eq!(compensating.amount, -1_200);
        assert_eq!(compensating.reversal_of, Some(charge.transaction_id));

        let summary = ledger
            .get_account_summary(tenant, &AccountSelector::Credit(account.credit_id))
            .await
            .unwrap();
        assert_eq!(summary.current_balance, 0);
        let original = summary
            .recent_transactions
            .iter()
            .find(|t| t.transaction_id == charge.transaction_id)
            .unwrap();
        assert_eq!(original.status, TransactionStatus::Reversed);
        assert_eq!(original.amount, 1_200);

        let again = ledger
            .reverse_transaction(tenant, charge.transaction_id, None)
            .await
            .unwrap_err();
        assert!(matches!(again, AppError::Conflict(_)));
        let of_reversal = ledger
            .reverse_transaction(tenant, compensating.transaction_id, None)
            .await
            .unwrap_err();
        assert!(matches!(of_reversal, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn settling_pending_charge_reapplies_limit() {
        let (ledger, _) = ledger();
        let tenant = Uuid::new_v4();
        let account = open(&ledger, tenant, 1_000).await;

        let mut pending = tx(account.credit_id, TransactionType::Charge, 800);
        pending.status = Some(TransactionStatus::Pending);
        let pending = ledger
            .record_transaction(tenant, pending)
            .await
            .unwrap()
            .into_transaction();
        ledger
            .record_transaction(tenant, tx(account.credit_id, TransactionType::Charge, 500))
            .await
            .unwrap();

        let err = ledger
            .settle_transaction(tenant, pending.transaction_id, TransactionStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput { .. }));

        let failed = ledger
            .settle_transaction(tenant, pending.transaction_id, TransactionStatus::Failed)
            .await
            .unwrap();
        assert_eq!(failed.status, TransactionStatus::Failed);
        let err = ledger
            .settle_transaction(tenant, pending.transaction_id, TransactionStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn page_clamps_limit_and_rejects_negative_offset() {
        let store = Arc::new(MemoryStore::new());
        let ledger = CreditLedger::new(store, LedgerSettings::default());
        assert_eq!(ledger.page(Some(500), None).unwrap(), Page { limit: 100, offset: 0 });
        assert_eq!(ledger.page(Some(0), Some(10)).unwrap(), Page { limit: 1, offset: 10 });
        assert_eq!(ledger.page(None, None).unwrap(), Page { limit: 20, offset: 0 });
        assert!(ledger.page(Some(10), Some(-1)).is_err());
    }

    #[test]
    fn synthesized_keys_differ() {
        let tenant = Uuid::new_v4();
        let a = synthesize_key(tenant);
        let b = synthesize_key(tenant);
        assert!(a.starts_with(&tenant.to_string()));
        assert_ne!(a, b);
    }
}

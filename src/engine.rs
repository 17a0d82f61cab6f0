// src/engine.rs
use crate::retry::{RetryPolicy, with_retry};
use crate::{
    EntryPair, EntryType, OperationKind, PairOutcome, StoreTx, WalletError, WalletStore,
};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub const METADATA_MAX_LEN: usize = 500;

/// Credit the user wallet from an external payment.
#[derive(Debug, Clone, Deserialize)]
pub struct TopUpRequest {
    pub user_id: i64,
    pub asset_type_id: i64,
    pub amount: i64,
    pub request_key: String,
    pub payment_reference: String,
    pub metadata: Option<String>,
}

/// Credit the user wallet without a payment (promotions, referrals).
#[derive(Debug, Clone, Deserialize)]
pub struct BonusRequest {
    pub user_id: i64,
    pub asset_type_id: i64,
    pub amount: i64,
    pub request_key: String,
    pub reason: String,
    pub metadata: Option<String>,
}

/// Debit the user wallet against an order.
#[derive(Debug, Clone, Deserialize)]
pub struct SpendRequest {
    pub user_id: i64,
    pub asset_type_id: i64,
    pub amount: i64,
    pub request_key: String,
    pub order_reference: String,
    pub metadata: Option<String>,
}

/// Kind-erased operation input; the public wrappers fill `reference_id`
/// from their kind-specific field.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub user_id: i64,
    pub asset_type_id: i64,
    pub amount: i64,
    pub request_key: String,
    pub reference_id: String,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    #[serde(rename = "SUCCESS")]
    Success,
}

/// The engine defines no non-success status: failures are raised as
/// [`WalletError`], never encoded in the response body. A replayed
/// duplicate gets the same receipt the original commit produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub status: ReceiptStatus,
    pub amount: i64,
    pub balance_after: i64,
}

impl Receipt {
    fn success(amount: i64, balance_after: i64) -> Receipt {
        Receipt {
            status: ReceiptStatus::Success,
            amount,
            balance_after,
        }
    }
}

/// The ledger transaction engine. Holds no cross-call state; every
/// operation is one storage transaction per attempt, and all mutual
/// exclusion is delegated to the backend's row locks.
pub struct LedgerEngine {
    store: Arc<dyn WalletStore>,
    policy: RetryPolicy,
}

impl LedgerEngine {
    pub fn new(store: Arc<dyn WalletStore>) -> Self {
        Self {
            store,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(store: Arc<dyn WalletStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn top_up(&self, req: TopUpRequest) -> Result<Receipt, WalletError> {
        let args = OperationRequest {
            user_id: req.user_id,
            asset_type_id: req.asset_type_id,
            amount: req.amount,
            request_key: req.request_key,
            reference_id: req.payment_reference,
            metadata: req.metadata,
        };
        self.execute(OperationKind::TopUp, args).await
    }

    pub async fn bonus(&self, req: BonusRequest) -> Result<Receipt, WalletError> {
        let args = OperationRequest {
            user_id: req.user_id,
            asset_type_id: req.asset_type_id,
            amount: req.amount,
            request_key: req.request_key,
            reference_id: req.reason,
            metadata: req.metadata,
        };
        self.execute(OperationKind::Bonus, args).await
    }

    pub async fn spend(&self, req: SpendRequest) -> Result<Receipt, WalletError> {
        let args = OperationRequest {
            user_id: req.user_id,
            asset_type_id: req.asset_type_id,
            amount: req.amount,
            request_key: req.request_key,
            reference_id: req.order_reference,
            metadata: req.metadata,
        };
        self.execute(OperationKind::Spend, args).await
    }

    /// One logical operation: a single correlation id, then the atomic
    /// attempt under the retry policy. The id is fixed across attempts so
    /// a retried commit still forms one logical transaction.
    pub async fn execute(
        &self,
        kind: OperationKind,
        req: OperationRequest,
    ) -> Result<Receipt, WalletError> {
        let correlation_id = Uuid::now_v7();

        let result = with_retry(&self.policy, || self.attempt(kind, &req, correlation_id)).await;

        counter!("wallet.transactions.total",
            "source" => kind.source_type(),
            "status" => if result.is_ok() { "success" } else { "failed" }
        )
        .increment(1);

        if result.is_ok() {
            histogram!("wallet.transaction.amount", "source" => kind.source_type())
                .record(req.amount as f64);
        }

        result
    }

    /// One attempt = one storage transaction. Commit on success, roll back
    /// on any error; no partial ledger or balance mutation survives.
    async fn attempt(
        &self,
        kind: OperationKind,
        req: &OperationRequest,
        correlation_id: Uuid,
    ) -> Result<Receipt, WalletError> {
        // Validation precedes the transaction: no locks are taken for a
        // request that can never commit.
        if req.amount <= 0 {
            return Err(WalletError::InvalidAmount);
        }
        if let Some(metadata) = &req.metadata {
            if metadata.chars().count() > METADATA_MAX_LEN {
                return Err(WalletError::MetadataTooLong);
            }
        }

        let mut tx = self.store.begin().await?;

        match self.run_locked(&mut tx, kind, req, correlation_id).await {
            Ok(receipt) => {
                tx.commit().await?;
                Ok(receipt)
            }
            Err(err) => {
                tx.rollback().await.ok();
                Err(err)
            }
        }
    }

    /// Steps 2–11. The acquisition order asset → user → system wallet →
    /// user wallet is the deadlock-avoidance contract; never reorder it.
    async fn run_locked(
        &self,
        tx: &mut Box<dyn StoreTx>,
        kind: OperationKind,
        req: &OperationRequest,
        correlation_id: Uuid,
    ) -> Result<Receipt, WalletError> {
        let asset = tx
            .lock_asset_shared(req.asset_type_id)
            .await?
            .ok_or(WalletError::AssetNotFound)?;
        if !asset.status.is_active() {
            return Err(WalletError::AssetInactive);
        }

        tx.lock_user_shared(req.user_id)
            .await?
            .ok_or(WalletError::UserNotFound)?;

        let system_wallet = tx
            .lock_system_wallet(req.asset_type_id)
            .await?
            .ok_or(WalletError::SystemWalletMissing)?;

        let user_wallet = tx
            .lock_or_create_user_wallet(req.user_id, req.asset_type_id)
            .await?;

        let user_entry_type = kind.user_entry_type();

        if let Some(existing) = tx
            .find_by_request_key(user_wallet.id, &req.request_key)
            .await?
        {
            warn!(
                request_key = %req.request_key,
                "duplicate request detected, returning cached result"
            );
            let balance_after = tx.balance_of(user_wallet.id).await?;
            return Ok(Receipt::success(existing.amount, balance_after));
        }

        if user_entry_type == EntryType::Debit && user_wallet.balance < req.amount {
            return Err(WalletError::InsufficientBalance);
        }

        let pair = EntryPair {
            uuid: correlation_id,
            user_wallet_id: user_wallet.id,
            system_wallet_id: system_wallet.id,
            amount: req.amount,
            user_entry_type,
            source_type: kind.source_type(),
            reference_id: req.reference_id.clone(),
            request_key: req.request_key.clone(),
            metadata: req.metadata.clone(),
        };

        match tx.insert_entry_pair(&pair).await? {
            PairOutcome::Inserted => {}
            PairOutcome::Duplicate(existing) => {
                // A concurrent duplicate won the race between the lookup
                // and the insert; answer it exactly like the lookup hit.
                warn!(
                    request_key = %req.request_key,
                    "duplicate request lost the insert race, returning cached result"
                );
                let balance_after = tx.balance_of(user_wallet.id).await?;
                return Ok(Receipt::success(existing.amount, balance_after));
            }
        }

        match user_entry_type {
            EntryType::Credit => tx.apply_balance_delta(user_wallet.id, req.amount).await?,
            EntryType::Debit => {
                // Conditional update: zero affected rows means the balance
                // moved under us and the debit would go negative.
                if !tx.debit_balance_checked(user_wallet.id, req.amount).await? {
                    return Err(WalletError::InsufficientBalance);
                }
            }
        }

        let system_delta = match pair.system_entry_type() {
            EntryType::Credit => req.amount,
            EntryType::Debit => -req.amount,
        };
        tx.apply_balance_delta(system_wallet.id, system_delta).await?;

        let balance_after = tx.balance_of(user_wallet.id).await?;
        Ok(Receipt::success(req.amount, balance_after))
    }
}

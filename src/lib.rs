// src/lib.rs
pub mod adapters;
pub mod asset;
pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
pub mod retry;
pub mod user;
pub mod wallet;

pub use asset::{Asset, AssetStatus};
pub use config::StoreConfig;
pub use engine::{
    BonusRequest, LedgerEngine, METADATA_MAX_LEN, OperationRequest, Receipt, ReceiptStatus,
    SpendRequest, TopUpRequest,
};
pub use entry::{EntryPair, EntryType, LedgerEntry, LedgerPage, OperationKind, PairOutcome};
pub use error::WalletError;
pub use retry::RetryPolicy;
pub use user::User;
pub use wallet::{AssetBalance, Wallet};

use async_trait::async_trait;
use std::sync::Arc;

/// One storage transaction, scoped to a single engine attempt.
///
/// Lock discipline: `lock_asset_shared` and `lock_user_shared` block
/// writers but not other readers; the wallet locks are exclusive and are
/// held across the read-modify-write until commit/rollback, so the second
/// caller on the same wallet proceeds with fresh data, never a stale read.
/// `find_by_request_key` takes a lock light enough to let unrelated
/// readers through while serializing two inserts racing on the same key;
/// the pair insert's unique constraint stays the final authority.
#[async_trait]
pub trait StoreTx: Send {
    async fn lock_asset_shared(&mut self, asset_type_id: i64)
    -> Result<Option<Asset>, WalletError>;

    async fn lock_user_shared(&mut self, user_id: i64) -> Result<Option<User>, WalletError>;

    async fn lock_system_wallet(&mut self, asset_type_id: i64)
    -> Result<Option<Wallet>, WalletError>;

    /// Locks the user wallet for (user, asset), creating it with balance 0
    /// if absent. A uniqueness race against a concurrent creator resolves
    /// by re-fetching under the lock, not by failing.
    async fn lock_or_create_user_wallet(
        &mut self,
        user_id: i64,
        asset_type_id: i64,
    ) -> Result<Wallet, WalletError>;

    async fn find_by_request_key(
        &mut self,
        wallet_id: i64,
        request_key: &str,
    ) -> Result<Option<LedgerEntry>, WalletError>;

    /// Appends both rows of one logical transaction, or reports the
    /// already-committed duplicate as a tagged outcome instead of a
    /// constraint error.
    async fn insert_entry_pair(&mut self, pair: &EntryPair) -> Result<PairOutcome, WalletError>;

    /// Unconditional balance mutation (credits, and the system-wallet side
    /// which is allowed to go negative).
    async fn apply_balance_delta(&mut self, wallet_id: i64, delta: i64)
    -> Result<(), WalletError>;

    /// Conditional debit: subtracts only while `balance >= amount` holds
    /// atomically, returning whether a row was affected.
    async fn debit_balance_checked(
        &mut self,
        wallet_id: i64,
        amount: i64,
    ) -> Result<bool, WalletError>;

    async fn balance_of(&mut self, wallet_id: i64) -> Result<i64, WalletError>;

    async fn commit(self: Box<Self>) -> Result<(), WalletError>;

    async fn rollback(self: Box<Self>) -> Result<(), WalletError>;
}

/// Storage contract for the wallet system: the engine's transactional
/// entry point plus the collaborator services (users, assets, system
/// wallet provisioning) and the read path.
#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, WalletError>;

    // Users: create/lookup only; the engine never mutates them.
    async fn create_user(&self, name: &str, email: &str) -> Result<User, WalletError>;
    async fn get_user(&self, user_id: i64) -> Result<User, WalletError>;
    async fn find_user_by_email(&self, email: &str) -> Result<User, WalletError>;
    async fn list_users(&self) -> Result<Vec<User>, WalletError>;

    // Assets: create/lookup only.
    async fn create_asset(
        &self,
        name: &str,
        description: Option<&str>,
        status: AssetStatus,
    ) -> Result<Asset, WalletError>;
    async fn get_asset(&self, asset_type_id: i64) -> Result<Asset, WalletError>;
    async fn list_active_assets(&self) -> Result<Vec<Asset>, WalletError>;

    /// Out-of-band provisioning of the one system wallet per asset.
    /// Idempotent. The engine itself treats a missing system wallet as a
    /// fatal configuration error and never creates one.
    async fn provision_system_wallet(&self, asset_type_id: i64) -> Result<Wallet, WalletError>;

    // Read path: plain snapshot reads, no locks.
    async fn user_balances(&self, user_id: i64) -> Result<Vec<AssetBalance>, WalletError>;
    async fn user_ledger(
        &self,
        user_id: i64,
        asset_type_id: Option<i64>,
        page: LedgerPage,
    ) -> Result<Vec<LedgerEntry>, WalletError>;
}

/// Wires a store to the transaction engine.
pub struct WalletSystem {
    store: Arc<dyn WalletStore>,
    engine: LedgerEngine,
}

impl WalletSystem {
    pub fn new(store: Box<dyn WalletStore>) -> Self {
        let store: Arc<dyn WalletStore> = store.into();
        Self {
            engine: LedgerEngine::new(Arc::clone(&store)),
            store,
        }
    }

    pub fn with_policy(store: Box<dyn WalletStore>, policy: RetryPolicy) -> Self {
        let store: Arc<dyn WalletStore> = store.into();
        Self {
            engine: LedgerEngine::with_policy(Arc::clone(&store), policy),
            store,
        }
    }

    pub fn store(&self) -> &dyn WalletStore {
        self.store.as_ref()
    }

    /// Get store Arc (for spawning concurrent workers)
    pub fn store_arc(&self) -> Arc<dyn WalletStore> {
        Arc::clone(&self.store)
    }

    pub fn engine(&self) -> &LedgerEngine {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_to_entry_mapping() {
        assert_eq!(OperationKind::TopUp.user_entry_type(), EntryType::Credit);
        assert_eq!(OperationKind::Spend.user_entry_type(), EntryType::Debit);
        assert_eq!(
            OperationKind::Spend.user_entry_type().complement(),
            EntryType::Credit
        );
    }

    #[test]
    fn test_email_normalization() {
        assert_eq!(user::normalize_email(" A@B.Com"), "a@b.com");
    }
}

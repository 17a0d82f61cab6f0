// src/adapters/memory.rs
use crate::user::normalize_email;
use crate::{
    Asset, AssetBalance, AssetStatus, EntryPair, LedgerEntry, LedgerPage, PairOutcome, StoreTx,
    User, Wallet, WalletError, WalletStore,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
struct MemoryState {
    users: HashMap<i64, User>,
    assets: HashMap<i64, Asset>,
    wallets: HashMap<i64, Wallet>,
    entries: Vec<LedgerEntry>,
    next_user_id: i64,
    next_asset_id: i64,
    next_wallet_id: i64,
    next_entry_id: i64,
}

impl MemoryState {
    fn user_wallet(&self, user_id: i64, asset_type_id: i64) -> Option<&Wallet> {
        self.wallets.values().find(|w| {
            w.user_id == Some(user_id) && w.asset_type_id == asset_type_id && !w.is_system
        })
    }

    fn system_wallet(&self, asset_type_id: i64) -> Option<&Wallet> {
        self.wallets
            .values()
            .find(|w| w.is_system && w.asset_type_id == asset_type_id)
    }

    fn entry_for_key(&self, wallet_id: i64, request_key: &str) -> Option<&LedgerEntry> {
        self.entries
            .iter()
            .find(|e| e.wallet_id == wallet_id && e.request_key == request_key)
    }
}

/// In-memory adapter with the same contract as the Postgres one, for
/// tests. One async mutex stands in for the backend's lock manager:
/// engine transactions serialize on it, and the snapshot taken at `begin`
/// restores the state on rollback. Unique constraints are re-checked on
/// every insert, so the tagged duplicate path behaves as it does against
/// the real index.
pub struct MemoryAdapter {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryTx {
    state: OwnedMutexGuard<MemoryState>,
    snapshot: MemoryState,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn lock_asset_shared(
        &mut self,
        asset_type_id: i64,
    ) -> Result<Option<Asset>, WalletError> {
        Ok(self.state.assets.get(&asset_type_id).cloned())
    }

    async fn lock_user_shared(&mut self, user_id: i64) -> Result<Option<User>, WalletError> {
        Ok(self.state.users.get(&user_id).cloned())
    }

    async fn lock_system_wallet(
        &mut self,
        asset_type_id: i64,
    ) -> Result<Option<Wallet>, WalletError> {
        Ok(self.state.system_wallet(asset_type_id).cloned())
    }

    async fn lock_or_create_user_wallet(
        &mut self,
        user_id: i64,
        asset_type_id: i64,
    ) -> Result<Wallet, WalletError> {
        if let Some(wallet) = self.state.user_wallet(user_id, asset_type_id) {
            return Ok(wallet.clone());
        }

        self.state.next_wallet_id += 1;
        let wallet = Wallet {
            id: self.state.next_wallet_id,
            user_id: Some(user_id),
            asset_type_id,
            is_system: false,
            balance: 0,
            created_at: Utc::now(),
        };
        self.state.wallets.insert(wallet.id, wallet.clone());

        Ok(wallet)
    }

    async fn find_by_request_key(
        &mut self,
        wallet_id: i64,
        request_key: &str,
    ) -> Result<Option<LedgerEntry>, WalletError> {
        Ok(self.state.entry_for_key(wallet_id, request_key).cloned())
    }

    async fn insert_entry_pair(&mut self, pair: &EntryPair) -> Result<PairOutcome, WalletError> {
        if let Some(existing) = self
            .state
            .entry_for_key(pair.user_wallet_id, &pair.request_key)
        {
            return Ok(PairOutcome::Duplicate(existing.clone()));
        }

        // Same key, different user wallet, same system wallet: the unique
        // index would reject the system-side row.
        if self
            .state
            .entry_for_key(pair.system_wallet_id, &pair.request_key)
            .is_some()
        {
            return Err(WalletError::Conflict(format!(
                "request key {} already used against this asset",
                pair.request_key
            )));
        }

        let now = Utc::now();
        for (wallet_id, entry_type) in [
            (pair.user_wallet_id, pair.user_entry_type),
            (pair.system_wallet_id, pair.system_entry_type()),
        ] {
            self.state.next_entry_id += 1;
            let entry = LedgerEntry {
                id: self.state.next_entry_id,
                wallet_id,
                uuid: pair.uuid,
                amount: pair.amount,
                entry_type,
                source_type: pair.source_type.to_string(),
                reference_id: pair.reference_id.clone(),
                request_key: pair.request_key.clone(),
                metadata: pair.metadata.clone(),
                created_at: now,
            };
            self.state.entries.push(entry);
        }

        Ok(PairOutcome::Inserted)
    }

    async fn apply_balance_delta(
        &mut self,
        wallet_id: i64,
        delta: i64,
    ) -> Result<(), WalletError> {
        let wallet = self
            .state
            .wallets
            .get_mut(&wallet_id)
            .ok_or(WalletError::WalletNotFound)?;
        wallet.balance += delta;
        Ok(())
    }

    async fn debit_balance_checked(
        &mut self,
        wallet_id: i64,
        amount: i64,
    ) -> Result<bool, WalletError> {
        let wallet = self
            .state
            .wallets
            .get_mut(&wallet_id)
            .ok_or(WalletError::WalletNotFound)?;

        if wallet.balance < amount {
            return Ok(false);
        }

        wallet.balance -= amount;
        Ok(true)
    }

    async fn balance_of(&mut self, wallet_id: i64) -> Result<i64, WalletError> {
        self.state
            .wallets
            .get(&wallet_id)
            .map(|w| w.balance)
            .ok_or(WalletError::WalletNotFound)
    }

    async fn commit(self: Box<Self>) -> Result<(), WalletError> {
        // Mutations were applied in place; dropping the guard publishes them.
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), WalletError> {
        let MemoryTx {
            mut state,
            snapshot,
        } = *self;
        *state = snapshot;
        Ok(())
    }
}

#[async_trait]
impl WalletStore for MemoryAdapter {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, WalletError> {
        let state = Arc::clone(&self.state).lock_owned().await;
        let snapshot = state.clone();
        Ok(Box::new(MemoryTx { state, snapshot }))
    }

    async fn create_user(&self, name: &str, email: &str) -> Result<User, WalletError> {
        let mut state = self.state.lock().await;
        let email = normalize_email(email);

        if state.users.values().any(|u| u.email == email) {
            return Err(WalletError::UserAlreadyExists);
        }

        state.next_user_id += 1;
        let user = User {
            id: state.next_user_id,
            name: name.trim().to_string(),
            email,
            created_at: Utc::now(),
        };
        state.users.insert(user.id, user.clone());

        Ok(user)
    }

    async fn get_user(&self, user_id: i64) -> Result<User, WalletError> {
        let state = self.state.lock().await;
        state
            .users
            .get(&user_id)
            .cloned()
            .ok_or(WalletError::UserNotFound)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<User, WalletError> {
        let state = self.state.lock().await;
        let email = normalize_email(email);
        state
            .users
            .values()
            .find(|u| u.email == email)
            .cloned()
            .ok_or(WalletError::UserNotFound)
    }

    async fn list_users(&self) -> Result<Vec<User>, WalletError> {
        let state = self.state.lock().await;
        let mut users: Vec<User> = state.users.values().cloned().collect();
        users.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(users)
    }

    async fn create_asset(
        &self,
        name: &str,
        description: Option<&str>,
        status: AssetStatus,
    ) -> Result<Asset, WalletError> {
        let mut state = self.state.lock().await;
        let name = name.trim();

        if state.assets.values().any(|a| a.name == name) {
            return Err(WalletError::AssetAlreadyExists);
        }

        state.next_asset_id += 1;
        let asset = Asset {
            id: state.next_asset_id,
            name: name.to_string(),
            description: description.map(str::to_string),
            status,
            created_at: Utc::now(),
        };
        state.assets.insert(asset.id, asset.clone());

        Ok(asset)
    }

    async fn get_asset(&self, asset_type_id: i64) -> Result<Asset, WalletError> {
        let state = self.state.lock().await;
        state
            .assets
            .get(&asset_type_id)
            .cloned()
            .ok_or(WalletError::AssetNotFound)
    }

    async fn list_active_assets(&self) -> Result<Vec<Asset>, WalletError> {
        let state = self.state.lock().await;
        let mut assets: Vec<Asset> = state
            .assets
            .values()
            .filter(|a| a.status.is_active())
            .cloned()
            .collect();
        assets.sort_by_key(|a| a.id);
        Ok(assets)
    }

    async fn provision_system_wallet(&self, asset_type_id: i64) -> Result<Wallet, WalletError> {
        let mut state = self.state.lock().await;

        if !state.assets.contains_key(&asset_type_id) {
            return Err(WalletError::AssetNotFound);
        }

        if let Some(wallet) = state.system_wallet(asset_type_id) {
            return Ok(wallet.clone());
        }

        state.next_wallet_id += 1;
        let wallet = Wallet {
            id: state.next_wallet_id,
            user_id: None,
            asset_type_id,
            is_system: true,
            balance: 0,
            created_at: Utc::now(),
        };
        state.wallets.insert(wallet.id, wallet.clone());

        Ok(wallet)
    }

    async fn user_balances(&self, user_id: i64) -> Result<Vec<AssetBalance>, WalletError> {
        let state = self.state.lock().await;

        if !state.users.contains_key(&user_id) {
            return Err(WalletError::UserNotFound);
        }

        let mut wallets: Vec<&Wallet> = state
            .wallets
            .values()
            .filter(|w| w.user_id == Some(user_id) && !w.is_system)
            .collect();

        if wallets.is_empty() {
            return Err(WalletError::WalletNotFound);
        }

        wallets.sort_by_key(|w| w.id);

        Ok(wallets
            .into_iter()
            .map(|w| AssetBalance {
                asset_type: state
                    .assets
                    .get(&w.asset_type_id)
                    .map(|a| a.name.clone())
                    .unwrap_or_else(|| "UNKNOWN".to_string()),
                balance: w.balance,
            })
            .collect())
    }

    async fn user_ledger(
        &self,
        user_id: i64,
        asset_type_id: Option<i64>,
        page: LedgerPage,
    ) -> Result<Vec<LedgerEntry>, WalletError> {
        let state = self.state.lock().await;

        let wallet_id = state
            .wallets
            .values()
            .filter(|w| {
                w.user_id == Some(user_id)
                    && !w.is_system
                    && asset_type_id.is_none_or(|asset| w.asset_type_id == asset)
            })
            .map(|w| w.id)
            .min()
            .ok_or(WalletError::WalletNotFound)?;

        // Entries are appended in creation order, so the vec order is the
        // ledger order.
        Ok(state
            .entries
            .iter()
            .filter(|e| e.wallet_id == wallet_id)
            .skip(page.offset.max(0) as usize)
            .take(page.limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

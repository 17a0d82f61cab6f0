// src/wallet.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A balance holder. Exactly one system wallet exists per asset
/// (`is_system`, no owner); at most one user wallet exists per
/// (user, asset) pair, created lazily on first transaction.
///
/// `balance` is a materialized cache of the signed sum of the wallet's
/// ledger entries, maintained incrementally inside the same transaction
/// that appends the entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: i64,
    pub user_id: Option<i64>,
    pub asset_type_id: i64,
    pub is_system: bool,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
}

impl Wallet {
    pub fn is_user_wallet(&self) -> bool {
        !self.is_system
    }
}

/// One row of the balances read path: a user wallet joined to its asset
/// name. A point-in-time snapshot, no cross-wallet consistency promised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset_type: String,
    pub balance: i64,
}

// src/adapters/postgres.rs
use crate::user::normalize_email;
use crate::{
    Asset, AssetBalance, AssetStatus, EntryPair, LedgerEntry, LedgerPage, PairOutcome, StoreConfig,
    StoreTx, User, Wallet, WalletError, WalletStore,
};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Acquire, Postgres, Row, Transaction};
use tracing::info;

/// Storage adapter backed by Postgres.
///
/// All engine-side mutual exclusion is delegated to row locks
/// (`FOR SHARE` / `FOR UPDATE` / `FOR KEY SHARE`) taken inside one sqlx
/// transaction per attempt. Read-committed isolation suffices: the
/// exclusive wallet locks are held across the read-modify-write.
pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &StoreConfig) -> Result<Self, WalletError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url())
            .await
            .map_err(storage_err)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the four tables and their uniqueness guards.
    pub async fn init_schema(&self) -> Result<(), WalletError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS assets (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                status TEXT NOT NULL CHECK (status IN ('ACTIVE', 'INACTIVE')),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallets (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                user_id BIGINT REFERENCES users(id),
                asset_type_id BIGINT NOT NULL REFERENCES assets(id),
                is_system BOOLEAN NOT NULL DEFAULT FALSE,
                balance BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        // One system wallet per asset; at most one user wallet per pair.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_wallets_system_per_asset
            ON wallets(asset_type_id) WHERE is_system
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_wallets_user_asset
            ON wallets(user_id, asset_type_id) WHERE NOT is_system
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_entries (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                wallet_id BIGINT NOT NULL REFERENCES wallets(id),
                uuid UUID NOT NULL,
                amount BIGINT NOT NULL CHECK (amount > 0),
                entry_type TEXT NOT NULL CHECK (entry_type IN ('CREDIT', 'DEBIT')),
                source_type TEXT NOT NULL,
                reference_id TEXT NOT NULL,
                request_key TEXT NOT NULL,
                metadata VARCHAR(500),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        // The idempotency guard.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_wallet_request_key
            ON ledger_entries(wallet_id, request_key)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ledger_wallet_created
            ON ledger_entries(wallet_id, created_at)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;

        info!("wallet schema initialized");
        Ok(())
    }
}

/// Serialization failures and deadlocks surface as transient conflicts for
/// the retry coordinator; everything else is a storage error.
fn storage_err(err: sqlx::Error) -> WalletError {
    if let sqlx::Error::Database(db) = &err {
        if let Some(code) = db.code() {
            if matches!(code.as_ref(), "40001" | "40P01") {
                return WalletError::TransientConflict(db.to_string());
            }
        }
    }
    WalletError::Storage(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn map_user_row(row: PgRow) -> Result<User, WalletError> {
    let de = |e: sqlx::Error| WalletError::Storage(e.to_string());
    Ok(User {
        id: row.try_get("id").map_err(de)?,
        name: row.try_get("name").map_err(de)?,
        email: row.try_get("email").map_err(de)?,
        created_at: row.try_get("created_at").map_err(de)?,
    })
}

fn map_asset_row(row: PgRow) -> Result<Asset, WalletError> {
    let de = |e: sqlx::Error| WalletError::Storage(e.to_string());
    let status: String = row.try_get("status").map_err(de)?;
    let status = AssetStatus::parse(&status)
        .ok_or_else(|| WalletError::Storage(format!("unknown asset status: {status}")))?;
    Ok(Asset {
        id: row.try_get("id").map_err(de)?,
        name: row.try_get("name").map_err(de)?,
        description: row.try_get("description").map_err(de)?,
        status,
        created_at: row.try_get("created_at").map_err(de)?,
    })
}

fn map_wallet_row(row: PgRow) -> Result<Wallet, WalletError> {
    let de = |e: sqlx::Error| WalletError::Storage(e.to_string());
    Ok(Wallet {
        id: row.try_get("id").map_err(de)?,
        user_id: row.try_get("user_id").map_err(de)?,
        asset_type_id: row.try_get("asset_type_id").map_err(de)?,
        is_system: row.try_get("is_system").map_err(de)?,
        balance: row.try_get("balance").map_err(de)?,
        created_at: row.try_get("created_at").map_err(de)?,
    })
}

fn map_entry_row(row: PgRow) -> Result<LedgerEntry, WalletError> {
    let de = |e: sqlx::Error| WalletError::Storage(e.to_string());
    let entry_type: String = row.try_get("entry_type").map_err(de)?;
    let entry_type = crate::EntryType::parse(&entry_type)
        .ok_or_else(|| WalletError::Storage(format!("unknown entry type: {entry_type}")))?;
    Ok(LedgerEntry {
        id: row.try_get("id").map_err(de)?,
        wallet_id: row.try_get("wallet_id").map_err(de)?,
        uuid: row.try_get("uuid").map_err(de)?,
        amount: row.try_get("amount").map_err(de)?,
        entry_type,
        source_type: row.try_get("source_type").map_err(de)?,
        reference_id: row.try_get("reference_id").map_err(de)?,
        request_key: row.try_get("request_key").map_err(de)?,
        metadata: row.try_get("metadata").map_err(de)?,
        created_at: row.try_get("created_at").map_err(de)?,
    })
}

/// One engine attempt's transaction. Every lock taken here lives until
/// commit/rollback releases the whole set at once.
struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn lock_asset_shared(
        &mut self,
        asset_type_id: i64,
    ) -> Result<Option<Asset>, WalletError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, description, status, created_at
            FROM assets
            WHERE id = $1
            FOR SHARE
            "#,
        )
        .bind(asset_type_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage_err)?;

        row.map(map_asset_row).transpose()
    }

    async fn lock_user_shared(&mut self, user_id: i64) -> Result<Option<User>, WalletError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, email, created_at
            FROM users
            WHERE id = $1
            FOR SHARE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage_err)?;

        row.map(map_user_row).transpose()
    }

    async fn lock_system_wallet(
        &mut self,
        asset_type_id: i64,
    ) -> Result<Option<Wallet>, WalletError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, asset_type_id, is_system, balance, created_at
            FROM wallets
            WHERE asset_type_id = $1 AND is_system
            FOR UPDATE
            "#,
        )
        .bind(asset_type_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage_err)?;

        row.map(map_wallet_row).transpose()
    }

    async fn lock_or_create_user_wallet(
        &mut self,
        user_id: i64,
        asset_type_id: i64,
    ) -> Result<Wallet, WalletError> {
        let select = r#"
            SELECT id, user_id, asset_type_id, is_system, balance, created_at
            FROM wallets
            WHERE user_id = $1 AND asset_type_id = $2 AND NOT is_system
            FOR UPDATE
        "#;

        if let Some(row) = sqlx::query(select)
            .bind(user_id)
            .bind(asset_type_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage_err)?
        {
            return map_wallet_row(row);
        }

        // A concurrent creator may win between the select and this insert;
        // ON CONFLICT turns that into a no-op and the re-select picks the
        // winner's row up, locked.
        sqlx::query(
            r#"
            INSERT INTO wallets (user_id, asset_type_id, is_system, balance)
            VALUES ($1, $2, FALSE, 0)
            ON CONFLICT (user_id, asset_type_id) WHERE NOT is_system DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(asset_type_id)
        .execute(&mut *self.tx)
        .await
        .map_err(storage_err)?;

        let row = sqlx::query(select)
            .bind(user_id)
            .bind(asset_type_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage_err)?
            .ok_or(WalletError::WalletNotFound)?;

        map_wallet_row(row)
    }

    async fn find_by_request_key(
        &mut self,
        wallet_id: i64,
        request_key: &str,
    ) -> Result<Option<LedgerEntry>, WalletError> {
        let row = sqlx::query(
            r#"
            SELECT id, wallet_id, uuid, amount, entry_type, source_type,
                   reference_id, request_key, metadata, created_at
            FROM ledger_entries
            WHERE wallet_id = $1 AND request_key = $2
            FOR KEY SHARE
            "#,
        )
        .bind(wallet_id)
        .bind(request_key)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage_err)?;

        row.map(map_entry_row).transpose()
    }

    async fn insert_entry_pair(&mut self, pair: &EntryPair) -> Result<PairOutcome, WalletError> {
        // Savepoint around the insert: a duplicate-key violation must not
        // poison the outer transaction, which still has to serve the
        // cached result.
        let mut sp = self.tx.begin().await.map_err(storage_err)?;

        let result = sqlx::query(
            r#"
            INSERT INTO ledger_entries
                (wallet_id, uuid, amount, entry_type, source_type,
                 reference_id, request_key, metadata)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8),
                ($9, $2, $3, $10, $5, $6, $7, $8)
            "#,
        )
        .bind(pair.user_wallet_id)
        .bind(pair.uuid)
        .bind(pair.amount)
        .bind(pair.user_entry_type.as_str())
        .bind(pair.source_type)
        .bind(&pair.reference_id)
        .bind(&pair.request_key)
        .bind(&pair.metadata)
        .bind(pair.system_wallet_id)
        .bind(pair.system_entry_type().as_str())
        .execute(&mut *sp)
        .await;

        match result {
            Ok(_) => {
                sp.commit().await.map_err(storage_err)?;
                Ok(PairOutcome::Inserted)
            }
            Err(err) if is_unique_violation(&err) => {
                sp.rollback().await.map_err(storage_err)?;

                let row = sqlx::query(
                    r#"
                    SELECT id, wallet_id, uuid, amount, entry_type, source_type,
                           reference_id, request_key, metadata, created_at
                    FROM ledger_entries
                    WHERE wallet_id = $1 AND request_key = $2
                    "#,
                )
                .bind(pair.user_wallet_id)
                .bind(&pair.request_key)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(storage_err)?;

                match row {
                    Some(row) => Ok(PairOutcome::Duplicate(map_entry_row(row)?)),
                    // The collision came from the system-wallet row: the
                    // same key was spent by a different wallet against this
                    // asset. Not a replay, so not absorbed.
                    None => Err(WalletError::Conflict(format!(
                        "request key {} already used against this asset",
                        pair.request_key
                    ))),
                }
            }
            Err(err) => Err(storage_err(err)),
        }
    }

    async fn apply_balance_delta(
        &mut self,
        wallet_id: i64,
        delta: i64,
    ) -> Result<(), WalletError> {
        sqlx::query("UPDATE wallets SET balance = balance + $1 WHERE id = $2")
            .bind(delta)
            .bind(wallet_id)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_err)?;

        Ok(())
    }

    async fn debit_balance_checked(
        &mut self,
        wallet_id: i64,
        amount: i64,
    ) -> Result<bool, WalletError> {
        let result =
            sqlx::query("UPDATE wallets SET balance = balance - $1 WHERE id = $2 AND balance >= $1")
                .bind(amount)
                .bind(wallet_id)
                .execute(&mut *self.tx)
                .await
                .map_err(storage_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn balance_of(&mut self, wallet_id: i64) -> Result<i64, WalletError> {
        sqlx::query_scalar("SELECT balance FROM wallets WHERE id = $1")
            .bind(wallet_id)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(storage_err)
    }

    async fn commit(self: Box<Self>) -> Result<(), WalletError> {
        self.tx.commit().await.map_err(storage_err)
    }

    async fn rollback(self: Box<Self>) -> Result<(), WalletError> {
        self.tx.rollback().await.map_err(storage_err)
    }
}

#[async_trait]
impl WalletStore for PostgresAdapter {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, WalletError> {
        let tx = self.pool.begin().await.map_err(storage_err)?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn create_user(&self, name: &str, email: &str) -> Result<User, WalletError> {
        let email = normalize_email(email);

        let result = sqlx::query(
            r#"
            INSERT INTO users (name, email)
            VALUES ($1, $2)
            RETURNING id, name, email, created_at
            "#,
        )
        .bind(name.trim())
        .bind(&email)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => map_user_row(row),
            Err(err) if is_unique_violation(&err) => Err(WalletError::UserAlreadyExists),
            Err(err) => Err(storage_err(err)),
        }
    }

    async fn get_user(&self, user_id: i64) -> Result<User, WalletError> {
        sqlx::query("SELECT id, name, email, created_at FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .ok_or(WalletError::UserNotFound)
            .and_then(map_user_row)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<User, WalletError> {
        let email = normalize_email(email);

        sqlx::query("SELECT id, name, email, created_at FROM users WHERE email = $1")
            .bind(&email)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .ok_or(WalletError::UserNotFound)
            .and_then(map_user_row)
    }

    async fn list_users(&self) -> Result<Vec<User>, WalletError> {
        let rows =
            sqlx::query("SELECT id, name, email, created_at FROM users ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await
                .map_err(storage_err)?;

        rows.into_iter().map(map_user_row).collect()
    }

    async fn create_asset(
        &self,
        name: &str,
        description: Option<&str>,
        status: AssetStatus,
    ) -> Result<Asset, WalletError> {
        let result = sqlx::query(
            r#"
            INSERT INTO assets (name, description, status)
            VALUES ($1, $2, $3)
            RETURNING id, name, description, status, created_at
            "#,
        )
        .bind(name.trim())
        .bind(description)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => map_asset_row(row),
            Err(err) if is_unique_violation(&err) => Err(WalletError::AssetAlreadyExists),
            Err(err) => Err(storage_err(err)),
        }
    }

    async fn get_asset(&self, asset_type_id: i64) -> Result<Asset, WalletError> {
        sqlx::query("SELECT id, name, description, status, created_at FROM assets WHERE id = $1")
            .bind(asset_type_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .ok_or(WalletError::AssetNotFound)
            .and_then(map_asset_row)
    }

    async fn list_active_assets(&self) -> Result<Vec<Asset>, WalletError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, description, status, created_at
            FROM assets
            WHERE status = 'ACTIVE'
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.into_iter().map(map_asset_row).collect()
    }

    async fn provision_system_wallet(&self, asset_type_id: i64) -> Result<Wallet, WalletError> {
        self.get_asset(asset_type_id).await?;

        sqlx::query(
            r#"
            INSERT INTO wallets (user_id, asset_type_id, is_system, balance)
            VALUES (NULL, $1, TRUE, 0)
            ON CONFLICT (asset_type_id) WHERE is_system DO NOTHING
            "#,
        )
        .bind(asset_type_id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"
            SELECT id, user_id, asset_type_id, is_system, balance, created_at
            FROM wallets
            WHERE asset_type_id = $1 AND is_system
            "#,
        )
        .bind(asset_type_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?
        .ok_or(WalletError::SystemWalletMissing)
        .and_then(map_wallet_row)
    }

    async fn user_balances(&self, user_id: i64) -> Result<Vec<AssetBalance>, WalletError> {
        self.get_user(user_id).await?;

        let rows = sqlx::query(
            r#"
            SELECT a.name AS asset_type, w.balance
            FROM wallets w
            JOIN assets a ON a.id = w.asset_type_id
            WHERE w.user_id = $1 AND NOT w.is_system
            ORDER BY w.id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        if rows.is_empty() {
            return Err(WalletError::WalletNotFound);
        }

        rows.into_iter()
            .map(|row| {
                let de = |e: sqlx::Error| WalletError::Storage(e.to_string());
                Ok(AssetBalance {
                    asset_type: row.try_get("asset_type").map_err(de)?,
                    balance: row.try_get("balance").map_err(de)?,
                })
            })
            .collect()
    }

    async fn user_ledger(
        &self,
        user_id: i64,
        asset_type_id: Option<i64>,
        page: LedgerPage,
    ) -> Result<Vec<LedgerEntry>, WalletError> {
        let wallet_id: Option<i64> = match asset_type_id {
            Some(asset) => {
                sqlx::query_scalar(
                    r#"
                    SELECT id FROM wallets
                    WHERE user_id = $1 AND asset_type_id = $2 AND NOT is_system
                    ORDER BY id ASC
                    LIMIT 1
                    "#,
                )
                .bind(user_id)
                .bind(asset)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?
            }
            None => {
                sqlx::query_scalar(
                    r#"
                    SELECT id FROM wallets
                    WHERE user_id = $1 AND NOT is_system
                    ORDER BY id ASC
                    LIMIT 1
                    "#,
                )
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?
            }
        };

        let wallet_id = wallet_id.ok_or(WalletError::WalletNotFound)?;

        let rows = sqlx::query(
            r#"
            SELECT id, wallet_id, uuid, amount, entry_type, source_type,
                   reference_id, request_key, metadata, created_at
            FROM ledger_entries
            WHERE wallet_id = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(wallet_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.into_iter().map(map_entry_row).collect()
    }
}

// src/entry.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Side of a double-entry movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    Credit,
    Debit,
}

impl EntryType {
    /// The side written to the system wallet when this side is written to
    /// the user wallet. The pair always nets to zero.
    pub fn complement(&self) -> EntryType {
        match self {
            EntryType::Credit => EntryType::Debit,
            EntryType::Debit => EntryType::Credit,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Credit => "CREDIT",
            EntryType::Debit => "DEBIT",
        }
    }

    pub fn parse(s: &str) -> Option<EntryType> {
        match s {
            "CREDIT" => Some(EntryType::Credit),
            "DEBIT" => Some(EntryType::Debit),
            _ => None,
        }
    }
}

/// The three public operations. They differ only in the user-side entry
/// type and the source tag recorded on the ledger rows; one engine path
/// serves all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    TopUp,
    Bonus,
    Spend,
}

impl OperationKind {
    /// Entry type written to the user wallet.
    pub fn user_entry_type(&self) -> EntryType {
        match self {
            OperationKind::TopUp | OperationKind::Bonus => EntryType::Credit,
            OperationKind::Spend => EntryType::Debit,
        }
    }

    pub fn source_type(&self) -> &'static str {
        match self {
            OperationKind::TopUp => "TOP_UP",
            OperationKind::Bonus => "BONUS",
            OperationKind::Spend => "SPEND",
        }
    }
}

/// An immutable, append-only fact: one side of a double-entry movement.
/// Never updated or deleted after insert. `(wallet_id, request_key)` is
/// unique and is the idempotency guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub wallet_id: i64,
    pub uuid: Uuid,
    pub amount: i64,
    pub entry_type: EntryType,
    pub source_type: String,
    pub reference_id: String,
    pub request_key: String,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Both rows of one logical transaction, handed to the store for the
/// atomic pair insert. The two rows share `uuid`, `amount`, and the
/// bookkeeping fields; they differ in wallet and entry type.
#[derive(Debug, Clone)]
pub struct EntryPair {
    pub uuid: Uuid,
    pub user_wallet_id: i64,
    pub system_wallet_id: i64,
    pub amount: i64,
    pub user_entry_type: EntryType,
    pub source_type: &'static str,
    pub reference_id: String,
    pub request_key: String,
    pub metadata: Option<String>,
}

impl EntryPair {
    pub fn system_entry_type(&self) -> EntryType {
        self.user_entry_type.complement()
    }
}

/// Outcome of the pair insert. `Duplicate` carries the already-committed
/// user-side entry when a concurrent submission of the same request won
/// the race between the idempotency lookup and the insert.
#[derive(Debug)]
pub enum PairOutcome {
    Inserted,
    Duplicate(LedgerEntry),
}

/// Pagination window for the ledger read path.
#[derive(Debug, Clone, Copy)]
pub struct LedgerPage {
    pub limit: i64,
    pub offset: i64,
}

impl Default for LedgerPage {
    fn default() -> Self {
        Self {
            limit: 20,
            offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping_matches_the_double_entry_contract() {
        assert_eq!(OperationKind::TopUp.user_entry_type(), EntryType::Credit);
        assert_eq!(OperationKind::Bonus.user_entry_type(), EntryType::Credit);
        assert_eq!(OperationKind::Spend.user_entry_type(), EntryType::Debit);

        assert_eq!(OperationKind::TopUp.source_type(), "TOP_UP");
        assert_eq!(OperationKind::Bonus.source_type(), "BONUS");
        assert_eq!(OperationKind::Spend.source_type(), "SPEND");
    }

    #[test]
    fn complement_is_an_involution() {
        assert_eq!(EntryType::Credit.complement(), EntryType::Debit);
        assert_eq!(EntryType::Debit.complement(), EntryType::Credit);
        assert_eq!(EntryType::Credit.complement().complement(), EntryType::Credit);
    }

    #[test]
    fn entry_type_round_trips_through_storage_form() {
        assert_eq!(EntryType::parse("CREDIT"), Some(EntryType::Credit));
        assert_eq!(EntryType::parse("DEBIT"), Some(EntryType::Debit));
        assert_eq!(EntryType::parse("credit"), None);
    }

    #[test]
    fn pagination_defaults() {
        let page = LedgerPage::default();
        assert_eq!(page.limit, 20);
        assert_eq!(page.offset, 0);
    }
}

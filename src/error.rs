// src/error.rs
use std::fmt;

#[derive(Debug)]
pub enum WalletError {
    InvalidAmount,
    MetadataTooLong,
    UserNotFound,
    AssetNotFound,
    AssetInactive,
    WalletNotFound,
    SystemWalletMissing,
    InsufficientBalance,
    UserAlreadyExists,
    AssetAlreadyExists,
    Conflict(String),
    TransientConflict(String),
    Storage(String),
}

impl WalletError {
    /// Serialization failures and detected deadlocks. These are expected to
    /// succeed on a fresh attempt and are the only errors the retry
    /// coordinator acts on.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientConflict(_))
    }

    /// Errors caused by the request itself rather than the backend or its
    /// configuration.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidAmount
                | Self::MetadataTooLong
                | Self::UserNotFound
                | Self::AssetNotFound
                | Self::AssetInactive
                | Self::WalletNotFound
                | Self::InsufficientBalance
                | Self::UserAlreadyExists
                | Self::AssetAlreadyExists
                | Self::Conflict(_)
        )
    }
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAmount => write!(f, "Invalid amount"),
            Self::MetadataTooLong => write!(f, "Metadata is too long (max 500 characters)"),
            Self::UserNotFound => write!(f, "User not found"),
            Self::AssetNotFound => write!(f, "Asset not found"),
            Self::AssetInactive => write!(f, "Asset is not active"),
            Self::WalletNotFound => write!(f, "No wallets found for the user"),
            Self::SystemWalletMissing => write!(f, "System wallet not found"),
            Self::InsufficientBalance => write!(f, "Insufficient balance"),
            Self::UserAlreadyExists => write!(f, "User already exists"),
            Self::AssetAlreadyExists => write!(f, "Asset already exists"),
            Self::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Self::TransientConflict(msg) => write!(f, "Transient backend conflict: {}", msg),
            Self::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for WalletError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_conflicts_are_retryable() {
        assert!(WalletError::TransientConflict("deadlock detected".into()).is_transient());
        assert!(!WalletError::InsufficientBalance.is_transient());
        assert!(!WalletError::Storage("connection reset".into()).is_transient());
    }

    #[test]
    fn system_wallet_missing_is_a_server_error() {
        assert!(!WalletError::SystemWalletMissing.is_client_error());
        assert!(!WalletError::Storage("boom".into()).is_client_error());
        assert!(WalletError::InsufficientBalance.is_client_error());
    }
}

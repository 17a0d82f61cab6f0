// src/asset.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an asset. Only active assets accept transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetStatus {
    Active,
    Inactive,
}

impl AssetStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, AssetStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Active => "ACTIVE",
            AssetStatus::Inactive => "INACTIVE",
        }
    }

    pub fn parse(s: &str) -> Option<AssetStatus> {
        match s {
            "ACTIVE" => Some(AssetStatus::Active),
            "INACTIVE" => Some(AssetStatus::Inactive),
            _ => None,
        }
    }
}

/// A named asset type. Owned by asset management; the engine read-locks the
/// row for the duration of a transaction so a deactivation cannot land in
/// the middle of one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: AssetStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_storage_form() {
        assert_eq!(AssetStatus::parse("ACTIVE"), Some(AssetStatus::Active));
        assert_eq!(AssetStatus::parse("INACTIVE"), Some(AssetStatus::Inactive));
        assert_eq!(AssetStatus::parse("active"), None);
        assert_eq!(AssetStatus::Active.as_str(), "ACTIVE");
        assert_eq!(AssetStatus::Inactive.as_str(), "INACTIVE");
    }

    #[test]
    fn only_active_accepts_transactions() {
        assert!(AssetStatus::Active.is_active());
        assert!(!AssetStatus::Inactive.is_active());
    }
}

// tests/integration_tests.rs
use coffer::{
    AssetStatus, BonusRequest, EntryType, LedgerPage, ReceiptStatus, SpendRequest, TopUpRequest,
    WalletError, WalletSystem, adapters::MemoryAdapter,
};
use std::sync::Arc;

async fn setup() -> (Arc<WalletSystem>, i64, i64) {
    let system = Arc::new(WalletSystem::new(Box::new(MemoryAdapter::new())));

    let user = system
        .store()
        .create_user("Ada", "ada@example.com")
        .await
        .unwrap();
    let asset = system
        .store()
        .create_asset("Gold Coins", Some("premium currency"), AssetStatus::Active)
        .await
        .unwrap();
    system
        .store()
        .provision_system_wallet(asset.id)
        .await
        .unwrap();

    (system, user.id, asset.id)
}

fn topup(user_id: i64, asset_type_id: i64, amount: i64, key: &str) -> TopUpRequest {
    TopUpRequest {
        user_id,
        asset_type_id,
        amount,
        request_key: key.to_string(),
        payment_reference: format!("PAY_{key}"),
        metadata: None,
    }
}

fn spend(user_id: i64, asset_type_id: i64, amount: i64, key: &str) -> SpendRequest {
    SpendRequest {
        user_id,
        asset_type_id,
        amount,
        request_key: key.to_string(),
        order_reference: format!("ORDER_{key}"),
        metadata: None,
    }
}

/// Current system wallet balance; provisioning is idempotent and returns
/// the existing row.
async fn system_balance(system: &WalletSystem, asset_type_id: i64) -> i64 {
    system
        .store()
        .provision_system_wallet(asset_type_id)
        .await
        .unwrap()
        .balance
}

#[tokio::test]
async fn test_topup_creates_wallet_lazily() {
    let (system, user, asset) = setup().await;

    let receipt = system
        .engine()
        .top_up(topup(user, asset, 100, "k1"))
        .await
        .unwrap();

    assert_eq!(receipt.status, ReceiptStatus::Success);
    assert_eq!(receipt.amount, 100);
    assert_eq!(receipt.balance_after, 100);

    // The system wallet absorbed the opposite side.
    assert_eq!(system_balance(&system, asset).await, -100);

    let balances = system.store().user_balances(user).await.unwrap();
    assert_eq!(balances.len(), 1);
    assert_eq!(balances[0].asset_type, "Gold Coins");
    assert_eq!(balances[0].balance, 100);
}

#[tokio::test]
async fn test_duplicate_request_is_a_noop() {
    let (system, user, asset) = setup().await;

    let first = system
        .engine()
        .top_up(topup(user, asset, 100, "k1"))
        .await
        .unwrap();
    let replay = system
        .engine()
        .top_up(topup(user, asset, 100, "k1"))
        .await
        .unwrap();

    assert_eq!(first, replay);
    assert_eq!(system_balance(&system, asset).await, -100);

    let entries = system
        .store()
        .user_ledger(user, Some(asset), LedgerPage::default())
        .await
        .unwrap();
    assert_eq!(entries.len(), 1, "exactly one pair committed");
}

#[tokio::test]
async fn test_duplicate_reports_current_balance() {
    let (system, user, asset) = setup().await;

    system
        .engine()
        .top_up(topup(user, asset, 100, "k1"))
        .await
        .unwrap();
    system
        .engine()
        .spend(spend(user, asset, 60, "k2"))
        .await
        .unwrap();

    // The replay answers with the original amount but today's balance.
    let replay = system
        .engine()
        .top_up(topup(user, asset, 100, "k1"))
        .await
        .unwrap();
    assert_eq!(replay.amount, 100);
    assert_eq!(replay.balance_after, 40);
}

#[tokio::test]
async fn test_spend_rejects_overdraft() {
    let (system, user, asset) = setup().await;

    system
        .engine()
        .top_up(topup(user, asset, 100, "k1"))
        .await
        .unwrap();

    let result = system.engine().spend(spend(user, asset, 150, "k2")).await;
    assert!(matches!(result, Err(WalletError::InsufficientBalance)));

    // Nothing moved.
    let balances = system.store().user_balances(user).await.unwrap();
    assert_eq!(balances[0].balance, 100);
    assert_eq!(system_balance(&system, asset).await, -100);
}

#[tokio::test]
async fn test_spend_debits_both_sides() {
    let (system, user, asset) = setup().await;

    system
        .engine()
        .top_up(topup(user, asset, 100, "k1"))
        .await
        .unwrap();
    let receipt = system
        .engine()
        .spend(spend(user, asset, 60, "k2"))
        .await
        .unwrap();

    assert_eq!(receipt.amount, 60);
    assert_eq!(receipt.balance_after, 40);
    assert_eq!(system_balance(&system, asset).await, -40);
}

#[tokio::test]
async fn test_failed_spend_rolls_back_lazy_wallet() {
    let (system, user, asset) = setup().await;

    // No wallet exists yet; the attempt creates one, fails, and the
    // rollback must take the wallet with it.
    let result = system.engine().spend(spend(user, asset, 10, "k1")).await;
    assert!(matches!(result, Err(WalletError::InsufficientBalance)));

    let balances = system.store().user_balances(user).await;
    assert!(matches!(balances, Err(WalletError::WalletNotFound)));
}

#[tokio::test]
async fn test_inactive_asset_rejects_all_operations() {
    let (system, user, _) = setup().await;

    let frozen = system
        .store()
        .create_asset("Frozen Coins", None, AssetStatus::Inactive)
        .await
        .unwrap();
    system
        .store()
        .provision_system_wallet(frozen.id)
        .await
        .unwrap();

    let result = system
        .engine()
        .top_up(topup(user, frozen.id, 100, "k1"))
        .await;
    assert!(matches!(result, Err(WalletError::AssetInactive)));

    let result = system.engine().spend(spend(user, frozen.id, 10, "k2")).await;
    assert!(matches!(result, Err(WalletError::AssetInactive)));
}

#[tokio::test]
async fn test_missing_references() {
    let (system, user, asset) = setup().await;

    let result = system.engine().top_up(topup(999, asset, 100, "k1")).await;
    assert!(matches!(result, Err(WalletError::UserNotFound)));

    let result = system.engine().top_up(topup(user, 999, 100, "k2")).await;
    assert!(matches!(result, Err(WalletError::AssetNotFound)));
}

#[tokio::test]
async fn test_missing_system_wallet_is_fatal() {
    let system = Arc::new(WalletSystem::new(Box::new(MemoryAdapter::new())));

    let user = system
        .store()
        .create_user("Ada", "ada@example.com")
        .await
        .unwrap();
    let asset = system
        .store()
        .create_asset("Gold Coins", None, AssetStatus::Active)
        .await
        .unwrap();
    // No provisioning on purpose.

    let result = system
        .engine()
        .top_up(topup(user.id, asset.id, 100, "k1"))
        .await;
    assert!(matches!(result, Err(WalletError::SystemWalletMissing)));
}

#[tokio::test]
async fn test_amount_validation() {
    let (system, user, asset) = setup().await;

    let result = system.engine().top_up(topup(user, asset, 0, "k1")).await;
    assert!(matches!(result, Err(WalletError::InvalidAmount)));

    let result = system.engine().top_up(topup(user, asset, -5, "k2")).await;
    assert!(matches!(result, Err(WalletError::InvalidAmount)));
}

#[tokio::test]
async fn test_metadata_length_bound() {
    let (system, user, asset) = setup().await;

    let mut request = topup(user, asset, 100, "k1");
    request.metadata = Some("x".repeat(501));
    let result = system.engine().top_up(request).await;
    assert!(matches!(result, Err(WalletError::MetadataTooLong)));

    let mut request = topup(user, asset, 100, "k2");
    request.metadata = Some("x".repeat(500));
    system.engine().top_up(request).await.unwrap();
}

#[tokio::test]
async fn test_bonus_and_spend_record_their_source() {
    let (system, user, asset) = setup().await;

    system
        .engine()
        .bonus(BonusRequest {
            user_id: user,
            asset_type_id: asset,
            amount: 50,
            request_key: "b1".to_string(),
            reason: "REFERRAL_BONUS".to_string(),
            metadata: Some("welcome".to_string()),
        })
        .await
        .unwrap();
    system
        .engine()
        .spend(spend(user, asset, 20, "s1"))
        .await
        .unwrap();

    let entries = system
        .store()
        .user_ledger(user, Some(asset), LedgerPage::default())
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);

    assert_eq!(entries[0].source_type, "BONUS");
    assert_eq!(entries[0].entry_type, EntryType::Credit);
    assert_eq!(entries[0].reference_id, "REFERRAL_BONUS");
    assert_eq!(entries[0].metadata.as_deref(), Some("welcome"));

    assert_eq!(entries[1].source_type, "SPEND");
    assert_eq!(entries[1].entry_type, EntryType::Debit);
    assert_eq!(entries[1].reference_id, "ORDER_s1");
}

#[tokio::test]
async fn test_balance_conservation() {
    let (system, user, asset) = setup().await;

    system
        .engine()
        .top_up(topup(user, asset, 100, "k1"))
        .await
        .unwrap();
    system
        .engine()
        .bonus(BonusRequest {
            user_id: user,
            asset_type_id: asset,
            amount: 30,
            request_key: "k2".to_string(),
            reason: "PROMO".to_string(),
            metadata: None,
        })
        .await
        .unwrap();
    system
        .engine()
        .spend(spend(user, asset, 45, "k3"))
        .await
        .unwrap();

    let user_balance = system.store().user_balances(user).await.unwrap()[0].balance;
    assert_eq!(user_balance, 85);
    assert_eq!(user_balance + system_balance(&system, asset).await, 0);
}

#[tokio::test]
async fn test_balance_cache_matches_ledger_sum() {
    let (system, user, asset) = setup().await;

    system
        .engine()
        .top_up(topup(user, asset, 100, "k1"))
        .await
        .unwrap();
    system
        .engine()
        .spend(spend(user, asset, 60, "k2"))
        .await
        .unwrap();
    system
        .engine()
        .top_up(topup(user, asset, 25, "k3"))
        .await
        .unwrap();
    // A failed and a replayed operation must not skew the sum.
    let _ = system.engine().spend(spend(user, asset, 1000, "k4")).await;
    system
        .engine()
        .top_up(topup(user, asset, 25, "k3"))
        .await
        .unwrap();

    let entries = system
        .store()
        .user_ledger(
            user,
            Some(asset),
            LedgerPage {
                limit: 100,
                offset: 0,
            },
        )
        .await
        .unwrap();

    let signed_sum: i64 = entries
        .iter()
        .map(|e| match e.entry_type {
            EntryType::Credit => e.amount,
            EntryType::Debit => -e.amount,
        })
        .sum();

    let balance = system.store().user_balances(user).await.unwrap()[0].balance;
    assert_eq!(signed_sum, balance);
    assert_eq!(balance, 65);
}

#[tokio::test]
async fn test_concurrent_duplicates_commit_once() {
    let (system, user, asset) = setup().await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let system = Arc::clone(&system);
        handles.push(tokio::spawn(async move {
            system.engine().top_up(topup(user, asset, 100, "dup")).await
        }));
    }

    let mut receipts = Vec::new();
    for handle in handles {
        receipts.push(handle.await.unwrap().unwrap());
    }

    // All callers see the same committed result.
    for receipt in &receipts {
        assert_eq!(receipt.amount, 100);
        assert_eq!(receipt.balance_after, 100);
    }

    let entries = system
        .store()
        .user_ledger(user, Some(asset), LedgerPage::default())
        .await
        .unwrap();
    assert_eq!(entries.len(), 1, "exactly one pair committed");
    assert_eq!(system_balance(&system, asset).await, -100);
}

#[tokio::test]
async fn test_concurrent_spends_double_spend_protection() {
    let (system, user, asset) = setup().await;

    system
        .engine()
        .top_up(topup(user, asset, 100, "k0"))
        .await
        .unwrap();

    let s1 = Arc::clone(&system);
    let s2 = Arc::clone(&system);
    let handle1 =
        tokio::spawn(async move { s1.engine().spend(spend(user, asset, 100, "k1")).await });
    let handle2 =
        tokio::spawn(async move { s2.engine().spend(spend(user, asset, 100, "k2")).await });

    let (result1, result2) = tokio::join!(handle1, handle2);
    let result1 = result1.unwrap();
    let result2 = result2.unwrap();

    let outcomes = [&result1, &result2];
    let succeeded = outcomes.iter().filter(|r| r.is_ok()).count();
    let failed = outcomes
        .iter()
        .filter(|r| matches!(r, Err(WalletError::InsufficientBalance)))
        .count();

    assert_eq!(succeeded, 1, "exactly one spend should succeed");
    assert_eq!(failed, 1, "exactly one spend should be rejected");

    let balance = system.store().user_balances(user).await.unwrap()[0].balance;
    assert_eq!(balance, 0);
    assert_eq!(system_balance(&system, asset).await, 0);
}

#[tokio::test]
async fn test_request_key_reuse_across_users_conflicts() {
    let (system, user_a, asset) = setup().await;
    let user_b = system
        .store()
        .create_user("Grace", "grace@example.com")
        .await
        .unwrap();

    system
        .engine()
        .top_up(topup(user_a, asset, 100, "shared-key"))
        .await
        .unwrap();

    // Same key from another user collides on the shared system wallet row
    // and is not a replay of anything this wallet committed.
    let result = system
        .engine()
        .top_up(topup(user_b.id, asset, 100, "shared-key"))
        .await;
    assert!(matches!(result, Err(WalletError::Conflict(_))));
}

#[tokio::test]
async fn test_ledger_pagination_is_oldest_first() {
    let (system, user, asset) = setup().await;

    for (i, amount) in [10, 20, 30].into_iter().enumerate() {
        system
            .engine()
            .top_up(topup(user, asset, amount, &format!("k{i}")))
            .await
            .unwrap();
    }

    let first_page = system
        .store()
        .user_ledger(
            user,
            Some(asset),
            LedgerPage {
                limit: 2,
                offset: 0,
            },
        )
        .await
        .unwrap();
    assert_eq!(first_page.len(), 2);
    assert_eq!(first_page[0].amount, 10);
    assert_eq!(first_page[1].amount, 20);

    let second_page = system
        .store()
        .user_ledger(
            user,
            Some(asset),
            LedgerPage {
                limit: 2,
                offset: 2,
            },
        )
        .await
        .unwrap();
    assert_eq!(second_page.len(), 1);
    assert_eq!(second_page[0].amount, 30);
}

#[tokio::test]
async fn test_ledger_requires_a_wallet() {
    let (system, user, asset) = setup().await;

    let result = system
        .store()
        .user_ledger(user, Some(asset), LedgerPage::default())
        .await;
    assert!(matches!(result, Err(WalletError::WalletNotFound)));

    let result = system.store().user_balances(999).await;
    assert!(matches!(result, Err(WalletError::UserNotFound)));
}

#[tokio::test]
async fn test_user_service_uniqueness_and_normalization() {
    let (system, _, _) = setup().await;

    let result = system.store().create_user("Imposter", " ADA@Example.com ").await;
    assert!(matches!(result, Err(WalletError::UserAlreadyExists)));

    let found = system
        .store()
        .find_user_by_email("ADA@EXAMPLE.COM")
        .await
        .unwrap();
    assert_eq!(found.name, "Ada");
}

#[tokio::test]
async fn test_asset_service_uniqueness_and_listing() {
    let (system, _, _) = setup().await;

    let result = system
        .store()
        .create_asset("Gold Coins", None, AssetStatus::Active)
        .await;
    assert!(matches!(result, Err(WalletError::AssetAlreadyExists)));

    system
        .store()
        .create_asset("Retired Coins", None, AssetStatus::Inactive)
        .await
        .unwrap();

    let active = system.store().list_active_assets().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].name, "Gold Coins");
}

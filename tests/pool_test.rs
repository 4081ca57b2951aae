mod common;

use bitcoin::Amount;
use chrono::{Duration, Utc};
use common::{harness_at_tip, harness_with_config, test_config, XPUB_A, XPUB_B};
use paywatch::chain::ChainError;
use paywatch::store::models::AddressStatus;
use paywatch::{PaymentError, Store};

#[tokio::test]
async fn test_first_generation_starts_at_index_zero() {
    let h = harness_at_tip(800_000);
    let wallet = h.store.get_or_create_wallet(XPUB_A).await.unwrap();
    assert_eq!(wallet.highest_derived_index, None);

    let batch = h.pool.generate_addresses(&wallet, 2).await.unwrap();

    let indices: Vec<u32> = batch.created.iter().map(|a| a.derivation_index).collect();
    assert_eq!(indices, vec![0, 1]);
    assert!(batch.orphans_adopted.is_empty());

    let wallet = h.store.wallet(wallet.id).await.unwrap().unwrap();
    assert_eq!(wallet.highest_derived_index, Some(1));
}

#[tokio::test]
async fn test_repeated_generation_never_reuses_an_index() {
    let h = harness_at_tip(800_000);
    let wallet = h.store.get_or_create_wallet(XPUB_A).await.unwrap();

    let first = h.pool.generate_addresses(&wallet, 2).await.unwrap();
    let wallet = h.store.wallet(wallet.id).await.unwrap().unwrap();
    let second = h.pool.generate_addresses(&wallet, 3).await.unwrap();

    let mut indices: Vec<u32> = first
        .created
        .iter()
        .chain(second.created.iter())
        .map(|a| a.derivation_index)
        .collect();
    let before_dedup = indices.len();
    indices.sort();
    indices.dedup();
    assert_eq!(indices.len(), before_dedup);
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);

    let wallet = h.store.wallet(wallet.id).await.unwrap().unwrap();
    assert_eq!(wallet.highest_derived_index, Some(4));
}

#[tokio::test]
async fn test_generation_resumes_past_existing_records_after_lost_cursor() {
    let h = harness_at_tip(800_000);
    let wallet = h.store.get_or_create_wallet(XPUB_A).await.unwrap();
    h.pool.generate_addresses(&wallet, 3).await.unwrap();

    // Cursor knowledge lost: same wallet record with a stale cursor
    let stale = wallet.clone();
    let batch = h.pool.generate_addresses(&stale, 1).await.unwrap();

    // Indices 0..2 are skipped silently, the new record lands at 3
    assert_eq!(batch.created.len(), 1);
    assert_eq!(batch.created[0].derivation_index, 3);

    let wallet = h.store.wallet(wallet.id).await.unwrap().unwrap();
    assert_eq!(wallet.highest_derived_index, Some(3));
}

#[tokio::test]
async fn test_orphaned_address_is_adopted_without_counting() {
    let h = harness_at_tip(800_000);
    let wallet_x = h.store.get_or_create_wallet(XPUB_A).await.unwrap();
    let wallet_y = h.store.get_or_create_wallet(XPUB_B).await.unwrap();

    // Wallet Y holds the record for X's index-0 address, as happens when a
    // wallet row is lost and re-created while its addresses survive
    let stray_raw = h.deriver.derive(XPUB_A, 0).unwrap().to_string();
    let stray = h
        .store
        .create_address(wallet_y.id, 0, &stray_raw)
        .await
        .unwrap();

    let batch = h.pool.generate_addresses(&wallet_x, 1).await.unwrap();

    // The stray is re-parented, the quota is filled by the next index
    assert_eq!(batch.orphans_adopted.len(), 1);
    assert_eq!(batch.orphans_adopted[0].id, stray.id);
    assert_eq!(batch.orphans_adopted[0].wallet_id, wallet_x.id);
    assert_eq!(batch.created.len(), 1);
    assert_eq!(batch.created[0].derivation_index, 1);

    let wallet_x = h.store.wallet(wallet_x.id).await.unwrap().unwrap();
    assert_eq!(wallet_x.highest_derived_index, Some(1));

    let adopted = h.store.address(stray.id).await.unwrap().unwrap();
    assert_eq!(adopted.wallet_id, wallet_x.id);
}

#[tokio::test]
async fn test_ensure_unused_is_satisfied_by_clean_existing_addresses() {
    let h = harness_at_tip(800_000);
    let wallet = h.store.get_or_create_wallet(XPUB_A).await.unwrap();
    let batch = h.pool.generate_addresses(&wallet, 2).await.unwrap();
    for address in &batch.created {
        h.store
            .set_address_status(address.id, AddressStatus::Unused)
            .await
            .unwrap();
    }

    let reports = h
        .pool
        .ensure_unused(std::slice::from_ref(&wallet), 2)
        .await
        .unwrap();

    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.assumed_unused_before, 2);
    assert_eq!(report.confirmed_unused_after, 2);
    assert!(report.newly_minted.is_empty());
    assert!(report.unexpectedly_used.is_empty());
    assert!(!report.exhausted);

    // Nothing new was derived
    let wallet = h.store.wallet(wallet.id).await.unwrap().unwrap();
    assert_eq!(wallet.highest_derived_index, Some(1));
}

#[tokio::test]
async fn test_ensure_unused_replaces_externally_spent_addresses() {
    let h = harness_at_tip(800_000);
    let wallet = h.store.get_or_create_wallet(XPUB_A).await.unwrap();
    let batch = h.pool.generate_addresses(&wallet, 2).await.unwrap();
    for address in &batch.created {
        h.store
            .set_address_status(address.id, AddressStatus::Unused)
            .await
            .unwrap();
    }

    // The index-0 address was paid outside this system's view
    let spent = &batch.created[0];
    h.chain.add_payment(
        &spent.raw_address,
        "ext-spend",
        Amount::from_sat(5_000),
        Some(799_000),
    );

    let reports = h
        .pool
        .ensure_unused(std::slice::from_ref(&wallet), 2)
        .await
        .unwrap();
    let report = &reports[0];

    assert_eq!(report.unexpectedly_used, vec![spent.id]);
    assert_eq!(report.confirmed_unused_after, 2);
    assert_eq!(report.newly_minted.len(), 1);
    assert_eq!(report.newly_minted[0].derivation_index, 2);
    assert_eq!(report.newly_minted[0].status, AddressStatus::Unused);

    let spent = h.store.address(spent.id).await.unwrap().unwrap();
    assert_eq!(spent.status, AddressStatus::Used);
}

#[tokio::test]
async fn test_ensure_unused_propagates_rate_limit_unchanged() {
    let h = harness_at_tip(800_000);
    let wallet = h.store.get_or_create_wallet(XPUB_A).await.unwrap();
    let batch = h.pool.generate_addresses(&wallet, 1).await.unwrap();
    h.store
        .set_address_status(batch.created[0].id, AddressStatus::Unused)
        .await
        .unwrap();

    let reset_at = Utc::now() + Duration::minutes(7);
    h.chain.fail_next(ChainError::RateLimited {
        reset_at: Some(reset_at),
    });

    let err = h
        .pool
        .ensure_unused(std::slice::from_ref(&wallet), 1)
        .await
        .unwrap_err();
    match err {
        PaymentError::RateLimited { reset_at: got } => assert_eq!(got, Some(reset_at)),
        other => panic!("expected RateLimited, got {:?}", other),
    }
}

#[tokio::test]
async fn test_convergence_walks_past_a_run_of_used_addresses() {
    let h = harness_at_tip(800_000);
    let wallet = h.store.get_or_create_wallet(XPUB_A).await.unwrap();

    // The first five derivable addresses already carry funds elsewhere
    for index in 0..5 {
        let raw = h.deriver.derive(XPUB_A, index).unwrap().to_string();
        h.chain.add_payment(
            &raw,
            &format!("prior-{}", index),
            Amount::from_sat(1_000),
            Some(790_000),
        );
    }

    let reports = h
        .pool
        .ensure_unused(std::slice::from_ref(&wallet), 2)
        .await
        .unwrap();
    let report = &reports[0];

    assert_eq!(report.unexpectedly_used.len(), 5);
    assert_eq!(report.confirmed_unused_after, 2);
    let minted: Vec<u32> = report
        .newly_minted
        .iter()
        .map(|a| a.derivation_index)
        .collect();
    assert_eq!(minted, vec![5, 6]);
}

#[tokio::test]
async fn test_convergence_cap_reports_exhaustion_instead_of_spinning() {
    let mut config = test_config();
    config.max_derivations_per_run = 3;
    let h = harness_with_config(800_000, config);
    let wallet = h.store.get_or_create_wallet(XPUB_A).await.unwrap();

    // Every address the cap allows us to reach is already used
    for index in 0..10 {
        let raw = h.deriver.derive(XPUB_A, index).unwrap().to_string();
        h.chain.add_payment(
            &raw,
            &format!("prior-{}", index),
            Amount::from_sat(1_000),
            Some(790_000),
        );
    }

    let reports = h
        .pool
        .ensure_unused(std::slice::from_ref(&wallet), 2)
        .await
        .unwrap();
    let report = &reports[0];

    assert!(report.exhausted);
    assert!(report.confirmed_unused_after < 2);

    // A later run resumes from the persisted cursor and finishes the job
    let wallet = h.store.wallet(wallet.id).await.unwrap().unwrap();
    assert_eq!(wallet.highest_derived_index, Some(2));

    let reports = h
        .pool
        .ensure_unused(std::slice::from_ref(&wallet), 2)
        .await
        .unwrap();
    assert!(reports[0].exhausted);
    let wallet = h.store.wallet(wallet.id).await.unwrap().unwrap();
    assert_eq!(wallet.highest_derived_index, Some(5));
}

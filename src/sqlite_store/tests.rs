use super::*;
use crate::policy::ActionKind;

async fn open_store() -> (tempfile::TempDir, SqliteStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("credits.sqlite"));
    store.init().await.expect("init");
    (dir, store)
}

fn attempt(account_id: &str, outcome: AttemptOutcome) -> NewConsumption {
    NewConsumption {
        account_id: account_id.to_string(),
        action: ActionKind::GenerateAppreciation,
        resource_id: None,
        requested_cost: 1,
        actual_cost: if outcome == AttemptOutcome::Success { 1 } else { 0 },
        was_free_regeneration: false,
        outcome,
        request_id: None,
        detail: serde_json::json!({}),
    }
}

#[tokio::test]
async fn create_account_is_first_writer_wins() {
    let (_dir, store) = open_store().await;

    assert!(store.create_account("a", 2, 0).await.expect("create"));
    assert!(!store.create_account("a", 99, 99).await.expect("recreate"));

    let record = store.get_balance("a").await.expect("read").expect("row");
    assert_eq!(record.free_remaining, 2);
    assert_eq!(record.paid_remaining, 0);
    assert!(record.regen_counters.is_empty());
}

#[tokio::test]
async fn get_balance_returns_none_for_missing_account() {
    let (_dir, store) = open_store().await;
    assert!(store.get_balance("ghost").await.expect("read").is_none());
}

#[tokio::test]
async fn deduct_if_unchanged_applies_once_per_observed_snapshot() {
    let (_dir, store) = open_store().await;
    store.create_account("a", 1, 0).await.expect("create");

    // Two writers that both observed free=1 paid=0: only the first lands.
    assert!(store.deduct_if_unchanged("a", 1, 0, 1, 0).await.expect("first"));
    assert!(!store.deduct_if_unchanged("a", 1, 0, 1, 0).await.expect("second"));

    let record = store.get_balance("a").await.expect("read").expect("row");
    assert_eq!(record.free_remaining, 0);
    assert_eq!(record.paid_remaining, 0);
}

#[tokio::test]
async fn deduct_if_unchanged_guards_the_paid_tier_too() {
    let (_dir, store) = open_store().await;
    store.create_account("a", 0, 3).await.expect("create");

    assert!(store.deduct_if_unchanged("a", 0, 3, 0, 2).await.expect("first"));
    // The stale snapshot saw paid=3; the row now holds paid=1.
    assert!(!store.deduct_if_unchanged("a", 0, 3, 0, 2).await.expect("stale"));

    let record = store.get_balance("a").await.expect("read").expect("row");
    assert_eq!(record.paid_remaining, 1);
}

#[tokio::test]
async fn regen_increment_stops_at_limit() {
    let (_dir, store) = open_store().await;
    store.create_account("a", 0, 0).await.expect("create");

    for _ in 0..3 {
        assert!(
            store
                .increment_regen_if_below("a", "res-1", RegenKind::Appreciation, 3)
                .await
                .expect("increment")
        );
    }
    assert!(
        !store
            .increment_regen_if_below("a", "res-1", RegenKind::Appreciation, 3)
            .await
            .expect("capped")
    );

    let record = store.get_balance("a").await.expect("read").expect("row");
    assert_eq!(record.regen_used("res-1", RegenKind::Appreciation), 3);
    assert_eq!(record.regen_used("res-1", RegenKind::Summary), 0);
}

#[tokio::test]
async fn apply_grant_is_idempotent_per_reference() {
    let (_dir, store) = open_store().await;
    store.create_account("a", 0, 0).await.expect("create");

    let first = store
        .apply_grant("a", "promo-ABC", 10, GrantKind::Paid, GrantSource::Promo)
        .await
        .expect("first");
    assert!(first.applied);
    assert_eq!(first.balance, Balance { free: 0, paid: 10 });

    let second = store
        .apply_grant("a", "promo-ABC", 10, GrantKind::Paid, GrantSource::Promo)
        .await
        .expect("second");
    assert!(!second.applied);
    assert_eq!(second.balance, Balance { free: 0, paid: 10 });

    let grants = store.list_grants("a").await.expect("list");
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].external_reference, "promo-ABC");
    assert_eq!(grants[0].amount, 10);
}

#[tokio::test]
async fn apply_grant_targets_the_requested_tier() {
    let (_dir, store) = open_store().await;
    store.create_account("a", 0, 0).await.expect("create");

    store
        .apply_grant("a", "signup", 5, GrantKind::Free, GrantSource::Signup)
        .await
        .expect("free grant");
    store
        .apply_grant("a", "cs_123", 20, GrantKind::Paid, GrantSource::Payment)
        .await
        .expect("paid grant");

    let record = store.get_balance("a").await.expect("read").expect("row");
    assert_eq!(record.free_remaining, 5);
    assert_eq!(record.paid_remaining, 20);
}

#[tokio::test]
async fn apply_grant_requires_an_account_row() {
    let (_dir, store) = open_store().await;
    let err = store
        .apply_grant("ghost", "promo-ABC", 10, GrantKind::Paid, GrantSource::Promo)
        .await;
    assert!(matches!(
        err,
        Err(SqliteStoreError::AccountNotFound { .. })
    ));
}

#[tokio::test]
async fn grant_reference_counts_span_accounts() {
    let (_dir, store) = open_store().await;
    store.create_account("a", 0, 0).await.expect("create a");
    store.create_account("b", 0, 0).await.expect("create b");

    store
        .apply_grant("a", "promo-X", 1, GrantKind::Paid, GrantSource::Promo)
        .await
        .expect("grant a");
    store
        .apply_grant("b", "promo-X", 1, GrantKind::Paid, GrantSource::Promo)
        .await
        .expect("grant b");

    assert_eq!(
        store
            .count_grants_for_reference("promo-X")
            .await
            .expect("global"),
        2
    );
    assert_eq!(
        store
            .count_grants_for_account_reference("a", "promo-X")
            .await
            .expect("per account"),
        1
    );
}

#[tokio::test]
async fn consumption_log_is_append_only_and_ordered() {
    let (_dir, store) = open_store().await;
    store.create_account("a", 2, 0).await.expect("create");

    store
        .append_consumption(attempt("a", AttemptOutcome::Success))
        .await
        .expect("append 1");
    store
        .append_consumption(attempt("a", AttemptOutcome::NoCredits))
        .await
        .expect("append 2");

    let records = store.list_consumptions("a", 10).await.expect("list");
    assert_eq!(records.len(), 2);
    // Newest first.
    assert_eq!(records[0].outcome, AttemptOutcome::NoCredits);
    assert_eq!(records[1].outcome, AttemptOutcome::Success);
    assert!(records[0].id > records[1].id);
}

#[tokio::test]
async fn duplicate_request_ids_do_not_duplicate_audit_rows() {
    let (_dir, store) = open_store().await;
    store.create_account("a", 2, 0).await.expect("create");

    let mut record = attempt("a", AttemptOutcome::Success);
    record.request_id = Some("req-1".to_string());
    store
        .append_consumption(record.clone())
        .await
        .expect("append");
    store.append_consumption(record).await.expect("replay append");

    let records = store.list_consumptions("a", 10).await.expect("list");
    assert_eq!(records.len(), 1);

    let found = store
        .find_successful_consumption("req-1")
        .await
        .expect("find")
        .expect("row");
    assert_eq!(found.actual_cost, 1);
    assert!(
        store
            .find_successful_consumption("req-2")
            .await
            .expect("find none")
            .is_none()
    );
}

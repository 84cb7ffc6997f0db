mod common;

use assert_matches::assert_matches;
use common::TestApp;
use futures::future::join_all;
use petcare_core::{errors::ServiceError, services::inventory::StockLine};
use rust_decimal_macros::dec;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_reservations_for_the_last_unit_never_both_succeed() {
    let app = TestApp::new().await;
    let v = app.variant("LAST", dec!(5)).await;
    app.stock(v.id, "default", 1).await;

    let first = app.services.ledger.clone();
    let second = app.services.ledger.clone();
    let lines = vec![StockLine::new(v.id, "default", 1)];
    let lines2 = lines.clone();

    let (a, b) = tokio::join!(
        tokio::spawn(async move { first.reserve(&lines, Some("order-a")).await }),
        tokio::spawn(async move { second.reserve(&lines2, Some("order-b")).await }),
    );
    let results = [a.unwrap(), b.unwrap()];

    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    let failure = results.iter().find(|r| r.is_err()).unwrap();
    assert_matches!(
        failure,
        Err(ServiceError::InsufficientInventory { available: 0, .. })
    );

    let item = app.stock_item(v.id, "default").await;
    assert_eq!(item.quantity, 1);
    assert_eq!(item.reserved_quantity, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_concurrent_reservations_never_oversell() {
    let app = TestApp::new().await;
    let v = app.variant("HOT", dec!(5)).await;
    app.stock(v.id, "default", 5).await;

    let tasks = (0..12).map(|i| {
        let ledger = app.services.ledger.clone();
        let line = StockLine::new(v.id, "default", 1);
        tokio::spawn(async move {
            ledger
                .reserve(&[line], Some(&format!("order-{}", i)))
                .await
        })
    });
    let results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 5);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, ServiceError::InsufficientInventory { .. })));

    let item = app.stock_item(v.id, "default").await;
    assert_eq!(item.reserved_quantity, 5);
    assert!(item.reserved_quantity <= item.quantity);

    let report = app.services.reports.reconcile().await.unwrap();
    assert!(report.is_clean());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_reservations_across_connections_fail_cleanly() {
    let app = TestApp::file_backed(8).await;
    let v = app.variant("LAST", dec!(5)).await;
    app.stock(v.id, "default", 1).await;

    let tasks = (0..8).map(|i| {
        let ledger = app.services.ledger.clone();
        let line = StockLine::new(v.id, "default", 1);
        tokio::spawn(async move {
            ledger
                .reserve(&[line], Some(&format!("order-{}", i)))
                .await
        })
    });
    let results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(
            matches!(err, ServiceError::InsufficientInventory { .. }) || err.is_retryable(),
            "unexpected error: {} ({})",
            err,
            err.code()
        );
    }

    let item = app.stock_item(v.id, "default").await;
    assert_eq!(item.quantity, 1);
    assert_eq!(item.reserved_quantity, 1);
    assert!(app.services.reports.reconcile().await.unwrap().is_clean());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn receipts_across_connections_all_land() {
    let app = TestApp::file_backed(4).await;
    let v = app.variant("BULK", dec!(2)).await;
    app.stock(v.id, "default", 1).await;

    let variant_id = v.id;
    let tasks = (0..10).map(|_| {
        let ledger = app.services.ledger.clone();
        tokio::spawn(async move {
            ledger
                .receive(&[StockLine::new(variant_id, "default", 3)], Some("delivery"))
                .await
        })
    });
    for joined in join_all(tasks).await {
        joined.unwrap().unwrap();
    }

    let item = app.stock_item(v.id, "default").await;
    assert_eq!(item.quantity, 31);
    assert!(app.services.reports.reconcile().await.unwrap().is_clean());
}

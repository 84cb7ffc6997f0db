mod common;

use assert_matches::assert_matches;
use common::TestApp;
use petcare_core::{
    entities::{
        order::{OrderStatus, ShippingMethod},
        stock_transaction::StockTransactionKind,
    },
    errors::ServiceError,
    events::Event,
    services::{commerce::OrderParams, reports::TransactionFilter},
};
use rust_decimal_macros::dec;
use uuid::Uuid;

fn params() -> OrderParams {
    OrderParams {
        currency: "USD".into(),
        shipping_address: "22 Whisker Lane".into(),
        billing_address: Some("22 Whisker Lane".into()),
        shipping_method: ShippingMethod::Express,
        promo_code: None,
    }
}

/// A pending order for `quantity` units of a fresh variant stocked at 10.
async fn pending_order(app: &TestApp, quantity: i32) -> (Uuid, Uuid) {
    let v = app.variant("KIBBLE", dec!(12.50)).await;
    app.stock(v.id, "default", 10).await;
    let cart = app.cart_with(&[(v.id, "default", quantity)]).await;
    let created = app
        .services
        .checkout
        .create_order_from_cart(cart.id, params())
        .await
        .unwrap();
    (created.order.id, v.id)
}

#[tokio::test]
async fn shipping_turns_the_reservation_into_a_sale() {
    let mut app = TestApp::new().await;
    let (order_id, variant_id) = pending_order(&app, 3).await;
    let before = app.stock_item(variant_id, "default").await;
    assert_eq!(before.reserved_quantity, 3);
    app.drain_events();

    let order = app
        .services
        .orders
        .update_order_status(order_id, OrderStatus::Shipped, "warehouse", Some("tracking 1Z999"))
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Shipped);
    assert_eq!(order.version, 2);

    let after = app.stock_item(variant_id, "default").await;
    assert_eq!(after.quantity, before.quantity - 3);
    assert_eq!(after.reserved_quantity, before.reserved_quantity - 3);

    let sold = app
        .services
        .reports
        .export_transactions(TransactionFilter {
            variant_id: Some(variant_id),
            kind: Some(StockTransactionKind::Sold),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(sold.len(), 1);
    assert_eq!(sold[0].quantity, -3);
    assert_eq!(sold[0].reference.as_deref(), Some("order shipped"));

    let events = app.drain_events();
    assert!(events.contains(&Event::OrderShipped(order_id)));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::OrderStatusChanged { order_id: id, .. } if *id == order_id)));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::InventoryDeducted { quantity: 3, .. })));

    let history = app.services.orders.history(order_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from_status, OrderStatus::Pending);
    assert_eq!(history[0].to_status, OrderStatus::Shipped);
    assert_eq!(history[0].actor, "warehouse");
    assert_eq!(history[0].note.as_deref(), Some("tracking 1Z999"));
}

#[tokio::test]
async fn cancelling_twice_releases_once() {
    let app = TestApp::new().await;
    let (order_id, variant_id) = pending_order(&app, 4).await;
    let orders = &app.services.orders;

    orders
        .update_order_status(order_id, OrderStatus::Cancelled, "customer", None)
        .await
        .unwrap();
    let item = app.stock_item(variant_id, "default").await;
    assert_eq!(item.quantity, 10);
    assert_eq!(item.reserved_quantity, 0);

    let again = orders
        .update_order_status(order_id, OrderStatus::Cancelled, "customer", None)
        .await
        .unwrap();
    assert_eq!(again.status, OrderStatus::Cancelled);
    assert_eq!(again.version, 2);

    let released = app
        .services
        .reports
        .export_transactions(TransactionFilter {
            kind: Some(StockTransactionKind::Released),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].quantity, -4);
    assert_eq!(orders.history(order_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn disallowed_moves_are_rejected_without_side_effects() {
    let app = TestApp::new().await;
    let (order_id, variant_id) = pending_order(&app, 2).await;
    let orders = &app.services.orders;

    for target in [OrderStatus::Delivered, OrderStatus::Refunded] {
        let err = orders
            .update_order_status(order_id, target, "ops", None)
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::InvalidTransition { .. });
    }
    assert_eq!(orders.get_status(order_id).await.unwrap(), OrderStatus::Pending);
    assert_eq!(app.stock_item(variant_id, "default").await.reserved_quantity, 2);
    assert!(orders.history(order_id).await.unwrap().is_empty());

    orders
        .update_order_status(order_id, OrderStatus::Shipped, "ops", None)
        .await
        .unwrap();
    let err = orders
        .update_order_status(order_id, OrderStatus::Cancelled, "ops", None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidTransition { .. });
    let item = app.stock_item(variant_id, "default").await;
    assert_eq!(item.quantity, 8);
    assert_eq!(item.reserved_quantity, 0);
}

#[tokio::test]
async fn delivered_orders_can_be_refunded() {
    let app = TestApp::new().await;
    let (order_id, variant_id) = pending_order(&app, 1).await;
    let orders = &app.services.orders;

    for target in [
        OrderStatus::Shipped,
        OrderStatus::Delivered,
        OrderStatus::Refunded,
    ] {
        orders
            .update_order_status(order_id, target, "ops", None)
            .await
            .unwrap();
    }
    assert_eq!(orders.get_status(order_id).await.unwrap(), OrderStatus::Refunded);

    let history = orders.history(order_id).await.unwrap();
    let moves: Vec<_> = history.iter().map(|h| (h.from_status, h.to_status)).collect();
    assert_eq!(moves.len(), 3);
    assert!(moves.contains(&(OrderStatus::Pending, OrderStatus::Shipped)));
    assert!(moves.contains(&(OrderStatus::Shipped, OrderStatus::Delivered)));
    assert!(moves.contains(&(OrderStatus::Delivered, OrderStatus::Refunded)));

    // Refunds do not restock
    assert_eq!(app.stock_item(variant_id, "default").await.quantity, 9);

    let err = orders
        .update_order_status(order_id, OrderStatus::Pending, "ops", None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidTransition { .. });
}

#[tokio::test]
async fn cancelled_orders_can_be_refunded() {
    let app = TestApp::new().await;
    let (order_id, _) = pending_order(&app, 1).await;
    let orders = &app.services.orders;

    orders
        .update_order_status(order_id, OrderStatus::Cancelled, "ops", None)
        .await
        .unwrap();
    let refunded = orders
        .update_order_status(order_id, OrderStatus::Refunded, "ops", Some("card refunded"))
        .await
        .unwrap();
    assert_eq!(refunded.status, OrderStatus::Refunded);
    assert_eq!(refunded.version, 3);
}

#[tokio::test]
async fn unknown_order_is_not_found() {
    let app = TestApp::new().await;
    let err = app
        .services
        .orders
        .update_order_status(Uuid::new_v4(), OrderStatus::Shipped, "ops", None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_ship_and_cancel_apply_exactly_one() {
    let app = TestApp::file_backed(4).await;
    let (order_id, variant_id) = pending_order(&app, 3).await;

    let ship = app.services.orders.clone();
    let cancel = app.services.orders.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move {
            ship.update_order_status(order_id, OrderStatus::Shipped, "warehouse", None)
                .await
        }),
        tokio::spawn(async move {
            cancel
                .update_order_status(order_id, OrderStatus::Cancelled, "customer", None)
                .await
        }),
    );
    let results = [a.unwrap(), b.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(
        matches!(err, ServiceError::InvalidTransition { .. }) || err.is_retryable(),
        "unexpected error: {}",
        err
    );

    let history = app.services.orders.history(order_id).await.unwrap();
    assert_eq!(history.len(), 1);
    let item = app.stock_item(variant_id, "default").await;
    assert_eq!(item.reserved_quantity, 0);
    match history[0].to_status {
        OrderStatus::Shipped => assert_eq!(item.quantity, 7),
        OrderStatus::Cancelled => assert_eq!(item.quantity, 10),
        other => panic!("unexpected status {}", other),
    }
}

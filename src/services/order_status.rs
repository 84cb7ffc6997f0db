use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection,
    EntityTrait, QueryFilter,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    db,
    entities::{
        order::{self, Entity as OrderEntity, Model as OrderModel, OrderStatus},
        order_status_history,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    repositories::{order_repository::items_for, require, OrderRepository},
    services::inventory::{InventoryLedger, LedgerChange, StockLine},
};

/// Inventory effect attached to an order transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StockEffect {
    None,
    Release,
    Deduct,
}

/// Order status transitions and their stock side effects.
#[derive(Clone)]
pub struct OrderLifecycle {
    db: Arc<DatabaseConnection>,
    ledger: InventoryLedger,
    event_sender: EventSender,
}

impl OrderLifecycle {
    pub fn new(db: Arc<DatabaseConnection>, ledger: InventoryLedger, event_sender: EventSender) -> Self {
        Self {
            db,
            ledger,
            event_sender,
        }
    }

    /// Moves an order to `new_status`. Requesting the current status succeeds without writing anything.
    #[instrument(skip(self, note), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn update_order_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        actor: &str,
        note: Option<&str>,
    ) -> Result<OrderModel, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;

        let order = require::<OrderEntity, _>(&txn, order_id, "Order").await?;
        let old_status = order.status;
        if old_status == new_status {
            info!("Order already in requested status");
            return Ok(order);
        }

        let effect = transition_effect(old_status, new_status)
            .ok_or_else(|| ServiceError::invalid_transition(old_status, new_status))?;

        let now = Utc::now();
        let result = OrderEntity::update_many()
            .col_expr(order::Column::Status, Expr::value(new_status))
            .col_expr(order::Column::Version, Expr::value(order.version + 1))
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(now)))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Version.eq(order.version))
            .exec(&txn)
            .await?;
        if result.rows_affected != 1 {
            warn!(version = order.version, "Order changed by a concurrent writer");
            counter!("petcare_orders.status_conflict", 1);
            return Err(ServiceError::ConcurrentModification(order_id));
        }

        let change = match effect {
            StockEffect::None => LedgerChange::default(),
            StockEffect::Release => {
                let lines = stock_lines(&txn, order_id).await?;
                self.ledger
                    .release_in(&txn, &lines, Some("order cancelled"))
                    .await?
            }
            StockEffect::Deduct => {
                let lines = stock_lines(&txn, order_id).await?;
                self.ledger
                    .deduct_in(&txn, &lines, Some("order shipped"))
                    .await?
            }
        };

        order_status_history::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            from_status: Set(old_status),
            to_status: Set(new_status),
            actor: Set(actor.to_string()),
            note: Set(note.map(str::to_string)),
            created_at: Set(now),
        }
        .insert(&txn)
        .await?;

        db::commit(txn, started).await?;
        counter!("petcare_orders.status_changed", 1, "to" => new_status.to_string());
        info!(%old_status, %new_status, actor, "Order status updated");

        self.ledger.publish(change.events).await;
        match new_status {
            OrderStatus::Shipped => {
                self.event_sender
                    .send_or_log(Event::OrderShipped(order_id))
                    .await
            }
            OrderStatus::Cancelled => {
                self.event_sender
                    .send_or_log(Event::OrderCancelled(order_id))
                    .await
            }
            _ => {}
        }
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: old_status.to_string(),
                new_status: new_status.to_string(),
            })
            .await;

        Ok(OrderModel {
            status: new_status,
            version: order.version + 1,
            updated_at: Some(now),
            ..order
        })
    }

    /// Whether `from -> to` is an allowed move. The identity move is handled separately.
    pub fn is_valid_transition(&self, from: OrderStatus, to: OrderStatus) -> bool {
        transition_effect(from, to).is_some()
    }

    pub async fn get_status(&self, order_id: Uuid) -> Result<OrderStatus, ServiceError> {
        Ok(require::<OrderEntity, _>(&*self.db, order_id, "Order")
            .await?
            .status)
    }

    pub async fn history(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<order_status_history::Model>, ServiceError> {
        OrderRepository::new(self.db.clone())
            .status_history(order_id)
            .await
    }
}

fn transition_effect(from: OrderStatus, to: OrderStatus) -> Option<StockEffect> {
    use OrderStatus::*;
    match (from, to) {
        (Pending, Shipped) => Some(StockEffect::Deduct),
        (Pending, Cancelled) => Some(StockEffect::Release),
        (Shipped, Delivered) => Some(StockEffect::None),
        (Delivered, Refunded) => Some(StockEffect::None),
        (Cancelled, Refunded) => Some(StockEffect::None),
        _ => None,
    }
}

async fn stock_lines<C: sea_orm::ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<StockLine>, ServiceError> {
    Ok(items_for(conn, order_id)
        .await?
        .into_iter()
        .map(|item| StockLine::new(item.variant_id, item.location_code, item.quantity))
        .collect())
}

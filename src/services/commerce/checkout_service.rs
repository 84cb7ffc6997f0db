use crate::{
    config::AppConfig,
    db,
    entities::{
        cart::Entity as Cart,
        order::{self, Entity as Order, OrderStatus, ShippingMethod},
        order_item,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    repositories::require,
    services::{
        commerce::{
            cart_service::{clear_items_in, items_in},
            pricing_service::{distribute, PricedLine, PricingService},
        },
        inventory::{find_item, InventoryLedger, StockLine},
        promotions::PromotionService,
    },
};
use chrono::{Datelike, Utc};
use metrics::counter;
use rand::{distributions::Alphanumeric, Rng};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Order parameters supplied at checkout.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OrderParams {
    #[validate(length(equal = 3))]
    pub currency: String,
    #[validate(length(min = 1, max = 1000))]
    pub shipping_address: String,
    #[validate(length(min = 1, max = 1000))]
    pub billing_address: Option<String>,
    pub shipping_method: ShippingMethod,
    #[validate(length(min = 1, max = 64))]
    pub promo_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderWithItems {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

/// Turns a cart into a committed order with its stock reserved.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<sea_orm::DatabaseConnection>,
    ledger: InventoryLedger,
    pricing: PricingService,
    promotions: PromotionService,
    event_sender: EventSender,
    order_number_attempts: u32,
}

impl CheckoutService {
    pub fn new(
        db: Arc<sea_orm::DatabaseConnection>,
        ledger: InventoryLedger,
        pricing: PricingService,
        promotions: PromotionService,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            ledger,
            pricing,
            promotions,
            event_sender,
            order_number_attempts: 5,
        }
    }

    pub fn with_config(mut self, cfg: &AppConfig) -> Self {
        self.order_number_attempts = cfg.order_number_attempts.max(1);
        self
    }

    /// Prices the cart, applies any promotion, creates the order and its items,
    /// reserves stock and empties the cart. Nothing is kept when any step fails.
    #[instrument(skip(self, params), fields(cart_id = %cart_id))]
    pub async fn create_order_from_cart(
        &self,
        cart_id: Uuid,
        params: OrderParams,
    ) -> Result<OrderWithItems, ServiceError> {
        params.validate()?;
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;

        let cart = require::<Cart, _>(&txn, cart_id, "Cart").await?;
        let cart_items = items_in(&txn, cart_id).await?;
        if cart_items.is_empty() {
            return Err(ServiceError::EmptyCart(cart_id));
        }

        let stock_lines: Vec<StockLine> = cart_items
            .iter()
            .map(|item| StockLine::new(item.variant_id, item.location_code.clone(), item.quantity))
            .collect();
        check_stock(&txn, &stock_lines).await?;

        let lines = self.pricing.price_cart_items(&txn, &cart_items).await?;
        let subtotal = self.pricing.subtotal(&lines);

        let applied = match params.promo_code.as_deref() {
            Some(code) => match self.promotions.apply_in(&txn, code, subtotal).await {
                Ok(applied) => Some(applied),
                Err(ServiceError::InvalidPromotion(reason)) => {
                    warn!(code, %reason, "Promotion not applied");
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };
        let discount = applied.as_ref().map_or(Decimal::ZERO, |a| a.discount);
        let totals = self.pricing.totals(
            &lines,
            discount,
            params.shipping_method,
            &params.shipping_address,
        );

        let order_number = self.unique_order_number(&txn).await?;
        let now = Utc::now();
        let order = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_number: Set(order_number.clone()),
            customer_id: Set(cart.customer_id),
            session_id: Set(cart.session_id.clone()),
            status: Set(OrderStatus::Pending),
            currency: Set(params.currency.to_uppercase()),
            subtotal: Set(totals.subtotal),
            discount_total: Set(totals.discount),
            tax_total: Set(totals.tax),
            shipping_total: Set(totals.shipping),
            total: Set(totals.total),
            promo_code: Set(applied.as_ref().map(|a| a.code.clone())),
            shipping_method: Set(params.shipping_method),
            shipping_address: Set(params.shipping_address),
            billing_address: Set(params.billing_address),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(None),
        }
        .insert(&txn)
        .await?;

        let items = insert_items(&txn, order.id, &lines, totals.discount, totals.tax).await?;

        let change = self
            .ledger
            .reserve_in(&txn, &stock_lines, Some(&order_number))
            .await?;
        clear_items_in(&txn, cart_id).await?;

        db::commit(txn, started).await?;
        counter!("petcare_checkout.orders_created", 1);
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            total = %order.total,
            promo = ?order.promo_code,
            "Order created from cart"
        );

        self.ledger.publish(change.events).await;
        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id: order.id,
                order_number: order.order_number.clone(),
            })
            .await;
        self.event_sender
            .send_or_log(Event::CartCleared(cart_id))
            .await;

        Ok(OrderWithItems { order, items })
    }

    async fn unique_order_number<C: ConnectionTrait>(&self, conn: &C) -> Result<String, ServiceError> {
        let year = Utc::now().year();
        for _ in 0..self.order_number_attempts {
            let candidate = generate_order_number(year);
            let taken = Order::find()
                .filter(order::Column::OrderNumber.eq(candidate.as_str()))
                .one(conn)
                .await?
                .is_some();
            if !taken {
                return Ok(candidate);
            }
            warn!(order_number = %candidate, "Order number collision");
        }
        Err(ServiceError::Conflict(
            "Could not allocate a unique order number".to_string(),
        ))
    }
}

/// `ORD-{year}-` followed by eight upper-case letters and digits.
pub fn generate_order_number(year: i32) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect();
    format!("ORD-{}-{}", year, suffix)
}

/// Fails fast with the first line that cannot be covered, before anything is written.
async fn check_stock<C: ConnectionTrait>(conn: &C, lines: &[StockLine]) -> Result<(), ServiceError> {
    let mut requested: BTreeMap<(Uuid, &str), i32> = BTreeMap::new();
    for line in lines {
        *requested
            .entry((line.variant_id, line.location_code.as_str()))
            .or_default() += line.quantity;
    }

    for ((variant_id, location_code), quantity) in requested {
        let item = find_item(conn, variant_id, location_code)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Stock item for variant {} at {} not found",
                    variant_id, location_code
                ))
            })?;
        if item.available() < quantity {
            return Err(ServiceError::InsufficientInventory {
                variant_id,
                location_code: location_code.to_string(),
                requested: quantity,
                available: item.available(),
            });
        }
    }
    Ok(())
}

/// Item discounts follow line subtotals; item taxes follow the discounted line amounts.
async fn insert_items<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    lines: &[PricedLine],
    discount: Decimal,
    tax: Decimal,
) -> Result<Vec<order_item::Model>, ServiceError> {
    let subtotals: Vec<Decimal> = lines.iter().map(PricedLine::line_subtotal).collect();
    let discounts = distribute(discount, &subtotals);
    let taxable: Vec<Decimal> = subtotals
        .iter()
        .zip(&discounts)
        .map(|(s, d)| *s - *d)
        .collect();
    let taxes = distribute(tax, &taxable);

    let now = Utc::now();
    let mut items = Vec::with_capacity(lines.len());
    for (((line, taxable), discount), tax) in lines.iter().zip(taxable).zip(discounts).zip(taxes) {
        let item = order_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            variant_id: Set(line.variant_id),
            sku: Set(line.sku.clone()),
            name: Set(line.name.clone()),
            location_code: Set(line.location_code.clone()),
            quantity: Set(line.quantity),
            unit_price: Set(line.unit_price),
            discount: Set(discount),
            tax_amount: Set(tax),
            total: Set(taxable + tax),
            created_at: Set(now),
        }
        .insert(conn)
        .await?;
        items.push(item);
    }
    Ok(items)
}

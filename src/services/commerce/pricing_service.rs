use crate::{
    config::AppConfig,
    entities::{cart_item, order::ShippingMethod, product_variant},
    errors::ServiceError,
};
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use uuid::Uuid;

/// Rounds a money amount to cents, halves away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Cart line priced at the variant's current price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricedLine {
    pub variant_id: Uuid,
    pub sku: String,
    pub name: String,
    pub location_code: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

impl PricedLine {
    pub fn line_subtotal(&self) -> Decimal {
        round_money(self.unit_price * Decimal::from(self.quantity))
    }
}

/// Tax and shipping rules. Swap the implementation per market.
pub trait PricingStrategy: Send + Sync + Debug {
    /// Tax owed on the already discounted amount.
    fn tax(&self, taxable_amount: Decimal, shipping_address: &str) -> Decimal;

    fn shipping(&self, lines: &[PricedLine], shipping_method: ShippingMethod) -> Decimal;
}

/// Single tax rate and one shipping fee for every carrier-shipped order. Pickup ships free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatRatePricing {
    pub tax_rate: Decimal,
    pub shipping_fee: Decimal,
}

impl Default for FlatRatePricing {
    fn default() -> Self {
        Self {
            tax_rate: Decimal::new(10, 2),
            shipping_fee: Decimal::new(599, 2),
        }
    }
}

impl From<&AppConfig> for FlatRatePricing {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            tax_rate: cfg.tax_rate,
            shipping_fee: cfg.flat_shipping_fee,
        }
    }
}

impl PricingStrategy for FlatRatePricing {
    fn tax(&self, taxable_amount: Decimal, _shipping_address: &str) -> Decimal {
        round_money(taxable_amount.max(Decimal::ZERO) * self.tax_rate)
    }

    fn shipping(&self, _lines: &[PricedLine], shipping_method: ShippingMethod) -> Decimal {
        match shipping_method {
            ShippingMethod::Pickup => Decimal::ZERO,
            _ => round_money(self.shipping_fee),
        }
    }
}

/// Order-level money figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax: Decimal,
    pub shipping: Decimal,
    pub total: Decimal,
}

/// Splits `amount` across `weights` proportionally. Every share but the last is
/// truncated to cents and the last takes the remainder, so shares sum to `amount`.
pub fn distribute(amount: Decimal, weights: &[Decimal]) -> Vec<Decimal> {
    if weights.is_empty() {
        return Vec::new();
    }
    let total_weight: Decimal = weights.iter().copied().sum();
    let last = weights.len() - 1;
    let mut shares = Vec::with_capacity(weights.len());
    let mut allocated = Decimal::ZERO;

    for weight in &weights[..last] {
        let share = if total_weight.is_zero() {
            Decimal::ZERO
        } else {
            (amount * *weight / total_weight).round_dp_with_strategy(2, RoundingStrategy::ToZero)
        };
        allocated += share;
        shares.push(share);
    }
    shares.push(amount - allocated);
    shares
}

/// Prices cart lines and computes order totals through a [`PricingStrategy`].
#[derive(Debug, Clone)]
pub struct PricingService {
    strategy: Arc<dyn PricingStrategy>,
}

impl PricingService {
    pub fn new(strategy: Arc<dyn PricingStrategy>) -> Self {
        Self { strategy }
    }

    pub fn flat_rate(pricing: FlatRatePricing) -> Self {
        Self::new(Arc::new(pricing))
    }

    /// Looks up current variant prices for the cart lines, in cart order.
    pub async fn price_cart_items<C: ConnectionTrait>(
        &self,
        conn: &C,
        items: &[cart_item::Model],
    ) -> Result<Vec<PricedLine>, ServiceError> {
        let ids: Vec<Uuid> = items.iter().map(|i| i.variant_id).collect();
        let variants: HashMap<Uuid, product_variant::Model> = product_variant::Entity::find()
            .filter(product_variant::Column::Id.is_in(ids))
            .all(conn)
            .await?
            .into_iter()
            .map(|v| (v.id, v))
            .collect();

        items
            .iter()
            .map(|item| {
                let variant = variants.get(&item.variant_id).ok_or_else(|| {
                    ServiceError::NotFound(format!("Product variant {} not found", item.variant_id))
                })?;
                if !variant.active {
                    return Err(ServiceError::ValidationError(format!(
                        "Product variant {} is no longer sold",
                        variant.sku
                    )));
                }
                Ok(PricedLine {
                    variant_id: variant.id,
                    sku: variant.sku.clone(),
                    name: variant.name.clone(),
                    location_code: item.location_code.clone(),
                    quantity: item.quantity,
                    unit_price: variant.price,
                })
            })
            .collect()
    }

    pub fn subtotal(&self, lines: &[PricedLine]) -> Decimal {
        lines.iter().map(PricedLine::line_subtotal).sum()
    }

    /// `total = subtotal - discount + tax + shipping`, with tax on the discounted subtotal.
    pub fn totals(
        &self,
        lines: &[PricedLine],
        discount: Decimal,
        shipping_method: ShippingMethod,
        shipping_address: &str,
    ) -> OrderTotals {
        let subtotal = self.subtotal(lines);
        let discount = round_money(discount.min(subtotal).max(Decimal::ZERO));
        let tax = self.strategy.tax(subtotal - discount, shipping_address);
        let shipping = self.strategy.shipping(lines, shipping_method);
        OrderTotals {
            subtotal,
            discount,
            tax,
            shipping,
            total: subtotal - discount + tax + shipping,
        }
    }
}

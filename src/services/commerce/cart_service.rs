use crate::{
    config::AppConfig,
    entities::{
        cart::{self, Entity as Cart, Model as CartModel},
        cart_item::{self, Entity as CartItem, Model as CartItemModel},
        product_variant::Entity as ProductVariant,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    repositories::require,
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_owner"))]
pub struct CreateCartInput {
    pub customer_id: Option<Uuid>,
    #[validate(length(min = 1, max = 128))]
    pub session_id: Option<String>,
    #[validate(length(equal = 3))]
    pub currency: String,
}

fn validate_owner(input: &CreateCartInput) -> Result<(), ValidationError> {
    if input.customer_id.is_none() && input.session_id.is_none() {
        return Err(ValidationError::new("customer_or_session_required"));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AddCartItemInput {
    pub variant_id: Uuid,
    /// Falls back to the configured default location
    #[validate(length(min = 1, max = 64))]
    pub location_code: Option<String>,
    #[validate(range(min = 1, max = 10000))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CartWithItems {
    pub cart: CartModel,
    pub items: Vec<CartItemModel>,
}

/// Cart management. Carts never touch stock; reservation happens at checkout.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    default_location_code: String,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self {
            db,
            event_sender,
            default_location_code: "default".to_string(),
        }
    }

    pub fn with_config(mut self, cfg: &AppConfig) -> Self {
        self.default_location_code = cfg.default_location_code.clone();
        self
    }

    #[instrument(skip(self, input))]
    pub async fn create_cart(&self, input: CreateCartInput) -> Result<CartModel, ServiceError> {
        input.validate()?;
        let now = Utc::now();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            session_id: Set(input.session_id),
            customer_id: Set(input.customer_id),
            currency: Set(input.currency.to_uppercase()),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;
        info!(cart_id = %cart.id, "Cart created");
        Ok(cart)
    }

    /// Adds a line, merging with an existing line for the same variant and location.
    #[instrument(skip(self, input), fields(variant_id = %input.variant_id))]
    pub async fn add_item(
        &self,
        cart_id: Uuid,
        input: AddCartItemInput,
    ) -> Result<CartItemModel, ServiceError> {
        input.validate()?;
        let db = &*self.db;
        require::<Cart, _>(db, cart_id, "Cart").await?;

        let variant = require::<ProductVariant, _>(db, input.variant_id, "Product variant").await?;
        if !variant.active {
            return Err(ServiceError::ValidationError(format!(
                "Product variant {} is not available for sale",
                variant.sku
            )));
        }

        let location_code = input
            .location_code
            .unwrap_or_else(|| self.default_location_code.clone());
        let now = Utc::now();
        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::VariantId.eq(input.variant_id))
            .filter(cart_item::Column::LocationCode.eq(location_code.as_str()))
            .one(db)
            .await?;

        let item = match existing {
            Some(item) => {
                let quantity = item.quantity + input.quantity;
                let mut active: cart_item::ActiveModel = item.into();
                active.quantity = Set(quantity);
                active.updated_at = Set(now);
                active.update(db).await?
            }
            None => {
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart_id),
                    variant_id: Set(input.variant_id),
                    location_code: Set(location_code),
                    quantity: Set(input.quantity),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(db)
                .await?
            }
        };
        self.touch(cart_id).await?;
        Ok(item)
    }

    /// Sets a line's quantity; zero removes the line.
    #[instrument(skip(self))]
    pub async fn update_item_quantity(
        &self,
        cart_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<Option<CartItemModel>, ServiceError> {
        if quantity < 0 {
            return Err(ServiceError::ValidationError(
                "Quantity cannot be negative".to_string(),
            ));
        }
        let item = self.require_item(cart_id, item_id).await?;
        if quantity == 0 {
            self.remove_item(cart_id, item_id).await?;
            return Ok(None);
        }
        let mut active: cart_item::ActiveModel = item.into();
        active.quantity = Set(quantity);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&*self.db).await?;
        self.touch(cart_id).await?;
        Ok(Some(updated))
    }

    #[instrument(skip(self))]
    pub async fn remove_item(&self, cart_id: Uuid, item_id: Uuid) -> Result<(), ServiceError> {
        self.require_item(cart_id, item_id).await?;
        CartItem::delete_by_id(item_id).exec(&*self.db).await?;
        self.touch(cart_id).await
    }

    pub async fn get_cart_with_items(&self, cart_id: Uuid) -> Result<CartWithItems, ServiceError> {
        let cart = require::<Cart, _>(&*self.db, cart_id, "Cart").await?;
        let items = items_in(&*self.db, cart_id).await?;
        Ok(CartWithItems { cart, items })
    }

    #[instrument(skip(self))]
    pub async fn clear_cart(&self, cart_id: Uuid) -> Result<u64, ServiceError> {
        require::<Cart, _>(&*self.db, cart_id, "Cart").await?;
        let removed = clear_items_in(&*self.db, cart_id).await?;
        self.event_sender
            .send_or_log(Event::CartCleared(cart_id))
            .await;
        Ok(removed)
    }

    async fn require_item(
        &self,
        cart_id: Uuid,
        item_id: Uuid,
    ) -> Result<CartItemModel, ServiceError> {
        CartItem::find_by_id(item_id)
            .filter(cart_item::Column::CartId.eq(cart_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Cart item {} not found in cart {}", item_id, cart_id))
            })
    }

    async fn touch(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        Cart::update_many()
            .col_expr(
                cart::Column::UpdatedAt,
                sea_orm::sea_query::Expr::value(Utc::now()),
            )
            .filter(cart::Column::Id.eq(cart_id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }
}

pub async fn items_in<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<Vec<CartItemModel>, ServiceError> {
    Ok(CartItem::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .order_by_asc(cart_item::Column::CreatedAt)
        .order_by_asc(cart_item::Column::Id)
        .all(conn)
        .await?)
}

pub async fn clear_items_in<C: ConnectionTrait>(conn: &C, cart_id: Uuid) -> Result<u64, ServiceError> {
    let result = CartItem::delete_many()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cart_needs_an_owner() {
        let input = CreateCartInput {
            customer_id: None,
            session_id: None,
            currency: "USD".into(),
        };
        assert!(input.validate().is_err());

        let input = CreateCartInput {
            customer_id: None,
            session_id: Some("guest-1".into()),
            currency: "USD".into(),
        };
        assert!(input.validate().is_ok());
    }

    #[test]
    fn cart_item_quantity_must_be_positive() {
        let input = AddCartItemInput {
            variant_id: Uuid::new_v4(),
            location_code: Some("main".into()),
            quantity: 0,
        };
        assert!(input.validate().is_err());
    }
}

use crate::{
    entities::promotion::{self, DiscountType, Entity as Promotion, Model as PromotionModel},
    errors::ServiceError,
    services::commerce::pricing_service::round_money,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait,
    QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_window"))]
pub struct NewPromotion {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    pub description: Option<String>,
    pub discount_type: DiscountType,
    #[validate(custom = "validate_positive")]
    pub discount_value: Decimal,
    pub minimum_order_amount: Option<Decimal>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[validate(range(min = 1))]
    pub usage_limit: Option<i32>,
}

fn validate_positive(value: &Decimal) -> Result<(), ValidationError> {
    if *value <= Decimal::ZERO {
        return Err(ValidationError::new("discount_value_must_be_positive"));
    }
    Ok(())
}

fn validate_window(promo: &NewPromotion) -> Result<(), ValidationError> {
    if promo.end_date < promo.start_date {
        return Err(ValidationError::new("end_date_before_start_date"));
    }
    Ok(())
}

/// A promotion that passed every check and had one use claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedPromotion {
    pub promotion_id: Uuid,
    pub code: String,
    pub discount: Decimal,
}

#[derive(Clone)]
pub struct PromotionService {
    db: Arc<DatabaseConnection>,
}

impl PromotionService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self, input), fields(code = %input.code))]
    pub async fn create_promotion(
        &self,
        input: NewPromotion,
    ) -> Result<PromotionModel, ServiceError> {
        input.validate()?;
        let now = Utc::now();
        let model = promotion::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(input.code.trim().to_string()),
            description: Set(input.description),
            discount_type: Set(input.discount_type),
            discount_value: Set(input.discount_value),
            minimum_order_amount: Set(input.minimum_order_amount),
            active: Set(true),
            start_date: Set(input.start_date),
            end_date: Set(input.end_date),
            usage_count: Set(0),
            usage_limit: Set(input.usage_limit),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;
        info!(promotion_id = %model.id, "Promotion created");
        Ok(model)
    }

    pub async fn deactivate(&self, promotion_id: Uuid) -> Result<PromotionModel, ServiceError> {
        let promo = crate::repositories::require::<Promotion, _>(
            &*self.db,
            promotion_id,
            "Promotion",
        )
        .await?;
        let mut active: promotion::ActiveModel = promo.into();
        active.active = Set(false);
        active.updated_at = Set(Utc::now());
        Ok(active.update(&*self.db).await?)
    }

    pub async fn find_by_code(&self, code: &str) -> Result<Option<PromotionModel>, ServiceError> {
        find_by_code_in(&*self.db, code).await
    }

    /// Checks `code` against `subtotal` and claims one use inside the caller's transaction.
    ///
    /// Every reason the promotion does not apply is reported as `InvalidPromotion`.
    pub async fn apply_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        code: &str,
        subtotal: Decimal,
    ) -> Result<AppliedPromotion, ServiceError> {
        let promo = find_by_code_in(conn, code)
            .await?
            .ok_or_else(|| ServiceError::InvalidPromotion(format!("Unknown code {}", code)))?;

        let discount = evaluate(&promo, subtotal, Utc::now())?;

        if !claim_usage_in(conn, promo.id).await? {
            return Err(ServiceError::InvalidPromotion(format!(
                "Promotion {} has reached its usage limit",
                promo.code
            )));
        }

        debug!(code = %promo.code, %discount, "Promotion applied");
        Ok(AppliedPromotion {
            promotion_id: promo.id,
            code: promo.code,
            discount,
        })
    }
}

pub async fn find_by_code_in<C: ConnectionTrait>(
    conn: &C,
    code: &str,
) -> Result<Option<PromotionModel>, ServiceError> {
    Ok(Promotion::find()
        .filter(promotion::Column::Code.eq(code.trim()))
        .one(conn)
        .await?)
}

/// Discount for `subtotal` at time `at`, or the reason the promotion does not apply.
pub fn evaluate(
    promo: &PromotionModel,
    subtotal: Decimal,
    at: DateTime<Utc>,
) -> Result<Decimal, ServiceError> {
    if !promo.active {
        return Err(ServiceError::InvalidPromotion(format!(
            "Promotion {} is inactive",
            promo.code
        )));
    }
    if !promo.is_within_window(at) {
        return Err(ServiceError::InvalidPromotion(format!(
            "Promotion {} is outside its validity window",
            promo.code
        )));
    }
    if let Some(minimum) = promo.minimum_order_amount {
        if subtotal < minimum {
            return Err(ServiceError::InvalidPromotion(format!(
                "Subtotal {} is below minimum order amount {}",
                subtotal, minimum
            )));
        }
    }
    if promo.usage_exhausted() {
        return Err(ServiceError::InvalidPromotion(format!(
            "Promotion {} has reached its usage limit",
            promo.code
        )));
    }

    let discount = match promo.discount_type {
        DiscountType::Percentage => subtotal * promo.discount_value / Decimal::ONE_HUNDRED,
        DiscountType::Fixed => promo.discount_value,
    };
    Ok(round_money(discount.min(subtotal).max(Decimal::ZERO)))
}

/// Increments `usage_count` only while it is below `usage_limit`. Returns whether a use was claimed.
pub async fn claim_usage_in<C: ConnectionTrait>(
    conn: &C,
    promotion_id: Uuid,
) -> Result<bool, ServiceError> {
    let result = Promotion::update_many()
        .col_expr(
            promotion::Column::UsageCount,
            Expr::col(promotion::Column::UsageCount).add(1),
        )
        .col_expr(promotion::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(promotion::Column::Id.eq(promotion_id))
        .filter(
            Condition::any()
                .add(promotion::Column::UsageLimit.is_null())
                .add(
                    Expr::col(promotion::Column::UsageCount)
                        .lt(Expr::col(promotion::Column::UsageLimit)),
                ),
        )
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

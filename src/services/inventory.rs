use crate::{
    config::AppConfig,
    db,
    entities::{
        stock_item::{self, Entity as StockItemEntity},
        stock_transaction::{self, StockTransactionKind},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Quantity of one variant at one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLine {
    pub variant_id: Uuid,
    pub location_code: String,
    pub quantity: i32,
}

impl StockLine {
    pub fn new(variant_id: Uuid, location_code: impl Into<String>, quantity: i32) -> Self {
        Self {
            variant_id,
            location_code: location_code.into(),
            quantity,
        }
    }
}

/// How an adjustment changes on-hand quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjustmentMode {
    Set(i32),
    Add(i32),
    Subtract(i32),
}

impl AdjustmentMode {
    /// New on-hand quantity, or a validation error when the result would be negative.
    pub fn resolve(&self, current: i32) -> Result<i32, ServiceError> {
        let next = match *self {
            AdjustmentMode::Set(n) if n >= 0 => n,
            AdjustmentMode::Add(n) if n > 0 => current.checked_add(n).ok_or_else(|| {
                ServiceError::ValidationError("Adjustment overflows quantity".to_string())
            })?,
            AdjustmentMode::Subtract(n) if n > 0 => current - n,
            other => {
                return Err(ServiceError::ValidationError(format!(
                    "Invalid adjustment amount: {:?}",
                    other
                )))
            }
        };
        if next < 0 {
            return Err(ServiceError::ValidationError(format!(
                "Adjustment would leave negative stock ({})",
                next
            )));
        }
        Ok(next)
    }

    fn creates_missing(&self) -> bool {
        !matches!(self, AdjustmentMode::Subtract(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjustment {
    pub variant_id: Uuid,
    pub location_code: String,
    pub mode: AdjustmentMode,
}

/// Tunables for the ledger.
#[derive(Debug, Clone, Copy)]
pub struct LedgerSettings {
    /// Attempts at the optimistic write before giving up
    pub max_retries: u32,
    /// Reorder threshold for stock items the ledger creates
    pub default_reorder_threshold: i32,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            default_reorder_threshold: 5,
        }
    }
}

impl From<&AppConfig> for LedgerSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            max_retries: cfg.ledger_max_retries,
            default_reorder_threshold: cfg.default_reorder_threshold,
        }
    }
}

/// Result of one or more ledger primitives. `events` are published by whoever commits.
#[derive(Debug, Default, Clone)]
pub struct LedgerChange {
    pub items: Vec<stock_item::Model>,
    pub transactions: Vec<stock_transaction::Model>,
    pub events: Vec<Event>,
}

/// Before and after snapshots of one compare-and-swap write.
struct Mutation {
    before: stock_item::Model,
    after: stock_item::Model,
}

impl Mutation {
    fn changed(&self) -> bool {
        self.before.quantity != self.after.quantity
            || self.before.reserved_quantity != self.after.reserved_quantity
    }

    fn low_stock_event(&self) -> Option<Event> {
        let crossed = !self.before.is_low_stock() && self.after.is_low_stock();
        crossed.then(|| Event::LowStock {
            variant_id: self.after.variant_id,
            location_code: self.after.location_code.clone(),
            available: self.after.available(),
            reorder_threshold: self.after.reorder_threshold,
        })
    }
}

/// Owner of stock counters and the stock transaction log.
///
/// Every public primitive runs in its own transaction. The `*_in` forms run inside
/// a caller's transaction and return the events to publish after that commits.
#[derive(Clone)]
pub struct InventoryLedger {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    settings: LedgerSettings,
}

impl InventoryLedger {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self {
            db,
            event_sender,
            settings: LedgerSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: LedgerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Publishes events collected from `*_in` calls once their transaction committed.
    pub async fn publish(&self, events: Vec<Event>) {
        for event in events {
            self.event_sender.send_or_log(event).await;
        }
    }

    /// Reserves stock for every line or for none of them.
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn reserve(
        &self,
        lines: &[StockLine],
        reference: Option<&str>,
    ) -> Result<LedgerChange, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let change = self.reserve_in(&txn, lines, reference).await?;
        db::commit(txn, started).await?;
        counter!("petcare_ledger.reserve", 1);
        info!(lines = lines.len(), ?reference, "Inventory reserved");
        self.publish(change.events.clone()).await;
        Ok(change)
    }

    pub async fn reserve_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        lines: &[StockLine],
        reference: Option<&str>,
    ) -> Result<LedgerChange, ServiceError> {
        let mut change = LedgerChange::default();
        for line in ordered(validate_lines(lines)?) {
            let requested = line.quantity;
            let mutation = self
                .compare_and_swap(conn, line.variant_id, &line.location_code, false, |item| {
                    let available = item.available();
                    if available < requested {
                        return Err(ServiceError::InsufficientInventory {
                            variant_id: item.variant_id,
                            location_code: item.location_code.clone(),
                            requested,
                            available,
                        });
                    }
                    Ok((item.quantity, item.reserved_quantity + requested))
                })
                .await?;

            let txn_row = record(
                conn,
                &mutation.after,
                StockTransactionKind::Reserved,
                requested,
                reference,
                None,
            )
            .await?;
            change.events.push(Event::InventoryReserved {
                variant_id: line.variant_id,
                location_code: line.location_code.clone(),
                quantity: requested,
                reference: reference.map(str::to_string),
            });
            push_mutation(&mut change, mutation, Some(txn_row));
        }
        Ok(change)
    }

    /// Releases previously reserved stock. Releasing more than is reserved clamps at zero.
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn release(
        &self,
        lines: &[StockLine],
        reference: Option<&str>,
    ) -> Result<LedgerChange, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let change = self.release_in(&txn, lines, reference).await?;
        db::commit(txn, started).await?;
        counter!("petcare_ledger.release", 1);
        info!(lines = lines.len(), ?reference, "Inventory released");
        self.publish(change.events.clone()).await;
        Ok(change)
    }

    pub async fn release_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        lines: &[StockLine],
        reference: Option<&str>,
    ) -> Result<LedgerChange, ServiceError> {
        let mut change = LedgerChange::default();
        for line in ordered(validate_lines(lines)?) {
            let requested = line.quantity;
            let mutation = self
                .compare_and_swap(conn, line.variant_id, &line.location_code, false, |item| {
                    let released = requested.min(item.reserved_quantity);
                    Ok((item.quantity, item.reserved_quantity - released))
                })
                .await?;

            if !mutation.changed() {
                debug!(variant_id = %line.variant_id, "Nothing reserved to release");
                continue;
            }
            let released = mutation.before.reserved_quantity - mutation.after.reserved_quantity;
            let txn_row = record(
                conn,
                &mutation.after,
                StockTransactionKind::Released,
                -released,
                reference,
                None,
            )
            .await?;
            change.events.push(Event::InventoryReleased {
                variant_id: line.variant_id,
                location_code: line.location_code.clone(),
                quantity: released,
                reference: reference.map(str::to_string),
            });
            push_mutation(&mut change, mutation, Some(txn_row));
        }
        Ok(change)
    }

    /// Removes sold units from both on-hand and reserved counters, flooring each at zero.
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn deduct(
        &self,
        lines: &[StockLine],
        reference: Option<&str>,
    ) -> Result<LedgerChange, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let change = self.deduct_in(&txn, lines, reference).await?;
        db::commit(txn, started).await?;
        counter!("petcare_ledger.deduct", 1);
        info!(lines = lines.len(), ?reference, "Inventory deducted");
        self.publish(change.events.clone()).await;
        Ok(change)
    }

    pub async fn deduct_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        lines: &[StockLine],
        reference: Option<&str>,
    ) -> Result<LedgerChange, ServiceError> {
        let mut change = LedgerChange::default();
        for line in ordered(validate_lines(lines)?) {
            let n = line.quantity;
            let mutation = self
                .compare_and_swap(conn, line.variant_id, &line.location_code, false, |item| {
                    Ok((
                        (item.quantity - n).max(0),
                        (item.reserved_quantity - n).max(0),
                    ))
                })
                .await?;

            if !mutation.changed() {
                continue;
            }
            let delta = mutation.after.quantity - mutation.before.quantity;
            let txn_row = record(
                conn,
                &mutation.after,
                StockTransactionKind::Sold,
                delta,
                reference,
                None,
            )
            .await?;
            change.events.push(Event::InventoryDeducted {
                variant_id: line.variant_id,
                location_code: line.location_code.clone(),
                quantity: -delta,
                reference: reference.map(str::to_string),
            });
            push_mutation(&mut change, mutation, Some(txn_row));
        }
        Ok(change)
    }

    /// Applies manual corrections to on-hand quantity.
    #[instrument(skip(self, adjustments), fields(adjustments = adjustments.len()))]
    pub async fn adjust(
        &self,
        adjustments: &[StockAdjustment],
        reference: Option<&str>,
    ) -> Result<LedgerChange, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let change = self.adjust_in(&txn, adjustments, reference).await?;
        db::commit(txn, started).await?;
        counter!("petcare_ledger.adjust", 1);
        info!(adjustments = adjustments.len(), ?reference, "Inventory adjusted");
        self.publish(change.events.clone()).await;
        Ok(change)
    }

    pub async fn adjust_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        adjustments: &[StockAdjustment],
        reference: Option<&str>,
    ) -> Result<LedgerChange, ServiceError> {
        if adjustments.is_empty() {
            return Err(ServiceError::ValidationError(
                "At least one adjustment is required".to_string(),
            ));
        }
        let mut change = LedgerChange::default();
        for adjustment in adjustments {
            validate_location(&adjustment.location_code)?;
            let mode = adjustment.mode;
            let mutation = self
                .compare_and_swap(
                    conn,
                    adjustment.variant_id,
                    &adjustment.location_code,
                    mode.creates_missing(),
                    |item| {
                        let next = mode.resolve(item.quantity)?;
                        if next < item.reserved_quantity {
                            return Err(ServiceError::InsufficientInventory {
                                variant_id: item.variant_id,
                                location_code: item.location_code.clone(),
                                requested: item.quantity - next,
                                available: item.available(),
                            });
                        }
                        Ok((next, item.reserved_quantity))
                    },
                )
                .await?;

            if !mutation.changed() {
                continue;
            }
            let old_quantity = mutation.before.quantity;
            let new_quantity = mutation.after.quantity;
            let txn_row = record(
                conn,
                &mutation.after,
                StockTransactionKind::Adjusted,
                new_quantity - old_quantity,
                reference,
                None,
            )
            .await?;
            change.events.push(Event::InventoryAdjusted {
                variant_id: adjustment.variant_id,
                location_code: adjustment.location_code.clone(),
                old_quantity,
                new_quantity,
                reference: reference.map(str::to_string),
            });
            push_mutation(&mut change, mutation, Some(txn_row));
        }
        Ok(change)
    }

    /// Books incoming stock, creating the stock item when the location has never held it.
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn receive(
        &self,
        lines: &[StockLine],
        reference: Option<&str>,
    ) -> Result<LedgerChange, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let change = self.receive_in(&txn, lines, reference).await?;
        db::commit(txn, started).await?;
        counter!("petcare_ledger.receive", 1);
        info!(lines = lines.len(), ?reference, "Inventory received");
        self.publish(change.events.clone()).await;
        Ok(change)
    }

    pub async fn receive_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        lines: &[StockLine],
        reference: Option<&str>,
    ) -> Result<LedgerChange, ServiceError> {
        let mut change = LedgerChange::default();
        for line in ordered(validate_lines(lines)?) {
            let n = line.quantity;
            let mutation = self
                .compare_and_swap(conn, line.variant_id, &line.location_code, true, |item| {
                    let next = item.quantity.checked_add(n).ok_or_else(|| {
                        ServiceError::ValidationError("Receipt overflows quantity".to_string())
                    })?;
                    Ok((next, item.reserved_quantity))
                })
                .await?;

            let txn_row = record(
                conn,
                &mutation.after,
                StockTransactionKind::Received,
                n,
                reference,
                None,
            )
            .await?;
            change.events.push(Event::InventoryReceived {
                variant_id: line.variant_id,
                location_code: line.location_code.clone(),
                quantity: n,
                reference: reference.map(str::to_string),
            });
            push_mutation(&mut change, mutation, Some(txn_row));
        }
        Ok(change)
    }

    /// Moves unreserved stock between two locations as one unit of work.
    #[instrument(skip(self))]
    pub async fn transfer(
        &self,
        variant_id: Uuid,
        quantity: i32,
        from_location: &str,
        to_location: &str,
        reference: Option<&str>,
    ) -> Result<LedgerChange, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let change = self
            .transfer_in(&txn, variant_id, quantity, from_location, to_location, reference)
            .await?;
        db::commit(txn, started).await?;
        counter!("petcare_ledger.transfer", 1);
        info!(%variant_id, quantity, from_location, to_location, "Inventory transferred");
        self.publish(change.events.clone()).await;
        Ok(change)
    }

    pub async fn transfer_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        variant_id: Uuid,
        quantity: i32,
        from_location: &str,
        to_location: &str,
        reference: Option<&str>,
    ) -> Result<LedgerChange, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Transfer quantity must be positive".to_string(),
            ));
        }
        validate_location(from_location)?;
        validate_location(to_location)?;
        if from_location == to_location {
            return Err(ServiceError::ValidationError(
                "Source and destination locations must differ".to_string(),
            ));
        }

        let transfer_id = Uuid::new_v4();
        let mut change = LedgerChange::default();

        // Both legs are written in location order so opposing transfers cannot deadlock.
        let source_first = from_location < to_location;
        for outbound in [source_first, !source_first] {
            if outbound {
                let mutation = self
                    .compare_and_swap(conn, variant_id, from_location, false, |item| {
                        let available = item.available();
                        if available < quantity {
                            return Err(ServiceError::InsufficientInventory {
                                variant_id,
                                location_code: item.location_code.clone(),
                                requested: quantity,
                                available,
                            });
                        }
                        Ok((item.quantity - quantity, item.reserved_quantity))
                    })
                    .await?;
                let row = record(
                    conn,
                    &mutation.after,
                    StockTransactionKind::TransferOut,
                    -quantity,
                    reference,
                    Some(transfer_id),
                )
                .await?;
                push_mutation(&mut change, mutation, Some(row));
            } else {
                let mutation = self
                    .compare_and_swap(conn, variant_id, to_location, true, |item| {
                        Ok((item.quantity + quantity, item.reserved_quantity))
                    })
                    .await?;
                let row = record(
                    conn,
                    &mutation.after,
                    StockTransactionKind::TransferIn,
                    quantity,
                    reference,
                    Some(transfer_id),
                )
                .await?;
                push_mutation(&mut change, mutation, Some(row));
            }
        }

        change.events.push(Event::InventoryTransferred {
            transfer_id,
            variant_id,
            from_location: from_location.to_string(),
            to_location: to_location.to_string(),
            quantity,
        });
        Ok(change)
    }

    pub async fn get_stock(
        &self,
        variant_id: Uuid,
        location_code: &str,
    ) -> Result<Option<stock_item::Model>, ServiceError> {
        find_item(&*self.db, variant_id, location_code).await
    }

    pub async fn available_quantity(
        &self,
        variant_id: Uuid,
        location_code: &str,
    ) -> Result<i32, ServiceError> {
        find_item(&*self.db, variant_id, location_code)
            .await?
            .map(|item| item.available())
            .ok_or_else(|| not_found(variant_id, location_code))
    }

    /// Reads the row, lets `decide` compute the next `(quantity, reserved)` pair and
    /// writes it only if nobody else wrote the row since it was read.
    async fn compare_and_swap<C, F>(
        &self,
        conn: &C,
        variant_id: Uuid,
        location_code: &str,
        create_missing: bool,
        mut decide: F,
    ) -> Result<Mutation, ServiceError>
    where
        C: ConnectionTrait,
        F: FnMut(&stock_item::Model) -> Result<(i32, i32), ServiceError> + Send,
    {
        let mut last_seen = None;
        for attempt in 0..self.settings.max_retries {
            let current = match find_item(conn, variant_id, location_code).await? {
                Some(item) => item,
                None if create_missing => {
                    self.create_item(conn, variant_id, location_code).await?
                }
                None => return Err(not_found(variant_id, location_code)),
            };

            let (quantity, reserved) = decide(&current)?;
            if quantity < 0 || reserved < 0 || reserved > quantity {
                return Err(ServiceError::InternalError(format!(
                    "Refusing stock write quantity={} reserved={} for {}",
                    quantity, reserved, current.id
                )));
            }
            if quantity == current.quantity && reserved == current.reserved_quantity {
                return Ok(Mutation {
                    before: current.clone(),
                    after: current,
                });
            }

            let now = Utc::now();
            let result = StockItemEntity::update_many()
                .col_expr(stock_item::Column::Quantity, Expr::value(quantity))
                .col_expr(stock_item::Column::ReservedQuantity, Expr::value(reserved))
                .col_expr(stock_item::Column::Version, Expr::value(current.version + 1))
                .col_expr(stock_item::Column::UpdatedAt, Expr::value(now))
                .filter(stock_item::Column::Id.eq(current.id))
                .filter(stock_item::Column::Version.eq(current.version))
                .exec(conn)
                .await?;

            if result.rows_affected == 1 {
                let after = stock_item::Model {
                    quantity,
                    reserved_quantity: reserved,
                    version: current.version + 1,
                    updated_at: now,
                    ..current.clone()
                };
                return Ok(Mutation {
                    before: current,
                    after,
                });
            }

            counter!("petcare_ledger.cas_retry", 1);
            debug!(stock_item_id = %current.id, attempt, "Stock item changed underneath, retrying");
            last_seen = Some(current.id);
        }

        warn!(%variant_id, location_code, "Giving up after repeated concurrent writes");
        counter!("petcare_ledger.cas_exhausted", 1);
        Err(ServiceError::ConcurrentModification(
            last_seen.unwrap_or(variant_id),
        ))
    }

    async fn create_item<C: ConnectionTrait>(
        &self,
        conn: &C,
        variant_id: Uuid,
        location_code: &str,
    ) -> Result<stock_item::Model, ServiceError> {
        let now = Utc::now();
        let item = stock_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            variant_id: Set(variant_id),
            location_code: Set(location_code.to_string()),
            quantity: Set(0),
            reserved_quantity: Set(0),
            reorder_threshold: Set(self.settings.default_reorder_threshold),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await?;
        info!(%variant_id, location_code, "Created stock item");
        Ok(item)
    }
}

pub(crate) async fn find_item<C: ConnectionTrait>(
    conn: &C,
    variant_id: Uuid,
    location_code: &str,
) -> Result<Option<stock_item::Model>, ServiceError> {
    Ok(StockItemEntity::find()
        .filter(stock_item::Column::VariantId.eq(variant_id))
        .filter(stock_item::Column::LocationCode.eq(location_code))
        .one(conn)
        .await?)
}

async fn record<C: ConnectionTrait>(
    conn: &C,
    after: &stock_item::Model,
    kind: StockTransactionKind,
    delta: i32,
    reference: Option<&str>,
    transfer_id: Option<Uuid>,
) -> Result<stock_transaction::Model, ServiceError> {
    let row = stock_transaction::ActiveModel {
        id: Set(Uuid::new_v4()),
        stock_item_id: Set(after.id),
        variant_id: Set(after.variant_id),
        location_code: Set(after.location_code.clone()),
        kind: Set(kind),
        quantity: Set(delta),
        quantity_after: Set(after.quantity),
        reserved_after: Set(after.reserved_quantity),
        reference: Set(reference.map(str::to_string)),
        transfer_id: Set(transfer_id),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?;
    Ok(row)
}

fn push_mutation(
    change: &mut LedgerChange,
    mutation: Mutation,
    transaction: Option<stock_transaction::Model>,
) {
    if let Some(event) = mutation.low_stock_event() {
        change.events.push(event);
    }
    change.items.push(mutation.after);
    change.transactions.extend(transaction);
}

fn not_found(variant_id: Uuid, location_code: &str) -> ServiceError {
    ServiceError::NotFound(format!(
        "Stock item for variant {} at {} not found",
        variant_id, location_code
    ))
}

fn validate_location(location_code: &str) -> Result<(), ServiceError> {
    if location_code.trim().is_empty() {
        return Err(ServiceError::ValidationError(
            "Location code is required".to_string(),
        ));
    }
    Ok(())
}

fn validate_lines(lines: &[StockLine]) -> Result<&[StockLine], ServiceError> {
    if lines.is_empty() {
        return Err(ServiceError::ValidationError(
            "At least one stock line is required".to_string(),
        ));
    }
    for line in lines {
        if line.quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "Quantity for variant {} must be positive, got {}",
                line.variant_id, line.quantity
            )));
        }
        validate_location(&line.location_code)?;
    }
    Ok(lines)
}

/// Fixed write order across batches: by variant, then location.
fn ordered(lines: &[StockLine]) -> Vec<&StockLine> {
    let mut sorted: Vec<&StockLine> = lines.iter().collect();
    sorted.sort_by(|a, b| {
        a.variant_id
            .cmp(&b.variant_id)
            .then_with(|| a.location_code.cmp(&b.location_code))
    });
    sorted
}

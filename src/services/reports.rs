use crate::{
    entities::{
        stock_item::{self, Entity as StockItem},
        stock_transaction::{self, Entity as StockTransaction, StockTransactionKind},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Filter for [`ReportService::export_transactions`]. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionFilter {
    pub variant_id: Option<Uuid>,
    pub location_code: Option<String>,
    pub kind: Option<StockTransactionKind>,
    /// Inclusive
    pub from: Option<DateTime<Utc>>,
    /// Exclusive
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub stock_item_id: Uuid,
    pub variant_id: Uuid,
    pub location_code: String,
    pub on_hand: i32,
    pub reserved: i32,
    pub available: i32,
    pub reorder_threshold: i32,
}

impl From<&stock_item::Model> for StockLevel {
    fn from(item: &stock_item::Model) -> Self {
        Self {
            stock_item_id: item.id,
            variant_id: item.variant_id,
            location_code: item.location_code.clone(),
            on_hand: item.quantity,
            reserved: item.reserved_quantity,
            available: item.available(),
            reorder_threshold: item.reorder_threshold,
        }
    }
}

/// Stock levels plus the day's movement per transaction kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailySnapshot {
    pub date: NaiveDate,
    pub levels: Vec<StockLevel>,
    /// Sum of signed deltas per kind for transactions written on `date`
    pub movements: BTreeMap<StockTransactionKind, i64>,
    pub transaction_count: usize,
}

/// A stock item whose counters disagree with its transaction log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub stock_item_id: Uuid,
    pub variant_id: Uuid,
    pub location_code: String,
    /// Sum of on-hand deltas in the log
    pub logged_quantity: i64,
    pub actual_quantity: i32,
    /// `reserved_after` of the newest log row, if any
    pub logged_reserved: Option<i32>,
    pub actual_reserved: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub checked_at: DateTime<Utc>,
    pub items_checked: usize,
    pub discrepancies: Vec<Discrepancy>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty()
    }
}

/// Read-only views over stock and its transaction log.
#[derive(Clone)]
pub struct ReportService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl ReportService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Transactions matching `filter`, oldest first.
    #[instrument(skip(self))]
    pub async fn export_transactions(
        &self,
        filter: TransactionFilter,
    ) -> Result<Vec<stock_transaction::Model>, ServiceError> {
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if to < from {
                return Err(ServiceError::ValidationError(
                    "Export range ends before it starts".to_string(),
                ));
            }
        }

        let mut query = StockTransaction::find();
        if let Some(variant_id) = filter.variant_id {
            query = query.filter(stock_transaction::Column::VariantId.eq(variant_id));
        }
        if let Some(location_code) = filter.location_code {
            query = query.filter(stock_transaction::Column::LocationCode.eq(location_code));
        }
        if let Some(kind) = filter.kind {
            query = query.filter(stock_transaction::Column::Kind.eq(kind));
        }
        if let Some(from) = filter.from {
            query = query.filter(stock_transaction::Column::CreatedAt.gte(from));
        }
        if let Some(to) = filter.to {
            query = query.filter(stock_transaction::Column::CreatedAt.lt(to));
        }

        Ok(query
            .order_by_asc(stock_transaction::Column::CreatedAt)
            .order_by_asc(stock_transaction::Column::Id)
            .all(&*self.db)
            .await?)
    }

    #[instrument(skip(self))]
    pub async fn daily_snapshot(&self, date: NaiveDate) -> Result<DailySnapshot, ServiceError> {
        let from = date.and_time(NaiveTime::MIN).and_utc();
        let transactions = self
            .export_transactions(TransactionFilter {
                from: Some(from),
                to: Some(from + Duration::days(1)),
                ..Default::default()
            })
            .await?;

        let mut movements = BTreeMap::new();
        for row in &transactions {
            *movements.entry(row.kind).or_insert(0i64) += i64::from(row.quantity);
        }

        let levels = self.levels().await?;
        Ok(DailySnapshot {
            date,
            levels,
            movements,
            transaction_count: transactions.len(),
        })
    }

    /// Replays the transaction log against every stock item.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconciliationReport, ServiceError> {
        let items = StockItem::find().all(&*self.db).await?;
        let transactions = StockTransaction::find()
            .order_by_asc(stock_transaction::Column::CreatedAt)
            .order_by_asc(stock_transaction::Column::Id)
            .all(&*self.db)
            .await?;

        let mut by_item: HashMap<Uuid, Vec<&stock_transaction::Model>> = HashMap::new();
        for row in &transactions {
            by_item.entry(row.stock_item_id).or_default().push(row);
        }

        let discrepancies: Vec<Discrepancy> = items
            .iter()
            .filter_map(|item| {
                let log = by_item.get(&item.id).map(Vec::as_slice).unwrap_or(&[]);
                check_item(item, log)
            })
            .collect();

        let report = ReconciliationReport {
            checked_at: Utc::now(),
            items_checked: items.len(),
            discrepancies,
        };

        if report.is_clean() {
            info!(items = report.items_checked, "Stock reconciled");
        } else {
            for d in &report.discrepancies {
                warn!(
                    stock_item_id = %d.stock_item_id,
                    logged_quantity = d.logged_quantity,
                    actual_quantity = d.actual_quantity,
                    logged_reserved = ?d.logged_reserved,
                    actual_reserved = d.actual_reserved,
                    "Stock counters disagree with transaction log"
                );
            }
        }
        metrics::gauge!(
            "petcare_reports.reconciliation_discrepancies",
            report.discrepancies.len() as f64
        );

        self.event_sender
            .send_or_log(Event::ReconciliationCompleted {
                date: report.checked_at.date_naive(),
                items_checked: report.items_checked,
                discrepancies: report.discrepancies.len(),
            })
            .await;
        Ok(report)
    }

    /// Items whose available quantity is at or below their reorder threshold.
    pub async fn low_stock(&self) -> Result<Vec<StockLevel>, ServiceError> {
        Ok(self
            .levels()
            .await?
            .into_iter()
            .filter(|level| level.available <= level.reorder_threshold)
            .collect())
    }

    async fn levels(&self) -> Result<Vec<StockLevel>, ServiceError> {
        Ok(StockItem::find()
            .order_by_asc(stock_item::Column::VariantId)
            .order_by_asc(stock_item::Column::LocationCode)
            .all(&*self.db)
            .await?
            .iter()
            .map(StockLevel::from)
            .collect())
    }
}

/// `log` must be oldest first.
fn check_item(
    item: &stock_item::Model,
    log: &[&stock_transaction::Model],
) -> Option<Discrepancy> {
    let logged_quantity: i64 = log
        .iter()
        .filter(|row| row.kind.affects_on_hand())
        .map(|row| i64::from(row.quantity))
        .sum();
    let logged_reserved = log.last().map(|row| row.reserved_after);

    let quantity_matches = logged_quantity == i64::from(item.quantity);
    let reserved_matches = logged_reserved.unwrap_or(0) == item.reserved_quantity;
    if quantity_matches && reserved_matches {
        return None;
    }
    Some(Discrepancy {
        stock_item_id: item.id,
        variant_id: item.variant_id,
        location_code: item.location_code.clone(),
        logged_quantity,
        actual_quantity: item.quantity,
        logged_reserved,
        actual_reserved: item.reserved_quantity,
    })
}

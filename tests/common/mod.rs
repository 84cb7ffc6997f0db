#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

use petcare_core::{
    config::AppConfig,
    db,
    entities::{
        appointment::{self, AppointmentStatus},
        cart, cart_item, clinic, clinic_service, product_variant,
        promotion::{self, DiscountType},
        staff, staff_availability, stock_item,
    },
    events::{Event, EventSender},
    services::inventory::StockLine,
    CoreServices,
};

/// Services over a fresh SQLite store, in memory unless built with `file_backed`.
pub struct TestApp {
    pub services: CoreServices,
    pub events: mpsc::Receiver<Event>,
    _dir: Option<TempDir>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut AppConfig)) -> Self {
        Self::build(None, tweak).await
    }

    /// A database file in a temp dir, shared by a pool of `connections`.
    pub async fn file_backed(connections: u32) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("petcare.db").display());
        Self::build(Some(dir), move |cfg| {
            cfg.database_url = url;
            cfg.db_max_connections = connections;
        })
        .await
    }

    async fn build(dir: Option<TempDir>, tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());
        // One connection keeps the in-memory database alive and shared.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.db_acquire_timeout_secs = 30;
        cfg.event_channel_capacity = 4096;
        tweak(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to open test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_sender, events) = EventSender::channel(cfg.event_channel_capacity);
        let services = CoreServices::new(Arc::new(pool), cfg, event_sender);
        Self {
            services,
            events,
            _dir: dir,
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.services.db
    }

    /// Everything published so far.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub async fn variant(&self, sku: &str, price: Decimal) -> product_variant::Model {
        let now = Utc::now();
        product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            sku: Set(sku.to_string()),
            name: Set(format!("{} product", sku)),
            price: Set(price),
            active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("insert variant")
    }

    /// Books `quantity` units in through the ledger so the transaction log stays consistent.
    pub async fn stock(&self, variant_id: Uuid, location: &str, quantity: i32) -> stock_item::Model {
        self.services
            .ledger
            .receive(&[StockLine::new(variant_id, location, quantity)], Some("seed"))
            .await
            .expect("seed stock");
        self.stock_item(variant_id, location).await
    }

    pub async fn stock_item(&self, variant_id: Uuid, location: &str) -> stock_item::Model {
        self.services
            .ledger
            .get_stock(variant_id, location)
            .await
            .expect("read stock")
            .expect("stock item exists")
    }

    pub async fn cart_with(&self, lines: &[(Uuid, &str, i32)]) -> cart::Model {
        let now = Utc::now();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            session_id: Set(Some("session".to_string())),
            customer_id: Set(Some(Uuid::new_v4())),
            currency: Set("USD".to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("insert cart");

        for (variant_id, location, quantity) in lines {
            cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart.id),
                variant_id: Set(*variant_id),
                location_code: Set(location.to_string()),
                quantity: Set(*quantity),
                created_at: Set(Utc::now()),
                updated_at: Set(Utc::now()),
            }
            .insert(self.db())
            .await
            .expect("insert cart item");
        }
        cart
    }

    pub async fn promotion(
        &self,
        code: &str,
        discount_type: DiscountType,
        value: Decimal,
        minimum: Option<Decimal>,
        usage_limit: Option<i32>,
    ) -> promotion::Model {
        let now = Utc::now();
        promotion::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_string()),
            description: Set(None),
            discount_type: Set(discount_type),
            discount_value: Set(value),
            minimum_order_amount: Set(minimum),
            active: Set(true),
            start_date: Set(now - chrono::Duration::days(1)),
            end_date: Set(now + chrono::Duration::days(1)),
            usage_count: Set(0),
            usage_limit: Set(usage_limit),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("insert promotion")
    }

    pub async fn reload_promotion(&self, id: Uuid) -> promotion::Model {
        promotion::Entity::find_by_id(id)
            .one(self.db())
            .await
            .expect("read promotion")
            .expect("promotion exists")
    }

    /// A clinic offering one service of `duration_minutes`.
    pub async fn clinic_with_service(
        &self,
        duration_minutes: i32,
    ) -> (clinic::Model, clinic_service::Model) {
        let now = Utc::now();
        let clinic = clinic::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set("Downtown Vet".to_string()),
            active: Set(true),
            created_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("insert clinic");

        let service = clinic_service::ActiveModel {
            id: Set(Uuid::new_v4()),
            clinic_id: Set(clinic.id),
            name: Set("Checkup".to_string()),
            duration_minutes: Set(duration_minutes),
            price: Set(Decimal::new(4500, 2)),
            active: Set(true),
            created_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("insert service");
        (clinic, service)
    }

    /// A staff member working `(day_of_week, start, end)` windows, times as `HH:MM`.
    pub async fn staff(&self, clinic_id: Uuid, windows: &[(i16, &str, &str)]) -> staff::Model {
        let member = staff::ActiveModel {
            id: Set(Uuid::new_v4()),
            clinic_id: Set(clinic_id),
            name: Set("Dr. Rivera".to_string()),
            role: Set(Some("veterinarian".to_string())),
            active: Set(true),
            booking_version: Set(0),
            created_at: Set(Utc::now()),
        }
        .insert(self.db())
        .await
        .expect("insert staff");

        for (day, start, end) in windows {
            staff_availability::ActiveModel {
                id: Set(Uuid::new_v4()),
                staff_id: Set(member.id),
                clinic_id: Set(clinic_id),
                day_of_week: Set(*day),
                start_time: Set(hm(start)),
                end_time: Set(hm(end)),
            }
            .insert(self.db())
            .await
            .expect("insert availability");
        }
        member
    }

    /// Inserts an appointment row directly, bypassing booking rules.
    pub async fn existing_appointment(
        &self,
        clinic_id: Uuid,
        service_id: Uuid,
        staff_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        status: AppointmentStatus,
    ) -> appointment::Model {
        appointment::ActiveModel {
            id: Set(Uuid::new_v4()),
            clinic_id: Set(clinic_id),
            service_id: Set(service_id),
            staff_id: Set(staff_id),
            customer_id: Set(Uuid::new_v4()),
            pet_id: Set(Uuid::new_v4()),
            start_time: Set(start),
            end_time: Set(end),
            status: Set(status),
            notes: Set(None),
            cancel_reason: Set(None),
            cancelled_by: Set(None),
            cancelled_at: Set(None),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(self.db())
        .await
        .expect("insert appointment")
    }
}

pub fn hm(value: &str) -> NaiveTime {
    NaiveTime::parse_from_str(value, "%H:%M").expect("HH:MM")
}

/// `2024-01-15` (a Monday) at `HH:MM` UTC.
pub fn monday_at(value: &str) -> DateTime<Utc> {
    chrono::NaiveDate::from_ymd_opt(2024, 1, 15)
        .expect("valid date")
        .and_time(hm(value))
        .and_utc()
}

pub const MONDAY: i16 = 1;

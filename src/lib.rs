//! Petcare core
//!
//! Stock reservation, order assembly and appointment scheduling for the pet-services marketplace.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod repositories;
pub mod services;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

pub use errors::{AppError, ServiceError};

use services::{
    commerce::{CartService, CheckoutService, FlatRatePricing, PricingService},
    inventory::{InventoryLedger, LedgerSettings},
    order_status::OrderLifecycle,
    promotions::PromotionService,
    reports::ReportService,
    scheduling::{AppointmentService, AvailabilityCalculator},
};

/// Every service wired to one pool, one event channel and one configuration.
#[derive(Clone)]
pub struct CoreServices {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub ledger: InventoryLedger,
    pub carts: CartService,
    pub promotions: PromotionService,
    pub checkout: CheckoutService,
    pub orders: OrderLifecycle,
    pub availability: AvailabilityCalculator,
    pub appointments: AppointmentService,
    pub reports: ReportService,
}

impl CoreServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: config::AppConfig,
        event_sender: events::EventSender,
    ) -> Self {
        let ledger = InventoryLedger::new(db.clone(), event_sender.clone())
            .with_settings(LedgerSettings::from(&config));
        let pricing = PricingService::flat_rate(FlatRatePricing::from(&config));
        let promotions = PromotionService::new(db.clone());
        let checkout = CheckoutService::new(
            db.clone(),
            ledger.clone(),
            pricing,
            promotions.clone(),
            event_sender.clone(),
        )
        .with_config(&config);

        Self {
            carts: CartService::new(db.clone(), event_sender.clone()).with_config(&config),
            orders: OrderLifecycle::new(db.clone(), ledger.clone(), event_sender.clone()),
            availability: AvailabilityCalculator::new(db.clone()).with_config(&config),
            appointments: AppointmentService::new(db.clone(), event_sender.clone()),
            reports: ReportService::new(db.clone(), event_sender.clone()),
            promotions,
            checkout,
            ledger,
            db,
            config,
            event_sender,
        }
    }
}

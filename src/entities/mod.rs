pub mod commerce;
pub mod order;
pub mod order_item;
pub mod order_status_history;
pub mod scheduling;
pub mod stock_item;
pub mod stock_transaction;

pub use commerce::{cart, cart_item, product_variant, promotion};
pub use scheduling::{appointment, appointment_note, clinic, clinic_service, staff, staff_availability};

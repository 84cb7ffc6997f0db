pub mod commerce;
pub mod inventory;
pub mod order_status;
pub mod promotions;
pub mod reports;
pub mod scheduling;

pub mod cart_service;
pub mod checkout_service;
pub mod pricing_service;

pub use cart_service::{AddCartItemInput, CartService, CartWithItems, CreateCartInput};
pub use checkout_service::{CheckoutService, OrderParams, OrderWithItems};
pub use pricing_service::{FlatRatePricing, PricingService, PricingStrategy};

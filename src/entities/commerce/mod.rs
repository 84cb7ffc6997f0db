pub mod cart;
pub mod cart_item;
pub mod product_variant;
pub mod promotion;

// Cart and pricing
pub mod cart;

// Order lifecycle
pub mod order_numbers;
pub mod orders;

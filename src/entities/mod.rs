//! Persisted records of the fulfillment pipeline.
pub mod address;
pub mod cart;
pub mod cart_item;
pub mod offer;
pub mod order;
pub mod order_sequence;
pub mod payment;
pub mod product;
pub mod retry_job;
pub mod shipment;

pub use address::{Entity as Address, Model as AddressModel};
pub use cart::{Entity as Cart, Model as CartModel};
pub use cart_item::{Entity as CartItem, Model as CartItemModel};
pub use offer::{Entity as Offer, Model as OfferModel};
pub use order::{Entity as Order, Model as OrderModel, OrderStatus, PaymentMethod};
pub use order_sequence::Entity as OrderSequence;
pub use payment::{Entity as Payment, Model as PaymentModel, PaymentStatus};
pub use product::{Entity as Product, Model as ProductModel};
pub use retry_job::{Entity as RetryJob, Model as RetryJobModel, RetryJobStatus};
pub use shipment::{Entity as Shipment, Model as ShipmentModel};

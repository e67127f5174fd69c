//! Payment-gateway collaborator: order creation and HMAC signature checks.
mod gateway;
mod signature;

pub use gateway::{
    GatewayOrder, GatewayOrderRequest, HttpPaymentGateway, PaymentGateway, PaymentGatewayError,
};
pub use signature::PaymentSignatureVerifier;

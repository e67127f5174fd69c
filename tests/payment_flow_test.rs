mod common;

use assert_matches::assert_matches;
use common::{TestContext, TEST_PAYMENT_SECRET};
use storefront_fulfillment::{
    entities::{OrderModel, OrderStatus, PaymentMethod, PaymentStatus},
    errors::ServiceError,
    payments::PaymentSignatureVerifier,
    services::{
        cart::{AddItemInput, CartOwner},
        orders::{CreateOrderInput, VerifyPaymentInput},
    },
};

async fn placed_order(ctx: &TestContext) -> (CartOwner, OrderModel) {
    let owner = TestContext::guest();
    let product = ctx.seed_product("Filter Coffee", 459).await;
    ctx.services()
        .cart
        .add_item(
            &owner,
            AddItemInput {
                product_id: product.id,
                size: "227gm".into(),
                quantity: 2,
                offer_id: None,
            },
        )
        .await
        .unwrap();
    let order = ctx
        .services()
        .orders
        .create_order(&owner, CreateOrderInput::default())
        .await
        .unwrap();
    (owner, order)
}

fn signed(gateway_order_id: &str, gateway_payment_id: &str) -> VerifyPaymentInput {
    let signature = PaymentSignatureVerifier::new(TEST_PAYMENT_SECRET)
        .sign(gateway_order_id, gateway_payment_id)
        .unwrap();
    VerifyPaymentInput {
        gateway_order_id: gateway_order_id.to_string(),
        gateway_payment_id: gateway_payment_id.to_string(),
        signature,
    }
}

#[tokio::test]
async fn create_order_snapshots_cart_and_initiates_payment() {
    let ctx = TestContext::new().await;
    let (owner, order) = placed_order(&ctx).await;

    assert_eq!(order.status, OrderStatus::Created);
    assert_eq!(order.total_amount, 918);
    assert_eq!(order.product_count, 2);
    assert_eq!(order.lines().len(), 1);
    assert_eq!(order.lines()[0].line_total, 918);

    let payment = ctx.services().orders.get_payment(order.id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Initiated);
    assert_eq!(payment.amount, 918);

    // the cart is only cleared after shipment
    let cart = ctx.services().cart.get_cart(&owner).await.unwrap().unwrap();
    assert_eq!(cart.items.len(), 1);
}

#[tokio::test]
async fn cod_confirmation_is_idempotent() {
    let ctx = TestContext::new().await;
    let (_, order) = placed_order(&ctx).await;
    let orders = &ctx.services().orders;

    let confirmed = orders.confirm_cod(&order.order_number).await.unwrap();
    assert_eq!(confirmed.status, OrderStatus::CodConfirmed);
    assert_eq!(confirmed.payment_method, PaymentMethod::Cod);
    let payment = orders.get_payment(order.id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);

    let again = orders.confirm_cod(&order.order_number).await.unwrap();
    assert_eq!(again.status, OrderStatus::CodConfirmed);
}

#[tokio::test]
async fn online_payment_initiation_reuses_gateway_order() {
    let ctx = TestContext::new().await;
    let (_, order) = placed_order(&ctx).await;
    let orders = &ctx.services().orders;

    let first = orders.initiate_online_payment(&order.order_number).await.unwrap();
    let second = orders.initiate_online_payment(&order.order_number).await.unwrap();
    assert_eq!(first.gateway_order_id, second.gateway_order_id);
    assert_eq!(first.amount, 918);
    assert_eq!(first.key_id, "key_test");
    assert_eq!(ctx.gateway.calls(), 1);

    let request = ctx.gateway.requests.lock().unwrap()[0].clone();
    assert_eq!(request.receipt, order.order_number);
    assert_eq!(request.amount, 918);

    let order = orders.get_order(&order.order_number).await.unwrap();
    assert_eq!(order.status, OrderStatus::PendingPayment);
}

#[tokio::test]
async fn valid_signature_marks_order_paid() {
    let ctx = TestContext::new().await;
    let (_, order) = placed_order(&ctx).await;
    let orders = &ctx.services().orders;
    let initiation = orders.initiate_online_payment(&order.order_number).await.unwrap();

    let input = signed(&initiation.gateway_order_id, "pay_001");
    let paid = orders
        .verify_online_payment(&order.order_number, input.clone())
        .await
        .unwrap();
    assert_eq!(paid.status, OrderStatus::Paid);
    assert_eq!(paid.gateway_payment_id.as_deref(), Some("pay_001"));
    let payment = orders.get_payment(order.id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Success);

    // a replayed callback is accepted without changes
    let replay = orders
        .verify_online_payment(&order.order_number, input)
        .await
        .unwrap();
    assert_eq!(replay.status, OrderStatus::Paid);
}

#[tokio::test]
async fn bad_signature_fails_payment_but_not_order() {
    let ctx = TestContext::new().await;
    let (_, order) = placed_order(&ctx).await;
    let orders = &ctx.services().orders;
    let initiation = orders.initiate_online_payment(&order.order_number).await.unwrap();

    let mut input = signed(&initiation.gateway_order_id, "pay_001");
    input.signature = "0".repeat(64);
    let err = orders
        .verify_online_payment(&order.order_number, input)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::PaymentVerificationFailed(_));
    assert!(!err.is_retryable());

    let order = orders.get_order(&order.order_number).await.unwrap();
    assert_eq!(order.status, OrderStatus::PendingPayment);
    let payment = orders.get_payment(order.id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);

    // the customer can still complete payment
    let paid = orders
        .verify_online_payment(
            &order.order_number,
            signed(&initiation.gateway_order_id, "pay_002"),
        )
        .await
        .unwrap();
    assert_eq!(paid.status, OrderStatus::Paid);
}

#[tokio::test]
async fn signature_for_another_gateway_order_is_rejected() {
    let ctx = TestContext::new().await;
    let (_, order) = placed_order(&ctx).await;
    let orders = &ctx.services().orders;
    orders.initiate_online_payment(&order.order_number).await.unwrap();

    // correctly signed, but for a gateway order this order never opened
    let err = orders
        .verify_online_payment(&order.order_number, signed("order_gw_other", "pay_001"))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::PaymentVerificationFailed(_));
}

#[tokio::test]
async fn gateway_failure_moves_pending_order_to_payment_failed() {
    let ctx = TestContext::new().await;
    let (_, order) = placed_order(&ctx).await;
    let orders = &ctx.services().orders;

    let err = orders
        .record_payment_failure(&order.order_number, "card declined")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidStatus(_));

    orders.initiate_online_payment(&order.order_number).await.unwrap();
    let failed = orders
        .record_payment_failure(&order.order_number, "card declined")
        .await
        .unwrap();
    assert_eq!(failed.status, OrderStatus::PaymentFailed);
    let payment = orders.get_payment(order.id).await.unwrap();
    assert_eq!(payment.failure_reason.as_deref(), Some("card declined"));

    // switching to cash on delivery is still possible
    let cod = orders.confirm_cod(&order.order_number).await.unwrap();
    assert_eq!(cod.status, OrderStatus::CodConfirmed);
}

#[tokio::test]
async fn unpaid_order_cannot_ship() {
    let ctx = TestContext::new().await;
    let (owner, order) = placed_order(&ctx).await;
    ctx.seed_default_address(&owner, None).await;

    let err = ctx
        .services()
        .orders
        .create_shipment(&order.order_number)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidStatus(_));
    assert_eq!(ctx.carrier.calls(), 0);
}

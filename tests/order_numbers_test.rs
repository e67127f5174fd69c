mod common;

use std::collections::HashSet;

use assert_matches::assert_matches;
use chrono::{Local, NaiveDate, Utc};
use common::TestContext;
use regex::Regex;
use sea_orm::{ActiveModelTrait, Set};
use storefront_fulfillment::{
    config::OrderNumberStrategy,
    entities::{order, OrderStatus, PaymentMethod},
    errors::ServiceError,
    services::{
        cart::{AddItemInput, CartOwner},
        order_numbers::{date_prefix, OrderNumberGenerator},
        orders::CreateOrderInput,
    },
};
use uuid::Uuid;

async fn insert_order_with_number(ctx: &TestContext, number: &str) {
    let now = Utc::now();
    order::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_number: Set(number.to_string()),
        user_id: Set(None),
        session_id: Set(Some("seed".into())),
        cart_id: Set(Uuid::new_v4()),
        status: Set(OrderStatus::Created),
        payment_method: Set(PaymentMethod::Online),
        total_amount: Set(100),
        currency: Set("INR".into()),
        product_ids: Set(serde_json::json!([])),
        product_count: Set(1),
        line_items: Set(serde_json::json!([])),
        carrier_order_ref: Set(None),
        gateway_order_id: Set(None),
        gateway_payment_id: Set(None),
        shipment_claimed_at: Set(None),
        issued_shipment: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&*ctx.state.db)
    .await
    .unwrap();
}

#[tokio::test]
async fn atomic_numbers_are_distinct_under_concurrency() {
    let ctx = TestContext::new().await;
    let generator = OrderNumberGenerator::new(ctx.state.db.clone(), OrderNumberStrategy::Atomic);
    let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();

    let handles: Vec<_> = (0..25)
        .map(|_| {
            let generator = generator.clone();
            tokio::spawn(async move { generator.next_for_date(date).await })
        })
        .collect();

    let mut numbers = HashSet::new();
    for handle in handles {
        numbers.insert(handle.await.unwrap());
    }
    assert_eq!(numbers.len(), 25);
    assert!(numbers.contains("2026101900001"));
    assert!(numbers.contains("2026101900025"));
}

#[tokio::test]
async fn sequence_restarts_each_day() {
    let ctx = TestContext::new().await;
    let generator = OrderNumberGenerator::new(ctx.state.db.clone(), OrderNumberStrategy::Atomic);
    let monday = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
    let tuesday = NaiveDate::from_ymd_opt(2026, 10, 20).unwrap();

    assert_eq!(generator.next_for_date(monday).await, "2026101900001");
    assert_eq!(generator.next_for_date(monday).await, "2026101900002");
    assert_eq!(generator.next_for_date(tuesday).await, "2026102000001");
}

#[tokio::test]
async fn scan_strategy_continues_after_highest_existing_number() {
    let ctx = TestContext::new().await;
    let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
    insert_order_with_number(&ctx, "2026101900007").await;
    insert_order_with_number(&ctx, "2026101900041").await;
    insert_order_with_number(&ctx, "2026101800099").await;

    let generator = OrderNumberGenerator::new(ctx.state.db.clone(), OrderNumberStrategy::Scan);
    assert_eq!(generator.next_for_date(date).await, "2026101900042");

    let fresh_day = NaiveDate::from_ymd_opt(2026, 11, 1).unwrap();
    assert_eq!(generator.next_for_date(fresh_day).await, "2026110100001");
}

#[tokio::test]
async fn created_orders_use_todays_prefix() {
    let ctx = TestContext::new().await;
    let owner = cart_with_one_item(&ctx).await;

    let order = ctx
        .services()
        .orders
        .create_order(&owner, CreateOrderInput::default())
        .await
        .unwrap();
    let pattern = Regex::new(r"^\d{8}\d{5}$").unwrap();
    assert!(pattern.is_match(&order.order_number), "{}", order.order_number);
    assert!(order
        .order_number
        .starts_with(&date_prefix(Local::now().date_naive())));
}

async fn cart_with_one_item(ctx: &TestContext) -> CartOwner {
    let owner = TestContext::guest();
    let product = ctx.seed_product("Coffee", 459).await;
    ctx.services()
        .cart
        .add_item(
            &owner,
            AddItemInput {
                product_id: product.id,
                size: "227gm".into(),
                quantity: 1,
                offer_id: None,
            },
        )
        .await
        .unwrap();
    owner
}

#[tokio::test]
async fn create_retries_with_fresh_number_after_conflict() {
    let ctx = TestContext::new().await;
    let owner = cart_with_one_item(&ctx).await;
    let prefix = date_prefix(Local::now().date_naive());
    // taken outside the counter, so the first allocated number collides
    insert_order_with_number(&ctx, &format!("{}00001", prefix)).await;

    let order = ctx
        .services()
        .orders
        .create_order(&owner, CreateOrderInput::default())
        .await
        .unwrap();
    assert_eq!(order.order_number, format!("{}00002", prefix));
}

#[tokio::test]
async fn create_gives_up_after_configured_attempts() {
    let ctx = TestContext::with_config(|cfg| cfg.orders.max_create_attempts = 2).await;
    let owner = cart_with_one_item(&ctx).await;
    let prefix = date_prefix(Local::now().date_naive());
    insert_order_with_number(&ctx, &format!("{}00001", prefix)).await;
    insert_order_with_number(&ctx, &format!("{}00002", prefix)).await;

    let err = ctx
        .services()
        .orders
        .create_order(&owner, CreateOrderInput::default())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::OrderCreateFailed(_));
    assert!(err.is_retryable());

    // the next call gets past the taken numbers
    let order = ctx
        .services()
        .orders
        .create_order(&owner, CreateOrderInput::default())
        .await
        .unwrap();
    assert_eq!(order.order_number, format!("{}00003", prefix));
}

#[tokio::test]
async fn empty_cart_cannot_become_an_order() {
    let ctx = TestContext::new().await;
    let owner = TestContext::guest();

    let err = ctx
        .services()
        .orders
        .create_order(&owner, CreateOrderInput::default())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::CartEmpty);

    ctx.services().cart.get_or_create_cart(&owner).await.unwrap();
    let err = ctx
        .services()
        .orders
        .create_order(&owner, CreateOrderInput::default())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::CartEmpty);
}

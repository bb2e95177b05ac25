//! Checkout through payment reconciliation, driven through the services.
//!
//! Covers pricing with a coupon, the gateway minimum, the signed callback and
//! the exactly-once side effects of reconciliation.

mod common;

use assert_matches::assert_matches;
use common::{line, new_order, sign, TestApp};
use rust_decimal_macros::dec;
use sea_orm::{ConnectionTrait, EntityTrait};
use storefront_api::{
    entities::{
        commerce::DiscountType,
        order::{OrderStatus, PaymentStatus, ShippingMethod},
        product,
    },
    errors::ServiceError,
    services::{fulfillment::PaymentCallback, pricing::LineRequest},
};
use uuid::Uuid;

fn callback(order_id: Uuid, gateway_order_id: &str, payment_id: &str) -> PaymentCallback {
    PaymentCallback {
        order_id,
        gateway_order_id: gateway_order_id.to_string(),
        gateway_payment_id: payment_id.to_string(),
        signature: sign(gateway_order_id, payment_id),
    }
}

#[tokio::test]
async fn coupon_checkout_settles_stock_coupon_and_mail_once() {
    let app = TestApp::new().await;
    let product = app.seed_product("Brass Lamp", dec!(1000), 10).await;
    app.seed_coupon("SAVE10", DiscountType::Percentage, dec!(10), None, Some(100))
        .await;

    let created = app
        .state
        .services
        .orders
        .create_order(None, new_order(vec![line(product.id, 2)], Some("save10")))
        .await
        .expect("order created");

    assert_eq!(created.total, dec!(1800));
    assert_eq!(created.amount, 180_000);
    assert_eq!(created.currency, "INR");
    assert!(created.order_number.starts_with("ORD-"));
    assert_eq!(app.gateway.calls(), 1);

    let pending = app.order(created.order_id).await;
    assert_eq!(pending.status, OrderStatus::Pending);
    assert_eq!(pending.payment_status, PaymentStatus::Pending);
    assert_eq!(pending.subtotal, dec!(2000));
    assert_eq!(pending.discount, dec!(200));
    assert_eq!(pending.coupon_code.as_deref(), Some("SAVE10"));
    assert_eq!(pending.customer_email, "asha@example.com");

    // Creating the order touches neither stock nor coupon usage
    assert_eq!(app.product(product.id).await.stock_quantity, 10);
    assert_eq!(app.coupon("SAVE10").await.usage_count, 0);

    let outcome = app
        .state
        .services
        .fulfillment
        .handle_callback(callback(created.order_id, &created.gateway_order_id, "pay_001"))
        .await
        .expect("payment reconciled");

    assert!(!outcome.replayed);
    assert_eq!(outcome.order.status, OrderStatus::Processing);
    assert_eq!(outcome.order.payment_status, PaymentStatus::Paid);
    assert_eq!(outcome.order.gateway_payment_id.as_deref(), Some("pay_001"));
    assert!(outcome.order.paid_at.is_some());

    let product = app.product(product.id).await;
    assert_eq!(product.stock_quantity, 8);
    assert_eq!(product.sales_count, 2);
    assert_eq!(app.coupon("SAVE10").await.usage_count, 1);

    let mails = app.mailer.sent();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].to, "asha@example.com");
    assert!(mails[0].subject.contains(&created.order_number));
}

#[tokio::test]
async fn replayed_callback_changes_nothing() {
    let app = TestApp::new().await;
    let product = app.seed_product("Teak Tray", dec!(500), 5).await;
    app.seed_coupon("FLAT50", DiscountType::Fixed, dec!(50), None, None)
        .await;

    let created = app
        .state
        .services
        .orders
        .create_order(None, new_order(vec![line(product.id, 1)], Some("FLAT50")))
        .await
        .unwrap();
    assert_eq!(created.total, dec!(450));

    let cb = callback(created.order_id, &created.gateway_order_id, "pay_first");
    let first = app
        .state
        .services
        .fulfillment
        .handle_callback(cb.clone())
        .await
        .unwrap();
    assert!(!first.replayed);

    let second = app
        .state
        .services
        .fulfillment
        .handle_callback(cb)
        .await
        .expect("replay is not an error");
    assert!(second.replayed);
    assert_eq!(second.order.status, OrderStatus::Processing);

    // A different payment id for the same order is also ignored
    let third = app
        .state
        .services
        .fulfillment
        .handle_callback(callback(
            created.order_id,
            &created.gateway_order_id,
            "pay_second",
        ))
        .await
        .unwrap();
    assert!(third.replayed);
    assert_eq!(third.order.gateway_payment_id.as_deref(), Some("pay_first"));

    let product = app.product(product.id).await;
    assert_eq!(product.stock_quantity, 4);
    assert_eq!(product.sales_count, 1);
    assert_eq!(app.coupon("FLAT50").await.usage_count, 1);
    assert_eq!(app.mailer.sent().len(), 1);
}

#[tokio::test]
async fn concurrent_callbacks_apply_once() {
    let app = TestApp::new().await;
    let product = app.seed_product("Clay Pot", dec!(250), 20).await;

    let created = app
        .state
        .services
        .orders
        .create_order(None, new_order(vec![line(product.id, 3)], None))
        .await
        .unwrap();

    let fulfillment = app.state.services.fulfillment.clone();
    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let fulfillment = fulfillment.clone();
            let cb = callback(
                created.order_id,
                &created.gateway_order_id,
                &format!("pay_race_{i}"),
            );
            tokio::spawn(async move { fulfillment.handle_callback(cb).await })
        })
        .collect();

    let mut applied = 0;
    for task in tasks {
        let outcome = task.await.expect("task").expect("reconcile");
        if !outcome.replayed {
            applied += 1;
        }
    }
    assert_eq!(applied, 1);

    let product = app.product(product.id).await;
    assert_eq!(product.stock_quantity, 17);
    assert_eq!(product.sales_count, 3);
    assert_eq!(app.mailer.sent().len(), 1);
}

#[tokio::test]
async fn tampered_signature_leaves_order_untouched() {
    let app = TestApp::new().await;
    let product = app.seed_product("Silk Scarf", dec!(1200), 4).await;
    app.seed_coupon("FESTIVE", DiscountType::Fixed, dec!(100), None, None)
        .await;

    let created = app
        .state
        .services
        .orders
        .create_order(None, new_order(vec![line(product.id, 1)], Some("FESTIVE")))
        .await
        .unwrap();

    let mut flipped = callback(created.order_id, &created.gateway_order_id, "pay_real");
    let last = if flipped.signature.ends_with('0') { "1" } else { "0" };
    flipped.signature.replace_range(flipped.signature.len() - 1.., last);
    assert_matches!(
        app.state.services.fulfillment.handle_callback(flipped).await,
        Err(ServiceError::InvalidSignature)
    );

    let mut forged = callback(created.order_id, &created.gateway_order_id, "pay_real");
    forged.gateway_payment_id = "pay_forged".to_string();

    let err = app
        .state
        .services
        .fulfillment
        .handle_callback(forged)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidSignature);

    let mut garbage = callback(created.order_id, &created.gateway_order_id, "pay_real");
    garbage.signature = "not-hex".to_string();
    assert_matches!(
        app.state.services.fulfillment.handle_callback(garbage).await,
        Err(ServiceError::InvalidSignature)
    );

    let order = app.order(created.order_id).await;
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment_status, PaymentStatus::Pending);
    let product = app.product(product.id).await;
    assert_eq!(product.stock_quantity, 4);
    assert_eq!(product.sales_count, 0);
    assert_eq!(app.coupon("FESTIVE").await.usage_count, 0);
    assert!(app.mailer.sent().is_empty());
}

#[tokio::test]
async fn failed_reconciliation_rolls_back_every_effect() {
    let app = TestApp::new().await;
    let lamp = app.seed_product("Brass Lamp", dec!(1000), 10).await;
    let tray = app.seed_product("Teak Tray", dec!(500), 5).await;
    app.seed_coupon("SAVE10", DiscountType::Percentage, dec!(10), None, None)
        .await;

    let created = app
        .state
        .services
        .orders
        .create_order(
            None,
            new_order(vec![line(lamp.id, 2), line(tray.id, 1)], Some("SAVE10")),
        )
        .await
        .unwrap();
    assert_eq!(created.total, dec!(2250));

    // The second line's product vanishes between checkout and payment
    product::Entity::delete_by_id(tray.id)
        .exec(&*app.state.db)
        .await
        .unwrap();

    let err = app
        .state
        .services
        .fulfillment
        .handle_callback(callback(created.order_id, &created.gateway_order_id, "pay_001"))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::FulfillmentFailed(_));

    let order = app.order(created.order_id).await;
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment_status, PaymentStatus::Pending);
    assert!(order.gateway_payment_id.is_none());

    let lamp = app.product(lamp.id).await;
    assert_eq!(lamp.stock_quantity, 10);
    assert_eq!(lamp.sales_count, 0);
    assert_eq!(app.coupon("SAVE10").await.usage_count, 0);
    assert!(app.mailer.sent().is_empty());
}

#[tokio::test]
async fn callback_for_another_gateway_order_is_rejected() {
    let app = TestApp::new().await;
    let product = app.seed_product("Copper Mug", dec!(300), 6).await;

    let first = app
        .state
        .services
        .orders
        .create_order(None, new_order(vec![line(product.id, 1)], None))
        .await
        .unwrap();
    let second = app
        .state
        .services
        .orders
        .create_order(None, new_order(vec![line(product.id, 1)], None))
        .await
        .unwrap();

    // Validly signed, but for the second order's charge
    let err = app
        .state
        .services
        .fulfillment
        .handle_callback(callback(first.order_id, &second.gateway_order_id, "pay_x"))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::BadRequest(_));
    assert_eq!(
        app.order(first.order_id).await.payment_status,
        PaymentStatus::Pending
    );

    let err = app
        .state
        .services
        .fulfillment
        .handle_callback(callback(Uuid::new_v4(), &first.gateway_order_id, "pay_y"))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn small_order_above_gateway_minimum_is_accepted() {
    let app = TestApp::new().await;
    let product = app.seed_product("Incense", dec!(50), 100).await;

    let created = app
        .state
        .services
        .orders
        .create_order(None, new_order(vec![line(product.id, 1)], None))
        .await
        .expect("order above minimum");

    assert_eq!(created.total, dec!(50));
    assert_eq!(created.amount, 5_000);
}

#[tokio::test]
async fn order_below_gateway_minimum_never_reaches_gateway() {
    let app = TestApp::new().await;
    let product = app.seed_product("Sticker", dec!(0.5), 100).await;

    let err = app
        .state
        .services
        .orders
        .create_order(None, new_order(vec![line(product.id, 1)], None))
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::BadRequest(_));
    assert_eq!(app.gateway.calls(), 0);
    assert_eq!(app.order_count().await, 0);
}

#[tokio::test]
async fn gateway_failure_persists_nothing() {
    let app = TestApp::new().await;
    let product = app.seed_product("Rug", dec!(4000), 2).await;
    app.gateway.fail_next_charges(true);

    let err = app
        .state
        .services
        .orders
        .create_order(None, new_order(vec![line(product.id, 1)], None))
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::PaymentInitializationFailed(_));
    assert_eq!(app.gateway.calls(), 1);
    assert_eq!(app.order_count().await, 0);
}

#[tokio::test]
async fn store_failure_after_charge_is_reported() {
    let app = TestApp::new().await;
    let product = app.seed_product("Rug", dec!(4000), 2).await;
    app.state
        .db
        .execute_unprepared("DROP TABLE orders")
        .await
        .unwrap();

    let err = app
        .state
        .services
        .orders
        .create_order(None, new_order(vec![line(product.id, 1)], None))
        .await
        .unwrap_err();

    // Order number allocation fails after the gateway was charged
    assert_matches!(err, ServiceError::DatabaseError(_));
    assert_eq!(app.gateway.calls(), 1);
}

#[tokio::test]
async fn gateway_amount_mismatch_persists_nothing() {
    let app = TestApp::new().await;
    let product = app.seed_product("Vase", dec!(700), 2).await;
    app.gateway.skew_amount(1);

    let err = app
        .state
        .services
        .orders
        .create_order(None, new_order(vec![line(product.id, 1)], None))
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::PaymentInitializationFailed(_));
    assert_eq!(app.order_count().await, 0);
}

#[tokio::test]
async fn invalid_coupon_blocks_order() {
    let app = TestApp::new().await;
    let product = app.seed_product("Lantern", dec!(900), 3).await;
    app.seed_coupon("BIG500", DiscountType::Fixed, dec!(500), Some(dec!(5000)), None)
        .await;

    let err = app
        .state
        .services
        .orders
        .create_order(None, new_order(vec![line(product.id, 1)], Some("NOPE")))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(msg) if msg.contains("invalid code"));

    let err = app
        .state
        .services
        .orders
        .create_order(None, new_order(vec![line(product.id, 1)], Some("big500")))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(msg) if msg.contains("minimum order"));

    assert_eq!(app.gateway.calls(), 0);
    assert_eq!(app.order_count().await, 0);
}

#[tokio::test]
async fn catalog_price_wins_over_client_price() {
    let app = TestApp::new().await;
    let product = app.seed_product("Candle", dec!(150), 10).await;

    let items = vec![LineRequest {
        product_id: product.id,
        variant_id: None,
        quantity: 2,
        client_unit_price: Some(dec!(1)),
    }];
    let created = app
        .state
        .services
        .orders
        .create_order(None, new_order(items, None))
        .await
        .unwrap();

    assert_eq!(created.total, dec!(300));
    assert_eq!(created.amount, 30_000);
}

#[tokio::test]
async fn variant_lines_take_variant_price_and_stock() {
    let app = TestApp::new().await;
    let product = app.seed_product("Kurta", dec!(800), 50).await;
    let variant = app.seed_variant(product.id, "XL", dec!(900), 5).await;
    app.state
        .services
        .shipping
        .cost_for(ShippingMethod::Express)
        .await
        .expect("shipping settings readable");

    let mut order = new_order(
        vec![LineRequest {
            product_id: product.id,
            variant_id: Some(variant.id),
            quantity: 2,
            client_unit_price: None,
        }],
        None,
    );
    order.shipping_method = ShippingMethod::Express;

    let created = app
        .state
        .services
        .orders
        .create_order(None, order)
        .await
        .unwrap();
    // 2 x 900 + default express shipping
    assert_eq!(created.total, dec!(1900));

    app.state
        .services
        .fulfillment
        .handle_callback(callback(created.order_id, &created.gateway_order_id, "pay_v"))
        .await
        .unwrap();

    let product = app.product(product.id).await;
    assert_eq!(product.stock_quantity, 50);
    assert_eq!(product.sales_count, 2);
    assert_eq!(app.variant(variant.id).await.stock_quantity, 3);
}

#[tokio::test]
async fn unknown_product_is_a_validation_error() {
    let app = TestApp::new().await;

    let err = app
        .state
        .services
        .orders
        .create_order(None, new_order(vec![line(Uuid::new_v4(), 1)], None))
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::ValidationError(_));
    assert_eq!(app.gateway.calls(), 0);
}

#[tokio::test]
async fn oversized_quantity_is_refused_before_charging() {
    let app = TestApp::new().await;
    let product = app.seed_product("Cotton Towel", dec!(1), 1_000_000).await;

    let err = app
        .state
        .services
        .orders
        .create_order(None, new_order(vec![line(product.id, i32::MAX)], None))
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::ValidationError(_));
    assert_eq!(app.gateway.calls(), 0);
    assert_eq!(app.order_count().await, 0);
}

mod common;

use agrimart_api::entities::order::{LogisticsStatus, OrderStatus, ShipmentStatus};
use agrimart_api::entities::user::{self, UserRole};
use agrimart_api::errors::ServiceError;
use common::{delivery_address, TestApp};
use rust_decimal_macros::dec;
use uuid::Uuid;

struct Marketplace {
    app: TestApp,
    ravi: user::Model,
    asha: user::Model,
    idle_farmer: user::Model,
    meera: user::Model,
    order_id: Uuid,
}

/// Confirmed order with a Ravi line (2 × 50) and an Asha line (3 × 20)
async fn marketplace() -> Marketplace {
    let app = TestApp::new().await;
    let ravi = app.seed_user("Ravi", UserRole::Farmer).await;
    let asha = app.seed_user("Asha", UserRole::Farmer).await;
    let idle_farmer = app.seed_user("Kiran", UserRole::Farmer).await;
    let meera = app.seed_user("Meera", UserRole::Consumer).await;

    let tomato = app.seed_product(&ravi, "Tomato", dec!(50), 10).await;
    let okra = app.seed_product(&asha, "Okra", dec!(20), 10).await;
    app.seed_product(&idle_farmer, "Garlic", dec!(80), 10).await;
    app.seed_cart(&meera, &[(tomato.id, 2), (okra.id, 3)]).await;

    let checkout = &app.state.services.checkout;
    let created = checkout
        .initiate_order(meera.id, delivery_address())
        .await
        .unwrap();
    checkout
        .confirm_order(&app.caller(&meera), created.order_id, &created.gateway_order_id)
        .await
        .unwrap();

    Marketplace {
        order_id: created.order_id,
        app,
        ravi,
        asha,
        idle_farmer,
        meera,
    }
}

#[tokio::test]
async fn consumer_sees_paid_orders_with_full_totals() {
    let m = marketplace().await;

    // a second, unpaid checkout must not show up
    let tomato_id = m.app.order(m.order_id).await.shipping_info.0[0].product_id;
    m.app.seed_cart(&m.meera, &[(tomato_id, 1)]).await;
    m.app
        .state
        .services
        .checkout
        .initiate_order(m.meera.id, delivery_address())
        .await
        .unwrap();

    let orders = m
        .app
        .state
        .services
        .queries
        .consumer_orders(m.meera.id)
        .await
        .unwrap();

    assert_eq!(orders.len(), 1);
    let summary = &orders[0];
    assert_eq!(summary.id, m.order_id);
    assert_eq!(summary.order_status, OrderStatus::Confirmed);
    assert_eq!(summary.item_count, 2);
    assert_eq!(summary.total_amount, dec!(160));
    let contact = summary.consumer.as_ref().expect("consumer contact");
    assert_eq!(contact.name, "Meera");
    assert_eq!(contact.phone.as_deref(), Some("+91-9800000000"));
}

#[tokio::test]
async fn farmer_view_only_counts_own_items() {
    let m = marketplace().await;
    let queries = &m.app.state.services.queries;

    let ravi_orders = queries.farmer_orders(m.ravi.id).await.unwrap();
    assert_eq!(ravi_orders.len(), 1);
    assert_eq!(ravi_orders[0].item_count, 1);
    assert_eq!(ravi_orders[0].total_amount, dec!(100));

    let asha_orders = queries.farmer_orders(m.asha.id).await.unwrap();
    assert_eq!(asha_orders[0].total_amount, dec!(60));

    assert!(queries.farmer_orders(m.idle_farmer.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn farmer_single_view_filters_items_and_shipments() {
    let m = marketplace().await;
    let queries = &m.app.state.services.queries;

    let detail = queries.order_for_farmer(m.asha.id, m.order_id).await.unwrap();
    assert_eq!(detail.order_items.len(), 1);
    let item = &detail.order_items[0];
    assert_eq!(item.quantity, 3);
    let product = item.product.as_ref().expect("product resolved");
    assert_eq!(product.category, "Okra");
    assert_eq!(product.farmer.as_ref().map(|f| f.name.as_str()), Some("Asha"));
    assert_eq!(detail.shipping_info.len(), 1);
    assert_eq!(detail.shipping_info[0].farm_details.farmer.id, m.asha.id);
    assert_eq!(detail.total_amount, dec!(60));

    let err = queries
        .order_for_farmer(m.idle_farmer.id, m.order_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn single_view_is_limited_to_owner_and_admin() {
    let m = marketplace().await;
    let queries = &m.app.state.services.queries;
    let stranger = m.app.seed_user("Arjun", UserRole::Consumer).await;
    let admin = m.app.seed_user("Root", UserRole::Admin).await;

    let own = queries
        .order_for_consumer(&m.app.caller(&m.meera), m.order_id)
        .await
        .unwrap();
    assert_eq!(own.order_items.len(), 2);
    assert_eq!(own.shipping_price, dec!(260));
    assert_eq!(own.total_amount, dec!(160));
    assert!(own.payment_info.is_some());

    let err = queries
        .order_for_consumer(&m.app.caller(&stranger), m.order_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));

    let as_admin = queries
        .order_for_consumer(&m.app.caller(&admin), m.order_id)
        .await
        .unwrap();
    assert_eq!(as_admin.id, m.order_id);

    let err = queries
        .order_for_consumer(&m.app.caller(&m.meera), Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn cancelled_orders_drop_out_of_the_farmer_view() {
    let app = TestApp::new().await;
    let ravi = app.seed_user("Ravi", UserRole::Farmer).await;
    let meera = app.seed_user("Meera", UserRole::Consumer).await;
    let tomato = app.seed_product(&ravi, "Tomato", dec!(50), 10).await;
    app.seed_cart(&meera, &[(tomato.id, 1)]).await;

    let checkout = &app.state.services.checkout;
    let created = checkout
        .initiate_order(meera.id, delivery_address())
        .await
        .unwrap();
    app.gateway.fail_capture(true);
    checkout
        .confirm_order(&app.caller(&meera), created.order_id, &created.gateway_order_id)
        .await
        .unwrap_err();

    let queries = &app.state.services.queries;
    assert!(queries.farmer_orders(ravi.id).await.unwrap().is_empty());
    assert!(queries.consumer_orders(meera.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_farmer_updates_keep_both_shipments() {
    let m = marketplace().await;
    let status = &m.app.state.services.order_status;
    let ravi = m.app.caller(&m.ravi);
    let asha = m.app.caller(&m.asha);

    let (first, second) = tokio::join!(
        status.update_logistics_status(&ravi, m.order_id, LogisticsStatus::Shipped),
        status.update_logistics_status(&asha, m.order_id, LogisticsStatus::Shipped),
    );
    first.expect("ravi ships");
    second.expect("asha ships");

    let order = m.app.order(m.order_id).await;
    assert_eq!(order.logistics_status, Some(LogisticsStatus::Shipped));
    assert_eq!(order.shipping_info.0.len(), 2);
    assert!(order
        .shipping_info
        .0
        .iter()
        .all(|s| s.status == ShipmentStatus::Shipped));
}

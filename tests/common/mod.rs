#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use agrimart_api::{
    auth::AuthService,
    clients::currency::mock::FixedRateConverter,
    clients::payments::mock::MockPaymentGateway,
    config::AppConfig,
    db::{self, DbConfig},
    entities::{cart, cart_item, order, product, user},
    handlers::AppServices,
    services::{checkout::CheckoutSettings, pricing::FlatRateShipping},
    AppState,
};
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "a9F3kQ7zL1mX8pR2tV6wY4bN0cJ5hG7dS3eU9iO1qA2sD4fG6hJ8kL0zX2cV4bN6";

/// INR → USD rate used by the fixed converter
pub const TEST_RATE: Decimal = dec!(0.5);
pub const DELIVERY_FEE: Decimal = dec!(100);

/// Helper harness backed by an in-memory SQLite database and in-process gateway mocks.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub db: Arc<DatabaseConnection>,
    pub gateway: MockPaymentGateway,
    pub converter: FixedRateConverter,
    pub auth: Arc<AuthService>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_settings(CheckoutSettings::default()).await
    }

    /// Construct a new test application with fresh database state.
    pub async fn with_settings(settings: CheckoutSettings) -> Self {
        // one connection so every query sees the same in-memory database
        let pool = db::establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            ..DbConfig::default()
        })
        .await
        .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db = Arc::new(pool);

        let gateway = MockPaymentGateway::new();
        let converter = FixedRateConverter::new(TEST_RATE);
        let services = AppServices::new(
            db.clone(),
            Arc::new(gateway.clone()),
            Arc::new(converter.clone()),
            Arc::new(FlatRateShipping::new(DELIVERY_FEE)),
            settings,
            None,
        );

        let auth = Arc::new(AuthService::new(JWT_SECRET, Duration::from_secs(3600)));
        let config = AppConfig::new(
            "sqlite::memory:".to_string(),
            JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );

        let state = AppState {
            db: db.clone(),
            config: Arc::new(config),
            services,
            auth: auth.clone(),
        };

        Self {
            router: agrimart_api::build_router(state.clone()),
            state,
            db,
            gateway,
            converter,
            auth,
        }
    }

    pub async fn seed_user(&self, name: &str, role: user::UserRole) -> user::Model {
        let now = Utc::now();
        user::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            email: Set(format!("{}@agrimart.test", name.to_lowercase().replace(' ', "."))),
            phone: Set(Some("+91-9800000000".to_string())),
            avatar: Set(None),
            role: Set(role),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await
        .expect("seed user")
    }

    pub async fn seed_product(
        &self,
        farmer: &user::Model,
        category: &str,
        price: Decimal,
        quantity: i32,
    ) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            farmer_id: Set(farmer.id),
            category: Set(category.to_string()),
            farm_name: Set(format!("{} Farm", farmer.name)),
            price: Set(price),
            quantity: Set(quantity),
            reserved: Set(0),
            size: Set(dec!(5)),
            unit_of_size: Set("kg".to_string()),
            address: Set(Some(json!({ "city": "Nashik" }))),
            images: Set(json!([])),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await
        .expect("seed product")
    }

    /// Creates the owner's cart with the given `(product, quantity)` lines
    pub async fn seed_cart(&self, owner: &user::Model, lines: &[(Uuid, i32)]) -> cart::Model {
        let now = Utc::now();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            owner_id: Set(owner.id),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await
        .expect("seed cart");

        for (i, (product_id, quantity)) in lines.iter().enumerate() {
            cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart.id),
                product_id: Set(*product_id),
                quantity: Set(*quantity),
                created_at: Set(now + chrono::Duration::milliseconds(i as i64)),
            }
            .insert(self.db.as_ref())
            .await
            .expect("seed cart item");
        }
        cart
    }

    pub async fn product(&self, id: Uuid) -> product::Model {
        product::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .expect("load product")
            .expect("product exists")
    }

    pub async fn order(&self, id: Uuid) -> order::Model {
        order::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .expect("load order")
            .expect("order exists")
    }

    pub async fn orders(&self) -> Vec<order::Model> {
        order::Entity::find()
            .all(self.db.as_ref())
            .await
            .expect("load orders")
    }

    pub async fn cart_count(&self) -> usize {
        cart::Entity::find()
            .all(self.db.as_ref())
            .await
            .expect("load carts")
            .len()
    }

    pub fn token_for(&self, user: &user::Model) -> String {
        self.auth
            .issue_token(user.id, &user.name, &user.email, user.role)
            .expect("issue token")
    }

    pub fn caller(&self, user: &user::Model) -> agrimart_api::auth::AuthUser {
        agrimart_api::auth::AuthUser {
            user_id: user.id,
            name: Some(user.name.clone()),
            email: Some(user.email.clone()),
            role: user.role,
        }
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

pub fn delivery_address() -> Value {
    json!({
        "name": "Meera Iyer",
        "addressLine1": "12 MG Road",
        "city": "Bengaluru",
        "postalCode": "560001"
    })
}

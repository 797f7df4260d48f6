use sea_orm::DatabaseConnection;
use std::sync::Arc;

pub mod cart_repository;
pub mod order_repository;
pub mod product_repository;
pub mod reservation_repository;
pub mod user_repository;

pub use cart_repository::CartRepository;
pub use order_repository::{OrderLine, OrderRepository, OrderWithLines};
pub use product_repository::ProductRepository;
pub use reservation_repository::{CaptureClaim, ReservationRepository};
pub use user_repository::UserRepository;

/// Repository trait for common database operations
pub trait Repository {
    fn get_db(&self) -> &DatabaseConnection;
}

#[derive(Debug, Clone)]
pub struct BaseRepository {
    db: Arc<DatabaseConnection>,
}

impl BaseRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

impl Repository for BaseRepository {
    fn get_db(&self) -> &DatabaseConnection {
        &self.db
    }
}

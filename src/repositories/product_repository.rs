use sea_orm::{ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter};
use std::sync::Arc;
use uuid::Uuid;

use crate::entities::product::{Column, Entity as Product, Model as ProductModel};
use crate::entities::user::Model as UserModel;
use crate::repositories::Repository;

use super::BaseRepository;

/// Catalog reads. Stock mutations live in [`super::ReservationRepository`].
#[derive(Debug, Clone)]
pub struct ProductRepository {
    base: BaseRepository,
}

impl ProductRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<ProductModel>, DbErr> {
        Product::find_by_id(id).one(self.base.get_db()).await
    }

    /// Products with their owning farmer, in no particular order
    pub async fn find_with_farmers<C: ConnectionTrait>(
        &self,
        conn: &C,
        ids: Vec<Uuid>,
    ) -> Result<Vec<(ProductModel, Option<UserModel>)>, DbErr> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Product::find()
            .filter(Column::Id.is_in(ids))
            .find_also_related(crate::entities::user::Entity)
            .all(conn)
            .await
    }
}

impl Repository for ProductRepository {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}

use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter};
use std::sync::Arc;
use uuid::Uuid;

use crate::entities::user::{Column, Entity as User, Model as UserModel};
use crate::repositories::Repository;

use super::BaseRepository;

/// Read access to the user directory
#[derive(Debug, Clone)]
pub struct UserRepository {
    base: BaseRepository,
}

impl UserRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    pub async fn find_by_ids(&self, ids: Vec<Uuid>) -> Result<Vec<UserModel>, DbErr> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        User::find()
            .filter(Column::Id.is_in(ids))
            .all(self.base.get_db())
            .await
    }
}

impl Repository for UserRepository {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}

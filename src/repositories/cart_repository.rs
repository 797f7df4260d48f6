use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, ModelTrait, QueryFilter,
    QueryOrder,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::entities::cart::{Column, Entity as Cart, Model as CartModel};
use crate::entities::cart_item::{self, Entity as CartItem, Model as CartItemModel};
use crate::repositories::Repository;

use super::BaseRepository;

/// Carts are written by the storefront; checkout reads and deletes them.
#[derive(Debug, Clone)]
pub struct CartRepository {
    base: BaseRepository,
}

impl CartRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    /// The owner's cart and its lines, oldest line first
    pub async fn find_by_owner(
        &self,
        owner_id: Uuid,
    ) -> Result<Option<(CartModel, Vec<CartItemModel>)>, DbErr> {
        let db = self.base.get_db();
        let Some(cart) = Cart::find()
            .filter(Column::OwnerId.eq(owner_id))
            .one(db)
            .await?
        else {
            return Ok(None);
        };

        let items = cart
            .find_related(CartItem)
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(db)
            .await?;

        Ok(Some((cart, items)))
    }

    /// Deletes the owner's cart and its lines; returns whether a cart existed
    pub async fn delete_for_owner<C: ConnectionTrait>(
        &self,
        conn: &C,
        owner_id: Uuid,
    ) -> Result<bool, DbErr> {
        let Some(cart) = Cart::find()
            .filter(Column::OwnerId.eq(owner_id))
            .one(conn)
            .await?
        else {
            return Ok(false);
        };

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(conn)
            .await?;
        let result = Cart::delete_by_id(cart.id).exec(conn).await?;

        Ok(result.rows_affected == 1)
    }
}

impl Repository for CartRepository {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}

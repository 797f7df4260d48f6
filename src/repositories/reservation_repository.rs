use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection,
    DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::entities::product;
use crate::entities::stock_reservation::{
    self, Column, Entity as StockReservation, Model as ReservationModel, ReservationStatus,
};
use crate::repositories::Repository;

use super::BaseRepository;

/// Stock holds for unpaid orders.
///
/// Every mutation here pairs a reservation row transition with the matching
/// `products` counter update, so callers should run them inside a transaction.
#[derive(Debug, Clone)]
pub struct ReservationRepository {
    base: BaseRepository,
}

impl ReservationRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    /// Holds `quantity` units of a product for an order.
    ///
    /// Returns `false` without writing anything when fewer than `quantity`
    /// units are unreserved.
    pub async fn reserve<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
        product_id: Uuid,
        quantity: i32,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DbErr> {
        let now = Utc::now();
        let result = product::Entity::update_many()
            .col_expr(
                product::Column::Reserved,
                Expr::col(product::Column::Reserved).add(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(now))
            .filter(product::Column::Id.eq(product_id))
            .filter(
                Expr::expr(Expr::col(product::Column::Reserved).add(quantity))
                    .lte(Expr::col(product::Column::Quantity)),
            )
            .exec(conn)
            .await?;

        if result.rows_affected != 1 {
            return Ok(false);
        }

        stock_reservation::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            product_id: Set(product_id),
            quantity: Set(quantity),
            status: Set(ReservationStatus::Active),
            expires_at: Set(expires_at),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await?;

        Ok(true)
    }

    /// Holds of the order that still count against stock
    pub async fn find_held_for_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<Vec<ReservationModel>, DbErr> {
        StockReservation::find()
            .filter(Column::OrderId.eq(order_id))
            .filter(held())
            .all(conn)
            .await
    }

    /// Marks every active, unexpired hold of the order as `capturing`.
    ///
    /// Run inside a transaction and roll back unless the result is
    /// [`CaptureClaim::Claimed`].
    pub async fn claim_for_capture<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CaptureClaim, DbErr> {
        let holds = self.find_held_for_order(conn, order_id).await?;
        if holds.is_empty() {
            return Ok(CaptureClaim::Lapsed);
        }
        if holds
            .iter()
            .any(|r| r.status == ReservationStatus::Capturing)
        {
            return Ok(CaptureClaim::InProgress);
        }
        if holds.iter().any(|r| r.expires_at <= now) {
            return Ok(CaptureClaim::Lapsed);
        }

        let result = StockReservation::update_many()
            .col_expr(Column::Status, Expr::value(ReservationStatus::Capturing))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::OrderId.eq(order_id))
            .filter(Column::Status.eq(ReservationStatus::Active))
            .filter(Column::ExpiresAt.gt(now))
            .exec(conn)
            .await?;

        // a concurrent confirm or sweep moved some rows first
        if result.rows_affected != holds.len() as u64 {
            return Ok(CaptureClaim::InProgress);
        }
        Ok(CaptureClaim::Claimed)
    }

    /// Turns every hold of the order into a real stock decrement.
    /// Returns the number of reservations committed.
    pub async fn commit_for_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<usize, DbErr> {
        let reservations = self.find_held_for_order(conn, order_id).await?;

        for reservation in &reservations {
            self.transition(conn, reservation.id, ReservationStatus::Committed, held())
                .await?;

            let result = product::Entity::update_many()
                .col_expr(
                    product::Column::Quantity,
                    Expr::col(product::Column::Quantity).sub(reservation.quantity),
                )
                .col_expr(
                    product::Column::Reserved,
                    Expr::col(product::Column::Reserved).sub(reservation.quantity),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(product::Column::Id.eq(reservation.product_id))
                .filter(product::Column::Reserved.gte(reservation.quantity))
                .exec(conn)
                .await?;

            if result.rows_affected != 1 {
                return Err(DbErr::RecordNotUpdated);
            }
        }

        Ok(reservations.len())
    }

    /// Gives every hold of the order back to the catalog.
    /// Returns the number of reservations released.
    pub async fn release_for_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<usize, DbErr> {
        self.release_matching(conn, order_id, held()).await
    }

    /// Releases the order's active holds that expired by `now` and capture
    /// claims last touched before `stale_claims_before`.
    pub async fn release_lapsed_for_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
        now: DateTime<Utc>,
        stale_claims_before: DateTime<Utc>,
    ) -> Result<usize, DbErr> {
        self.release_matching(conn, order_id, lapsed(now, stale_claims_before))
            .await
    }

    /// Orders holding lapsed stock, oldest expiry first
    pub async fn find_lapsed_order_ids(
        &self,
        now: DateTime<Utc>,
        stale_claims_before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Uuid>, DbErr> {
        let rows: Vec<(Uuid, DateTime<Utc>)> = StockReservation::find()
            .select_only()
            .column(Column::OrderId)
            .column(Column::ExpiresAt)
            .filter(lapsed(now, stale_claims_before))
            .order_by_asc(Column::ExpiresAt)
            .into_tuple()
            .all(self.base.get_db())
            .await?;

        let mut order_ids: Vec<Uuid> = Vec::new();
        for (order_id, _) in rows {
            if !order_ids.contains(&order_id) {
                order_ids.push(order_id);
            }
            if order_ids.len() as u64 >= limit {
                break;
            }
        }
        Ok(order_ids)
    }

    async fn release_matching<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
        condition: Condition,
    ) -> Result<usize, DbErr> {
        let reservations = StockReservation::find()
            .filter(Column::OrderId.eq(order_id))
            .filter(condition.clone())
            .all(conn)
            .await?;

        for reservation in &reservations {
            self.transition(
                conn,
                reservation.id,
                ReservationStatus::Released,
                condition.clone(),
            )
            .await?;

            product::Entity::update_many()
                .col_expr(
                    product::Column::Reserved,
                    Expr::col(product::Column::Reserved).sub(reservation.quantity),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(product::Column::Id.eq(reservation.product_id))
                .filter(product::Column::Reserved.gte(reservation.quantity))
                .exec(conn)
                .await?;
        }

        Ok(reservations.len())
    }

    /// Moves one row to `status` if it still matches `from`; a row already
    /// moved by a concurrent caller fails the whole operation.
    async fn transition<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: Uuid,
        status: ReservationStatus,
        from: Condition,
    ) -> Result<(), DbErr> {
        let result = StockReservation::update_many()
            .col_expr(Column::Status, Expr::value(status))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(Column::Id.eq(id))
            .filter(from)
            .exec(conn)
            .await?;

        if result.rows_affected != 1 {
            return Err(DbErr::RecordNotUpdated);
        }
        Ok(())
    }
}

/// Result of [`ReservationRepository::claim_for_capture`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureClaim {
    Claimed,
    /// Another confirm holds the claim
    InProgress,
    /// The holds expired or were released
    Lapsed,
}

fn held() -> Condition {
    Condition::all().add(
        Column::Status.is_in([ReservationStatus::Active, ReservationStatus::Capturing]),
    )
}

fn lapsed(now: DateTime<Utc>, stale_claims_before: DateTime<Utc>) -> Condition {
    Condition::any()
        .add(
            Condition::all()
                .add(Column::Status.eq(ReservationStatus::Active))
                .add(Column::ExpiresAt.lte(now)),
        )
        .add(
            Condition::all()
                .add(Column::Status.eq(ReservationStatus::Capturing))
                .add(Column::UpdatedAt.lte(stale_claims_before)),
        )
}

impl Repository for ReservationRepository {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}

//! Stock ledger over the `stock` / `sold` columns of `products`.
//!
//! Every change is a single conditional `UPDATE`, never a read followed by a
//! write, so concurrent reservations cannot oversell. Callers run
//! [`StockLedger::reserve`] inside a transaction: a failure on any line must
//! roll back the lines already reserved.

use sea_orm::{sea_query::Expr, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::entities::{order_item, pending_payment::LineItemSnapshot, product};
use crate::errors::ServiceError;

/// Quantity of one product to move in or out of stock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockLine {
    pub product_id: Uuid,
    pub quantity: i32,
}

impl From<&LineItemSnapshot> for StockLine {
    fn from(item: &LineItemSnapshot) -> Self {
        Self {
            product_id: item.product_id,
            quantity: item.quantity,
        }
    }
}

impl From<&order_item::Model> for StockLine {
    fn from(item: &order_item::Model) -> Self {
        Self {
            product_id: item.product_id,
            quantity: item.quantity,
        }
    }
}

/// Lines ordered by product id so concurrent callers lock rows in the same order
fn ordered(lines: &[StockLine]) -> Vec<StockLine> {
    let mut sorted = lines.to_vec();
    sorted.sort_by_key(|l| l.product_id);
    sorted
}

pub struct StockLedger;

impl StockLedger {
    /// Moves `quantity` units of every line from `stock` to `sold`.
    ///
    /// Returns `InsufficientStock` naming the first product that cannot cover
    /// its line; lines updated before it are only undone if `conn` is a
    /// transaction that the caller rolls back.
    #[instrument(skip(conn, lines), fields(lines = lines.len()))]
    pub async fn reserve<C: ConnectionTrait>(
        conn: &C,
        lines: &[StockLine],
    ) -> Result<(), ServiceError> {
        for line in ordered(lines) {
            if line.quantity <= 0 {
                return Err(ServiceError::ValidationError(format!(
                    "reservation quantity must be positive for product {}",
                    line.product_id
                )));
            }

            let result = product::Entity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).sub(line.quantity),
                )
                .col_expr(
                    product::Column::Sold,
                    Expr::col(product::Column::Sold).add(line.quantity),
                )
                .col_expr(
                    product::Column::UpdatedAt,
                    Expr::value(chrono::Utc::now()),
                )
                .filter(product::Column::Id.eq(line.product_id))
                .filter(product::Column::Stock.gte(line.quantity))
                .exec(conn)
                .await
                .map_err(ServiceError::db_error)?;

            if result.rows_affected == 0 {
                debug!(product_id = %line.product_id, quantity = line.quantity, "Reservation refused");
                return Err(ServiceError::InsufficientStock(format!(
                    "product {} cannot cover {} units",
                    line.product_id, line.quantity
                )));
            }
        }
        Ok(())
    }

    /// Returns units from `sold` back to `stock`. Missing products are skipped.
    ///
    /// Returns the number of units actually restored.
    #[instrument(skip(conn, lines), fields(lines = lines.len()))]
    pub async fn release<C: ConnectionTrait>(
        conn: &C,
        lines: &[StockLine],
    ) -> Result<i64, ServiceError> {
        let mut restored = 0i64;
        for line in ordered(lines) {
            if line.quantity <= 0 {
                continue;
            }

            let sold_after = Expr::case(
                Expr::col(product::Column::Sold).gte(line.quantity),
                Expr::col(product::Column::Sold).sub(line.quantity),
            )
            .finally(0);

            let result = product::Entity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).add(line.quantity),
                )
                .col_expr(product::Column::Sold, sold_after.into())
                .col_expr(
                    product::Column::UpdatedAt,
                    Expr::value(chrono::Utc::now()),
                )
                .filter(product::Column::Id.eq(line.product_id))
                .exec(conn)
                .await
                .map_err(ServiceError::db_error)?;

            if result.rows_affected == 0 {
                warn!(product_id = %line.product_id, quantity = line.quantity, "Cannot restore stock for missing product");
            } else {
                restored += i64::from(line.quantity);
            }
        }
        Ok(restored)
    }
}

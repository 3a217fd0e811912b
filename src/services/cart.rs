use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::cart_item;
use crate::errors::ServiceError;

/// The slice of the cart store the checkout engine touches
#[derive(Clone)]
pub struct CartService {
    db_pool: Arc<DbPool>,
}

impl CartService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Removes every cart row of `user_id`; returns how many were removed
    #[instrument(skip(self))]
    pub async fn clear(&self, user_id: Uuid) -> Result<u64, ServiceError> {
        let result = cart_item::Entity::delete_many()
            .filter(cart_item::Column::UserId.eq(user_id))
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(result.rows_affected)
    }

    /// Like [`clear`](Self::clear) but only logs failures
    pub async fn clear_best_effort(&self, user_id: Uuid) {
        if let Err(e) = self.clear(user_id).await {
            warn!(%user_id, error = %e, "Failed to clear cart after confirmed payment");
        }
    }
}

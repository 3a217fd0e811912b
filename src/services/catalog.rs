use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::product;
use crate::errors::ServiceError;

/// Read-only access to catalog pricing and availability
#[derive(Clone)]
pub struct ProductCatalog {
    db_pool: Arc<DbPool>,
}

impl ProductCatalog {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Loads all requested products in one query, keyed by id
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn get_products(
        &self,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, product::Model>, ServiceError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let products = product::Entity::find()
            .filter(product::Column::Id.is_in(ids.iter().copied()))
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(products.into_iter().map(|p| (p.id, p)).collect())
    }
}

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle of a checkout attempt.
///
/// Only `Initiated` rows are ever updated; every transition out of it is a
/// conditional update guarded on the current status.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum PendingPaymentStatus {
    #[sea_orm(string_value = "initiated")]
    Initiated,
    #[sea_orm(string_value = "confirmed")]
    Confirmed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "expired")]
    Expired,
}

/// Priced line captured when the checkout session is created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LineItemSnapshot {
    pub product_id: Uuid,
    pub name: String,
    #[schema(value_type = String, example = "12.00")]
    pub unit_price: Decimal,
    pub quantity: i32,
}

impl LineItemSnapshot {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize, FromJsonQueryResult)]
pub struct LineItems(pub Vec<LineItemSnapshot>);

impl LineItems {
    pub fn total(&self) -> Decimal {
        self.0.iter().map(LineItemSnapshot::line_total).sum()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LineItemSnapshot> {
        self.0.iter()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "pending_payments")]
pub struct Model {
    /// Correlation id handed to the gateway as metadata
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub user_id: Uuid,

    #[sea_orm(column_type = "Json")]
    pub line_items: LineItems,

    pub total_amount: Decimal,
    pub currency: String,

    /// Gateway session id; unset until the gateway has answered
    #[sea_orm(unique)]
    pub session_reference: Option<String>,

    pub status: PendingPaymentStatus,
    pub failure_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A rental unit and the rent it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    pub unit_id: Uuid,
    pub property_id: Option<Uuid>,
    pub label: Option<String>,
    pub monthly_rent: Decimal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub tenant_id: Uuid,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub unit: Option<Unit>,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn unit_id(&self) -> Option<Uuid> {
        self.unit.as_ref().map(|u| u.unit_id)
    }

    pub fn monthly_rent(&self) -> Option<Decimal> {
        self.unit.as_ref().map(|u| u.monthly_rent)
    }
}

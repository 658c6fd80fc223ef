use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One calculation position. `total` is derived; any value a caller sends is
/// overwritten by [`CostItem::recompute_total`] before the item is persisted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CostItem {
    #[serde(default)]
    pub id: String,
    pub position: String,
    pub quantity: f64,
    #[serde(default)]
    pub unit: String,
    pub unit_price: f64,
    #[serde(default)]
    pub total: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl CostItem {
    pub fn computed_total(&self) -> f64 {
        self.quantity * self.unit_price
    }

    pub fn recompute_total(&mut self) {
        self.total = self.computed_total();
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{CustomerId, OrderId, ProductId};

/// Order status lifecycle as exposed by the external platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderStatus {
    Pending,
    Processing,
    OnHold,
    Completed,
    Cancelled,
    Refunded,
    Failed,
}

impl OrderStatus {
    /// Parse the wire representation (`"on-hold"`, `"completed"`, ...).
    ///
    /// Unknown statuses (e.g. ones registered by plugins) return `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "on-hold" | "on_hold" => Some(Self::OnHold),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "refunded" => Some(Self::Refunded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::OnHold => "on-hold",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
            Self::Failed => "failed",
        }
    }

    /// Statuses whose side effects return reserved stock to inventory.
    pub fn restores_inventory(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Refunded)
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order line: product and quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: ProductId,
    pub quantity: i64,
}

/// Order row as read by the background workers.
///
/// Only the fields the core needs are modelled; the full JSON contract lives
/// with the resource services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub status: OrderStatus,
    #[serde(default)]
    pub customer_id: Option<CustomerId>,
    #[serde(default)]
    pub billing_email: Option<String>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub coupon_codes: Vec<String>,
    /// Total in smallest currency unit (e.g., cents).
    #[serde(default)]
    pub total: i64,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Stock delta per line for the given direction (`-qty` to reserve, `+qty` to restore).
    pub fn stock_deltas(&self, restore: bool) -> impl Iterator<Item = (ProductId, i64)> + '_ {
        self.line_items.iter().map(move |line| {
            let delta = if restore { line.quantity } else { -line.quantity };
            (line.product_id, delta)
        })
    }

    /// Serialize into the JSON payload sent to webhooks and plugins.
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Order {
        Order {
            id: OrderId::new(10),
            status: OrderStatus::Processing,
            customer_id: Some(CustomerId::new(3)),
            billing_email: Some("buyer@example.com".into()),
            line_items: vec![
                LineItem { product_id: ProductId::new(1), quantity: 2 },
                LineItem { product_id: ProductId::new(2), quantity: 5 },
            ],
            coupon_codes: vec![],
            total: 1999,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn status_parses_wire_names() {
        assert_eq!(OrderStatus::parse("on-hold"), Some(OrderStatus::OnHold));
        assert_eq!(OrderStatus::parse("Completed"), Some(OrderStatus::Completed));
        assert_eq!(OrderStatus::parse("checkout-draft"), None);
        assert_eq!(OrderStatus::OnHold.to_string(), "on-hold");
    }

    #[test]
    fn only_cancelled_and_refunded_restore_inventory() {
        assert!(OrderStatus::Cancelled.restores_inventory());
        assert!(OrderStatus::Refunded.restores_inventory());
        assert!(!OrderStatus::Completed.restores_inventory());
        assert!(!OrderStatus::Processing.restores_inventory());
        assert!(!OrderStatus::OnHold.restores_inventory());
    }

    #[test]
    fn stock_deltas_follow_direction() {
        let o = order();
        let reserve: Vec<_> = o.stock_deltas(false).collect();
        assert_eq!(reserve, vec![(ProductId::new(1), -2), (ProductId::new(2), -5)]);

        let restore: Vec<_> = o.stock_deltas(true).collect();
        assert_eq!(restore, vec![(ProductId::new(1), 2), (ProductId::new(2), 5)]);
    }

    #[test]
    fn status_serializes_kebab_case() {
        let json = serde_json::to_value(OrderStatus::OnHold).unwrap();
        assert_eq!(json, serde_json::json!("on-hold"));
    }
}

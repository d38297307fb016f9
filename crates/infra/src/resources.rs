//! Resource services: the contract the core uses to touch catalog rows.
//!
//! The REST layer owns the real implementation. Workers use the typed
//! operations; plugins go through the generic named-operation methods on JSON
//! values.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use storefront_core::{CustomerId, Order, OrderId, ProductId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Products,
    Orders,
    Customers,
    Coupons,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Products => "products",
            ResourceKind::Orders => "orders",
            ResourceKind::Customers => "customers",
            ResourceKind::Coupons => "coupons",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("{kind} {id} not found")]
    NotFound { kind: ResourceKind, id: String },

    #[error("invalid {kind} row: {message}")]
    Invalid { kind: ResourceKind, message: String },

    #[error("resource backend error: {0}")]
    Backend(String),
}

pub type ResourceResult<T> = Result<T, ResourceError>;

#[async_trait]
pub trait ResourceServices: Send + Sync {
    async fn get_order(&self, id: OrderId) -> ResourceResult<Option<Order>>;

    /// Add `delta` (negative to reserve) to a product's stock quantity.
    async fn adjust_stock(&self, product_id: ProductId, delta: i64) -> ResourceResult<()>;

    async fn increment_coupon_usage(&self, code: &str) -> ResourceResult<()>;

    /// Flag the customer as having completed a paid order.
    async fn mark_customer_paying(&self, customer_id: CustomerId) -> ResourceResult<()>;

    async fn get(&self, kind: ResourceKind, id: i64) -> ResourceResult<Option<serde_json::Value>>;

    /// Rows whose fields equal every key of `filter` (an object; empty matches all).
    async fn list(&self, kind: ResourceKind, filter: serde_json::Value) -> ResourceResult<Vec<serde_json::Value>>;

    async fn create(&self, kind: ResourceKind, body: serde_json::Value) -> ResourceResult<serde_json::Value>;

    async fn update(
        &self,
        kind: ResourceKind,
        id: i64,
        patch: serde_json::Value,
    ) -> ResourceResult<serde_json::Value>;

    async fn delete(&self, kind: ResourceKind, id: i64) -> ResourceResult<bool>;
}

/// JSON rows held in memory, keyed by kind and integer id.
#[derive(Debug)]
pub struct InMemoryResources {
    rows: RwLock<HashMap<ResourceKind, BTreeMap<i64, serde_json::Value>>>,
    next_id: AtomicI64,
}

impl Default for InMemoryResources {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryResources {
    pub fn new() -> Self {
        Self {
            rows: RwLock::default(),
            next_id: AtomicI64::new(1),
        }
    }

    /// Insert or replace a row under an explicit id.
    pub fn seed(&self, kind: ResourceKind, id: i64, mut row: serde_json::Value) {
        if let Some(obj) = row.as_object_mut() {
            obj.insert("id".into(), id.into());
        }
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .insert(id, row);
        self.next_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    pub fn seed_order(&self, order: &Order) {
        self.seed(ResourceKind::Orders, order.id.get(), order.to_payload());
    }

    fn modify<T>(
        &self,
        kind: ResourceKind,
        id: i64,
        f: impl FnOnce(&mut serde_json::Map<String, serde_json::Value>) -> T,
    ) -> ResourceResult<T> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let row = rows
            .get_mut(&kind)
            .and_then(|table| table.get_mut(&id))
            .ok_or_else(|| ResourceError::NotFound {
                kind,
                id: id.to_string(),
            })?;
        let obj = row.as_object_mut().ok_or_else(|| ResourceError::Invalid {
            kind,
            message: "row is not an object".into(),
        })?;
        Ok(f(obj))
    }
}

fn matches_filter(row: &serde_json::Value, filter: &serde_json::Value) -> bool {
    match filter.as_object() {
        Some(wanted) => wanted.iter().all(|(k, v)| row.get(k) == Some(v)),
        None => true,
    }
}

#[async_trait]
impl ResourceServices for InMemoryResources {
    async fn get_order(&self, id: OrderId) -> ResourceResult<Option<Order>> {
        let Some(row) = self.get(ResourceKind::Orders, id.get()).await? else {
            return Ok(None);
        };
        serde_json::from_value(row).map(Some).map_err(|e| ResourceError::Invalid {
            kind: ResourceKind::Orders,
            message: e.to_string(),
        })
    }

    async fn adjust_stock(&self, product_id: ProductId, delta: i64) -> ResourceResult<()> {
        self.modify(ResourceKind::Products, product_id.get(), |row| {
            let current = row.get("stock_quantity").and_then(|v| v.as_i64()).unwrap_or(0);
            row.insert("stock_quantity".into(), (current + delta).into());
        })
    }

    async fn increment_coupon_usage(&self, code: &str) -> ResourceResult<()> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let coupon = rows
            .get_mut(&ResourceKind::Coupons)
            .and_then(|table| {
                table
                    .values_mut()
                    .find(|row| row.get("code").and_then(|c| c.as_str()) == Some(code))
            })
            .and_then(|row| row.as_object_mut())
            .ok_or_else(|| ResourceError::NotFound {
                kind: ResourceKind::Coupons,
                id: code.to_string(),
            })?;
        let used = coupon.get("usage_count").and_then(|v| v.as_i64()).unwrap_or(0);
        coupon.insert("usage_count".into(), (used + 1).into());
        Ok(())
    }

    async fn mark_customer_paying(&self, customer_id: CustomerId) -> ResourceResult<()> {
        self.modify(ResourceKind::Customers, customer_id.get(), |row| {
            row.insert("is_paying_customer".into(), true.into());
        })
    }

    async fn get(&self, kind: ResourceKind, id: i64) -> ResourceResult<Option<serde_json::Value>> {
        Ok(self
            .rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .and_then(|table| table.get(&id))
            .cloned())
    }

    async fn list(&self, kind: ResourceKind, filter: serde_json::Value) -> ResourceResult<Vec<serde_json::Value>> {
        Ok(self
            .rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map(|table| table.values().filter(|row| matches_filter(row, &filter)).cloned().collect())
            .unwrap_or_default())
    }

    async fn create(&self, kind: ResourceKind, body: serde_json::Value) -> ResourceResult<serde_json::Value> {
        if !body.is_object() {
            return Err(ResourceError::Invalid {
                kind,
                message: "body must be a JSON object".into(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.seed(kind, id, body);
        self.get(kind, id).await?.ok_or_else(|| ResourceError::Backend("row vanished".into()))
    }

    async fn update(
        &self,
        kind: ResourceKind,
        id: i64,
        patch: serde_json::Value,
    ) -> ResourceResult<serde_json::Value> {
        let patch = patch.as_object().cloned().ok_or_else(|| ResourceError::Invalid {
            kind,
            message: "patch must be a JSON object".into(),
        })?;
        self.modify(kind, id, |row| {
            for (k, v) in patch {
                if k != "id" {
                    row.insert(k, v);
                }
            }
            serde_json::Value::Object(row.clone())
        })
    }

    async fn delete(&self, kind: ResourceKind, id: i64) -> ResourceResult<bool> {
        Ok(self
            .rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&kind)
            .and_then(|table| table.remove(&id))
            .is_some())
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use storefront_core::{DeliveryId, WebhookId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Active,
    Paused,
    Disabled,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Active => "active",
            WebhookStatus::Paused => "paused",
            WebhookStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(WebhookStatus::Active),
            "paused" => Some(WebhookStatus::Paused),
            "disabled" => Some(WebhookStatus::Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSubscription {
    pub id: WebhookId,
    pub name: String,
    /// Dot-namespaced event name, e.g. `order.created`
    pub topic: String,
    pub delivery_url: String,
    pub secret: String,
    pub status: WebhookStatus,
    pub is_deleted: bool,
}

impl WebhookSubscription {
    pub fn new(
        id: WebhookId,
        name: impl Into<String>,
        topic: impl Into<String>,
        delivery_url: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            topic: topic.into(),
            delivery_url: delivery_url.into(),
            secret: secret.into(),
            status: WebhookStatus::Active,
            is_deleted: false,
        }
    }

    /// `order` for `order.created`.
    pub fn resource(&self) -> &str {
        self.topic.split_once('.').map_or(self.topic.as_str(), |(r, _)| r)
    }

    /// `created` for `order.created`.
    pub fn event(&self) -> &str {
        self.topic.split_once('.').map_or("", |(_, e)| e)
    }

    pub fn receives_deliveries(&self) -> bool {
        self.status == WebhookStatus::Active && !self.is_deleted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "delivered" => Some(DeliveryStatus::Delivered),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// One payload tracked through delivery to one subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    /// Opaque id, also sent as `X-WC-Webhook-Delivery-ID`
    pub id: DeliveryId,
    pub webhook_id: WebhookId,
    pub topic: String,
    pub status: DeliveryStatus,
    pub request_body: serde_json::Value,
    pub request_headers: BTreeMap<String, String>,
    pub response_code: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    /// Failed attempts so far
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Installed,
    Active,
    Inactive,
    Error,
}

impl PluginStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginStatus::Installed => "installed",
            PluginStatus::Active => "active",
            PluginStatus::Inactive => "inactive",
            PluginStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "installed" => Some(PluginStatus::Installed),
            "active" => Some(PluginStatus::Active),
            "inactive" => Some(PluginStatus::Inactive),
            "error" => Some(PluginStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub status: PluginStatus,
    pub is_system: bool,
    pub manifest: serde_json::Value,
    /// JSON object of configuration values
    pub config: serde_json::Value,
    pub date_installed: DateTime<Utc>,
    pub date_activated: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginLogEntry {
    pub plugin_id: String,
    pub level: LogLevel,
    pub message: String,
    pub context: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Persisted state of one plugin schedule.
///
/// Exactly one of `cron_expression` / `interval_ms` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTaskRecord {
    /// `"{plugin_id}:{schedule_id}"`
    pub id: String,
    pub plugin_id: String,
    pub schedule_id: String,
    pub cron_expression: Option<String>,
    pub interval_ms: Option<u64>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub is_running: bool,
    pub is_enabled: bool,
    pub description: Option<String>,
}

impl ScheduledTaskRecord {
    pub fn task_id(plugin_id: &str, schedule_id: &str) -> String {
        format!("{plugin_id}:{schedule_id}")
    }
}

//! Postgres-backed store.
//!
//! Every write is a single-row upsert keyed by primary key (or
//! `(plugin_id, schedule_id)` for scheduled tasks). Queries are built at
//! runtime with `sqlx::query`, so no database is needed at compile time.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use storefront_core::{DeliveryId, WebhookId};

use super::{
    DeliveryStatus, LogLevel, PluginLogEntry, PluginRecord, PluginStatus, PluginStore,
    ScheduleStore, ScheduledTaskRecord, StoreError, StoreResult, WebhookDelivery, WebhookStatus,
    WebhookStore, WebhookSubscription,
};

/// Tables owned by this store. Applied by [`PostgresStore::migrate`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS webhooks (
    id BIGINT PRIMARY KEY,
    name TEXT NOT NULL,
    topic TEXT NOT NULL,
    delivery_url TEXT NOT NULL,
    secret TEXT NOT NULL,
    status TEXT NOT NULL,
    is_deleted BOOLEAN NOT NULL DEFAULT FALSE
);
CREATE INDEX IF NOT EXISTS webhooks_topic_idx ON webhooks (topic);

CREATE TABLE IF NOT EXISTS webhook_deliveries (
    id UUID PRIMARY KEY,
    webhook_id BIGINT NOT NULL,
    topic TEXT NOT NULL,
    status TEXT NOT NULL,
    request_body JSONB NOT NULL,
    request_headers JSONB NOT NULL,
    response_code INTEGER,
    response_body TEXT,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    completed_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS webhook_deliveries_webhook_idx ON webhook_deliveries (webhook_id);

CREATE TABLE IF NOT EXISTS plugins (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    status TEXT NOT NULL,
    is_system BOOLEAN NOT NULL DEFAULT FALSE,
    manifest JSONB NOT NULL,
    config JSONB NOT NULL,
    date_installed TIMESTAMPTZ NOT NULL,
    date_activated TIMESTAMPTZ,
    last_error TEXT
);

CREATE TABLE IF NOT EXISTS plugin_settings (
    plugin_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value JSONB NOT NULL,
    PRIMARY KEY (plugin_id, key)
);

CREATE TABLE IF NOT EXISTS plugin_logs (
    id BIGSERIAL PRIMARY KEY,
    plugin_id TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    context JSONB,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS scheduled_tasks (
    id TEXT PRIMARY KEY,
    plugin_id TEXT NOT NULL,
    schedule_id TEXT NOT NULL,
    cron_expression TEXT,
    interval_ms BIGINT,
    next_run TIMESTAMPTZ,
    last_run TIMESTAMPTZ,
    is_running BOOLEAN NOT NULL DEFAULT FALSE,
    is_enabled BOOLEAN NOT NULL DEFAULT TRUE,
    description TEXT,
    UNIQUE (plugin_id, schedule_id)
);
"#;

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    let message = match err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => format!("{} (code {})", db_err.message(), code),
            None => db_err.message().to_string(),
        },
        sqlx::Error::PoolClosed => "connection pool closed".to_string(),
        other => other.to_string(),
    };
    StoreError::Database { operation, message }
}

fn decode(table: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| StoreError::Decode {
        table,
        message: e.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create missing tables.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

fn subscription_from_row(row: &PgRow) -> StoreResult<WebhookSubscription> {
    let d = decode("webhooks");
    let status: String = row.try_get("status").map_err(&d)?;
    Ok(WebhookSubscription {
        id: WebhookId::new(row.try_get("id").map_err(&d)?),
        name: row.try_get("name").map_err(&d)?,
        topic: row.try_get("topic").map_err(&d)?,
        delivery_url: row.try_get("delivery_url").map_err(&d)?,
        secret: row.try_get("secret").map_err(&d)?,
        status: WebhookStatus::parse(&status).ok_or_else(|| StoreError::Decode {
            table: "webhooks",
            message: format!("unknown status '{status}'"),
        })?,
        is_deleted: row.try_get("is_deleted").map_err(&d)?,
    })
}

fn delivery_from_row(row: &PgRow) -> StoreResult<WebhookDelivery> {
    let d = decode("webhook_deliveries");
    let status: String = row.try_get("status").map_err(&d)?;
    let headers: serde_json::Value = row.try_get("request_headers").map_err(&d)?;
    let request_headers: BTreeMap<String, String> =
        serde_json::from_value(headers).map_err(|e| StoreError::Decode {
            table: "webhook_deliveries",
            message: e.to_string(),
        })?;
    let response_code: Option<i32> = row.try_get("response_code").map_err(&d)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(&d)?;

    Ok(WebhookDelivery {
        id: DeliveryId::from_uuid(row.try_get("id").map_err(&d)?),
        webhook_id: WebhookId::new(row.try_get("webhook_id").map_err(&d)?),
        topic: row.try_get("topic").map_err(&d)?,
        status: DeliveryStatus::parse(&status).ok_or_else(|| StoreError::Decode {
            table: "webhook_deliveries",
            message: format!("unknown status '{status}'"),
        })?,
        request_body: row.try_get("request_body").map_err(&d)?,
        request_headers,
        response_code: response_code.map(|c| c as u16),
        response_body: row.try_get("response_body").map_err(&d)?,
        error_message: row.try_get("error_message").map_err(&d)?,
        retry_count: retry_count.max(0) as u32,
        created_at: row.try_get("created_at").map_err(&d)?,
        completed_at: row.try_get("completed_at").map_err(&d)?,
    })
}

fn plugin_from_row(row: &PgRow) -> StoreResult<PluginRecord> {
    let d = decode("plugins");
    let status: String = row.try_get("status").map_err(&d)?;
    Ok(PluginRecord {
        id: row.try_get("id").map_err(&d)?,
        name: row.try_get("name").map_err(&d)?,
        version: row.try_get("version").map_err(&d)?,
        status: PluginStatus::parse(&status).ok_or_else(|| StoreError::Decode {
            table: "plugins",
            message: format!("unknown status '{status}'"),
        })?,
        is_system: row.try_get("is_system").map_err(&d)?,
        manifest: row.try_get("manifest").map_err(&d)?,
        config: row.try_get("config").map_err(&d)?,
        date_installed: row.try_get("date_installed").map_err(&d)?,
        date_activated: row.try_get("date_activated").map_err(&d)?,
        last_error: row.try_get("last_error").map_err(&d)?,
    })
}

fn task_from_row(row: &PgRow) -> StoreResult<ScheduledTaskRecord> {
    let d = decode("scheduled_tasks");
    let interval_ms: Option<i64> = row.try_get("interval_ms").map_err(&d)?;
    Ok(ScheduledTaskRecord {
        id: row.try_get("id").map_err(&d)?,
        plugin_id: row.try_get("plugin_id").map_err(&d)?,
        schedule_id: row.try_get("schedule_id").map_err(&d)?,
        cron_expression: row.try_get("cron_expression").map_err(&d)?,
        interval_ms: interval_ms.map(|ms| ms.max(0) as u64),
        next_run: row.try_get("next_run").map_err(&d)?,
        last_run: row.try_get("last_run").map_err(&d)?,
        is_running: row.try_get("is_running").map_err(&d)?,
        is_enabled: row.try_get("is_enabled").map_err(&d)?,
        description: row.try_get("description").map_err(&d)?,
    })
}

#[async_trait]
impl WebhookStore for PostgresStore {
    #[instrument(skip(self), err)]
    async fn active_subscriptions(&self, topic: &str) -> StoreResult<Vec<WebhookSubscription>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, topic, delivery_url, secret, status, is_deleted
            FROM webhooks
            WHERE topic = $1 AND status = 'active' AND is_deleted = FALSE
            ORDER BY id ASC
            "#,
        )
        .bind(topic)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_subscriptions", e))?;

        rows.iter().map(subscription_from_row).collect()
    }

    async fn get_subscription(&self, id: WebhookId) -> StoreResult<Option<WebhookSubscription>> {
        let row = sqlx::query(
            "SELECT id, name, topic, delivery_url, secret, status, is_deleted FROM webhooks WHERE id = $1",
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_subscription", e))?;

        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn save_subscription(&self, s: &WebhookSubscription) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhooks (id, name, topic, delivery_url, secret, status, is_deleted)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                topic = EXCLUDED.topic,
                delivery_url = EXCLUDED.delivery_url,
                secret = EXCLUDED.secret,
                status = EXCLUDED.status,
                is_deleted = EXCLUDED.is_deleted
            "#,
        )
        .bind(s.id.get())
        .bind(&s.name)
        .bind(&s.topic)
        .bind(&s.delivery_url)
        .bind(&s.secret)
        .bind(s.status.as_str())
        .bind(s.is_deleted)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_subscription", e))?;
        Ok(())
    }

    #[instrument(skip(self, delivery), fields(delivery_id = %delivery.id), err)]
    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> StoreResult<()> {
        self.write_delivery("insert_delivery", delivery).await
    }

    async fn get_delivery(&self, id: DeliveryId) -> StoreResult<Option<WebhookDelivery>> {
        let row = sqlx::query("SELECT * FROM webhook_deliveries WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_delivery", e))?;

        row.as_ref().map(delivery_from_row).transpose()
    }

    #[instrument(skip(self, delivery), fields(delivery_id = %delivery.id), err)]
    async fn update_delivery(&self, delivery: &WebhookDelivery) -> StoreResult<()> {
        self.write_delivery("update_delivery", delivery).await
    }

    async fn deliveries_for(&self, webhook_id: WebhookId) -> StoreResult<Vec<WebhookDelivery>> {
        let rows = sqlx::query(
            "SELECT * FROM webhook_deliveries WHERE webhook_id = $1 ORDER BY created_at ASC",
        )
        .bind(webhook_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("deliveries_for", e))?;

        rows.iter().map(delivery_from_row).collect()
    }
}

impl PostgresStore {
    async fn write_delivery(&self, operation: &'static str, d: &WebhookDelivery) -> StoreResult<()> {
        let headers = serde_json::to_value(&d.request_headers).map_err(|e| StoreError::Decode {
            table: "webhook_deliveries",
            message: e.to_string(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries (
                id, webhook_id, topic, status, request_body, request_headers,
                response_code, response_body, error_message, retry_count,
                created_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                response_code = EXCLUDED.response_code,
                response_body = EXCLUDED.response_body,
                error_message = EXCLUDED.error_message,
                retry_count = EXCLUDED.retry_count,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(d.id.as_uuid())
        .bind(d.webhook_id.get())
        .bind(&d.topic)
        .bind(d.status.as_str())
        .bind(&d.request_body)
        .bind(headers)
        .bind(d.response_code.map(i32::from))
        .bind(&d.response_body)
        .bind(&d.error_message)
        .bind(d.retry_count as i32)
        .bind(d.created_at)
        .bind(d.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(())
    }
}

#[async_trait]
impl PluginStore for PostgresStore {
    async fn get_plugin(&self, id: &str) -> StoreResult<Option<PluginRecord>> {
        let row = sqlx::query("SELECT * FROM plugins WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_plugin", e))?;

        row.as_ref().map(plugin_from_row).transpose()
    }

    async fn list_plugins(&self) -> StoreResult<Vec<PluginRecord>> {
        let rows = sqlx::query("SELECT * FROM plugins ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_plugins", e))?;

        rows.iter().map(plugin_from_row).collect()
    }

    #[instrument(skip(self, r), fields(plugin_id = %r.id, status = %r.status), err)]
    async fn save_plugin(&self, r: &PluginRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO plugins (
                id, name, version, status, is_system, manifest, config,
                date_installed, date_activated, last_error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                version = EXCLUDED.version,
                status = EXCLUDED.status,
                is_system = EXCLUDED.is_system,
                manifest = EXCLUDED.manifest,
                config = EXCLUDED.config,
                date_activated = EXCLUDED.date_activated,
                last_error = EXCLUDED.last_error
            "#,
        )
        .bind(&r.id)
        .bind(&r.name)
        .bind(&r.version)
        .bind(r.status.as_str())
        .bind(r.is_system)
        .bind(&r.manifest)
        .bind(&r.config)
        .bind(r.date_installed)
        .bind(r.date_activated)
        .bind(&r.last_error)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_plugin", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_plugin(&self, id: &str) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("delete_plugin", e))?;

        for sql in [
            "DELETE FROM plugin_settings WHERE plugin_id = $1",
            "DELETE FROM plugin_logs WHERE plugin_id = $1",
            "DELETE FROM plugins WHERE id = $1",
        ] {
            sqlx::query(sql)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_plugin", e))?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error("delete_plugin", e))?;
        Ok(())
    }

    async fn get_setting(&self, plugin_id: &str, key: &str) -> StoreResult<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT value FROM plugin_settings WHERE plugin_id = $1 AND key = $2")
            .bind(plugin_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_setting", e))?;

        row.map(|r| r.try_get("value").map_err(decode("plugin_settings")))
            .transpose()
    }

    async fn set_setting(&self, plugin_id: &str, key: &str, value: serde_json::Value) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO plugin_settings (plugin_id, key, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (plugin_id, key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(plugin_id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_setting", e))?;
        Ok(())
    }

    async fn append_log(&self, entry: &PluginLogEntry) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO plugin_logs (plugin_id, level, message, context, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&entry.plugin_id)
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(&entry.context)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_log", e))?;
        Ok(())
    }

    async fn logs(&self, plugin_id: &str) -> StoreResult<Vec<PluginLogEntry>> {
        let rows = sqlx::query(
            "SELECT plugin_id, level, message, context, created_at FROM plugin_logs WHERE plugin_id = $1 ORDER BY id ASC",
        )
        .bind(plugin_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("logs", e))?;

        let d = decode("plugin_logs");
        rows.iter()
            .map(|row| {
                let level: String = row.try_get("level").map_err(&d)?;
                let created_at: DateTime<Utc> = row.try_get("created_at").map_err(&d)?;
                Ok(PluginLogEntry {
                    plugin_id: row.try_get("plugin_id").map_err(&d)?,
                    level: LogLevel::parse(&level).unwrap_or(LogLevel::Info),
                    message: row.try_get("message").map_err(&d)?,
                    context: row.try_get("context").map_err(&d)?,
                    created_at,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ScheduleStore for PostgresStore {
    async fn get_task(&self, id: &str) -> StoreResult<Option<ScheduledTaskRecord>> {
        let row = sqlx::query("SELECT * FROM scheduled_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_task", e))?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn save_task(&self, t: &ScheduledTaskRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_tasks (
                id, plugin_id, schedule_id, cron_expression, interval_ms,
                next_run, last_run, is_running, is_enabled, description
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (plugin_id, schedule_id) DO UPDATE SET
                cron_expression = EXCLUDED.cron_expression,
                interval_ms = EXCLUDED.interval_ms,
                next_run = EXCLUDED.next_run,
                last_run = EXCLUDED.last_run,
                is_running = EXCLUDED.is_running,
                is_enabled = EXCLUDED.is_enabled,
                description = EXCLUDED.description
            "#,
        )
        .bind(&t.id)
        .bind(&t.plugin_id)
        .bind(&t.schedule_id)
        .bind(&t.cron_expression)
        .bind(t.interval_ms.map(|ms| ms as i64))
        .bind(t.next_run)
        .bind(t.last_run)
        .bind(t.is_running)
        .bind(t.is_enabled)
        .bind(&t.description)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_task", e))?;
        Ok(())
    }

    async fn delete_plugin_tasks(&self, plugin_id: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE plugin_id = $1")
            .bind(plugin_id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_plugin_tasks", e))?;
        Ok(result.rows_affected())
    }

    async fn list_tasks(&self) -> StoreResult<Vec<ScheduledTaskRecord>> {
        let rows = sqlx::query("SELECT * FROM scheduled_tasks ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_tasks", e))?;

        rows.iter().map(task_from_row).collect()
    }
}

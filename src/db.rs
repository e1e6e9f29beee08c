//! Database access
//!
//! Two pools: the auth store (tenants, users, devices, API keys, audit log)
//! and the telemetry store (Timescale). Tenant-scoped reads go through
//! `TenantScope`, a transaction with the row-level-security session
//! variables applied; dropping the scope without committing rolls back.

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::config::Config;

#[derive(Clone)]
pub struct Db {
    pub auth: PgPool,
    pub telemetry: PgPool,
}

impl Db {
    pub async fn connect(config: &Config) -> Result<Self, sqlx::Error> {
        let auth = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.postgres_url())
            .await?;
        let telemetry = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.timescale_url())
            .await?;
        Ok(Self { auth, telemetry })
    }

    pub async fn close(&self) {
        self.auth.close().await;
        self.telemetry.close().await;
    }

    /// Begin a transaction on the auth store with the RLS session variables
    /// bound. All tenant-scoped reads in the request must run inside it.
    pub async fn tenant_scope(
        &self,
        tenant_id: Uuid,
        role: &str,
    ) -> Result<TenantScope, sqlx::Error> {
        TenantScope::begin(&self.auth, tenant_id, role).await
    }

    /// Permission names attached to a role.
    pub async fn permissions_for_role(&self, role: &str) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT p.name
            FROM role_permissions rp
            JOIN permissions p ON rp.permission_id = p.permission_id
            WHERE rp.role = $1
            "#,
        )
        .bind(role)
        .fetch_all(&self.auth)
        .await
    }
}

/// RLS-bound transaction guard.
pub struct TenantScope {
    tx: Transaction<'static, Postgres>,
}

impl TenantScope {
    pub async fn begin(pool: &PgPool, tenant_id: Uuid, role: &str) -> Result<Self, sqlx::Error> {
        let mut tx = pool.begin().await?;
        set_rls_context(&mut tx, &tenant_id.to_string(), role).await?;
        Ok(Self { tx })
    }

    /// Connection for queries inside the scope.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }
}

/// Apply the session variables consumed by the row-level-security policies.
/// `set_config(..., true)` scopes them to the enclosing transaction.
pub async fn set_rls_context(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    role: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT set_config('app.current_tenant_id', $1, true)")
        .bind(tenant_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("SELECT set_config('app.current_user_role', $1, true)")
        .bind(role)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Best-effort audit log insert; failures are logged and swallowed.
pub async fn record_audit_event(
    pool: &PgPool,
    tenant_id: Option<Uuid>,
    user_id: Option<Uuid>,
    event_type: &str,
    event_category: &str,
    severity: &str,
    action: &str,
    result: &str,
    metadata: serde_json::Value,
) {
    let outcome = sqlx::query(
        r#"
        INSERT INTO audit_log (
            tenant_id, user_id, event_type, event_category, severity,
            actor_type, actor_id, action, result, metadata, timestamp
        )
        VALUES ($1, $2, $3, $4, $5, 'system', $2, $6, $7, $8, NOW())
        "#,
    )
    .bind(tenant_id)
    .bind(user_id)
    .bind(event_type)
    .bind(event_category)
    .bind(severity)
    .bind(action)
    .bind(result)
    .bind(metadata)
    .execute(pool)
    .await;

    if let Err(err) = outcome {
        tracing::warn!(error = %err, event_type, "audit log insert failed");
    }
}

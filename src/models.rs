//! API Models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

// ============ Users ============

/// User account row. The password hash never leaves the server.
#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct User {
    pub user_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub email: String,
    #[serde(skip_serializing)]
    #[sqlx(default)]
    pub password_hash: String,
    pub role: String,
    pub status: String,
    #[sqlx(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[sqlx(default)]
    pub last_login_at: Option<DateTime<Utc>>,
}

/// User registration request
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RegisterRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
}

/// Login request
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct LoginRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
}

/// Token refresh request
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RefreshRequest {
    #[validate(length(min = 1))]
    pub refresh_token: String,
}

/// Issued token pair plus the authenticated user
#[derive(Debug, Serialize, ToSchema)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub user: User,
}

/// Token refresh response
#[derive(Debug, Serialize, ToSchema)]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

// ============ Devices ============

/// Device listing entry (tenant-scoped)
#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct DeviceSummary {
    pub device_id: Uuid,
    pub device_label: Option<String>,
    pub status: String,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Device claim request (device_id + claim code from the label)
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ClaimDeviceRequest {
    #[validate(length(min = 1))]
    pub device_id: String,
    #[validate(length(min = 1))]
    pub claim_code: String,
}

/// Device claim response. The device secret is never returned here.
#[derive(Debug, Serialize, ToSchema)]
pub struct ClaimDeviceResponse {
    pub device_id: String,
    pub message: String,
}

/// Device bootstrap poll, authenticated with the manufacturing key
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct BootstrapRequest {
    #[validate(length(min = 1))]
    pub device_id: String,
    #[validate(length(min = 1))]
    pub timestamp: String,
    #[validate(length(min = 1))]
    pub signature: String,
}

/// Bootstrap poll response
#[derive(Debug, Serialize, ToSchema)]
pub struct BootstrapResponse {
    pub status: String,
    pub device_id: String,
    pub poll_interval: u32,
}

/// One-time device secret retrieval, authenticated like bootstrap
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct SecretRequest {
    #[validate(length(min = 1))]
    pub device_id: String,
    #[validate(length(min = 1))]
    pub timestamp: String,
    #[validate(length(min = 1))]
    pub signature: String,
}

/// Secret delivery response
#[derive(Debug, Serialize, ToSchema)]
pub struct SecretResponse {
    pub device_secret: String,
    pub expires_at: String,
}

/// Device reset request; confirmation must be the literal "RESET"
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ResetDeviceRequest {
    #[validate(length(min = 1))]
    pub device_id: String,
    #[validate(length(min = 1))]
    pub confirmation: String,
}

/// Device reset response
#[derive(Debug, Serialize, ToSchema)]
pub struct ResetDeviceResponse {
    pub status: String,
    pub message: String,
}

/// Admin-driven device provisioning (idempotent on device_id)
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ProvisionDeviceRequest {
    pub device_id: Option<Uuid>,
    #[validate(length(min = 1))]
    pub device_label: String,
    #[validate(length(min = 8))]
    pub claim_code: String,
}

/// Provisioning response
#[derive(Debug, Serialize, ToSchema)]
pub struct ProvisionDeviceResponse {
    pub device_id: Uuid,
    pub device_label: String,
    pub status: String,
}

// ============ Telemetry ============

/// Telemetry webhook body posted by the MQTT rule engine
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct TelemetryRequest {
    #[serde(default)]
    pub clientid: String,
    #[validate(length(min = 1))]
    pub topic: String,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub timestamp: String,
}

/// Ingest acknowledgement
#[derive(Debug, Serialize, ToSchema)]
pub struct IngestResponse {
    pub success: bool,
    pub device_id: Uuid,
    pub slot: i32,
}

/// Cached latest value per (device, slot)
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LatestTelemetry {
    pub device_id: String,
    pub slot: i32,
    #[schema(value_type = Object)]
    pub value: serde_json::Value,
    pub timestamp: String,
}

/// Slots with a cached latest value for a device
#[derive(Debug, Serialize, ToSchema)]
pub struct ActiveSlotsResponse {
    pub device_id: Uuid,
    pub slots: Vec<i32>,
}

// ============ Tenants ============

/// Tenant plan and quota fields
#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct TenantQuota {
    pub tenant_id: Uuid,
    pub plan_type: String,
    pub billing_cycle: String,
    pub quota_devices: i32,
    pub quota_msgs_per_min: i32,
    pub quota_storage_mb: i32,
    pub allow_overage: bool,
}

/// Partial quota update
#[derive(Debug, Deserialize, ToSchema)]
pub struct TenantQuotaPatch {
    pub plan_type: Option<String>,
    pub billing_cycle: Option<String>,
    pub quota_devices: Option<i32>,
    pub quota_msgs_per_min: Option<i32>,
    pub quota_storage_mb: Option<i32>,
    pub allow_overage: Option<bool>,
}

/// Current tenant usage figures
#[derive(Debug, Serialize, ToSchema)]
pub struct TenantUsage {
    pub tenant_id: Uuid,
    pub messages_last_60min: i64,
    pub devices_total: i64,
    pub storage_mb_estimated: f64,
    pub plan_type: String,
    pub billing_cycle: String,
}

// ============ Health ============

/// Health probe response
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: String,
}

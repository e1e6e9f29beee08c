//! Ops notifications
//!
//! Operational events (user registered, device provisioned, quota
//! exceeded) are pushed to a Telegram chat and mirrored into the audit log.
//! Every dispatch is a detached task with a bounded timeout; the primary
//! response never waits on it.

use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Notifier {
    http: reqwest::Client,
    bot_token: String,
    chat_id: String,
    audit: PgPool,
}

impl Notifier {
    pub fn new(bot_token: String, chat_id: String, audit: PgPool) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token,
            chat_id,
            audit,
        }
    }

    fn enabled(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }

    pub fn user_registered(&self, user_id: Uuid, tenant_id: Option<Uuid>, email: &str, role: &str) {
        let message = format_message(
            "[USER] Registered",
            &[
                ("email", email.to_string()),
                ("role", role.to_string()),
                ("user_id", user_id.to_string()),
                (
                    "tenant_id",
                    tenant_id.map(|t| t.to_string()).unwrap_or_default(),
                ),
            ],
        );
        let metadata = serde_json::json!({
            "email": email,
            "role": role,
            "user_id": user_id,
            "tenant_id": tenant_id,
        });
        self.dispatch(
            tenant_id,
            Some(user_id),
            "ops.user_registered_notified",
            message,
            metadata,
        );
    }

    pub fn device_provisioned(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        user_email: &str,
        device_id: Uuid,
        device_label: &str,
    ) {
        let message = format_message(
            "[DEVICE] Provisioned",
            &[
                ("tenant_id", tenant_id.to_string()),
                ("user_email", user_email.to_string()),
                ("device_id", device_id.to_string()),
                ("device_label", device_label.to_string()),
            ],
        );
        let metadata = serde_json::json!({
            "tenant_id": tenant_id,
            "user_email": user_email,
            "device_id": device_id,
            "device_label": device_label,
        });
        self.dispatch(
            Some(tenant_id),
            Some(user_id),
            "ops.device_provisioned_notified",
            message,
            metadata,
        );
    }

    pub fn quota_exceeded(&self, tenant_id: Uuid, reason: &str, detail: String) {
        let message = format_message(
            "[QUOTA] Exceeded",
            &[
                ("tenant_id", tenant_id.to_string()),
                ("reason", reason.to_string()),
                ("detail", detail.clone()),
            ],
        );
        let metadata = serde_json::json!({
            "tenant_id": tenant_id,
            "reason": reason,
            "detail": detail,
        });
        self.dispatch(
            Some(tenant_id),
            None,
            "quota.exceeded_notified",
            message,
            metadata,
        );
    }

    /// Fire-and-forget: send to Telegram, then mirror the outcome into the
    /// audit log. Does not hold the caller's cancellation scope.
    fn dispatch(
        &self,
        tenant_id: Option<Uuid>,
        user_id: Option<Uuid>,
        event_type: &'static str,
        message: String,
        metadata: serde_json::Value,
    ) {
        let notifier = self.clone();
        tokio::spawn(async move {
            let result = if notifier.enabled() {
                match notifier.send_telegram(&message).await {
                    Ok(()) => "success",
                    Err(err) => {
                        tracing::warn!(error = %err, event_type, "telegram notify failed");
                        "failed"
                    }
                }
            } else {
                "skipped"
            };

            crate::db::record_audit_event(
                &notifier.audit,
                tenant_id,
                user_id,
                event_type,
                "operations",
                "info",
                "telegram_notify",
                result,
                metadata,
            )
            .await;
        });
    }

    async fn send_telegram(&self, text: &str) -> Result<(), reqwest::Error> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let response = self
            .http
            .post(&url)
            .timeout(SEND_TIMEOUT)
            .form(&[("chat_id", self.chat_id.as_str()), ("text", text)])
            .send()
            .await?;
        response.error_for_status().map(|_| ())
    }
}

fn format_message(title: &str, fields: &[(&str, String)]) -> String {
    let mut lines = vec![title.to_string()];
    for (key, value) in fields {
        if value.trim().is_empty() {
            continue;
        }
        lines.push(format!("- {key}: {value}"));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_message_skips_empty_fields() {
        let msg = format_message(
            "[USER] Registered",
            &[
                ("email", "user@example.com".to_string()),
                ("tenant_id", "".to_string()),
                ("role", "tenant_admin".to_string()),
            ],
        );
        assert_eq!(
            msg,
            "[USER] Registered\n- email: user@example.com\n- role: tenant_admin"
        );
    }
}

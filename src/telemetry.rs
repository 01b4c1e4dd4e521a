use serde_json::{json, Value};
use thiserror::Error;

use crate::subscriptions::models::QuotaNotification;

pub const QUOTA_THRESHOLD_EVENT: &str = "quota_threshold_crossed";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotificationValidationError {
    #[error("notification `{event_type}` missing detail payload")]
    MissingDetails { event_type: String },
    #[error("notification `{event_type}` missing required detail `{field}`")]
    MissingField {
        event_type: String,
        field: &'static str,
    },
}

/// key: quota-telemetry -> notification envelope
pub fn notification_payload(notification: &QuotaNotification) -> Value {
    json!({
        "event_type": QUOTA_THRESHOLD_EVENT,
        "details": {
            "user_id": notification.user_id,
            "instance_id": notification.instance_id,
            "plan_name": notification.plan_name,
            "resource": notification.resource,
            "band": notification.band.as_str(),
            "usage_percentage": notification.usage_percentage,
            "remaining": notification.remaining,
            "total": notification.total,
            "observed_at": notification.observed_at,
        },
    })
}

pub fn validate_notification_payload(payload: &Value) -> Result<(), NotificationValidationError> {
    let event_type = payload
        .get("event_type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if event_type != QUOTA_THRESHOLD_EVENT {
        return Ok(());
    }
    let details = payload
        .get("details")
        .ok_or_else(|| NotificationValidationError::MissingDetails {
            event_type: event_type.to_string(),
        })?;
    for field in ["user_id", "instance_id", "resource", "band", "usage_percentage"] {
        require_field(details, event_type, field)?;
    }
    Ok(())
}

fn require_field<'a>(
    payload: &'a Value,
    event_type: &str,
    field: &'static str,
) -> Result<&'a Value, NotificationValidationError> {
    payload
        .get(field)
        .filter(|value| !value.is_null())
        .ok_or_else(|| NotificationValidationError::MissingField {
            event_type: event_type.to_string(),
            field,
        })
}

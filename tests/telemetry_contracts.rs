use chrono::Utc;
use quota_engine::subscriptions::models::{AlertBand, QuotaNotification};
use quota_engine::telemetry::{
    notification_payload, validate_notification_payload, NotificationValidationError,
    QUOTA_THRESHOLD_EVENT,
};

fn notification(band: AlertBand) -> QuotaNotification {
    QuotaNotification {
        user_id: 21,
        instance_id: 8,
        plan_name: "Pro".to_string(),
        resource: "claude-3".to_string(),
        band,
        usage_percentage: 91.5,
        remaining: 17,
        total: 200,
        observed_at: Utc::now(),
    }
}

#[test]
fn notification_payload_preserves_alert_schema() {
    let payload = notification_payload(&notification(AlertBand::Critical));
    assert_eq!(
        payload.get("event_type").and_then(|v| v.as_str()),
        Some(QUOTA_THRESHOLD_EVENT)
    );

    let details = payload
        .get("details")
        .and_then(|value| value.as_object())
        .expect("details should be an object");
    for key in [
        "user_id",
        "instance_id",
        "plan_name",
        "resource",
        "band",
        "usage_percentage",
        "remaining",
        "total",
        "observed_at",
    ] {
        assert!(details.contains_key(key), "missing key {key} in notification payload");
    }
    assert_eq!(details["band"], "critical");
    assert_eq!(details["remaining"], 17);
}

#[test]
fn stripped_payload_fails_validation() {
    let mut payload = notification_payload(&notification(AlertBand::Notice));
    payload["details"]["band"] = serde_json::Value::Null;

    let err = validate_notification_payload(&payload).expect_err("null band should fail");
    assert_eq!(
        err,
        NotificationValidationError::MissingField {
            event_type: QUOTA_THRESHOLD_EVENT.to_string(),
            field: "band",
        }
    );
}

#[test]
fn unrelated_events_are_not_checked() {
    let payload = serde_json::json!({ "event_type": "plan_created" });
    assert!(validate_notification_payload(&payload).is_ok());
}

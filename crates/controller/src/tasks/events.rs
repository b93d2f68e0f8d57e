//! Notification events
//!
//! Emits Kubernetes Events on phase transitions and retry decisions, labeled
//! for the external notification controllers that watch them.

use crate::crds::NotebookValidationJob;
use crate::tasks::types::{Context, Result};
use chrono::Utc;
use k8s_openapi::api::core::v1::Event;
use kube::api::PostParams;
use kube::{Api, Resource, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::warn;

pub const NOTIFICATION_LABEL: &str = "mlops.dev/notification-type";

/// Notification class consumed by external controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationType {
    ValidationSuccess,
    ValidationFailure,
}

impl NotificationType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::ValidationSuccess => "validation-success",
            NotificationType::ValidationFailure => "validation-failure",
        }
    }
}

/// Publish a phase-transition or retry event for a job.
///
/// Best-effort: event emission never fails a reconciliation, so callers log
/// and continue on error.
pub async fn publish(
    job: &NotebookValidationJob,
    ctx: &Context,
    reason: &str,
    message: &str,
    notification: Option<NotificationType>,
) {
    if let Err(e) = publish_inner(job, ctx, reason, message, notification).await {
        warn!("Failed to publish event {} for {}: {}", reason, job.name_any(), e);
    }
}

async fn publish_inner(
    job: &NotebookValidationJob,
    ctx: &Context,
    reason: &str,
    message: &str,
    notification: Option<NotificationType>,
) -> Result<()> {
    let events: Api<Event> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let now = Utc::now();

    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "notebook-validator".to_string());
    if let Some(notification) = notification {
        labels.insert(NOTIFICATION_LABEL.to_string(), notification.as_str().to_string());
    }

    // Names must be unique per event instance
    let event_name = format!("{}.{:x}", job.name_any(), now.timestamp_micros());

    let event: Event = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Event",
        "metadata": {
            "name": event_name,
            "namespace": ctx.namespace,
            "labels": labels,
        },
        "involvedObject": {
            "apiVersion": "mlops.dev/v1alpha1",
            "kind": "NotebookValidationJob",
            "name": job.name_any(),
            "namespace": job.meta().namespace.clone().unwrap_or_else(|| ctx.namespace.clone()),
            "uid": job.metadata.uid.clone().unwrap_or_default(),
        },
        "reason": reason,
        "message": message,
        "type": if matches!(notification, Some(NotificationType::ValidationFailure)) { "Warning" } else { "Normal" },
        "firstTimestamp": now.to_rfc3339(),
        "lastTimestamp": now.to_rfc3339(),
        "count": 1,
        "source": { "component": "notebook-validation-controller" },
    }))?;

    events.create(&PostParams::default(), &event).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_type_labels() {
        assert_eq!(
            NotificationType::ValidationSuccess.as_str(),
            "validation-success"
        );
        assert_eq!(
            NotificationType::ValidationFailure.as_str(),
            "validation-failure"
        );
    }
}

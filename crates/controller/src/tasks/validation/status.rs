//! Status and annotation writes for `NotebookValidationJob`
//!
//! Status mutation is a transform over a value: handlers compute the next
//! `NotebookValidationJobStatus` and this module attempts the single write.
//! A resource-version conflict during that write is the normal event
//! cross-talk case and is surfaced to the caller as `Transient`.

use crate::crds::{
    JobPhase, NotebookValidationJob, NotebookValidationJobStatus, ValidationCondition,
};
use crate::tasks::types::{
    Context, Result, ANNOTATION_BLOCK_WAVE, ANNOTATION_SYNC_WAVE, ANNOTATION_TRIGGERS_FIRED,
    ANNOTATION_WAVE_COMPLETE, ANNOTATION_WAVE_FAILED, ANNOTATION_WAVE_TIMESTAMP,
};
use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

/// Condition types written by the controller.
pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_GIT_CLONED: &str = "GitCloned";
pub const CONDITION_ENVIRONMENT_READY: &str = "EnvironmentReady";
pub const CONDITION_VALIDATION_STARTED: &str = "ValidationStarted";
pub const CONDITION_VALIDATION_COMPLETE: &str = "ValidationComplete";

/// Upsert a named condition, bumping lastTransitionTime only on change.
pub fn set_condition(
    status: &mut NotebookValidationJobStatus,
    condition_type: &str,
    condition_status: bool,
    reason: &str,
    message: &str,
) {
    let conditions = status.conditions.get_or_insert_with(Vec::new);
    let status_str = if condition_status { "True" } else { "False" };

    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        if existing.status != status_str {
            existing.last_transition_time = Some(Utc::now().to_rfc3339());
        }
        existing.status = status_str.to_string();
        existing.reason = Some(reason.to_string());
        existing.message = Some(message.to_string());
        return;
    }

    conditions.push(ValidationCondition {
        condition_type: condition_type.to_string(),
        status: status_str.to_string(),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    });
}

/// Read a condition's boolean status, if present.
#[must_use]
pub fn condition_is_true(status: &NotebookValidationJobStatus, condition_type: &str) -> bool {
    status
        .conditions
        .as_ref()
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.condition_type == condition_type)
        })
        .is_some_and(|c| c.status == "True")
}

/// Move the working status to a new phase, stamping bookkeeping fields.
pub fn enter_phase(status: &mut NotebookValidationJobStatus, phase: JobPhase, message: &str) {
    status.phase = phase.as_str().to_string();
    status.message = Some(message.to_string());
    status.last_update = Some(Utc::now().to_rfc3339());

    if status.started_at.is_none() {
        status.started_at = Some(Utc::now().to_rfc3339());
    }
    if phase.is_terminal() && status.completed_at.is_none() {
        status.completed_at = Some(Utc::now().to_rfc3339());
    }
}

/// Persist the computed status through the status subresource.
///
/// Uses the loaded resourceVersion so a concurrent writer surfaces as a 409,
/// which the reconcile loop maps to a short requeue without touching the
/// retry budget.
pub async fn persist(
    job: &NotebookValidationJob,
    ctx: &Context,
    status: &NotebookValidationJobStatus,
) -> Result<()> {
    let api: Api<NotebookValidationJob> = Api::namespaced(ctx.client.clone(), &ctx.namespace);

    let patch = json!({
        "apiVersion": "mlops.dev/v1alpha1",
        "kind": "NotebookValidationJob",
        "metadata": {
            "name": job.name_any(),
            "resourceVersion": job.metadata.resource_version.clone(),
        },
        "status": status,
    });

    api.patch_status(
        &job.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;

    debug!(
        "Status persisted for {}: phase={}",
        job.name_any(),
        status.phase
    );
    Ok(())
}

/// Echo the declared sync-wave into terminal wave annotations, record the
/// advisory block-wave value, and stamp the completion time.
pub async fn write_wave_annotations(
    job: &NotebookValidationJob,
    ctx: &Context,
    outcome: JobPhase,
) -> Result<()> {
    let annotations = job.metadata.annotations.clone().unwrap_or_default();
    let Some(wave) = annotations.get(ANNOTATION_SYNC_WAVE) else {
        return Ok(());
    };

    let wave_key = if outcome == JobPhase::Succeeded {
        ANNOTATION_WAVE_COMPLETE
    } else {
        ANNOTATION_WAVE_FAILED
    };

    let patch_annotations = json!({
        wave_key: wave,
        ANNOTATION_WAVE_TIMESTAMP: Utc::now().to_rfc3339(),
    });
    if let Some(block) = annotations.get(ANNOTATION_BLOCK_WAVE) {
        // Advisory only, recorded but never interpreted
        info!("Job {} carries block-wave={}", job.name_any(), block);
    }

    let api: Api<NotebookValidationJob> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    api.patch(
        &job.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&json!({ "metadata": { "annotations": patch_annotations } })),
    )
    .await?;

    info!(
        "Wave annotation {}={} written for {}",
        wave_key,
        wave,
        job.name_any()
    );
    Ok(())
}

/// Whether the one-shot trigger execution already ran for this job.
#[must_use]
pub fn triggers_already_fired(job: &NotebookValidationJob) -> bool {
    job.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(ANNOTATION_TRIGGERS_FIRED))
}

/// Mark trigger execution done so terminal reconciliations stay no-ops.
pub async fn mark_triggers_fired(job: &NotebookValidationJob, ctx: &Context) -> Result<()> {
    let api: Api<NotebookValidationJob> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let patch = json!({
        "metadata": {
            "annotations": {
                ANNOTATION_TRIGGERS_FIRED: Utc::now().to_rfc3339(),
            }
        }
    });
    api.patch(&job.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_inserts_and_updates() {
        let mut status = NotebookValidationJobStatus::default();
        set_condition(&mut status, CONDITION_READY, true, "Validated", "all good");
        assert!(condition_is_true(&status, CONDITION_READY));

        let first_transition = status.conditions.as_ref().unwrap()[0]
            .last_transition_time
            .clone();

        // Same status: message refreshes, transition time does not
        set_condition(&mut status, CONDITION_READY, true, "Validated", "still good");
        let conditions = status.conditions.as_ref().unwrap();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first_transition);
        assert_eq!(conditions[0].message.as_deref(), Some("still good"));

        // Flipped status transitions
        set_condition(&mut status, CONDITION_READY, false, "SecretMissing", "gone");
        assert!(!condition_is_true(&status, CONDITION_READY));
    }

    #[test]
    fn test_enter_phase_stamps_bookkeeping() {
        let mut status = NotebookValidationJobStatus::default();
        enter_phase(&mut status, JobPhase::Initializing, "starting");
        assert_eq!(status.phase, "Initializing");
        assert!(status.started_at.is_some());
        assert!(status.completed_at.is_none());

        let started = status.started_at.clone();
        enter_phase(&mut status, JobPhase::Succeeded, "done");
        assert_eq!(status.phase, "Succeeded");
        // First transition anchors the timeout; it never moves
        assert_eq!(status.started_at, started);
        assert!(status.completed_at.is_some());
    }

    #[test]
    fn test_terminal_completion_time_written_once() {
        let mut status = NotebookValidationJobStatus::default();
        enter_phase(&mut status, JobPhase::Failed, "boom");
        let completed = status.completed_at.clone();
        enter_phase(&mut status, JobPhase::Failed, "boom again");
        assert_eq!(status.completed_at, completed);
    }
}

//! Post-success trigger execution
//!
//! On a job's terminal Succeeded transition the controller reads the
//! `mlops.dev/on-success-trigger` annotation (a JSON list) and applies each
//! declared action to its downstream resource. Triggers run in declared
//! order and are independent: one failing does not stop the rest, and errors
//! never propagate into the already-terminal job status.

use crate::crds::NotebookValidationJob;
use crate::tasks::types::{Context, Error, Result, ANNOTATION_TRIGGERS};
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::{Api, ResourceExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

pub const KSERVE_LABEL: &str = "serving.kserve.io/inferenceservice";

/// Action applied to a downstream resource.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerAction {
    /// Delete the pods behind the target so its controller restarts them
    Restart,
    /// Force an ArgoCD Application to refresh and re-sync
    Sync,
    /// Stamp a restart-timestamp annotation and let the owning controller act
    Refresh,
}

/// One declared trigger entry.
#[derive(Deserialize, Clone, Debug)]
pub struct Trigger {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    pub kind: String,

    pub name: String,

    /// Defaults to the job's namespace
    #[serde(default)]
    pub namespace: Option<String>,

    pub action: TriggerAction,
}

/// Parse the trigger list from the job's annotations. An absent annotation is
/// an empty list; a malformed one is an error the caller logs and drops.
pub fn parse_triggers(job: &NotebookValidationJob) -> Result<Vec<Trigger>> {
    let Some(raw) = job
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_TRIGGERS))
    else {
        return Ok(Vec::new());
    };

    serde_json::from_str(raw).map_err(Error::SerializationError)
}

/// Execute all declared triggers for a succeeded job.
pub async fn execute_triggers(job: &NotebookValidationJob, ctx: &Context) {
    let triggers = match parse_triggers(job) {
        Ok(triggers) => triggers,
        Err(e) => {
            warn!(
                "Ignoring malformed {} annotation on {}: {}",
                ANNOTATION_TRIGGERS,
                job.name_any(),
                e
            );
            return;
        }
    };

    for trigger in &triggers {
        let namespace = trigger
            .namespace
            .clone()
            .or_else(|| job.metadata.namespace.clone())
            .unwrap_or_else(|| ctx.namespace.clone());

        let outcome = match trigger.action {
            TriggerAction::Restart => restart_target(trigger, &namespace, ctx).await,
            TriggerAction::Sync => sync_argocd_application(trigger, &namespace, ctx).await,
            TriggerAction::Refresh => refresh_target(trigger, &namespace, ctx).await,
        };

        match outcome {
            Ok(()) => info!(
                "Trigger {:?} applied to {}/{} {}",
                trigger.action, namespace, trigger.kind, trigger.name
            ),
            Err(e) => warn!(
                "Trigger {:?} on {}/{} {} failed: {}",
                trigger.action, namespace, trigger.kind, trigger.name, e
            ),
        }
    }
}

/// Delete the pods behind the target. Deployment targets resolve through
/// their selector, KServe InferenceServices through the well-known serving
/// label, anything else through owner-reference UIDs.
async fn restart_target(trigger: &Trigger, namespace: &str, ctx: &Context) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);

    let selector = match trigger.kind.as_str() {
        "Deployment" => {
            let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), namespace);
            let deployment = deployments.get(&trigger.name).await?;
            deployment
                .spec
                .and_then(|s| s.selector.match_labels)
                .map(|labels| {
                    labels
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join(",")
                })
        }
        "InferenceService" => Some(format!("{KSERVE_LABEL}={}", trigger.name)),
        _ => None,
    };

    let candidates = if let Some(selector) = selector {
        pods.list(&ListParams::default().labels(&selector)).await?.items
    } else {
        // Generic resources: match pods owned (transitively one hop) by the
        // target's UID.
        let target = get_dynamic(trigger, namespace, ctx).await?;
        let target_uid = target.metadata.uid.clone().unwrap_or_default();
        pods.list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter(|pod| {
                pod.metadata
                    .owner_references
                    .as_ref()
                    .is_some_and(|refs| refs.iter().any(|r| r.uid == target_uid))
            })
            .collect()
    };

    for pod in candidates {
        let pod_name = pod.name_any();
        match pods.delete(&pod_name, &DeleteParams::default()).await {
            Ok(_) => info!("Restarted pod {} for trigger target {}", pod_name, trigger.name),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => warn!("Failed to delete pod {}: {}", pod_name, e),
        }
    }

    Ok(())
}

/// Patch refresh and sync-wave annotations onto an ArgoCD Application so the
/// GitOps controller reconciles it immediately.
async fn sync_argocd_application(trigger: &Trigger, namespace: &str, ctx: &Context) -> Result<()> {
    let resource = ApiResource {
        group: "argoproj.io".to_string(),
        version: "v1alpha1".to_string(),
        api_version: "argoproj.io/v1alpha1".to_string(),
        kind: "Application".to_string(),
        plural: "applications".to_string(),
    };
    let applications: Api<DynamicObject> =
        Api::namespaced_with(ctx.client.clone(), namespace, &resource);

    let patch = json!({
        "metadata": {
            "annotations": {
                "argocd.argoproj.io/refresh": "normal",
                "argocd.argoproj.io/sync-wave": "-1",
            }
        }
    });

    applications
        .patch(&trigger.name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Stamp a restart-timestamp annotation on the target resource.
async fn refresh_target(trigger: &Trigger, namespace: &str, ctx: &Context) -> Result<()> {
    let resource = api_resource_for(trigger)?;
    let api: Api<DynamicObject> = Api::namespaced_with(ctx.client.clone(), namespace, &resource);

    let patch = json!({
        "metadata": {
            "annotations": {
                "mlops.dev/restart-timestamp": Utc::now().to_rfc3339(),
            }
        }
    });

    api.patch(&trigger.name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn get_dynamic(trigger: &Trigger, namespace: &str, ctx: &Context) -> Result<DynamicObject> {
    let resource = api_resource_for(trigger)?;
    let api: Api<DynamicObject> = Api::namespaced_with(ctx.client.clone(), namespace, &resource);
    Ok(api.get(&trigger.name).await?)
}

fn api_resource_for(trigger: &Trigger) -> Result<ApiResource> {
    let (group, version) = match trigger.api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), trigger.api_version.clone()),
    };

    if version.is_empty() {
        return Err(Error::SpecError(format!(
            "trigger apiVersion {:?} is not parseable",
            trigger.api_version
        )));
    }

    Ok(ApiResource {
        group,
        version,
        api_version: trigger.api_version.clone(),
        kind: trigger.kind.clone(),
        plural: guess_plural(&trigger.kind),
    })
}

fn guess_plural(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        format!("{lower}es")
    } else if lower.ends_with('y') {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{lower}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{GitSource, NotebookSource, NotebookValidationJobSpec};
    use std::collections::BTreeMap;

    fn job_with_annotation(value: Option<&str>) -> NotebookValidationJob {
        let mut job = NotebookValidationJob::new(
            "demo",
            NotebookValidationJobSpec {
                notebook: NotebookSource {
                    git: GitSource {
                        url: "https://git.example/org/notebooks.git".to_string(),
                        git_ref: None,
                        credentials_secret: None,
                    },
                    path: "hello.ipynb".to_string(),
                },
                pod_config: None,
                golden_notebook: None,
                comparison_config: None,
                model_validation: None,
                timeout: None,
            },
        );
        if let Some(raw) = value {
            job.metadata.annotations = Some(BTreeMap::from([(
                ANNOTATION_TRIGGERS.to_string(),
                raw.to_string(),
            )]));
        }
        job
    }

    #[test]
    fn test_absent_annotation_is_empty_list() {
        let job = job_with_annotation(None);
        assert!(parse_triggers(&job).unwrap().is_empty());
    }

    #[test]
    fn test_parse_trigger_list_preserves_order() {
        let job = job_with_annotation(Some(
            r#"[
                {"apiVersion":"serving.kserve.io/v1beta1","kind":"InferenceService","name":"m1","action":"restart"},
                {"apiVersion":"argoproj.io/v1alpha1","kind":"Application","name":"team-app","namespace":"argocd","action":"sync"},
                {"apiVersion":"apps/v1","kind":"Deployment","name":"scorer","action":"refresh"}
            ]"#,
        ));

        let triggers = parse_triggers(&job).unwrap();
        assert_eq!(triggers.len(), 3);
        assert_eq!(triggers[0].action, TriggerAction::Restart);
        assert_eq!(triggers[0].name, "m1");
        assert_eq!(triggers[1].action, TriggerAction::Sync);
        assert_eq!(triggers[1].namespace.as_deref(), Some("argocd"));
        assert_eq!(triggers[2].action, TriggerAction::Refresh);
        assert_eq!(triggers[2].namespace, None);
    }

    #[test]
    fn test_malformed_annotation_is_an_error() {
        let job = job_with_annotation(Some("not json"));
        assert!(parse_triggers(&job).is_err());
    }

    #[test]
    fn test_unknown_action_rejected() {
        let job = job_with_annotation(Some(
            r#"[{"apiVersion":"apps/v1","kind":"Deployment","name":"d","action":"explode"}]"#,
        ));
        assert!(parse_triggers(&job).is_err());
    }

    #[test]
    fn test_api_resource_for_core_group() {
        let trigger = Trigger {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            name: "svc".to_string(),
            namespace: None,
            action: TriggerAction::Refresh,
        };
        let resource = api_resource_for(&trigger).unwrap();
        assert_eq!(resource.group, "");
        assert_eq!(resource.version, "v1");
        assert_eq!(resource.plural, "services");
    }

    #[test]
    fn test_guess_plural() {
        assert_eq!(guess_plural("Deployment"), "deployments");
        assert_eq!(guess_plural("InferenceService"), "inferenceservices");
        assert_eq!(guess_plural("NetworkPolicy"), "networkpolicies");
    }
}

use crate::crds::NotebookValidationJob;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, Instrument};

pub mod build;
pub mod config;
pub mod events;
pub mod failure;
pub mod triggers;
pub mod types;
pub mod validation;

// Re-export commonly used items
pub use config::ControllerConfig;
pub use types::{Error, Result};
pub use validation::reconcile_validation_job;

// Context is crate-internal only
use types::{Context, ErrorClass, ANNOTATION_RESYNC_TS};

/// Main entry point for the validation controller
#[instrument(skip(client, config), fields(namespace = %namespace))]
pub async fn run_validation_controller(
    client: Client,
    namespace: String,
    config: ControllerConfig,
) -> Result<()> {
    info!("Starting validation controller in namespace: {}", namespace);

    if let Err(validation_error) = config.validate() {
        error!("Configuration validation failed: {}", validation_error);
        return Err(Error::ConfigError(validation_error.to_string()));
    }
    debug!("Configuration validation passed");

    // Create shared context
    let context = Arc::new(Context {
        client: client.clone(),
        namespace: namespace.clone(),
        config: Arc::new(config),
    });

    // Startup visibility: list existing jobs so we can see what the
    // controller should observe
    {
        let jobs_api: Api<NotebookValidationJob> = Api::namespaced(client.clone(), &namespace);
        match jobs_api.list(&ListParams::default()).await {
            Ok(list) => {
                info!(
                    "Controller startup: found {} NotebookValidationJob(s) in namespace {}",
                    list.items.len(),
                    namespace
                );
                for job in list.items {
                    let name = job.name_any();
                    let phase = job
                        .status
                        .as_ref()
                        .map(|s| s.phase.clone())
                        .unwrap_or_default();
                    info!("Existing job: name={}, phase='{}'", name, phase);
                }
            }
            Err(e) => {
                error!("Failed to list NotebookValidationJobs at startup: {}", e);
            }
        }
    }

    // Periodic resync: proactively nudge missed jobs to ensure reconcile is
    // triggered
    let _resync_handle = tokio::spawn({
        let client = client.clone();
        let namespace = namespace.clone();
        async move {
            let jobs_api: Api<NotebookValidationJob> =
                Api::namespaced(client.clone(), &namespace);
            let mut ticker = tokio::time::interval(Duration::from_secs(120));
            loop {
                ticker.tick().await;
                match jobs_api.list(&ListParams::default()).await {
                    Ok(list) => {
                        debug!(
                            "Resync scan: {} job(s) in namespace {}",
                            list.items.len(),
                            namespace
                        );
                        for job in list.items {
                            let name = job.name_any();
                            let phase_empty = job
                                .status
                                .as_ref()
                                .map(|s| s.phase.trim().is_empty())
                                .unwrap_or(true);
                            if phase_empty {
                                // Trigger a benign metadata change to emit a
                                // MODIFIED event
                                let ts = Utc::now().to_rfc3339();
                                let patch = json!({
                                    "metadata": {"annotations": {ANNOTATION_RESYNC_TS: ts}}
                                });
                                let pp = PatchParams::default();
                                match jobs_api.patch(&name, &pp, &Patch::Merge(&patch)).await {
                                    Ok(_) => info!("Resync nudged job: {}", name),
                                    Err(e) => debug!("Resync patch skipped for {}: {}", name, e),
                                }
                            }
                        }
                    }
                    Err(e) => {
                        debug!("Resync scan failed: {}", e);
                    }
                }
            }
        }
    });

    let jobs_api: Api<NotebookValidationJob> = Api::namespaced(client.clone(), &namespace);
    let pods_api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let secrets_api: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    let watcher_config = Config::default().any_semantic();

    let controller = Controller::new(jobs_api, watcher_config.clone());

    // Credential rotations re-trigger every job referencing the secret so the
    // pipeline strategy can re-derive its transport copy
    let store = controller.store();
    let secret_mapper = move |secret: Secret| {
        let secret_name = secret.name_any();
        store
            .state()
            .iter()
            .filter(|job| {
                job.spec.notebook.git.credentials_secret.as_deref()
                    == Some(secret_name.as_str())
            })
            .map(|job| ObjectRef::from_obj(job.as_ref()))
            .collect::<Vec<_>>()
    };

    controller
        .owns(pods_api, watcher_config.clone())
        .watches(secrets_api, watcher_config, secret_mapper)
        .run(reconcile_validation_job, error_policy, context)
        .for_each(|reconciliation_result| {
            let span = tracing::info_span!("validation_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok(job_resource) => {
                        info!(resource = ?job_resource, "Reconciliation successful");
                    }
                    Err(reconciliation_err) => {
                        error!(error = ?reconciliation_err, "Reconciliation error");
                    }
                }
            }
            .instrument(span)
        })
        .await;

    info!("Validation controller shutting down");
    Ok(())
}

/// Error policy: errors that escape the reconciler are classified the same
/// way in-reconcile errors are.
#[instrument(skip(ctx), fields(job_name = %job.name_any(), namespace = %ctx.namespace))]
fn error_policy(job: Arc<NotebookValidationJob>, error: &Error, ctx: Arc<Context>) -> Action {
    match error.classify() {
        ErrorClass::Transient => {
            debug!(error = ?error, "Transient reconciliation error, short requeue");
            Action::requeue(ctx.config.transient_requeue())
        }
        ErrorClass::Retriable => {
            error!(error = ?error, "Retriable reconciliation error, backing off");
            Action::requeue(ctx.config.retry_backoff(0))
        }
        ErrorClass::Terminal => {
            error!(error = ?error, "Terminal reconciliation error, awaiting change");
            Action::await_change()
        }
    }
}

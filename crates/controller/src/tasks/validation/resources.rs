//! Validation workload composition and lifecycle
//!
//! Composes the child pod from the canonical image reference and the job's
//! pod config, creates it idempotently and reads its coarse state back. When
//! the image was built, the notebook is baked in and no source-clone init
//! step is added; the clone step only exists for pre-built images.

use crate::crds::{NotebookValidationJob, NotebookValidationJobStatus};
use crate::tasks::config::ControllerConfig;
use crate::tasks::failure::CLONE_CONTAINER_NAME;
use crate::tasks::types::{Context, Error, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, PostParams};
use kube::ResourceExt;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Recovery marker meaning the declared image replaces the built one.
pub const RECOVERY_PREBUILT_IMAGE: &str = "prebuilt-image";

/// Coarse state of the child validation pod.
#[derive(Debug, Clone)]
pub enum ValidationPodState {
    NotFound,
    Pending(Box<Pod>),
    Running,
    Succeeded(Box<Pod>),
    Failed(Box<Pod>),
}

/// Name of the child validation pod for a job.
#[must_use]
pub fn validation_pod_name(job: &NotebookValidationJob) -> String {
    format!("{}-validator", job.name_any())
}

/// Resolve the canonical image reference for the validation workload.
///
/// Exactly one source per job: the built image when a build was requested and
/// succeeded, else the declared `containerImage`. An applied prebuilt-image
/// recovery overrides the built reference.
pub fn canonical_image(
    job: &NotebookValidationJob,
    status: &NotebookValidationJobStatus,
) -> Result<String> {
    if status.recovery_applied.as_deref() != Some(RECOVERY_PREBUILT_IMAGE) {
        if let Some(reference) = status
            .build_status
            .as_ref()
            .and_then(|b| b.image_reference.as_deref())
            .filter(|r| !r.is_empty())
        {
            return Ok(reference.to_string());
        }
    }

    job.declared_image()
        .map(std::string::ToString::to_string)
        .ok_or_else(|| {
            Error::SpecError(
                "no image available: no build produced an image and podConfig.containerImage \
                 is unset"
                    .to_string(),
            )
        })
}

/// Whether the workload runs the built image (and therefore needs no clone
/// init step — the notebook is already baked in).
#[must_use]
pub fn uses_built_image(
    job: &NotebookValidationJob,
    status: &NotebookValidationJobStatus,
) -> bool {
    status.recovery_applied.as_deref() != Some(RECOVERY_PREBUILT_IMAGE)
        && job.build_requested()
        && status
            .build_status
            .as_ref()
            .and_then(|b| b.image_reference.as_deref())
            .is_some_and(|r| !r.is_empty())
}

pub struct ValidationResourceManager<'a> {
    pub pods: &'a Api<Pod>,
    pub config: &'a Arc<ControllerConfig>,
}

impl<'a> ValidationResourceManager<'a> {
    pub fn new(pods: &'a Api<Pod>, config: &'a Arc<ControllerConfig>) -> Self {
        Self { pods, config }
    }

    /// Idempotent pod creation: create if absent, reuse on 409.
    pub async fn create_or_get(
        &self,
        job: &NotebookValidationJob,
        status: &NotebookValidationJobStatus,
    ) -> Result<String> {
        let pod_name = validation_pod_name(job);

        match self.pods.get(&pod_name).await {
            Ok(_) => {
                debug!("Found existing validation pod: {}, reusing", pod_name);
                return Ok(pod_name);
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        let pod = self.build_pod_spec(job, status, &pod_name)?;
        match self.pods.create(&PostParams::default(), &pod).await {
            Ok(_) => {
                info!("Created validation pod: {}", pod_name);
                Ok(pod_name)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!("Validation pod {} created concurrently, reusing", pod_name);
                Ok(pod_name)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read the pod's coarse state.
    pub async fn pod_state(&self, pod_name: &str) -> Result<ValidationPodState> {
        let pod = match self.pods.get(pod_name).await {
            Ok(pod) => pod,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Ok(ValidationPodState::NotFound)
            }
            Err(e) => return Err(e.into()),
        };

        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("");

        Ok(match phase {
            "Succeeded" => ValidationPodState::Succeeded(Box::new(pod)),
            "Failed" => ValidationPodState::Failed(Box::new(pod)),
            "Running" => ValidationPodState::Running,
            _ => ValidationPodState::Pending(Box::new(pod)),
        })
    }

    /// Delete the pod before a retry; not-found is fine.
    pub async fn delete_pod(&self, pod_name: &str) -> Result<()> {
        match self.pods.delete(pod_name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("Deleted validation pod: {}", pod_name);
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => {
                warn!("Failed to delete validation pod {}: {}", pod_name, e);
                Err(e.into())
            }
        }
    }

    fn build_pod_spec(
        &self,
        job: &NotebookValidationJob,
        status: &NotebookValidationJobStatus,
        pod_name: &str,
    ) -> Result<Pod> {
        let image = canonical_image(job, status)?;
        let with_clone_step = !uses_built_image(job, status);
        let pod_config = job.spec.pod_config.clone().unwrap_or_default();
        let runner = &self.config.runner;
        let notebook = &job.spec.notebook;

        let service_account = pod_config
            .service_account_name
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| runner.service_account_name.clone());

        // Workspace shared between the clone step and the runner
        let mut volumes = vec![json!({ "name": "workspace", "emptyDir": {} })];
        let mut volume_mounts = vec![json!({ "name": "workspace", "mountPath": "/workspace" })];
        if let Some(extra) = pod_config.volumes.as_ref().and_then(|v| v.as_array()) {
            volumes.extend(extra.iter().cloned());
        }
        if let Some(extra) = pod_config.volume_mounts.as_ref().and_then(|v| v.as_array()) {
            volume_mounts.extend(extra.iter().cloned());
        }

        let notebook_path = if with_clone_step {
            format!("/workspace/source/{}", notebook.path)
        } else {
            // Built images bake the repository under /workspace
            format!("/workspace/{}", notebook.path)
        };

        let mut env_vars = vec![
            json!({ "name": "NOTEBOOK_PATH", "value": notebook_path }),
            json!({ "name": "OUTPUT_PATH", "value": runner.output_path }),
            json!({ "name": "VALIDATION_JOB_NAME", "value": job.name_any() }),
            json!({
                "name": "NAMESPACE",
                "valueFrom": { "fieldRef": { "fieldPath": "metadata.namespace" } }
            }),
        ];
        for (name, value) in &pod_config.env {
            env_vars.push(json!({ "name": name, "value": value }));
        }
        for mapping in &pod_config.credentials {
            env_vars.push(json!({
                "name": mapping.name,
                "valueFrom": {
                    "secretKeyRef": {
                        "name": mapping.secret_name,
                        "key": mapping.secret_key,
                    }
                }
            }));
        }

        let env_from: Vec<_> = pod_config
            .env_from_secrets
            .iter()
            .map(|secret| json!({ "secretRef": { "name": secret } }))
            .collect();

        let requests = pod_config.requests.clone().map_or_else(
            || {
                json!({
                    "cpu": runner.cpu_request,
                    "memory": runner.memory_request,
                })
            },
            |r| json!(r),
        );
        let limits = pod_config.limits.clone().map_or_else(
            || {
                json!({
                    "cpu": runner.cpu_limit,
                    "memory": runner.memory_limit,
                })
            },
            |l| json!(l),
        );

        let mut command: Vec<String> = runner.command.clone();
        command.extend([
            "--notebook".to_string(),
            "$(NOTEBOOK_PATH)".to_string(),
            "--output".to_string(),
            "$(OUTPUT_PATH)".to_string(),
        ]);

        let mut container = json!({
            "name": "notebook-validator",
            "image": image,
            "command": command,
            "env": env_vars,
            "workingDir": "/workspace",
            "volumeMounts": volume_mounts,
            "resources": {
                "requests": requests,
                "limits": limits,
            }
        });
        if !env_from.is_empty() {
            container["envFrom"] = json!(env_from);
        }

        let mut pod_spec = json!({
            "restartPolicy": "Never",
            "serviceAccountName": service_account,
            "containers": [container],
            "volumes": volumes,
        });

        if with_clone_step {
            pod_spec["initContainers"] = json!([self.clone_init_container(job)]);
        }

        let labels = json!({
            "app": "notebook-validator",
            "mlops.dev/job": job.name_any(),
        });

        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": pod_name,
                "labels": labels,
                "ownerReferences": [{
                    "apiVersion": "mlops.dev/v1alpha1",
                    "kind": "NotebookValidationJob",
                    "name": job.name_any(),
                    "uid": job.metadata.uid.clone().unwrap_or_default(),
                    "controller": true,
                    "blockOwnerDeletion": true
                }]
            },
            "spec": pod_spec,
        });

        Ok(serde_json::from_value(manifest)?)
    }

    /// The source-clone init step, configured with the job's git credentials.
    fn clone_init_container(&self, job: &NotebookValidationJob) -> serde_json::Value {
        let git = &job.spec.notebook.git;
        let git_ref = git.git_ref.clone().unwrap_or_else(|| "HEAD".to_string());

        let mut env = Vec::new();
        if let Some(secret) = git.credentials_secret.as_deref() {
            env.push(json!({
                "name": "GIT_USERNAME",
                "valueFrom": {
                    "secretKeyRef": { "name": secret, "key": "username", "optional": true }
                }
            }));
            env.push(json!({
                "name": "GIT_PASSWORD",
                "valueFrom": {
                    "secretKeyRef": { "name": secret, "key": "password", "optional": true }
                }
            }));
            env.push(json!({
                "name": "GIT_TOKEN",
                "valueFrom": {
                    "secretKeyRef": { "name": secret, "key": "token", "optional": true }
                }
            }));
        }
        env.push(json!({ "name": "GIT_URL", "value": git.url }));
        env.push(json!({ "name": "GIT_REF", "value": git_ref }));

        // Exit codes 2/128 from git surface as git-authentication failures
        let script = concat!(
            "set -e\n",
            "url=\"$GIT_URL\"\n",
            "if [ -n \"$GIT_TOKEN\" ]; then\n",
            "  url=$(echo \"$url\" | sed \"s#https://#https://oauth2:${GIT_TOKEN}@#\")\n",
            "elif [ -n \"$GIT_USERNAME\" ] && [ -n \"$GIT_PASSWORD\" ]; then\n",
            "  url=$(echo \"$url\" | sed \"s#https://#https://${GIT_USERNAME}:${GIT_PASSWORD}@#\")\n",
            "fi\n",
            "git clone --depth 1 --branch \"$GIT_REF\" \"$url\" /workspace/source || \\\n",
            "  git clone --depth 1 \"$url\" /workspace/source\n"
        );

        json!({
            "name": CLONE_CONTAINER_NAME,
            "image": self.config.runner.clone_image,
            "command": ["/bin/sh", "-c", script],
            "env": env,
            "volumeMounts": [ { "name": "workspace", "mountPath": "/workspace" } ]
        })
    }
}

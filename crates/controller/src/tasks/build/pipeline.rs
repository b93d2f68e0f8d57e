//! Tekton pipeline build backend
//!
//! Creates a `tekton.dev/v1beta1` PipelineRun that clones the source,
//! resolves the requirements chain into a Dockerfile and builds the image
//! in-cluster. Namespace prerequisites (service account, privileged-build SCC
//! grant, derived git credentials, task definitions) are ensured idempotently
//! before the run is created; grants are add-only.

use crate::crds::NotebookValidationJob;
use crate::tasks::build::BuildPoll;
use crate::tasks::types::{derived_git_secret_name, Context, Result};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ApiResource, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::{Api, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub const PIPELINE_GROUP: &str = "tekton.dev";
const BUILD_TASK_NAME: &str = "notebook-image-build";

fn pipelinerun_resource() -> ApiResource {
    ApiResource {
        group: PIPELINE_GROUP.to_string(),
        version: "v1beta1".to_string(),
        api_version: format!("{PIPELINE_GROUP}/v1beta1"),
        kind: "PipelineRun".to_string(),
        plural: "pipelineruns".to_string(),
    }
}

fn task_resource() -> ApiResource {
    ApiResource {
        group: PIPELINE_GROUP.to_string(),
        version: "v1beta1".to_string(),
        api_version: format!("{PIPELINE_GROUP}/v1beta1"),
        kind: "Task".to_string(),
        plural: "tasks".to_string(),
    }
}

fn scc_resource() -> ApiResource {
    ApiResource {
        group: "security.openshift.io".to_string(),
        version: "v1".to_string(),
        api_version: "security.openshift.io/v1".to_string(),
        kind: "SecurityContextConstraints".to_string(),
        plural: "securitycontextconstraints".to_string(),
    }
}

/// Tekton backend bound to one namespace.
#[derive(Clone)]
pub struct PipelineBackend {
    pipelineruns: Api<DynamicObject>,
    tasks: Api<DynamicObject>,
    sccs: Api<DynamicObject>,
    service_accounts: Api<ServiceAccount>,
    secrets: Api<Secret>,
    namespace: String,
    service_account: String,
    scc_name: String,
    internal_registry: String,
}

impl PipelineBackend {
    #[must_use]
    pub fn new(ctx: &Context) -> Self {
        Self {
            pipelineruns: Api::namespaced_with(
                ctx.client.clone(),
                &ctx.namespace,
                &pipelinerun_resource(),
            ),
            tasks: Api::namespaced_with(ctx.client.clone(), &ctx.namespace, &task_resource()),
            sccs: Api::all_with(ctx.client.clone(), &scc_resource()),
            service_accounts: Api::namespaced(ctx.client.clone(), &ctx.namespace),
            secrets: Api::namespaced(ctx.client.clone(), &ctx.namespace),
            namespace: ctx.namespace.clone(),
            service_account: ctx.config.build.pipeline_service_account.clone(),
            scc_name: ctx.config.build.privileged_build_scc.clone(),
            internal_registry: ctx.config.build.internal_registry.clone(),
        }
    }

    #[must_use]
    pub fn target_image(&self, job_name: &str) -> String {
        format!("{}/{}/{}:latest", self.internal_registry, self.namespace, job_name)
    }

    /// Ensure the PipelineRun exists; reuse on 409. Returns the artifact name.
    pub async fn ensure_created(
        &self,
        job: &NotebookValidationJob,
        resolve_script: &str,
    ) -> Result<String> {
        self.ensure_service_account().await?;
        self.ensure_privileged_grant().await;
        self.ensure_build_task().await?;
        if let Some(secret) = job.spec.notebook.git.credentials_secret.as_deref() {
            self.ensure_derived_git_secret(secret, &job.spec.notebook.git.url)
                .await?;
        }

        let name = format!("{}-build", job.name_any());
        let git = &job.spec.notebook.git;
        let git_ref = git.git_ref.clone().unwrap_or_else(|| "main".to_string());

        let manifest = json!({
            "apiVersion": format!("{PIPELINE_GROUP}/v1beta1"),
            "kind": "PipelineRun",
            "metadata": {
                "name": name.clone(),
                "labels": {
                    "app": "notebook-validator",
                    "mlops.dev/job": job.name_any(),
                },
                "ownerReferences": [super::s2i::owner_reference(job)],
            },
            "spec": {
                "serviceAccountName": self.service_account,
                "params": [
                    { "name": "git-url", "value": git.url },
                    { "name": "git-ref", "value": git_ref },
                    { "name": "image-target", "value": self.target_image(&job.name_any()) },
                ],
                "pipelineSpec": {
                    "params": [
                        { "name": "git-url", "type": "string" },
                        { "name": "git-ref", "type": "string" },
                        { "name": "image-target", "type": "string" },
                    ],
                    "workspaces": [ { "name": "source" } ],
                    "results": [
                        { "name": "IMAGE_URL", "value": "$(tasks.build.results.IMAGE_URL)" }
                    ],
                    "tasks": [
                        {
                            "name": "fetch",
                            "taskRef": { "name": "git-clone", "kind": "ClusterTask" },
                            "params": [
                                { "name": "url", "value": "$(params.git-url)" },
                                { "name": "revision", "value": "$(params.git-ref)" },
                            ],
                            "workspaces": [ { "name": "output", "workspace": "source" } ]
                        },
                        {
                            "name": "resolve-requirements",
                            "runAfter": ["fetch"],
                            "taskSpec": {
                                "workspaces": [ { "name": "source" } ],
                                "steps": [{
                                    "name": "resolve",
                                    "image": "registry.access.redhat.com/ubi9/ubi-minimal:latest",
                                    "script": resolve_script
                                }]
                            },
                            "workspaces": [ { "name": "source", "workspace": "source" } ]
                        },
                        {
                            "name": "build",
                            "runAfter": ["resolve-requirements"],
                            "taskRef": { "name": BUILD_TASK_NAME },
                            "params": [
                                { "name": "IMAGE", "value": "$(params.image-target)" },
                            ],
                            "workspaces": [ { "name": "source", "workspace": "source" } ]
                        }
                    ]
                },
                "workspaces": [{
                    "name": "source",
                    "volumeClaimTemplate": {
                        "spec": {
                            "accessModes": ["ReadWriteOnce"],
                            "resources": { "requests": { "storage": "1Gi" } }
                        }
                    }
                }]
            }
        });

        let object: DynamicObject = serde_json::from_value(manifest)?;
        match self.pipelineruns.create(&PostParams::default(), &object).await {
            Ok(_) => {
                info!("Created PipelineRun: {}", name);
                Ok(name)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!("PipelineRun {} already exists, reusing", name);
                Ok(name)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Poll the PipelineRun's Succeeded condition.
    pub async fn poll(&self, run_name: &str) -> Result<BuildPoll> {
        let run = match self.pipelineruns.get(run_name).await {
            Ok(run) => run,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(BuildPoll::Pending),
            Err(e) => return Err(e.into()),
        };

        let conditions = run
            .data
            .get("status")
            .and_then(|s| s.get("conditions"))
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default();

        let succeeded = conditions.iter().find(|c| {
            c.get("type").and_then(|t| t.as_str()) == Some("Succeeded")
        });

        let Some(condition) = succeeded else {
            return Ok(BuildPoll::Pending);
        };

        match condition.get("status").and_then(|s| s.as_str()) {
            Some("True") => {
                let image = run
                    .data
                    .get("status")
                    .and_then(|s| s.get("pipelineResults"))
                    .and_then(|r| r.as_array())
                    .and_then(|results| {
                        results.iter().find(|r| {
                            r.get("name").and_then(|n| n.as_str()) == Some("IMAGE_URL")
                        })
                    })
                    .and_then(|r| r.get("value"))
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(std::string::ToString::to_string)
                    // Older Tekton versions drop pipelineResults on pruned
                    // runs; the target reference is still authoritative.
                    .unwrap_or_else(|| {
                        run_name
                            .strip_suffix("-build")
                            .map_or_else(|| self.target_image(run_name), |job| self.target_image(job))
                    });
                Ok(BuildPoll::Succeeded { image })
            }
            Some("False") => {
                let message = condition
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("pipeline run failed")
                    .to_string();
                Ok(BuildPoll::Failed { message })
            }
            _ => Ok(BuildPoll::Running),
        }
    }

    /// Delete the PipelineRun.
    pub async fn delete(&self, run_name: &str) -> Result<()> {
        match self.pipelineruns.delete(run_name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("Deleted PipelineRun: {}", run_name);
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_service_account(&self) -> Result<()> {
        match self.service_accounts.get(&self.service_account).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let sa: ServiceAccount = serde_json::from_value(json!({
                    "apiVersion": "v1",
                    "kind": "ServiceAccount",
                    "metadata": {
                        "name": self.service_account,
                        "labels": { "app": "notebook-validator" }
                    }
                }))?;
                match self.service_accounts.create(&PostParams::default(), &sa).await {
                    Ok(_) => {
                        info!("Created pipeline ServiceAccount: {}", self.service_account);
                        Ok(())
                    }
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Add our service account to the privileged-build SCC user list.
    ///
    /// Add-only: existing users are never removed. Non-privileged clusters
    /// (403) and clusters without the SCC API (404) skip with a warning.
    async fn ensure_privileged_grant(&self) {
        let user = format!(
            "system:serviceaccount:{}:{}",
            self.namespace, self.service_account
        );

        let scc = match self.sccs.get(&self.scc_name).await {
            Ok(scc) => scc,
            Err(kube::Error::Api(ae)) if ae.code == 404 || ae.code == 403 => {
                warn!(
                    "Privileged-build SCC {} not grantable (HTTP {}), pipeline builds may fail",
                    self.scc_name, ae.code
                );
                return;
            }
            Err(e) => {
                warn!("Failed to read SCC {}: {}", self.scc_name, e);
                return;
            }
        };

        let mut users: Vec<String> = scc
            .data
            .get("users")
            .and_then(|u| u.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(std::string::ToString::to_string))
                    .collect()
            })
            .unwrap_or_default();

        if users.contains(&user) {
            return;
        }
        users.push(user.clone());

        let patch = json!({ "users": users });
        match self
            .sccs
            .patch(&self.scc_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => info!("Granted {} access to SCC {}", user, self.scc_name),
            Err(e) => warn!("Failed to grant SCC {} to {}: {}", self.scc_name, user, e),
        }
    }

    /// Copy the image-build Task definition into the namespace if missing.
    async fn ensure_build_task(&self) -> Result<()> {
        match self.tasks.get(BUILD_TASK_NAME).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        let manifest = json!({
            "apiVersion": format!("{PIPELINE_GROUP}/v1beta1"),
            "kind": "Task",
            "metadata": {
                "name": BUILD_TASK_NAME,
                "labels": { "app": "notebook-validator" }
            },
            "spec": {
                "params": [ { "name": "IMAGE", "type": "string" } ],
                "workspaces": [ { "name": "source" } ],
                "results": [ { "name": "IMAGE_URL" } ],
                "steps": [{
                    "name": "build-and-push",
                    "image": "quay.io/buildah/stable:latest",
                    "securityContext": { "privileged": true },
                    "workingDir": "$(workspaces.source.path)",
                    "script": concat!(
                        "#!/bin/sh\nset -e\n",
                        "buildah bud --storage-driver=vfs -t \"$(params.IMAGE)\" -f Dockerfile .\n",
                        "buildah push --storage-driver=vfs \"$(params.IMAGE)\"\n",
                        "printf '%s' \"$(params.IMAGE)\" > \"$(results.IMAGE_URL.path)\"\n"
                    )
                }]
            }
        });

        let object: DynamicObject = serde_json::from_value(manifest)?;
        match self.tasks.create(&PostParams::default(), &object).await {
            Ok(_) => {
                info!("Copied build Task {} into namespace", BUILD_TASK_NAME);
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Synthesize the Tekton basic-auth secret derived from the source
    /// credentials secret, and re-derive when the source resourceVersion
    /// drifts from the one stamped on the derived copy.
    async fn ensure_derived_git_secret(&self, source_name: &str, git_url: &str) -> Result<()> {
        let source = self.secrets.get(source_name).await?;
        let source_rv = source.metadata.resource_version.clone().unwrap_or_default();
        let derived_name = derived_git_secret_name(source_name);

        if let Ok(existing) = self.secrets.get(&derived_name).await {
            let stamped = existing
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get("mlops.dev/source-resource-version"))
                .cloned()
                .unwrap_or_default();
            if stamped == source_rv {
                return Ok(());
            }
            debug!(
                "Source secret {} rotated (rv {} -> {}), re-deriving {}",
                source_name, stamped, source_rv, derived_name
            );
        }

        let git_host = git_url
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or("github.com");

        let mut data = BTreeMap::new();
        if let Some(source_data) = &source.data {
            for key in ["username", "password", "token"] {
                if let Some(value) = source_data.get(key) {
                    data.insert(key.to_string(), value.clone());
                }
            }
        }
        // Token-only secrets authenticate as an oauth user
        if !data.contains_key("username") && data.contains_key("token") {
            data.insert(
                "username".to_string(),
                k8s_openapi::ByteString(b"oauth2".to_vec()),
            );
        }
        if !data.contains_key("password") {
            if let Some(token) = data.get("token").cloned() {
                data.insert("password".to_string(), token);
            }
        }
        data.remove("token");

        let derived = Secret {
            metadata: ObjectMeta {
                name: Some(derived_name.clone()),
                annotations: Some(BTreeMap::from([
                    (
                        "tekton.dev/git-0".to_string(),
                        format!("https://{git_host}"),
                    ),
                    (
                        "mlops.dev/source-resource-version".to_string(),
                        source_rv,
                    ),
                ])),
                labels: Some(BTreeMap::from([(
                    "app".to_string(),
                    "notebook-validator".to_string(),
                )])),
                ..Default::default()
            },
            type_: Some("kubernetes.io/basic-auth".to_string()),
            data: Some(data),
            ..Default::default()
        };

        match self.secrets.create(&PostParams::default(), &derived).await {
            Ok(_) => {
                info!("Derived git credentials secret: {}", derived_name);
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                self.secrets
                    .replace(&derived_name, &PostParams::default(), &derived)
                    .await?;
                info!("Re-derived git credentials secret: {}", derived_name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

//! OpenShift source-to-image build backend
//!
//! Drives `build.openshift.io/v1` BuildConfig/Build resources through the
//! dynamic API. The BuildConfig carries the source repository plus an inline
//! Dockerfile recipe; the config-change trigger produces the actual Build,
//! which we poll for phase and output image reference.

use crate::crds::NotebookValidationJob;
use crate::tasks::build::BuildPoll;
use crate::tasks::types::{Context, Error, Result};
use kube::api::{ApiResource, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

pub const BUILD_GROUP: &str = "build.openshift.io";

fn buildconfig_resource() -> ApiResource {
    ApiResource {
        group: BUILD_GROUP.to_string(),
        version: "v1".to_string(),
        api_version: format!("{BUILD_GROUP}/v1"),
        kind: "BuildConfig".to_string(),
        plural: "buildconfigs".to_string(),
    }
}

fn build_resource() -> ApiResource {
    ApiResource {
        group: BUILD_GROUP.to_string(),
        version: "v1".to_string(),
        api_version: format!("{BUILD_GROUP}/v1"),
        kind: "Build".to_string(),
        plural: "builds".to_string(),
    }
}

/// Source-to-image backend bound to one namespace.
#[derive(Clone)]
pub struct S2iBackend {
    buildconfigs: Api<DynamicObject>,
    builds: Api<DynamicObject>,
    namespace: String,
    internal_registry: String,
}

impl S2iBackend {
    #[must_use]
    pub fn new(ctx: &Context) -> Self {
        let buildconfigs = Api::namespaced_with(
            ctx.client.clone(),
            &ctx.namespace,
            &buildconfig_resource(),
        );
        let builds =
            Api::namespaced_with(ctx.client.clone(), &ctx.namespace, &build_resource());
        Self {
            buildconfigs,
            builds,
            namespace: ctx.namespace.clone(),
            internal_registry: ctx.config.build.internal_registry.clone(),
        }
    }

    /// Target reference for the produced image in the internal registry.
    #[must_use]
    pub fn target_image(&self, job_name: &str) -> String {
        format!("{}/{}/{}:latest", self.internal_registry, self.namespace, job_name)
    }

    /// Ensure the BuildConfig exists; reuse on 409. Returns the artifact name.
    pub async fn ensure_created(
        &self,
        job: &NotebookValidationJob,
        dockerfile: &str,
    ) -> Result<String> {
        let name = format!("{}-build", job.name_any());
        let git = &job.spec.notebook.git;

        let mut source = json!({
            "type": "Git",
            "git": { "uri": git.url },
            "dockerfile": dockerfile,
        });
        if let Some(git_ref) = git.git_ref.as_deref().filter(|r| !r.is_empty()) {
            source["git"]["ref"] = json!(git_ref);
        }
        if let Some(secret) = git.credentials_secret.as_deref() {
            source["sourceSecret"] = json!({ "name": secret });
        }

        let manifest = json!({
            "apiVersion": format!("{BUILD_GROUP}/v1"),
            "kind": "BuildConfig",
            "metadata": {
                "name": name.clone(),
                "labels": {
                    "app": "notebook-validator",
                    "mlops.dev/job": job.name_any(),
                },
                "ownerReferences": [owner_reference(job)],
            },
            "spec": {
                "source": source,
                "strategy": {
                    "type": "Docker",
                    "dockerStrategy": { "noCache": false }
                },
                "output": {
                    "to": {
                        "kind": "DockerImage",
                        "name": self.target_image(&job.name_any()),
                    }
                },
                "triggers": [ { "type": "ConfigChange" } ],
                "runPolicy": "Serial"
            }
        });

        let object: DynamicObject = serde_json::from_value(manifest)?;
        match self.buildconfigs.create(&PostParams::default(), &object).await {
            Ok(_) => {
                info!("Created BuildConfig: {}", name);
                Ok(name)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!("BuildConfig {} already exists, reusing", name);
                Ok(name)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Poll the latest Build produced by the named BuildConfig.
    pub async fn poll(&self, build_config_name: &str) -> Result<BuildPoll> {
        let params = ListParams::default()
            .labels(&format!("openshift.io/build-config.name={build_config_name}"));
        let list = self.builds.list(&params).await?;

        // Config-change triggered builds appear shortly after BuildConfig
        // creation; nothing yet just means keep polling.
        let Some(latest) = list.items.into_iter().max_by_key(|b| {
            b.metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
        }) else {
            return Ok(BuildPoll::Pending);
        };

        let phase = latest
            .data
            .get("status")
            .and_then(|s| s.get("phase"))
            .and_then(|p| p.as_str())
            .unwrap_or("");

        match phase {
            "Complete" => {
                let image = latest
                    .data
                    .get("status")
                    .and_then(|s| s.get("outputDockerImageReference"))
                    .and_then(|r| r.as_str())
                    .map(std::string::ToString::to_string);

                match image {
                    Some(reference) => Ok(BuildPoll::Succeeded { image: reference }),
                    None => {
                        warn!(
                            "Build {} complete but carries no output image reference",
                            latest.name_any()
                        );
                        Err(Error::BuildError(format!(
                            "build {} completed without an output image reference",
                            latest.name_any()
                        )))
                    }
                }
            }
            "Failed" | "Error" | "Cancelled" => {
                let message = latest
                    .data
                    .get("status")
                    .and_then(|s| s.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("build failed")
                    .to_string();
                Ok(BuildPoll::Failed { message })
            }
            "New" | "Pending" => Ok(BuildPoll::Pending),
            _ => Ok(BuildPoll::Running),
        }
    }

    /// Delete the BuildConfig (cascades to its Builds via owner references).
    pub async fn delete(&self, build_config_name: &str) -> Result<()> {
        match self
            .buildconfigs
            .delete(build_config_name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!("Deleted BuildConfig: {}", build_config_name);
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub(super) fn owner_reference(job: &NotebookValidationJob) -> serde_json::Value {
    json!({
        "apiVersion": "mlops.dev/v1alpha1",
        "kind": "NotebookValidationJob",
        "name": job.name_any(),
        "uid": job.metadata.uid.clone().unwrap_or_default(),
        "controller": true,
        "blockOwnerDeletion": true
    })
}

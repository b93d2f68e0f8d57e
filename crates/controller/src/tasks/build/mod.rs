//! Build strategy abstraction
//!
//! A uniform contract over the two build backends. Dispatch is by variant
//! tag; each variant carries its backend with the API handles it needs.
//! Strategy selection probes the cluster for the required API group and
//! degrades gracefully when a backend is not installed.

use crate::crds::{BuildStrategyKind, NotebookValidationJob};
use crate::tasks::types::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info, warn};

pub mod pipeline;
pub mod requirements;
pub mod s2i;

pub use pipeline::PipelineBackend;
pub use s2i::S2iBackend;

/// Outcome of one build status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildPoll {
    /// No artifact observed yet, or it has not started
    Pending,
    /// Build in progress
    Running,
    /// Build finished; `image` is the fully-qualified produced reference
    Succeeded { image: String },
    /// Build finished unsuccessfully
    Failed { message: String },
}

/// A concrete build strategy, tagged by backend.
#[derive(Clone)]
pub enum BuildStrategy {
    SourceToImage(S2iBackend),
    Pipeline(PipelineBackend),
}

impl BuildStrategy {
    #[must_use]
    pub fn for_kind(kind: BuildStrategyKind, ctx: &Context) -> Self {
        match kind {
            BuildStrategyKind::S2i => BuildStrategy::SourceToImage(S2iBackend::new(ctx)),
            BuildStrategyKind::Pipeline => BuildStrategy::Pipeline(PipelineBackend::new(ctx)),
        }
    }

    #[must_use]
    pub fn kind(&self) -> BuildStrategyKind {
        match self {
            BuildStrategy::SourceToImage(_) => BuildStrategyKind::S2i,
            BuildStrategy::Pipeline(_) => BuildStrategyKind::Pipeline,
        }
    }

    /// Ensure the child build artifact exists, rendering the recipe for this
    /// backend. Returns the artifact name; reused when already present.
    pub async fn ensure_created(&self, job: &NotebookValidationJob) -> Result<String> {
        let build_spec = job.build_config().cloned().unwrap_or_default();
        let notebook_path = &job.spec.notebook.path;
        let candidates = requirements::candidate_paths(notebook_path, &build_spec);

        match self {
            BuildStrategy::SourceToImage(backend) => {
                let base_image = build_spec
                    .base_image
                    .clone()
                    .unwrap_or_else(|| default_base_image(job));
                let dockerfile = requirements::render_dockerfile(
                    &base_image,
                    notebook_path,
                    &candidates,
                    build_spec.prefer_dockerfile,
                )?;
                backend.ensure_created(job, &dockerfile).await
            }
            BuildStrategy::Pipeline(backend) => {
                let base_image = build_spec
                    .base_image
                    .clone()
                    .unwrap_or_else(|| default_base_image(job));
                let script = requirements::render_resolve_script(
                    &base_image,
                    &candidates,
                    build_spec.prefer_dockerfile,
                )?;
                backend.ensure_created(job, &script).await
            }
        }
    }

    pub async fn poll(&self, artifact_name: &str) -> Result<BuildPoll> {
        match self {
            BuildStrategy::SourceToImage(backend) => backend.poll(artifact_name).await,
            BuildStrategy::Pipeline(backend) => backend.poll(artifact_name).await,
        }
    }

    pub async fn delete(&self, artifact_name: &str) -> Result<()> {
        match self {
            BuildStrategy::SourceToImage(backend) => backend.delete(artifact_name).await,
            BuildStrategy::Pipeline(backend) => backend.delete(artifact_name).await,
        }
    }
}

fn default_base_image(job: &NotebookValidationJob) -> String {
    // Falls back to the declared runtime image so a built image at least
    // matches what the user would have run unbuilt.
    job.declared_image()
        .map(std::string::ToString::to_string)
        .unwrap_or_else(|| "quay.io/jupyter/minimal-notebook:latest".to_string())
}

/// Probe whether a backend's API group is served by this cluster.
///
/// Missing groups surface as 404s from discovery; both "type not registered"
/// and "no matches for kind" resolve to unavailable rather than hard failure.
pub async fn detect(kind: BuildStrategyKind, ctx: &Context) -> bool {
    let group = match kind {
        BuildStrategyKind::S2i => s2i::BUILD_GROUP,
        BuildStrategyKind::Pipeline => pipeline::PIPELINE_GROUP,
    };

    match kube::discovery::group(&ctx.client, group).await {
        Ok(discovered) => {
            let kind_name = match kind {
                BuildStrategyKind::S2i => "BuildConfig",
                BuildStrategyKind::Pipeline => "PipelineRun",
            };
            let available = discovered
                .recommended_resources()
                .iter()
                .any(|(resource, _)| resource.kind == kind_name);
            if !available {
                debug!("API group {} present but {} not served", group, kind_name);
            }
            available
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!("API group {} not registered in this cluster", group);
            false
        }
        Err(e) => {
            warn!("Discovery probe for {} failed: {}", group, e);
            false
        }
    }
}

/// Pick the strategy to use: the requested one when available, its declared
/// (or implicit) fallback otherwise. `None` means neither backend is usable.
pub async fn select_strategy(
    job: &NotebookValidationJob,
    ctx: &Context,
) -> Option<BuildStrategy> {
    let build_spec = job.build_config()?;
    let requested = build_spec.strategy.unwrap_or(BuildStrategyKind::S2i);
    let fallback = build_spec
        .fallback_strategy
        .unwrap_or_else(|| requested.alternate());

    if detect(requested, ctx).await {
        return Some(BuildStrategy::for_kind(requested, ctx));
    }

    info!(
        "Build strategy {} unavailable, probing fallback {}",
        requested, fallback
    );
    if fallback != requested && detect(fallback, ctx).await {
        return Some(BuildStrategy::for_kind(fallback, ctx));
    }

    None
}

lazy_static! {
    static ref STRUCTURAL_BUILD_FAILURE_RE: Regex = Regex::new(
        r"(?i)image pull|pull access denied|manifest unknown|imagepullbackoff|registry|quota|no space left|connection (?:refused|reset)|timed? ?out"
    )
    .unwrap();
}

/// Whether a build failure message points at the backend or its environment
/// (worth trying the alternate strategy) rather than at the recipe itself.
#[must_use]
pub fn is_structural_build_failure(message: &str) -> bool {
    STRUCTURAL_BUILD_FAILURE_RE.is_match(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_failure_matching() {
        assert!(is_structural_build_failure(
            "Failed to pull image: pull access denied"
        ));
        assert!(is_structural_build_failure("error: registry unreachable"));
        assert!(is_structural_build_failure("step timed out after 10m"));
        assert!(!is_structural_build_failure(
            "pip install failed: no matching distribution found for pandass"
        ));
        assert!(!is_structural_build_failure("Dockerfile syntax error on line 4"));
    }

    #[test]
    fn test_build_poll_equality() {
        assert_eq!(BuildPoll::Pending, BuildPoll::Pending);
        assert_ne!(
            BuildPoll::Succeeded { image: "a".into() },
            BuildPoll::Succeeded { image: "b".into() }
        );
    }
}

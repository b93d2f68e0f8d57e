//! `NotebookValidationJob` Custom Resource Definition
//!
//! Declares one notebook validation lifecycle: fetch the notebook from git,
//! optionally build a custom image carrying its dependencies, execute it in an
//! isolated pod and publish structured results into the status subresource.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Coarse lifecycle phase of a validation job.
///
/// Transitions are monotonic along the canonical path; `Pending` and
/// `Running` are accepted from older writers and folded into their modern
/// equivalents on first observation.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
pub enum JobPhase {
    #[default]
    Initializing,
    Building,
    BuildComplete,
    ValidationRunning,
    Succeeded,
    Failed,
}

impl JobPhase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Initializing => "Initializing",
            JobPhase::Building => "Building",
            JobPhase::BuildComplete => "BuildComplete",
            JobPhase::ValidationRunning => "ValidationRunning",
            JobPhase::Succeeded => "Succeeded",
            JobPhase::Failed => "Failed",
        }
    }

    /// Parse a stored phase string, folding legacy values written by older
    /// controller versions.
    #[must_use]
    pub fn parse(raw: &str) -> JobPhase {
        match raw {
            "Building" => JobPhase::Building,
            "BuildComplete" => JobPhase::BuildComplete,
            "ValidationRunning" | "Running" => JobPhase::ValidationRunning,
            "Succeeded" => JobPhase::Succeeded,
            "Failed" => JobPhase::Failed,
            // "", "Initializing" and legacy "Pending" all start the machine
            _ => JobPhase::Initializing,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Git source for the notebook under validation
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct GitSource {
    /// Repository URL (https or ssh)
    pub url: String,

    /// Branch, tag or commit to check out
    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,

    /// Name of a Secret holding git credentials (username/password or token)
    #[serde(default, rename = "credentialsSecret")]
    pub credentials_secret: Option<String>,
}

/// Notebook location within the source repository
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct NotebookSource {
    pub git: GitSource,

    /// Relative path of the notebook, must match `*.ipynb`
    pub path: String,
}

/// Environment variable sourced from a Secret key
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct SecretEnvVar {
    /// Name of the environment variable inside the container
    pub name: String,

    /// Name of the Secret
    #[serde(rename = "secretName")]
    pub secret_name: String,

    /// Key within the Secret
    #[serde(rename = "secretKey")]
    pub secret_key: String,
}

/// Build backend selector
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BuildStrategyKind {
    /// OpenShift source-to-image (`build.openshift.io`)
    S2i,
    /// Tekton pipeline (`tekton.dev`)
    Pipeline,
}

impl BuildStrategyKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStrategyKind::S2i => "s2i",
            BuildStrategyKind::Pipeline => "pipeline",
        }
    }

    /// The strategy tried when this one is unavailable or structurally failing.
    #[must_use]
    pub fn alternate(&self) -> BuildStrategyKind {
        match self {
            BuildStrategyKind::S2i => BuildStrategyKind::Pipeline,
            BuildStrategyKind::Pipeline => BuildStrategyKind::S2i,
        }
    }
}

impl std::fmt::Display for BuildStrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Custom-image build configuration
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct BuildConfigSpec {
    /// Whether to build a custom image before validation
    #[serde(default)]
    pub enabled: bool,

    /// Requested build backend; the controller picks one when omitted
    #[serde(default)]
    pub strategy: Option<BuildStrategyKind>,

    /// Backend tried when the requested one is unavailable or fails
    #[serde(default, rename = "fallbackStrategy")]
    pub fallback_strategy: Option<BuildStrategyKind>,

    /// Base image for the built image; defaults come from controller config
    #[serde(default, rename = "baseImage")]
    pub base_image: Option<String>,

    /// Explicit requirements.txt path, bypassing auto-detection
    #[serde(default, rename = "requirementsFile")]
    pub requirements_file: Option<String>,

    /// Ordered custom candidate paths consulted before the standard chain
    #[serde(default, rename = "requirementsSources")]
    pub requirements_sources: Vec<String>,

    /// Auto-detect a requirements file along the fallback chain
    #[serde(default = "default_true", rename = "autoGenerateRequirements")]
    pub auto_generate_requirements: bool,

    /// Prefer a Dockerfile found in the repository over a generated recipe
    #[serde(default, rename = "preferDockerfile")]
    pub prefer_dockerfile: bool,

    /// Build timeout, e.g. "20m"
    #[serde(default)]
    pub timeout: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Shape of the validation workload
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct PodConfigSpec {
    /// Image executing the notebook when no build is requested
    #[serde(default, rename = "containerImage")]
    pub container_image: Option<String>,

    /// Resource requests, quantity strings keyed by resource name
    #[serde(default)]
    pub requests: Option<BTreeMap<String, String>>,

    /// Resource limits, quantity strings keyed by resource name
    #[serde(default)]
    pub limits: Option<BTreeMap<String, String>>,

    /// ServiceAccount for the validation pod
    #[serde(default, rename = "serviceAccountName")]
    pub service_account_name: Option<String>,

    /// Plain environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Secrets mounted wholesale via envFrom
    #[serde(default, rename = "envFromSecrets")]
    pub env_from_secrets: Vec<String>,

    /// Credential mappings, each resolving one Secret key into an env var
    #[serde(default)]
    pub credentials: Vec<SecretEnvVar>,

    /// Additional pod volumes (raw pod-spec fragments)
    #[serde(default)]
    pub volumes: Option<serde_json::Value>,

    /// Additional container volume mounts (raw pod-spec fragments)
    #[serde(default, rename = "volumeMounts")]
    pub volume_mounts: Option<serde_json::Value>,

    /// Custom-image build configuration
    #[serde(default, rename = "buildConfig")]
    pub build_config: Option<BuildConfigSpec>,
}

/// Second notebook used for output comparison
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct GoldenNotebookSpec {
    pub git: GitSource,
    pub path: String,
}

/// Knobs for the golden-notebook comparison collaborator
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct ComparisonConfigSpec {
    /// Compare cell outputs, not just execution status
    #[serde(default = "default_true", rename = "compareOutputs")]
    pub compare_outputs: bool,

    /// Cell indexes excluded from comparison
    #[serde(default, rename = "excludeCells")]
    pub exclude_cells: Vec<usize>,
}

/// Model-serving platform checks run after a successful execution
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct ModelValidationSpec {
    /// Platform hint, e.g. "kserve"
    pub platform: String,

    /// Names of serving resources to probe
    #[serde(default)]
    pub models: Vec<String>,
}

/// `NotebookValidationJob` drives one validation lifecycle
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "mlops.dev", version = "v1alpha1", kind = "NotebookValidationJob")]
#[kube(namespaced)]
#[kube(status = "NotebookValidationJobStatus")]
#[kube(shortname = "nvj")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Notebook","type":"string","jsonPath":".spec.notebook.path"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct NotebookValidationJobSpec {
    /// Source location of the notebook
    pub notebook: NotebookSource,

    /// Workload shape, including the optional build configuration
    #[serde(default, rename = "podConfig")]
    pub pod_config: Option<PodConfigSpec>,

    /// Optional golden notebook for output comparison
    #[serde(default, rename = "goldenNotebook")]
    pub golden_notebook: Option<GoldenNotebookSpec>,

    /// Comparison collaborator configuration
    #[serde(default, rename = "comparisonConfig")]
    pub comparison_config: Option<ComparisonConfigSpec>,

    /// Model-serving platform checks
    #[serde(default, rename = "modelValidation")]
    pub model_validation: Option<ModelValidationSpec>,

    /// Overall job deadline, e.g. "30m"; controller default applies when unset
    #[serde(default)]
    pub timeout: Option<String>,
}

/// Observed state of one build attempt chain
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatusInfo {
    /// Build phase: Pending, Running, Complete, Failed
    pub phase: String,

    /// Backend that produced (or is producing) the image
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,

    /// Name of the child build artifact
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_name: Option<String>,

    /// Fully-qualified reference of the produced image; written exactly once
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_reference: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,

    /// Human-readable build duration, e.g. "2m30s"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Total build attempts across all strategies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    /// Attempts per strategy, keyed by strategy name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_attempts: Option<HashMap<String, u32>>,
}

/// Per-cell execution outcome collected from the validation pod
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CellResult {
    pub index: usize,

    /// "success", "error" or "skipped"
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_seconds: Option<f64>,

    /// Truncated cell output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of the golden-notebook comparison
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResult {
    pub matched: bool,

    #[serde(default)]
    pub mismatched_cells: Vec<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Outcome of the model-serving platform checks
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelValidationResult {
    pub platform: String,

    pub ready: bool,

    #[serde(default)]
    pub checked_models: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Condition for the `NotebookValidationJob`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationCondition {
    /// Type of condition (Ready, GitCloned, EnvironmentReady,
    /// ValidationStarted, ValidationComplete)
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, or Unknown)
    pub status: String,

    /// Last time the condition transitioned (RFC3339 format)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Reason for the condition's last transition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message about the condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Observed state; the single place the controller writes
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct NotebookValidationJobStatus {
    pub phase: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_status: Option<BuildStatusInfo>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<ValidationCondition>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_retry_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<CellResult>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison_result: Option<ComparisonResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_validation_result: Option<ModelValidationResult>,

    /// Name of the child validation pod, stored so restarts reuse it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_pod_name: Option<String>,

    /// First Initializing transition; anchors timeout enforcement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,

    /// Recovery the failure analyzer applied, e.g. "prebuilt-image"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_applied: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
}

impl NotebookValidationJob {
    /// Build configuration, traversing the optional pod config.
    #[must_use]
    pub fn build_config(&self) -> Option<&BuildConfigSpec> {
        self.spec
            .pod_config
            .as_ref()
            .and_then(|pc| pc.build_config.as_ref())
    }

    /// Whether a custom-image build was requested.
    #[must_use]
    pub fn build_requested(&self) -> bool {
        self.build_config().is_some_and(|bc| bc.enabled)
    }

    /// The declared (pre-built) container image, if any.
    #[must_use]
    pub fn declared_image(&self) -> Option<&str> {
        self.spec
            .pod_config
            .as_ref()
            .and_then(|pc| pc.container_image.as_deref())
    }

    /// Current phase, folding legacy strings.
    #[must_use]
    pub fn phase(&self) -> JobPhase {
        self.status
            .as_ref()
            .map_or(JobPhase::Initializing, |s| JobPhase::parse(&s.phase))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_parse_canonical() {
        assert_eq!(JobPhase::parse("Building"), JobPhase::Building);
        assert_eq!(JobPhase::parse("BuildComplete"), JobPhase::BuildComplete);
        assert_eq!(
            JobPhase::parse("ValidationRunning"),
            JobPhase::ValidationRunning
        );
        assert_eq!(JobPhase::parse("Succeeded"), JobPhase::Succeeded);
        assert_eq!(JobPhase::parse("Failed"), JobPhase::Failed);
    }

    #[test]
    fn test_phase_parse_folds_legacy_values() {
        assert_eq!(JobPhase::parse("Pending"), JobPhase::Initializing);
        assert_eq!(JobPhase::parse("Running"), JobPhase::ValidationRunning);
        assert_eq!(JobPhase::parse(""), JobPhase::Initializing);
    }

    #[test]
    fn test_phase_terminality() {
        assert!(JobPhase::Succeeded.is_terminal());
        assert!(JobPhase::Failed.is_terminal());
        assert!(!JobPhase::ValidationRunning.is_terminal());
        assert!(!JobPhase::Initializing.is_terminal());
    }

    #[test]
    fn test_strategy_alternate() {
        assert_eq!(BuildStrategyKind::S2i.alternate(), BuildStrategyKind::Pipeline);
        assert_eq!(BuildStrategyKind::Pipeline.alternate(), BuildStrategyKind::S2i);
    }

    #[test]
    fn test_spec_serialization_uses_camel_case() {
        let spec = NotebookValidationJobSpec {
            notebook: NotebookSource {
                git: GitSource {
                    url: "https://git.example/org/notebooks.git".to_string(),
                    git_ref: Some("main".to_string()),
                    credentials_secret: None,
                },
                path: "tier1/hello.ipynb".to_string(),
            },
            pod_config: Some(PodConfigSpec {
                container_image: Some("registry.example/notebook:1.0".to_string()),
                build_config: Some(BuildConfigSpec {
                    enabled: true,
                    strategy: Some(BuildStrategyKind::Pipeline),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            golden_notebook: None,
            comparison_config: None,
            model_validation: None,
            timeout: Some("30m".to_string()),
        };

        let json = serde_json::to_string(&spec).expect("spec serializes");
        assert!(json.contains("\"containerImage\":\"registry.example/notebook:1.0\""));
        assert!(json.contains("\"buildConfig\""));
        assert!(json.contains("\"strategy\":\"pipeline\""));
        assert!(json.contains("\"path\":\"tier1/hello.ipynb\""));
    }

    #[test]
    fn test_build_requested_traversal() {
        let mut job = NotebookValidationJob::new(
            "demo",
            NotebookValidationJobSpec {
                notebook: NotebookSource {
                    git: GitSource {
                        url: "https://git.example/org/notebooks.git".to_string(),
                        git_ref: None,
                        credentials_secret: None,
                    },
                    path: "a.ipynb".to_string(),
                },
                pod_config: None,
                golden_notebook: None,
                comparison_config: None,
                model_validation: None,
                timeout: None,
            },
        );
        assert!(!job.build_requested());

        job.spec.pod_config = Some(PodConfigSpec {
            build_config: Some(BuildConfigSpec {
                enabled: true,
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(job.build_requested());
    }
}

//! Workload failure analysis
//!
//! Pure classifier over a pod's observed status. It reads container and
//! init-container states and produces a structured diagnosis the state machine
//! turns into a recovery decision. No cluster access, no mutation.

use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};
use lazy_static::lazy_static;
use regex::Regex;

/// Name of the source-clone init container, shared with pod composition.
pub const CLONE_CONTAINER_NAME: &str = "git-clone";

lazy_static! {
    static ref SECURITY_PROFILE_RE: Regex = Regex::new(
        r"(?i)security context|seccomp|securitycontextconstraint|\bscc\b|runasuser|runasnonroot|permission denied|operation not permitted"
    )
    .unwrap();
    static ref AUTH_RE: Regex =
        Regex::new(r"(?i)authentication|unauthorized|invalid credentials|access token").unwrap();
}

/// Failure categories the analyzer can assign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    ImagePullBackoff,
    ContainerCrash,
    InitContainerError,
    SecurityProfileViolation,
    ContainerMisconfiguration,
    Authentication,
    GitAuthentication,
    Unknown,
}

impl FailureCategory {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::ImagePullBackoff => "image-pull-backoff",
            FailureCategory::ContainerCrash => "container-crash",
            FailureCategory::InitContainerError => "init-container-error",
            FailureCategory::SecurityProfileViolation => "security-profile-violation",
            FailureCategory::ContainerMisconfiguration => "container-misconfiguration",
            FailureCategory::Authentication => "authentication",
            FailureCategory::GitAuthentication => "git-authentication",
            FailureCategory::Unknown => "unknown",
        }
    }
}

/// Recovery the state machine may apply in response to a diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Run the validation pod on the declared (pre-built) image
    FallbackPreBuiltImage,
    /// Re-enter the build phase with the alternate backend
    AlternateBuildStrategy,
    /// Recreate the pod without the source-clone init step
    RemoveCloneInitStep,
    /// Plain retry with the same configuration
    RetrySameConfig,
    /// Nothing structural to change
    None,
}

/// Structured diagnosis of a failed (or failing) validation workload.
#[derive(Debug, Clone)]
pub struct FailureDiagnosis {
    pub category: FailureCategory,
    pub transient: bool,
    pub should_retry: bool,
    pub recovery: RecoveryAction,
    /// Container the failure was attributed to
    pub container: Option<String>,
    /// Error message extracted from container state
    pub message: String,
    /// Human-readable suggested recovery
    pub suggested_action: String,
}

impl FailureDiagnosis {
    fn new(
        category: FailureCategory,
        transient: bool,
        should_retry: bool,
        recovery: RecoveryAction,
        container: Option<String>,
        message: String,
        suggested_action: &str,
    ) -> Self {
        Self {
            category,
            transient,
            should_retry,
            recovery,
            container,
            message,
            suggested_action: suggested_action.to_string(),
        }
    }
}

/// Analyze a pod status and produce a diagnosis.
///
/// Init containers are inspected first: a clone failure explains everything
/// downstream of it.
#[must_use]
pub fn analyze_pod(status: &PodStatus) -> FailureDiagnosis {
    if let Some(init_statuses) = &status.init_container_statuses {
        for cs in init_statuses {
            if let Some(diagnosis) = diagnose_container(cs, true) {
                return diagnosis;
            }
        }
    }

    if let Some(container_statuses) = &status.container_statuses {
        for cs in container_statuses {
            if let Some(diagnosis) = diagnose_container(cs, false) {
                return diagnosis;
            }
        }
    }

    let message = status
        .message
        .clone()
        .or_else(|| status.reason.clone())
        .unwrap_or_else(|| "pod failed without a reported container error".to_string());

    FailureDiagnosis::new(
        FailureCategory::Unknown,
        true,
        true,
        RecoveryAction::RetrySameConfig,
        None,
        message,
        "retry; inspect pod events if the failure persists",
    )
}

fn diagnose_container(cs: &ContainerStatus, is_init: bool) -> Option<FailureDiagnosis> {
    let name = cs.name.clone();

    if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) {
        let reason = waiting.reason.as_deref().unwrap_or("");
        let message = waiting.message.clone().unwrap_or_else(|| reason.to_string());

        match reason {
            "ImagePullBackOff" | "ErrImagePull" => {
                return Some(FailureDiagnosis::new(
                    FailureCategory::ImagePullBackoff,
                    false,
                    false,
                    RecoveryAction::FallbackPreBuiltImage,
                    Some(name),
                    message,
                    "fall back to pre-built image",
                ));
            }
            "CrashLoopBackOff" => {
                return Some(FailureDiagnosis::new(
                    FailureCategory::ContainerCrash,
                    false,
                    false,
                    RecoveryAction::AlternateBuildStrategy,
                    Some(name),
                    message,
                    "try alternate build strategy",
                ));
            }
            "RunContainerError" => {
                if SECURITY_PROFILE_RE.is_match(&message) {
                    return Some(FailureDiagnosis::new(
                        FailureCategory::SecurityProfileViolation,
                        false,
                        false,
                        RecoveryAction::RemoveCloneInitStep,
                        Some(name),
                        message,
                        "remove source-clone init step and use built image only",
                    ));
                }
                return Some(FailureDiagnosis::new(
                    FailureCategory::ContainerMisconfiguration,
                    false,
                    false,
                    RecoveryAction::None,
                    Some(name),
                    message,
                    "inspect the container command and mounted configuration",
                ));
            }
            "CreateContainerConfigError" => {
                return Some(FailureDiagnosis::new(
                    FailureCategory::ContainerMisconfiguration,
                    false,
                    false,
                    RecoveryAction::None,
                    Some(name),
                    message,
                    "a referenced Secret or ConfigMap key is missing; fix the credential mappings",
                ));
            }
            _ => {}
        }
    }

    if let Some(terminated) = cs.state.as_ref().and_then(|s| s.terminated.as_ref()) {
        if terminated.exit_code == 0 {
            return None;
        }

        let message = terminated
            .message
            .clone()
            .or_else(|| terminated.reason.clone())
            .unwrap_or_else(|| format!("exited with code {}", terminated.exit_code));

        // Clone-step exit codes 2 and 128 are git's credential failures
        if name == CLONE_CONTAINER_NAME && matches!(terminated.exit_code, 2 | 128) {
            return Some(FailureDiagnosis::new(
                FailureCategory::GitAuthentication,
                false,
                false,
                RecoveryAction::None,
                Some(name),
                message,
                "git authentication failed; set notebook.git.credentialsSecret to a Secret with \
                 username/password (or token) keys for the repository",
            ));
        }

        if SECURITY_PROFILE_RE.is_match(&message) {
            return Some(FailureDiagnosis::new(
                FailureCategory::SecurityProfileViolation,
                false,
                false,
                RecoveryAction::RemoveCloneInitStep,
                Some(name),
                message,
                "remove source-clone init step and use built image only",
            ));
        }

        if AUTH_RE.is_match(&message) {
            return Some(FailureDiagnosis::new(
                FailureCategory::Authentication,
                false,
                false,
                RecoveryAction::None,
                Some(name),
                message,
                "verify the credential mappings referenced by the job",
            ));
        }

        if is_init {
            return Some(FailureDiagnosis::new(
                FailureCategory::InitContainerError,
                false,
                false,
                RecoveryAction::RemoveCloneInitStep,
                Some(name),
                message,
                "use built image without clone step",
            ));
        }

        return Some(FailureDiagnosis::new(
            FailureCategory::ContainerCrash,
            true,
            true,
            RecoveryAction::RetrySameConfig,
            Some(name),
            message,
            "retry; inspect notebook execution logs if the failure persists",
        ));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStateWaiting,
    };

    fn waiting_status(name: &str, reason: &str, message: &str) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some(reason.to_string()),
                    message: Some(message.to_string()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn terminated_status(name: &str, exit_code: i32, message: &str) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code,
                    message: Some(message.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod_status(
        init: Vec<ContainerStatus>,
        containers: Vec<ContainerStatus>,
    ) -> PodStatus {
        PodStatus {
            init_container_statuses: Some(init),
            container_statuses: Some(containers),
            ..Default::default()
        }
    }

    #[test]
    fn test_image_pull_backoff_suggests_prebuilt_fallback() {
        let status = pod_status(
            vec![],
            vec![waiting_status(
                "notebook-validator",
                "ImagePullBackOff",
                "Back-off pulling image",
            )],
        );
        let diagnosis = analyze_pod(&status);
        assert_eq!(diagnosis.category, FailureCategory::ImagePullBackoff);
        assert!(!diagnosis.transient);
        assert_eq!(diagnosis.recovery, RecoveryAction::FallbackPreBuiltImage);
    }

    #[test]
    fn test_err_image_pull_maps_like_backoff() {
        let status = pod_status(
            vec![],
            vec![waiting_status("notebook-validator", "ErrImagePull", "manifest unknown")],
        );
        assert_eq!(
            analyze_pod(&status).category,
            FailureCategory::ImagePullBackoff
        );
    }

    #[test]
    fn test_crash_loop_suggests_alternate_strategy() {
        let status = pod_status(
            vec![],
            vec![waiting_status("notebook-validator", "CrashLoopBackOff", "back-off restarting")],
        );
        let diagnosis = analyze_pod(&status);
        assert_eq!(diagnosis.category, FailureCategory::ContainerCrash);
        assert_eq!(diagnosis.recovery, RecoveryAction::AlternateBuildStrategy);
    }

    #[test]
    fn test_run_container_error_with_scc_keywords() {
        let status = pod_status(
            vec![],
            vec![waiting_status(
                "notebook-validator",
                "RunContainerError",
                "container has runAsNonRoot and image will run as root",
            )],
        );
        let diagnosis = analyze_pod(&status);
        assert_eq!(
            diagnosis.category,
            FailureCategory::SecurityProfileViolation
        );
        assert_eq!(diagnosis.recovery, RecoveryAction::RemoveCloneInitStep);
    }

    #[test]
    fn test_clone_exit_code_means_git_authentication() {
        for exit_code in [2, 128] {
            let status = pod_status(
                vec![terminated_status(
                    CLONE_CONTAINER_NAME,
                    exit_code,
                    "fatal: could not read Username",
                )],
                vec![],
            );
            let diagnosis = analyze_pod(&status);
            assert_eq!(diagnosis.category, FailureCategory::GitAuthentication);
            assert!(diagnosis.suggested_action.contains("credentialsSecret"));
        }
    }

    #[test]
    fn test_other_init_failure_is_init_container_error() {
        let status = pod_status(
            vec![terminated_status(CLONE_CONTAINER_NAME, 1, "network unreachable")],
            vec![],
        );
        let diagnosis = analyze_pod(&status);
        assert_eq!(diagnosis.category, FailureCategory::InitContainerError);
        assert_eq!(diagnosis.recovery, RecoveryAction::RemoveCloneInitStep);
    }

    #[test]
    fn test_main_container_nonzero_exit_is_retryable_crash() {
        let status = pod_status(
            vec![],
            vec![terminated_status("notebook-validator", 1, "cell 3 raised ValueError")],
        );
        let diagnosis = analyze_pod(&status);
        assert_eq!(diagnosis.category, FailureCategory::ContainerCrash);
        assert!(diagnosis.transient);
        assert!(diagnosis.should_retry);
        assert_eq!(diagnosis.recovery, RecoveryAction::RetrySameConfig);
    }

    #[test]
    fn test_missing_secret_is_misconfiguration() {
        let status = pod_status(
            vec![],
            vec![waiting_status(
                "notebook-validator",
                "CreateContainerConfigError",
                "secret \"db-creds\" not found",
            )],
        );
        assert_eq!(
            analyze_pod(&status).category,
            FailureCategory::ContainerMisconfiguration
        );
    }

    #[test]
    fn test_bare_pod_failure_is_unknown_and_retryable() {
        let status = PodStatus {
            message: Some("node drained".to_string()),
            ..Default::default()
        };
        let diagnosis = analyze_pod(&status);
        assert_eq!(diagnosis.category, FailureCategory::Unknown);
        assert!(diagnosis.should_retry);
    }

    #[test]
    fn test_successful_containers_do_not_diagnose() {
        let status = pod_status(
            vec![terminated_status(CLONE_CONTAINER_NAME, 0, "done")],
            vec![waiting_status("notebook-validator", "PodInitializing", "waiting")],
        );
        assert_eq!(analyze_pod(&status).category, FailureCategory::Unknown);
    }
}

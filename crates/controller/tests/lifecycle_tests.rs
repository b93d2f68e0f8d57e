//! Lifecycle-level tests over the controller's pure decision surfaces:
//! image canonicalization, the requirements fallback chain, failure
//! diagnosis, trigger parsing and the error taxonomy.

use controller::crds::{
    BuildConfigSpec, BuildStatusInfo, BuildStrategyKind, CellResult, ComparisonConfigSpec,
    GitSource, JobPhase, NotebookSource, NotebookValidationJob, NotebookValidationJobSpec,
    NotebookValidationJobStatus, PodConfigSpec,
};
use controller::tasks::build::requirements::{candidate_paths, render_dockerfile};
use controller::tasks::failure::{analyze_pod, FailureCategory, RecoveryAction};
use controller::tasks::triggers::{parse_triggers, TriggerAction};
use controller::tasks::types::{parse_timeout, Error, ErrorClass};
use controller::tasks::validation::resources::{
    canonical_image, uses_built_image, RECOVERY_PREBUILT_IMAGE,
};
use controller::tasks::validation::results::compare_results;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateWaiting, ContainerStatus, PodStatus,
};
use std::collections::BTreeMap;
use std::time::Duration;

fn job(container_image: Option<&str>, build_enabled: bool) -> NotebookValidationJob {
    NotebookValidationJob::new(
        "tier1-hello",
        NotebookValidationJobSpec {
            notebook: NotebookSource {
                git: GitSource {
                    url: "https://git.example/org/notebooks.git".to_string(),
                    git_ref: Some("main".to_string()),
                    credentials_secret: None,
                },
                path: "tier1/hello.ipynb".to_string(),
            },
            pod_config: Some(PodConfigSpec {
                container_image: container_image.map(std::string::ToString::to_string),
                build_config: Some(BuildConfigSpec {
                    enabled: build_enabled,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            golden_notebook: None,
            comparison_config: None,
            model_validation: None,
            timeout: Some("30m".to_string()),
        },
    )
}

// Scenario A: no build declared. The canonical image is the declared one and
// the workload needs a clone step because nothing baked the notebook in.
#[test]
fn scenario_a_no_build_uses_declared_image_with_clone_step() {
    let job = job(Some("registry.example/notebook:1.0"), false);
    let status = NotebookValidationJobStatus::default();

    assert!(!job.build_requested());
    assert_eq!(
        canonical_image(&job, &status).unwrap(),
        "registry.example/notebook:1.0"
    );
    assert!(!uses_built_image(&job, &status));
    assert!(status.build_status.is_none());
}

// Scenario B: the fallback chain picks the notebook-directory requirements
// file first, and the rendered recipe carries the chain in order.
#[test]
fn scenario_b_requirements_chain_first_match_wins() {
    let build = BuildConfigSpec {
        enabled: true,
        auto_generate_requirements: true,
        ..Default::default()
    };
    let chain = candidate_paths("notebooks/tier2-data/01-pandas.ipynb", &build);
    assert_eq!(chain[0], "notebooks/tier2-data/requirements.txt");
    assert_eq!(chain[1], "notebooks/requirements.txt");
    assert_eq!(chain[2], "requirements.txt");

    // Resolution is deterministic for fixed inputs
    assert_eq!(
        chain,
        candidate_paths("notebooks/tier2-data/01-pandas.ipynb", &build)
    );

    let dockerfile = render_dockerfile(
        "quay.io/jupyter/minimal-notebook:latest",
        "notebooks/tier2-data/01-pandas.ipynb",
        &chain,
        false,
    )
    .unwrap();
    let tier_dir = dockerfile.find("notebooks/tier2-data/requirements.txt").unwrap();
    let tier = dockerfile.find("\"notebooks/requirements.txt\"").unwrap();
    let root = dockerfile.find("\"requirements.txt\"").unwrap();
    assert!(tier_dir < tier && tier < root);
}

// Scenario B continued: a built image is the single canonical source.
#[test]
fn scenario_b_built_image_is_canonical_and_elides_clone() {
    let job = job(Some("registry.example/notebook:1.0"), true);
    let status = NotebookValidationJobStatus {
        build_status: Some(BuildStatusInfo {
            phase: "Complete".to_string(),
            image_reference: Some(
                "image-registry.openshift-image-registry.svc:5000/ns/tier1-hello:latest"
                    .to_string(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    };

    assert_eq!(
        canonical_image(&job, &status).unwrap(),
        "image-registry.openshift-image-registry.svc:5000/ns/tier1-hello:latest"
    );
    assert!(uses_built_image(&job, &status));
}

// Scenario C: optimistic-concurrency conflicts are Transient and must never
// consume retry budget.
#[test]
fn scenario_c_conflicts_are_transient() {
    let conflict = Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: "the object has been modified".to_string(),
        reason: "Conflict".to_string(),
        code: 409,
    }));

    assert!(conflict.is_conflict());
    assert_eq!(conflict.classify(), ErrorClass::Transient);
}

// Scenario D groundwork: strategy alternates are symmetric so the fallback
// chain always has somewhere to go.
#[test]
fn scenario_d_strategy_fallback_pairing() {
    assert_eq!(
        BuildStrategyKind::Pipeline.alternate(),
        BuildStrategyKind::S2i
    );
    assert_eq!(
        BuildStrategyKind::S2i.alternate(),
        BuildStrategyKind::Pipeline
    );
}

// Scenario E: a security-profile violation on a workload that already runs
// without a clone step has nothing left to remove; the recovery the analyzer
// suggests is detectable as already applied.
#[test]
fn scenario_e_security_violation_with_clone_already_elided() {
    let job = job(Some("registry.example/notebook:1.0"), true);
    let status = NotebookValidationJobStatus {
        build_status: Some(BuildStatusInfo {
            phase: "Complete".to_string(),
            image_reference: Some("registry.internal/ns/tier1-hello:latest".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };
    assert!(uses_built_image(&job, &status));

    let pod_status = PodStatus {
        container_statuses: Some(vec![ContainerStatus {
            name: "notebook-validator".to_string(),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some("RunContainerError".to_string()),
                    message: Some(
                        "runc create failed: seccomp profile not allowed".to_string(),
                    ),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let diagnosis = analyze_pod(&pod_status);
    assert_eq!(diagnosis.category, FailureCategory::SecurityProfileViolation);
    assert_eq!(diagnosis.recovery, RecoveryAction::RemoveCloneInitStep);
    // uses_built_image == true means the step is already absent: the state
    // machine terminates Failed instead of looping on this recovery.
}

// Scenario F: trigger annotation parsing preserves the declared order and
// defaults the namespace to the job's own.
#[test]
fn scenario_f_success_triggers_parse_in_declared_order() {
    let mut job = job(Some("registry.example/notebook:1.0"), false);
    job.metadata.annotations = Some(BTreeMap::from([(
        "mlops.dev/on-success-trigger".to_string(),
        r#"[{"apiVersion":"serving.kserve.io/v1beta1","kind":"InferenceService","name":"m1","action":"restart"}]"#
            .to_string(),
    )]));

    let triggers = parse_triggers(&job).unwrap();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].action, TriggerAction::Restart);
    assert_eq!(triggers[0].name, "m1");
    assert_eq!(triggers[0].namespace, None);
}

// Recovery override: after a prebuilt-image fallback the built reference is
// no longer the canonical source.
#[test]
fn prebuilt_image_recovery_overrides_built_reference() {
    let job = job(Some("registry.example/notebook:1.0"), true);
    let status = NotebookValidationJobStatus {
        build_status: Some(BuildStatusInfo {
            image_reference: Some("registry.internal/ns/tier1-hello:latest".to_string()),
            ..Default::default()
        }),
        recovery_applied: Some(RECOVERY_PREBUILT_IMAGE.to_string()),
        ..Default::default()
    };

    assert_eq!(
        canonical_image(&job, &status).unwrap(),
        "registry.example/notebook:1.0"
    );
    assert!(!uses_built_image(&job, &status));
}

// Legacy writers: Pending and Running fold into their modern equivalents.
#[test]
fn legacy_phases_fold_on_observation() {
    assert_eq!(JobPhase::parse("Pending"), JobPhase::Initializing);
    assert_eq!(JobPhase::parse("Running"), JobPhase::ValidationRunning);
    assert_eq!(JobPhase::parse("Succeeded"), JobPhase::Succeeded);
}

// Timeout grammar covers the duration patterns the CRD documents.
#[test]
fn timeout_patterns_parse() {
    assert_eq!(parse_timeout("30m").unwrap(), Duration::from_secs(1800));
    assert_eq!(parse_timeout("1h30m").unwrap(), Duration::from_secs(5400));
    assert!(parse_timeout("eventually").is_err());
}

// Golden comparison is pure and order-sensitive.
#[test]
fn golden_comparison_flags_mismatches() {
    let cell = |index: usize, output: &str| CellResult {
        index,
        status: "success".to_string(),
        execution_time_seconds: None,
        output: Some(output.to_string()),
        error: None,
    };

    let actual = vec![cell(0, "42"), cell(1, "panda")];
    let golden = vec![cell(0, "42"), cell(1, "pandas")];

    let outcome = compare_results(&actual, &golden, &ComparisonConfigSpec::default());
    assert!(!outcome.matched);
    assert_eq!(outcome.mismatched_cells, vec![1]);

    let outcome = compare_results(&actual, &actual.clone(), &ComparisonConfigSpec::default());
    assert!(outcome.matched);
}

//! Result collection and collaborator calls
//!
//! Per-cell outcomes are written by the execution tool onto the validation
//! pod as an annotation; the controller parses them into status. The golden
//! comparison is a pure function over two result sets; model validation
//! probes the declared serving platform and records readiness. Collaborator
//! failures surface into status, never into retries.

use crate::crds::{
    CellResult, ComparisonConfigSpec, ComparisonResult, ModelValidationResult,
    ModelValidationSpec,
};
use crate::tasks::triggers::KSERVE_LABEL;
use crate::tasks::types::{Context, Result, ANNOTATION_CELL_RESULTS};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ApiResource, DynamicObject};
use kube::Api;
use tracing::{debug, warn};

/// Annotation the execution tool writes golden-run outcomes to when the job
/// declares a golden notebook.
pub const ANNOTATION_GOLDEN_RESULTS: &str = "mlops.dev/golden-cell-results";

/// Parse per-cell outcomes from the validation pod's annotation.
///
/// A missing or malformed annotation yields an empty list; the job still
/// succeeded, it just executed a notebook whose runner reported nothing.
#[must_use]
pub fn collect_cell_results(pod: &Pod) -> Vec<CellResult> {
    collect_annotated_results(pod, ANNOTATION_CELL_RESULTS)
}

/// Parse the golden notebook's outcomes, written by the same execution run.
#[must_use]
pub fn collect_golden_results(pod: &Pod) -> Vec<CellResult> {
    collect_annotated_results(pod, ANNOTATION_GOLDEN_RESULTS)
}

fn collect_annotated_results(pod: &Pod, key: &str) -> Vec<CellResult> {
    let Some(raw) = pod.metadata.annotations.as_ref().and_then(|a| a.get(key)) else {
        debug!("Validation pod carries no {} annotation", key);
        return Vec::new();
    };

    match serde_json::from_str::<Vec<CellResult>>(raw) {
        Ok(results) => results,
        Err(e) => {
            warn!("Malformed {} annotation, dropping: {}", key, e);
            Vec::new()
        }
    }
}

/// Compare executed results against the golden notebook's results.
///
/// Pure: deterministic for fixed inputs, no cluster access.
#[must_use]
pub fn compare_results(
    actual: &[CellResult],
    golden: &[CellResult],
    config: &ComparisonConfigSpec,
) -> ComparisonResult {
    if actual.len() != golden.len() {
        return ComparisonResult {
            matched: false,
            mismatched_cells: Vec::new(),
            message: Some(format!(
                "cell count differs: executed {} cells, golden has {}",
                actual.len(),
                golden.len()
            )),
        };
    }

    let mut mismatched = Vec::new();
    for (lhs, rhs) in actual.iter().zip(golden.iter()) {
        if config.exclude_cells.contains(&lhs.index) {
            continue;
        }
        let status_differs = lhs.status != rhs.status;
        let output_differs = config.compare_outputs && lhs.output != rhs.output;
        if status_differs || output_differs {
            mismatched.push(lhs.index);
        }
    }

    if mismatched.is_empty() {
        ComparisonResult {
            matched: true,
            mismatched_cells: Vec::new(),
            message: Some("all compared cells match the golden notebook".to_string()),
        }
    } else {
        ComparisonResult {
            matched: false,
            message: Some(format!("{} cell(s) differ from the golden notebook", mismatched.len())),
            mismatched_cells: mismatched,
        }
    }
}

/// Probe the declared serving platform for the target models' readiness.
pub async fn validate_models(
    spec: &ModelValidationSpec,
    ctx: &Context,
) -> Result<ModelValidationResult> {
    match spec.platform.to_lowercase().as_str() {
        "kserve" => validate_kserve_models(spec, ctx).await,
        other => Ok(ModelValidationResult {
            platform: spec.platform.clone(),
            ready: false,
            checked_models: Vec::new(),
            message: Some(format!("unsupported model-serving platform: {other}")),
        }),
    }
}

async fn validate_kserve_models(
    spec: &ModelValidationSpec,
    ctx: &Context,
) -> Result<ModelValidationResult> {
    let resource = ApiResource {
        group: "serving.kserve.io".to_string(),
        version: "v1beta1".to_string(),
        api_version: "serving.kserve.io/v1beta1".to_string(),
        kind: "InferenceService".to_string(),
        plural: "inferenceservices".to_string(),
    };
    let services: Api<DynamicObject> =
        Api::namespaced_with(ctx.client.clone(), &ctx.namespace, &resource);

    let mut checked = Vec::new();
    let mut not_ready = Vec::new();

    for model in &spec.models {
        checked.push(model.clone());
        match services.get(model).await {
            Ok(service) => {
                let ready = service
                    .data
                    .get("status")
                    .and_then(|s| s.get("conditions"))
                    .and_then(|c| c.as_array())
                    .is_some_and(|conditions| {
                        conditions.iter().any(|c| {
                            c.get("type").and_then(|t| t.as_str()) == Some("Ready")
                                && c.get("status").and_then(|s| s.as_str()) == Some("True")
                        })
                    });
                if !ready {
                    not_ready.push(model.clone());
                }
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                not_ready.push(model.clone());
            }
            Err(e) => return Err(e.into()),
        }
    }

    let ready = not_ready.is_empty();
    let message = if ready {
        format!("{} model(s) ready under label {KSERVE_LABEL}", checked.len())
    } else {
        format!("models not ready: {}", not_ready.join(", "))
    };

    Ok(ModelValidationResult {
        platform: spec.platform.clone(),
        ready,
        checked_models: checked,
        message: Some(message),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn cell(index: usize, status: &str, output: Option<&str>) -> CellResult {
        CellResult {
            index,
            status: status.to_string(),
            execution_time_seconds: Some(0.1),
            output: output.map(std::string::ToString::to_string),
            error: None,
        }
    }

    fn pod_with_annotation(raw: Option<&str>) -> Pod {
        let mut pod = Pod::default();
        if let Some(raw) = raw {
            pod.metadata.annotations = Some(BTreeMap::from([(
                ANNOTATION_CELL_RESULTS.to_string(),
                raw.to_string(),
            )]));
        }
        pod
    }

    #[test]
    fn test_collect_results_parses_annotation() {
        let pod = pod_with_annotation(Some(
            r#"[{"index":0,"status":"success","executionTimeSeconds":0.4,"output":"42"},
                {"index":1,"status":"error","error":"ValueError"}]"#,
        ));
        let results = collect_cell_results(&pod);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, "success");
        assert_eq!(results[1].error.as_deref(), Some("ValueError"));
    }

    #[test]
    fn test_collect_results_tolerates_absence_and_garbage() {
        assert!(collect_cell_results(&pod_with_annotation(None)).is_empty());
        assert!(collect_cell_results(&pod_with_annotation(Some("certainly not json"))).is_empty());
    }

    #[test]
    fn test_compare_matching_results() {
        let actual = vec![cell(0, "success", Some("42")), cell(1, "success", Some("ok"))];
        let outcome = compare_results(&actual, &actual.clone(), &ComparisonConfigSpec::default());
        assert!(outcome.matched);
        assert!(outcome.mismatched_cells.is_empty());
    }

    #[test]
    fn test_compare_flags_output_differences() {
        let actual = vec![cell(0, "success", Some("42"))];
        let golden = vec![cell(0, "success", Some("43"))];
        let outcome = compare_results(&actual, &golden, &ComparisonConfigSpec::default());
        assert!(!outcome.matched);
        assert_eq!(outcome.mismatched_cells, vec![0]);
    }

    #[test]
    fn test_compare_can_ignore_outputs() {
        let actual = vec![cell(0, "success", Some("42"))];
        let golden = vec![cell(0, "success", Some("43"))];
        let config = ComparisonConfigSpec {
            compare_outputs: false,
            exclude_cells: Vec::new(),
        };
        assert!(compare_results(&actual, &golden, &config).matched);
    }

    #[test]
    fn test_compare_excluded_cells_are_skipped() {
        let actual = vec![cell(0, "success", Some("42")), cell(1, "error", None)];
        let golden = vec![cell(0, "success", Some("42")), cell(1, "success", None)];
        let config = ComparisonConfigSpec {
            compare_outputs: true,
            exclude_cells: vec![1],
        };
        assert!(compare_results(&actual, &golden, &config).matched);
    }

    #[test]
    fn test_compare_cell_count_mismatch() {
        let actual = vec![cell(0, "success", None)];
        let golden = vec![cell(0, "success", None), cell(1, "success", None)];
        let outcome = compare_results(&actual, &golden, &ComparisonConfigSpec::default());
        assert!(!outcome.matched);
        assert!(outcome.message.unwrap().contains("cell count differs"));
    }
}

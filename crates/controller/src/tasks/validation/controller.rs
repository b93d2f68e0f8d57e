//! Reconciliation entry point and validation state machine
//!
//! One reconcile call is one short, synchronous pass: load the job, dispatch
//! to the handler for its current phase, persist the computed status and map
//! the handler's transition onto a requeue decision. Progress across phases
//! comes from the requeue cadence, never from blocking inside a handler.

use super::resources::{
    canonical_image, uses_built_image, validation_pod_name, ValidationPodState,
    ValidationResourceManager, RECOVERY_PREBUILT_IMAGE,
};
use super::{results, status as status_util};
use crate::crds::{
    BuildStatusInfo, JobPhase, NotebookValidationJob, NotebookValidationJobStatus,
};
use crate::tasks::build::{self, BuildPoll, BuildStrategy};
use crate::tasks::events::{self, NotificationType};
use crate::tasks::failure::{analyze_pod, FailureCategory, RecoveryAction};
use crate::tasks::triggers;
use crate::tasks::types::{parse_timeout, Context, Error, ErrorClass, Result, JOB_FINALIZER_NAME};
use crate::tasks::validation::status::{
    CONDITION_ENVIRONMENT_READY, CONDITION_GIT_CLONED, CONDITION_READY,
    CONDITION_VALIDATION_COMPLETE, CONDITION_VALIDATION_STARTED,
};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Api, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Marker recorded when a crashed pod sent the job back to the build phase.
const RECOVERY_ALTERNATE_STRATEGY: &str = "alternate-build-strategy";

/// Outcome of one per-phase handler call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Persist status; the next reconciliation enters `phase`
    Advance { phase: JobPhase, message: String },
    /// Persist status and requeue after `delay`
    Wait { delay: Duration },
    /// Persist status with a terminal outcome; no further requeue
    Terminate { outcome: JobPhase, message: String },
}

#[instrument(skip(ctx), fields(job_name = %job.name_any(), namespace = %ctx.namespace))]
pub async fn reconcile_validation_job(
    job: Arc<NotebookValidationJob>,
    ctx: Arc<Context>,
) -> Result<Action> {
    debug!("Starting reconcile for NotebookValidationJob: {}", job.name_any());

    let api: Api<NotebookValidationJob> =
        Api::namespaced(ctx.client.clone(), &ctx.namespace);

    let result = finalizer(&api, JOB_FINALIZER_NAME, job.clone(), |event| async {
        match event {
            FinalizerEvent::Apply(job) => reconcile_apply(job, &ctx).await,
            FinalizerEvent::Cleanup(job) => cleanup_resources(job, &ctx).await,
        }
    })
    .await
    .map_err(|e| match e {
        kube::runtime::finalizer::Error::ApplyFailed(err)
        | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
        kube::runtime::finalizer::Error::AddFinalizer(e)
        | kube::runtime::finalizer::Error::RemoveFinalizer(e) => Error::KubeError(e),
        kube::runtime::finalizer::Error::UnnamedObject => Error::MissingObjectKey,
        kube::runtime::finalizer::Error::InvalidFinalizer => {
            Error::ConfigError("Invalid finalizer name".to_string())
        }
    })?;

    debug!("Reconcile completed with result: {:?}", result);
    Ok(result)
}

#[instrument(skip(ctx), fields(job_name = %job.name_any()))]
async fn reconcile_apply(job: Arc<NotebookValidationJob>, ctx: &Context) -> Result<Action> {
    let phase = job.phase();

    // Terminal phases are no-ops apart from the one-shot trigger execution
    if phase.is_terminal() {
        return finish_terminal(&job, ctx, phase).await;
    }

    let mut status = job.status.clone().unwrap_or_default();
    let stored_phase = status.phase.clone();
    if stored_phase != phase.as_str() && !stored_phase.is_empty() {
        info!(
            "Folding legacy phase {:?} into {} for {}",
            stored_phase,
            phase,
            job.name_any()
        );
    }
    status.phase = phase.as_str().to_string();

    // Timeout is enforced against the first Initializing transition,
    // regardless of the current phase.
    if let Some(elapsed) = elapsed_since_start(&status) {
        let deadline = match job.spec.timeout.as_deref().map(parse_timeout).transpose() {
            Ok(parsed) => parsed.unwrap_or_else(|| ctx.config.default_deadline()),
            Err(e) => return handle_dispatch_error(&job, ctx, status, e).await,
        };
        if elapsed > deadline {
            warn!(
                "Job {} exceeded its {}s deadline, terminating",
                job.name_any(),
                deadline.as_secs()
            );
            let transition = Transition::Terminate {
                outcome: JobPhase::Failed,
                message: format!(
                    "validation timed out after {}s (deadline {}s)",
                    elapsed.as_secs(),
                    deadline.as_secs()
                ),
            };
            return apply_transition(&job, ctx, status, transition).await;
        }
    }

    let dispatched = match phase {
        JobPhase::Initializing => handle_initializing(&job, ctx, &mut status).await,
        JobPhase::Building => handle_building(&job, ctx, &mut status).await,
        JobPhase::BuildComplete => handle_build_complete(&job, &mut status),
        JobPhase::ValidationRunning => handle_validation_running(&job, ctx, &mut status).await,
        JobPhase::Succeeded | JobPhase::Failed => unreachable!("terminal handled above"),
    };

    match dispatched {
        Ok(transition) => apply_transition(&job, ctx, status, transition).await,
        Err(err) => handle_dispatch_error(&job, ctx, status, err).await,
    }
}

/// Persist the computed status and map the transition onto an Action.
async fn apply_transition(
    job: &NotebookValidationJob,
    ctx: &Context,
    mut status: NotebookValidationJobStatus,
    transition: Transition,
) -> Result<Action> {
    match &transition {
        Transition::Advance { phase, message } => {
            status_util::enter_phase(&mut status, *phase, message);
        }
        Transition::Wait { .. } => {
            status.last_update = Some(Utc::now().to_rfc3339());
            if status.started_at.is_none() {
                status.started_at = Some(Utc::now().to_rfc3339());
            }
        }
        Transition::Terminate { outcome, message } => {
            status_util::enter_phase(&mut status, *outcome, message);
        }
    }

    if let Err(err) = status_util::persist(job, ctx, &status).await {
        if err.is_conflict() {
            // Event cross-talk lost the optimistic-concurrency race. Requeue
            // shortly and re-read; retry budget is untouched.
            debug!(
                "Status write conflict for {}, requeueing without consuming retry budget",
                job.name_any()
            );
            return Ok(Action::requeue(ctx.config.transient_requeue()));
        }
        return Err(err);
    }

    match transition {
        Transition::Advance { phase, message } => {
            info!("Job {} advancing to {}: {}", job.name_any(), phase, message);
            events::publish(job, ctx, "PhaseTransition", &message, None).await;
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        Transition::Wait { delay } => Ok(Action::requeue(delay)),
        Transition::Terminate { outcome, message } => {
            info!("Job {} terminated as {}: {}", job.name_any(), outcome, message);
            let notification = if outcome == JobPhase::Succeeded {
                NotificationType::ValidationSuccess
            } else {
                NotificationType::ValidationFailure
            };
            events::publish(
                job,
                ctx,
                if outcome == JobPhase::Succeeded {
                    "ValidationSucceeded"
                } else {
                    "ValidationFailed"
                },
                &message,
                Some(notification),
            )
            .await;
            // Terminal bookkeeping is best-effort: the terminal status is
            // already persisted and a lost annotation race re-runs next event
            if let Err(e) = status_util::write_wave_annotations(job, ctx, outcome).await {
                warn!("Wave annotation write failed for {}: {}", job.name_any(), e);
            }
            if outcome == JobPhase::Succeeded {
                fire_triggers_once(job, ctx).await?;
            }
            Ok(Action::await_change())
        }
    }
}

/// Classify a handler error and act per the error taxonomy.
async fn handle_dispatch_error(
    job: &NotebookValidationJob,
    ctx: &Context,
    mut status: NotebookValidationJobStatus,
    err: Error,
) -> Result<Action> {
    match err.classify() {
        ErrorClass::Transient => {
            debug!(
                "Transient error for {}, requeueing without consuming retry budget: {}",
                job.name_any(),
                err
            );
            Ok(Action::requeue(ctx.config.transient_requeue()))
        }
        ErrorClass::Retriable => {
            let retry_count = status.retry_count.unwrap_or(0);
            if retry_count >= ctx.config.job.max_retries {
                let transition = Transition::Terminate {
                    outcome: JobPhase::Failed,
                    message: format!("retry limit reached: {err}"),
                };
                return apply_transition(job, ctx, status, transition).await;
            }

            let delay = ctx.config.retry_backoff(retry_count);
            status.retry_count = Some(retry_count + 1);
            status.last_retry_time = Some(Utc::now().to_rfc3339());
            status.message = Some(format!(
                "retriable error (attempt {} of {}): {err}",
                retry_count + 1,
                ctx.config.job.max_retries
            ));
            events::publish(
                job,
                ctx,
                "RetryScheduled",
                status.message.as_deref().unwrap_or_default(),
                None,
            )
            .await;
            apply_transition(job, ctx, status, Transition::Wait { delay }).await
        }
        ErrorClass::Terminal => {
            let transition = Transition::Terminate {
                outcome: JobPhase::Failed,
                message: err.to_string(),
            };
            apply_transition(job, ctx, status, transition).await
        }
    }
}

/// Terminal reconciliations: run the one-shot triggers if they have not fired.
async fn finish_terminal(
    job: &NotebookValidationJob,
    ctx: &Context,
    phase: JobPhase,
) -> Result<Action> {
    debug!("Job {} already {}, nothing to reconcile", job.name_any(), phase);
    if phase == JobPhase::Succeeded {
        fire_triggers_once(job, ctx).await?;
    }
    Ok(Action::await_change())
}

async fn fire_triggers_once(job: &NotebookValidationJob, ctx: &Context) -> Result<()> {
    if status_util::triggers_already_fired(job) {
        return Ok(());
    }
    triggers::execute_triggers(job, ctx).await;
    status_util::mark_triggers_fired(job, ctx).await
}

fn elapsed_since_start(status: &NotebookValidationJobStatus) -> Option<Duration> {
    let started = status.started_at.as_deref()?;
    let started = DateTime::parse_from_rfc3339(started).ok()?.with_timezone(&Utc);
    (Utc::now() - started).to_std().ok()
}

// ---------------------------------------------------------------------------
// Per-phase handlers. Each one reads the job, mutates the working status and
// returns a transition; it never writes to the cluster API beyond child
// resources it owns.
// ---------------------------------------------------------------------------

async fn handle_initializing(
    job: &NotebookValidationJob,
    ctx: &Context,
    status: &mut NotebookValidationJobStatus,
) -> Result<Transition> {
    let notebook = &job.spec.notebook;

    if !notebook.path.ends_with(".ipynb") {
        status_util::set_condition(
            status,
            CONDITION_READY,
            false,
            "InvalidNotebookPath",
            "notebook path must match *.ipynb",
        );
        return Err(Error::SpecError(format!(
            "notebook path {:?} must match *.ipynb",
            notebook.path
        )));
    }

    let url = notebook.git.url.trim();
    let url_ok = url.starts_with("https://")
        || url.starts_with("http://")
        || url.starts_with("ssh://")
        || url.starts_with("git@");
    if url.is_empty() || !url_ok {
        status_util::set_condition(
            status,
            CONDITION_READY,
            false,
            "InvalidSourceUrl",
            "source URL is not parseable",
        );
        return Err(Error::SpecError(format!(
            "source URL {url:?} is not parseable"
        )));
    }

    if let Some(raw) = job.spec.timeout.as_deref() {
        // Surface malformed timeouts here rather than mid-flight
        parse_timeout(raw)?;
    }

    if let Some(image) = job.declared_image() {
        if image.trim().is_empty() || image.contains(char::is_whitespace) {
            status_util::set_condition(
                status,
                CONDITION_READY,
                false,
                "InvalidImage",
                "containerImage is malformed",
            );
            return Err(Error::SpecError(format!(
                "containerImage {image:?} is malformed"
            )));
        }
    } else if !job.build_requested() {
        status_util::set_condition(
            status,
            CONDITION_READY,
            false,
            "NoImageSource",
            "neither a build nor a containerImage is declared",
        );
        return Err(Error::SpecError(
            "job declares neither buildConfig.enabled nor podConfig.containerImage".to_string(),
        ));
    }

    if let Some(secret_name) = notebook.git.credentials_secret.as_deref() {
        let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
        match secrets.get(secret_name).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                status_util::set_condition(
                    status,
                    CONDITION_READY,
                    false,
                    "CredentialsMissing",
                    &format!("credentials secret {secret_name} not found"),
                );
                return Err(Error::SpecError(format!(
                    "credentials secret {secret_name:?} not found"
                )));
            }
            Err(e) => return Err(e.into()),
        }
    }

    status_util::set_condition(status, CONDITION_READY, true, "Validated", "preconditions met");

    if job.build_requested() {
        Ok(Transition::Advance {
            phase: JobPhase::Building,
            message: "preconditions validated, building custom image".to_string(),
        })
    } else {
        Ok(Transition::Advance {
            phase: JobPhase::ValidationRunning,
            message: "preconditions validated, no build requested".to_string(),
        })
    }
}

async fn handle_building(
    job: &NotebookValidationJob,
    ctx: &Context,
    status: &mut NotebookValidationJobStatus,
) -> Result<Transition> {
    // Sticky strategy: once recorded in buildStatus it is reused until a
    // failure explicitly switches it.
    let strategy = match stored_strategy(status) {
        Some(kind) => Some(BuildStrategy::for_kind(kind, ctx)),
        None => {
            let selected = build::select_strategy(job, ctx).await;
            if let Some(selected) = &selected {
                let requested = job
                    .build_config()
                    .and_then(|b| b.strategy)
                    .unwrap_or(crate::crds::BuildStrategyKind::S2i);
                if selected.kind() != requested {
                    status_util::set_condition(
                        status,
                        CONDITION_ENVIRONMENT_READY,
                        false,
                        "StrategyFallback",
                        &format!(
                            "requested {requested} backend unavailable, using {}",
                            selected.kind()
                        ),
                    );
                }
            }
            selected
        }
    };

    let Some(strategy) = strategy else {
        status_util::set_condition(
            status,
            CONDITION_ENVIRONMENT_READY,
            false,
            "BuildUnavailable",
            "no build backend is available in this cluster",
        );
        if job.declared_image().is_some() {
            warn!(
                "No build backend available for {}, falling back to declared image",
                job.name_any()
            );
            return Ok(Transition::Advance {
                phase: JobPhase::ValidationRunning,
                message: "build backends unavailable, using declared containerImage".to_string(),
            });
        }
        return Err(Error::SpecError(
            "no build backend available and podConfig.containerImage is unset".to_string(),
        ));
    };

    if status.build_status.is_none() {
        status.build_status = Some(BuildStatusInfo::default());
    }
    {
        let build_status = status.build_status.as_mut().expect("just initialized");
        if build_status.strategy.is_none() {
            build_status.strategy = Some(strategy.kind().as_str().to_string());
        }
    }

    let existing_artifact = status
        .build_status
        .as_ref()
        .and_then(|b| b.build_name.clone());

    let Some(artifact) = existing_artifact else {
        let total = status
            .build_status
            .as_ref()
            .and_then(|b| b.attempts)
            .unwrap_or(0);
        if total >= ctx.config.build.max_attempts_total {
            return build_exhausted(job, status);
        }

        let name = strategy.ensure_created(job).await?;
        let build_status = status.build_status.as_mut().expect("build status initialized");
        build_status.build_name = Some(name.clone());
        build_status.phase = "Pending".to_string();
        build_status.started_at.get_or_insert_with(|| Utc::now().to_rfc3339());
        build_status.attempts = Some(total + 1);
        bump_strategy_attempts(build_status, strategy.kind().as_str());
        info!(
            "Build artifact {} ensured for {} (attempt {})",
            name,
            job.name_any(),
            total + 1
        );
        return Ok(Transition::Wait {
            delay: ctx.config.building_requeue(),
        });
    };
    match strategy.poll(&artifact).await? {
        BuildPoll::Pending => {
            let build_status = status.build_status.as_mut().expect("build status initialized");
            build_status.phase = "Pending".to_string();
            status.message = Some(format!("build {artifact} pending"));
            Ok(Transition::Wait {
                delay: ctx.config.building_requeue(),
            })
        }
        BuildPoll::Running => {
            let build_status = status.build_status.as_mut().expect("build status initialized");
            build_status.phase = "Running".to_string();
            build_status.duration = build_duration(build_status);
            status.message = Some(format!("build {artifact} in progress"));
            Ok(Transition::Wait {
                delay: ctx.config.building_requeue(),
            })
        }
        BuildPoll::Succeeded { image } => {
            let build_status = status.build_status.as_mut().expect("build status initialized");
            build_status.phase = "Complete".to_string();
            build_status.completed_at = Some(Utc::now().to_rfc3339());
            build_status.duration = build_duration(build_status);
            // The canonical reference is committed exactly once
            if build_status.image_reference.is_none() {
                build_status.image_reference = Some(image.clone());
            }
            build_status.message = Some("build completed".to_string());
            status_util::set_condition(
                status,
                CONDITION_ENVIRONMENT_READY,
                true,
                "ImageBuilt",
                &format!("image built: {image}"),
            );
            Ok(Transition::Advance {
                phase: JobPhase::BuildComplete,
                message: format!("build succeeded, image {image}"),
            })
        }
        BuildPoll::Failed { message } => {
            warn!("Build {} failed for {}: {}", artifact, job.name_any(), message);
            handle_build_failure(job, ctx, status, &strategy, &artifact, &message).await
        }
    }
}

async fn handle_build_failure(
    job: &NotebookValidationJob,
    ctx: &Context,
    status: &mut NotebookValidationJobStatus,
    strategy: &BuildStrategy,
    artifact: &str,
    message: &str,
) -> Result<Transition> {
    // The failed artifact is deleted so the next attempt starts clean;
    // at most one build artifact exists per job.
    strategy.delete(artifact).await?;

    let caps = ctx.config.build.clone();
    if status.build_status.is_none() {
        status.build_status = Some(BuildStatusInfo::default());
    }
    let (total, current_attempts, alternate_attempts);
    let current_kind = strategy.kind();
    let alternate = current_kind.alternate();
    {
        let build_status = status.build_status.as_mut().expect("just initialized");
        build_status.build_name = None;
        build_status.phase = "Failed".to_string();
        build_status.message = Some(message.to_string());
        total = build_status.attempts.unwrap_or(0);
        current_attempts = strategy_attempts(build_status, current_kind.as_str());
        alternate_attempts = strategy_attempts(build_status, alternate.as_str());
    }

    if total >= caps.max_attempts_total {
        return build_exhausted(job, status);
    }

    if build::is_structural_build_failure(message)
        && alternate_attempts < caps.max_attempts_per_strategy
        && build::detect(alternate, ctx).await
    {
        info!(
            "Structural build failure on {}, switching {} to {}",
            current_kind,
            job.name_any(),
            alternate
        );
        if let Some(build_status) = status.build_status.as_mut() {
            build_status.strategy = Some(alternate.as_str().to_string());
        }
        status_util::set_condition(
            status,
            CONDITION_ENVIRONMENT_READY,
            false,
            "StrategyFallback",
            &format!("{current_kind} build failed structurally, trying {alternate}"),
        );
        status.message = Some(format!("retrying build with {alternate} backend"));
        return Ok(Transition::Wait {
            delay: ctx.config.building_requeue(),
        });
    }

    if current_attempts < caps.max_attempts_per_strategy {
        status.message = Some(format!(
            "build failed (attempt {current_attempts} of {}), retrying: {message}",
            caps.max_attempts_per_strategy
        ));
        events::publish(job, ctx, "RetryScheduled", status.message.as_deref().unwrap_or(""), None)
            .await;
        return Ok(Transition::Wait {
            delay: ctx.config.building_requeue(),
        });
    }

    build_exhausted(job, status)
}

/// All build attempts spent: fall back to the declared image when one exists,
/// otherwise fail with a remediation message.
fn build_exhausted(
    job: &NotebookValidationJob,
    status: &mut NotebookValidationJobStatus,
) -> Result<Transition> {
    let build_message = status
        .build_status
        .as_ref()
        .and_then(|b| b.message.clone())
        .unwrap_or_else(|| "build failed".to_string());

    if job.declared_image().is_some() {
        status_util::set_condition(
            status,
            CONDITION_ENVIRONMENT_READY,
            false,
            "BuildExhausted",
            "all build attempts failed, using declared containerImage",
        );
        return Ok(Transition::Advance {
            phase: JobPhase::ValidationRunning,
            message: format!("build attempts exhausted ({build_message}), using declared image"),
        });
    }

    Ok(Transition::Terminate {
        outcome: JobPhase::Failed,
        message: format!(
            "build failed and no containerImage fallback is declared: {build_message}. \
             Fix the build configuration or declare podConfig.containerImage"
        ),
    })
}

/// One-tick transitional state: commits the canonical image reference so
/// external watchers observe build success before execution starts.
fn handle_build_complete(
    job: &NotebookValidationJob,
    status: &mut NotebookValidationJobStatus,
) -> Result<Transition> {
    let reference = status
        .build_status
        .as_ref()
        .and_then(|b| b.image_reference.clone())
        .filter(|r| !r.is_empty());

    match reference {
        Some(reference) => Ok(Transition::Advance {
            phase: JobPhase::ValidationRunning,
            message: format!("canonical image committed: {reference}"),
        }),
        None => {
            warn!(
                "Job {} reached BuildComplete without an image reference",
                job.name_any()
            );
            Ok(Transition::Terminate {
                outcome: JobPhase::Failed,
                message: "build reported success but produced no image reference".to_string(),
            })
        }
    }
}

async fn handle_validation_running(
    job: &NotebookValidationJob,
    ctx: &Context,
    status: &mut NotebookValidationJobStatus,
) -> Result<Transition> {
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let manager = ValidationResourceManager::new(&pods, &ctx.config);
    let pod_name = status
        .validation_pod_name
        .clone()
        .unwrap_or_else(|| validation_pod_name(job));

    match manager.pod_state(&pod_name).await? {
        ValidationPodState::NotFound => {
            // Canonical-image resolution fails Terminal when no source exists
            let image = canonical_image(job, status)?;
            let created = manager.create_or_get(job, status).await?;
            status.validation_pod_name = Some(created.clone());
            status_util::set_condition(
                status,
                CONDITION_VALIDATION_STARTED,
                true,
                "PodCreated",
                &format!("validation pod {created} running image {image}"),
            );
            status.message = Some(format!("validation pod {created} created"));
            Ok(Transition::Wait {
                delay: ctx.config.running_requeue(),
            })
        }
        ValidationPodState::Pending(pod) => {
            // Pull failures park pods in Pending forever; diagnose them here
            if let Some(pod_status) = pod.status.as_ref() {
                let diagnosis = analyze_pod(pod_status);
                if diagnosis.category != FailureCategory::Unknown && !diagnosis.transient {
                    return handle_pod_failure(job, ctx, status, &manager, &pod_name, &pod).await;
                }
            }
            status.message = Some(format!("validation pod {pod_name} pending"));
            Ok(Transition::Wait {
                delay: ctx.config.running_requeue(),
            })
        }
        ValidationPodState::Running => {
            status.message = Some(format!("validation pod {pod_name} running"));
            Ok(Transition::Wait {
                delay: ctx.config.running_requeue(),
            })
        }
        ValidationPodState::Succeeded(pod) => finish_validation(job, ctx, status, &pod).await,
        ValidationPodState::Failed(pod) => {
            handle_pod_failure(job, ctx, status, &manager, &pod_name, &pod).await
        }
    }
}

/// Collect results and collaborator outcomes, then terminate Succeeded or
/// Failed on their verdicts.
async fn finish_validation(
    job: &NotebookValidationJob,
    ctx: &Context,
    status: &mut NotebookValidationJobStatus,
    pod: &Pod,
) -> Result<Transition> {
    let cell_results = results::collect_cell_results(pod);
    let failed_cells = cell_results.iter().filter(|c| c.status == "error").count();
    status.results = Some(cell_results.clone());

    if !uses_built_image(job, status) {
        status_util::set_condition(
            status,
            CONDITION_GIT_CLONED,
            true,
            "CloneCompleted",
            "source clone init step completed",
        );
    }
    status_util::set_condition(
        status,
        CONDITION_VALIDATION_COMPLETE,
        true,
        "ExecutionFinished",
        &format!("{} cell(s) executed, {} failed", cell_results.len(), failed_cells),
    );

    if failed_cells > 0 {
        return Ok(Transition::Terminate {
            outcome: JobPhase::Failed,
            message: format!("{failed_cells} notebook cell(s) failed execution"),
        });
    }

    if job.spec.golden_notebook.is_some() {
        let golden = results::collect_golden_results(pod);
        let config = job.spec.comparison_config.clone().unwrap_or_default();
        let outcome = results::compare_results(&cell_results, &golden, &config);
        let matched = outcome.matched;
        let summary = outcome.message.clone();
        status.comparison_result = Some(outcome);
        if !matched {
            return Ok(Transition::Terminate {
                outcome: JobPhase::Failed,
                message: summary
                    .unwrap_or_else(|| "golden notebook comparison failed".to_string()),
            });
        }
    }

    if let Some(model_spec) = &job.spec.model_validation {
        match results::validate_models(model_spec, ctx).await {
            Ok(outcome) => {
                let ready = outcome.ready;
                let summary = outcome.message.clone();
                status.model_validation_result = Some(outcome);
                if !ready {
                    return Ok(Transition::Terminate {
                        outcome: JobPhase::Failed,
                        message: summary
                            .unwrap_or_else(|| "model validation failed".to_string()),
                    });
                }
            }
            Err(e) if e.classify() == ErrorClass::Transient => return Err(e),
            Err(e) => {
                // Collaborator probe errors surface into status without
                // failing an otherwise-successful validation
                warn!("Model validation probe failed for {}: {}", job.name_any(), e);
                status.message = Some(format!("model validation probe failed: {e}"));
            }
        }
    }

    Ok(Transition::Terminate {
        outcome: JobPhase::Succeeded,
        message: "notebook validated successfully".to_string(),
    })
}

/// Diagnose a failed (or pull-stuck) pod and pick the recovery path.
async fn handle_pod_failure(
    job: &NotebookValidationJob,
    ctx: &Context,
    status: &mut NotebookValidationJobStatus,
    manager: &ValidationResourceManager<'_>,
    pod_name: &str,
    pod: &Pod,
) -> Result<Transition> {
    let diagnosis = pod
        .status
        .as_ref()
        .map(analyze_pod)
        .unwrap_or_else(|| analyze_pod(&Default::default()));

    warn!(
        "Validation pod {} failed for {}: category={}, message={}",
        pod_name,
        job.name_any(),
        diagnosis.category.as_str(),
        diagnosis.message
    );
    status_util::set_condition(
        status,
        CONDITION_VALIDATION_COMPLETE,
        false,
        diagnosis.category.as_str(),
        &diagnosis.message,
    );

    match diagnosis.recovery {
        RecoveryAction::RetrySameConfig if diagnosis.should_retry => {
            let retry_count = status.retry_count.unwrap_or(0);
            if retry_count >= ctx.config.job.max_retries {
                return Ok(Transition::Terminate {
                    outcome: JobPhase::Failed,
                    message: format!(
                        "retry limit reached ({retry_count} attempts): {}",
                        diagnosis.message
                    ),
                });
            }
            manager.delete_pod(pod_name).await?;
            let delay = ctx.config.retry_backoff(retry_count);
            status.retry_count = Some(retry_count + 1);
            status.last_retry_time = Some(Utc::now().to_rfc3339());
            status.message = Some(format!(
                "transient failure, retry {} of {} in {}s: {}",
                retry_count + 1,
                ctx.config.job.max_retries,
                delay.as_secs(),
                diagnosis.message
            ));
            events::publish(job, ctx, "RetryScheduled", status.message.as_deref().unwrap_or(""), None)
                .await;
            Ok(Transition::Wait { delay })
        }
        RecoveryAction::FallbackPreBuiltImage => {
            if uses_built_image(job, status) && job.declared_image().is_some() {
                manager.delete_pod(pod_name).await?;
                status.recovery_applied = Some(RECOVERY_PREBUILT_IMAGE.to_string());
                status.message = Some(format!(
                    "built image unusable ({}), falling back to declared containerImage",
                    diagnosis.message
                ));
                Ok(Transition::Wait {
                    delay: ctx.config.running_requeue(),
                })
            } else {
                Ok(Transition::Terminate {
                    outcome: JobPhase::Failed,
                    message: format!(
                        "{} and no pre-built image is available to fall back to. {}",
                        diagnosis.message, diagnosis.suggested_action
                    ),
                })
            }
        }
        RecoveryAction::AlternateBuildStrategy => {
            if job.build_requested() && status.recovery_applied.is_none() {
                manager.delete_pod(pod_name).await?;
                let alternate = stored_strategy(status)
                    .map(|k| k.alternate())
                    .unwrap_or(crate::crds::BuildStrategyKind::Pipeline);
                let build_status =
                    status.build_status.get_or_insert_with(BuildStatusInfo::default);
                build_status.strategy = Some(alternate.as_str().to_string());
                build_status.build_name = None;
                // The produced image crashed; its reference is no longer
                // canonical and the rebuild writes a fresh one
                build_status.image_reference = None;
                build_status.phase = "Pending".to_string();
                status.recovery_applied = Some(RECOVERY_ALTERNATE_STRATEGY.to_string());
                status.validation_pod_name = None;
                status.message = Some(format!(
                    "built image crashing ({}), rebuilding with {alternate}",
                    diagnosis.message
                ));
                Ok(Transition::Advance {
                    phase: JobPhase::Building,
                    message: format!("recovery: rebuilding with {alternate} backend"),
                })
            } else {
                Ok(Transition::Terminate {
                    outcome: JobPhase::Failed,
                    message: format!("{}. {}", diagnosis.message, diagnosis.suggested_action),
                })
            }
        }
        RecoveryAction::RemoveCloneInitStep => {
            if uses_built_image(job, status) {
                // The clone step is already absent; nothing left to remove
                Ok(Transition::Terminate {
                    outcome: JobPhase::Failed,
                    message: format!(
                        "workload failed with a security-profile violation and the clone step \
                         is already elided: {}",
                        diagnosis.message
                    ),
                })
            } else if status
                .build_status
                .as_ref()
                .and_then(|b| b.image_reference.as_deref())
                .is_some()
            {
                manager.delete_pod(pod_name).await?;
                status.recovery_applied = None;
                status.message = Some(format!(
                    "removing clone init step, using built image only: {}",
                    diagnosis.message
                ));
                Ok(Transition::Wait {
                    delay: ctx.config.running_requeue(),
                })
            } else {
                Ok(Transition::Terminate {
                    outcome: JobPhase::Failed,
                    message: format!(
                        "{}. {}",
                        diagnosis.message, diagnosis.suggested_action
                    ),
                })
            }
        }
        RecoveryAction::RetrySameConfig | RecoveryAction::None => Ok(Transition::Terminate {
            outcome: JobPhase::Failed,
            message: format!("{}. {}", diagnosis.message, diagnosis.suggested_action),
        }),
    }
}

/// Finalizer cleanup: delete the pod and any build artifact before release.
#[instrument(skip(ctx), fields(job_name = %job.name_any()))]
async fn cleanup_resources(job: Arc<NotebookValidationJob>, ctx: &Context) -> Result<Action> {
    debug!("Cleaning up resources for NotebookValidationJob");

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let manager = ValidationResourceManager::new(&pods, &ctx.config);
    let pod_name = job
        .status
        .as_ref()
        .and_then(|s| s.validation_pod_name.clone())
        .unwrap_or_else(|| validation_pod_name(&job));
    let _ = manager.delete_pod(&pod_name).await;

    if let Some(artifact) = job
        .status
        .as_ref()
        .and_then(|s| s.build_status.as_ref())
        .and_then(|b| b.build_name.clone())
    {
        for kind in [
            crate::crds::BuildStrategyKind::S2i,
            crate::crds::BuildStrategyKind::Pipeline,
        ] {
            let strategy = BuildStrategy::for_kind(kind, ctx);
            if let Err(e) = strategy.delete(&artifact).await {
                debug!("Cleanup of build artifact {} via {} skipped: {}", artifact, kind, e);
            }
        }
    }

    Ok(Action::await_change())
}

fn stored_strategy(status: &NotebookValidationJobStatus) -> Option<crate::crds::BuildStrategyKind> {
    match status
        .build_status
        .as_ref()
        .and_then(|b| b.strategy.as_deref())
    {
        Some("s2i") => Some(crate::crds::BuildStrategyKind::S2i),
        Some("pipeline") => Some(crate::crds::BuildStrategyKind::Pipeline),
        _ => None,
    }
}

fn strategy_attempts(build_status: &BuildStatusInfo, kind: &str) -> u32 {
    build_status
        .strategy_attempts
        .as_ref()
        .and_then(|m| m.get(kind).copied())
        .unwrap_or(0)
}

fn bump_strategy_attempts(build_status: &mut BuildStatusInfo, kind: &str) {
    let attempts = build_status
        .strategy_attempts
        .get_or_insert_with(Default::default);
    *attempts.entry(kind.to_string()).or_insert(0) += 1;
}

fn build_duration(build_status: &BuildStatusInfo) -> Option<String> {
    let started = build_status.started_at.as_deref()?;
    let started = DateTime::parse_from_rfc3339(started).ok()?.with_timezone(&Utc);
    let end = build_status
        .completed_at
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map_or_else(Utc::now, |dt| dt.with_timezone(&Utc));
    (end - started)
        .to_std()
        .ok()
        .map(crate::tasks::types::format_duration)
}

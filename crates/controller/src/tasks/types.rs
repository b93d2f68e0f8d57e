use super::config::ControllerConfig;
use kube::Client;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

// Error type for the controller
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Missing object key")]
    MissingObjectKey,

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Controller configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid job spec: {0}")]
    SpecError(String),

    #[error("Build error: {0}")]
    BuildError(String),

    #[error("General error: {0}")]
    GenericError(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How an error affects requeueing and retry budget.
///
/// Optimistic-concurrency conflicts are the load-bearing case: they are a
/// normal consequence of event cross-talk during multi-phase workflows and
/// must requeue without consuming retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Normal race (conflict, server timeout, unavailable); short requeue,
    /// retry count untouched
    Transient,
    /// Infrastructure hiccup worth retrying with the same config; backoff,
    /// retry count incremented
    Retriable,
    /// Structural error with no recovery; fail the job immediately
    Terminal,
}

impl Error {
    #[must_use]
    pub fn classify(&self) -> ErrorClass {
        match self {
            Error::KubeError(kube::Error::Api(ae)) => match ae.code {
                409 | 429 | 500 | 503 | 504 => ErrorClass::Transient,
                404 | 408 | 502 => ErrorClass::Retriable,
                400 | 401 | 403 | 422 => ErrorClass::Terminal,
                _ => ErrorClass::Retriable,
            },
            // Connection-level failures come and go with the apiserver
            Error::KubeError(_) => ErrorClass::Transient,
            Error::SpecError(_) | Error::ConfigError(_) => ErrorClass::Terminal,
            Error::MissingObjectKey => ErrorClass::Terminal,
            Error::SerializationError(_) => ErrorClass::Terminal,
            Error::BuildError(_) => ErrorClass::Retriable,
            Error::GenericError(_) => ErrorClass::Retriable,
        }
    }

    /// True for resource-version conflicts and other short-lived races.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(ae)) if ae.code == 409)
    }
}

// Context shared across controller operations
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub namespace: String,
    pub config: Arc<ControllerConfig>,
}

// Finalizer name for cleanup
pub(crate) const JOB_FINALIZER_NAME: &str = "notebookvalidationjobs.mlops.dev/finalizer";

// Annotations consumed or written on the job
pub const ANNOTATION_TRIGGERS: &str = "mlops.dev/on-success-trigger";
pub const ANNOTATION_TRIGGERS_FIRED: &str = "mlops.dev/triggers-fired";
pub const ANNOTATION_SYNC_WAVE: &str = "argocd.argoproj.io/sync-wave";
pub const ANNOTATION_WAVE_COMPLETE: &str = "mlops.dev/wave-complete";
pub const ANNOTATION_WAVE_FAILED: &str = "mlops.dev/wave-failed";
pub const ANNOTATION_WAVE_TIMESTAMP: &str = "mlops.dev/wave-timestamp";
pub const ANNOTATION_BLOCK_WAVE: &str = "mlops.dev/block-wave";
pub const ANNOTATION_RESYNC_TS: &str = "mlops.dev/resync-ts";
pub const ANNOTATION_CELL_RESULTS: &str = "mlops.dev/cell-results";

lazy_static! {
    static ref DURATION_RE: Regex = Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").unwrap();
}

/// Parse a duration pattern like "30m", "1h30m" or "90s".
pub fn parse_timeout(raw: &str) -> Result<Duration> {
    let trimmed = raw.trim();
    let caps = DURATION_RE
        .captures(trimmed)
        .filter(|c| c.get(1).is_some() || c.get(2).is_some() || c.get(3).is_some())
        .ok_or_else(|| Error::SpecError(format!("invalid timeout pattern: {raw:?}")))?;

    let field = |idx: usize| {
        caps.get(idx)
            .map_or(Ok(0u64), |m| {
                m.as_str()
                    .parse::<u64>()
                    .map_err(|e| Error::SpecError(format!("invalid timeout pattern {raw:?}: {e}")))
            })
    };

    let secs = field(1)? * 3600 + field(2)? * 60 + field(3)?;
    if secs == 0 {
        return Err(Error::SpecError(format!("timeout must be positive: {raw:?}")));
    }
    Ok(Duration::from_secs(secs))
}

/// Render a duration as the human-readable form stored in `buildStatus.duration`.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (hours, rem) = (total / 3600, total % 3600);
    let (minutes, seconds) = (rem / 60, rem % 60);

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if seconds > 0 || out.is_empty() {
        out.push_str(&format!("{seconds}s"));
    }
    out
}

/// Derived Tekton basic-auth secret name for a source credentials secret
#[must_use]
pub fn derived_git_secret_name(source_secret: &str) -> String {
    format!("{source_secret}-tekton")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "test".to_string(),
            code,
        }))
    }

    #[test]
    fn test_conflict_is_transient() {
        let err = api_error(409);
        assert!(err.is_conflict());
        assert_eq!(err.classify(), ErrorClass::Transient);
    }

    #[test]
    fn test_server_pressure_is_transient() {
        for code in [429, 500, 503, 504] {
            assert_eq!(api_error(code).classify(), ErrorClass::Transient);
        }
    }

    #[test]
    fn test_not_found_is_retriable() {
        assert_eq!(api_error(404).classify(), ErrorClass::Retriable);
    }

    #[test]
    fn test_structural_errors_are_terminal() {
        for code in [400, 401, 403, 422] {
            assert_eq!(api_error(code).classify(), ErrorClass::Terminal);
        }
        assert_eq!(
            Error::SpecError("bad path".to_string()).classify(),
            ErrorClass::Terminal
        );
    }

    #[test]
    fn test_parse_timeout_patterns() {
        assert_eq!(parse_timeout("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_timeout("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_timeout("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_timeout("90s").unwrap(), Duration::from_secs(90));
        assert!(parse_timeout("").is_err());
        assert!(parse_timeout("soon").is_err());
        assert!(parse_timeout("0s").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(150)), "2m30s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h2m5s");
    }

    #[test]
    fn test_derived_git_secret_name() {
        assert_eq!(derived_git_secret_name("repo-creds"), "repo-creds-tekton");
    }
}

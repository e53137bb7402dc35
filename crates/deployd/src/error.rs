//! Failure kinds for the deployment pipeline.

use thiserror::Error;

/// Everything that can go wrong while updating a deployment.
///
/// Each step of the pipeline maps its failures to one of these variants so
/// that the progress publisher sees every failure as data. `Interrupted` is
/// special: it is raised when the cooperative stop flag is observed and the
/// task exits without a terminal publish.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The deployment lacks a required field for the step being attempted.
    #[error("{0}")]
    Misconfigured(String),

    /// CI preconditions are not satisfied.
    #[error("{0}")]
    BadBuild(String),

    /// The upstream source refresh failed.
    #[error("{0}")]
    SourceUnavailable(String),

    /// An I/O error occurred while writing a secret file.
    #[error("Could not write secret file: {0}")]
    SecretWriteFailed(String),

    /// The install script exited non-zero; carries the captured output.
    #[error("{0}")]
    ScriptFailed(String),

    /// The service-restart tool exited non-zero.
    #[error("Could not restart service {0}")]
    ServiceRestartFailed(String),

    /// The dashboard API returned a failure.
    #[error("{0}")]
    DashboardUpdateFailed(String),

    /// The cooperative stop flag was observed.
    #[error("task is stopped")]
    Interrupted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_write_failed_prefixes_cause() {
        let err = PipelineError::SecretWriteFailed("permission denied".to_string());
        assert_eq!(
            err.to_string(),
            "Could not write secret file: permission denied"
        );
    }

    #[test]
    fn service_restart_failed_names_service() {
        let err = PipelineError::ServiceRestartFailed("nginx".to_string());
        assert_eq!(err.to_string(), "Could not restart service nginx");
    }
}

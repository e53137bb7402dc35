//! Background deployment tasks.
//!
//! A `DeployTask` performs one update of one deployment on its own worker
//! thread: CI check, source refresh, artifact copy, secret-file writes,
//! install script, service restarts, and dashboard update, in that order.
//! Progress is published at every phase boundary; each publish first checks
//! the cooperative stop flag, so a stopped task exits silently without a
//! terminal record.

use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::bigboat::{BigBoat, COMPOSE_FILES};
use crate::deployment::Deployment;
use crate::error::PipelineError;
use crate::git::{self, WorkingCopy};
use crate::jenkins::{Build, Jenkins};

/// The state of a deployment task as shown to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    Starting,
    Progress,
    Success,
    Error,
}

impl DeployState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Progress => "progress",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Terminal states release the worker slot; re-delivery of the same
    /// final record is harmless.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// Receiver for progress records published by deployment tasks.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, name: &str, state: DeployState, message: &str);
}

/// Background task to update a deployment.
pub struct DeployTask {
    deployment: Deployment,
    jenkins: Option<Jenkins>,
    sink: Arc<dyn ProgressSink>,
    stop: Arc<AtomicBool>,
}

/// Name of the primary compose document parsed for the application
/// identity.
#[derive(Debug, Deserialize)]
struct ComposeInfo {
    name: String,
    version: String,
}

impl DeployTask {
    pub fn new(
        deployment: Deployment,
        jenkins: Option<Jenkins>,
        sink: Arc<dyn ProgressSink>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            deployment,
            jenkins,
            sink,
            stop,
        }
    }

    /// Run the pipeline to completion, publishing a terminal record unless
    /// the task was stopped first.
    pub fn run(self) {
        match self.deploy() {
            Ok(()) => {}
            Err(PipelineError::Interrupted) => {
                info!("deploy {}: stopped before completion", self.deployment.name);
            }
            Err(err) => {
                let _ = self.publish(DeployState::Error, &err.to_string());
            }
        }
    }

    fn publish(&self, state: DeployState, message: &str) -> Result<(), PipelineError> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(PipelineError::Interrupted);
        }

        info!(
            "deploy {}: {}: {}",
            self.deployment.name,
            state.as_str(),
            message
        );
        self.sink.publish(&self.deployment.name, state, message);
        Ok(())
    }

    fn deploy(&self) -> Result<(), PipelineError> {
        let deployment = &self.deployment;

        // Check Jenkins job success
        let mut build = None;
        if !deployment.jenkins_job.is_empty() {
            self.publish(DeployState::Progress, "Checking Jenkins build state")?;
            let jenkins = self.jenkins.as_ref().ok_or_else(|| {
                PipelineError::Misconfigured(
                    "Jenkins job configured but no Jenkins server is available".to_string(),
                )
            })?;
            build = Some(deployment.check_ci(jenkins)?);
        }

        // Update the working copy using the deploy key
        self.publish(DeployState::Progress, "Updating Git repository")?;
        let source = deployment.source()?;
        let git_path = Path::new(&deployment.git_path);
        let repository = git::refresh(&source, git_path, &deployment.git_branch)
            .map_err(|err| PipelineError::SourceUnavailable(format!("{err:#}")))?;
        info!("updated repository {}", repository.repo_name());

        if deployment.artifacts {
            if let Some(build) = &build {
                self.publish(DeployState::Progress, "Adding Jenkins build artifacts")?;
                self.copy_artifacts(build, git_path)?;
            }
        }

        self.publish(DeployState::Progress, "Writing secret files")?;
        for (secret_name, contents) in &deployment.secret_files {
            if secret_name.is_empty() {
                continue;
            }
            let secret_path = git_path.join(secret_name);
            fs::write(&secret_path, contents)
                .map_err(|err| PipelineError::SecretWriteFailed(err.to_string()))?;
        }

        // Run the install script
        if !deployment.script.is_empty() {
            self.publish(
                DeployState::Progress,
                &format!("Running script {}", deployment.script),
            )?;
            self.run_script(git_path)?;
        }

        // Restart services
        for service in &deployment.services {
            if service.is_empty() {
                continue;
            }
            self.publish(
                DeployState::Progress,
                &format!("Restarting service {service}"),
            )?;
            restart_service(service)?;
        }

        // Update BigBoat dashboard applications
        if !deployment.bigboat_url.is_empty() {
            self.update_dashboard(&repository)?;
        }

        self.publish(DeployState::Success, "Finished deployment")?;
        Ok(())
    }

    fn copy_artifacts(&self, build: &Build, git_path: &Path) -> Result<(), PipelineError> {
        let jenkins = self.jenkins.as_ref().ok_or_else(|| {
            PipelineError::Misconfigured(
                "Jenkins job configured but no Jenkins server is available".to_string(),
            )
        })?;

        if build.artifacts.is_empty() {
            return Err(PipelineError::BadBuild(
                "Build has no artifacts".to_string(),
            ));
        }

        for artifact in &build.artifacts {
            let target = git_path.join(&artifact.relative_path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|err| {
                    PipelineError::BadBuild(format!(
                        "Could not create artifact directory {}: {err}",
                        parent.display()
                    ))
                })?;
            }
            let body = jenkins.artifact(build, &artifact.relative_path).map_err(|err| {
                PipelineError::BadBuild(format!(
                    "Could not download artifact {}: {err:#}",
                    artifact.relative_path
                ))
            })?;
            fs::write(&target, body).map_err(|err| {
                PipelineError::BadBuild(format!(
                    "Could not write artifact {}: {err}",
                    target.display()
                ))
            })?;
        }

        Ok(())
    }

    fn run_script(&self, git_path: &Path) -> Result<(), PipelineError> {
        let deployment = &self.deployment;
        let words = shell_words::split(&deployment.script).map_err(|err| {
            PipelineError::ScriptFailed(format!(
                "Could not parse script {}: {err}",
                deployment.script
            ))
        })?;
        let Some((program, args)) = words.split_first() else {
            return Ok(());
        };

        let output = Command::new(program)
            .args(args)
            .current_dir(git_path)
            .env("DEPLOYMENT_NAME", &deployment.name)
            .output()
            .map_err(|err| {
                PipelineError::ScriptFailed(format!(
                    "Could not run script {}: {err}",
                    deployment.script
                ))
            })?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(PipelineError::ScriptFailed(format!(
                "Could not run script {}: {}",
                deployment.script,
                combined.trim()
            )));
        }

        Ok(())
    }

    fn update_dashboard(&self, repository: &WorkingCopy) -> Result<(), PipelineError> {
        let deployment = &self.deployment;
        if deployment.bigboat_key.is_empty() {
            return Err(PipelineError::Misconfigured(
                "BigBoat API key required to update BigBoat".to_string(),
            ));
        }

        let mut files = Vec::new();
        let mut paths = Vec::new();
        for (filename, file_id) in COMPOSE_FILES {
            let full = compose_path(&deployment.bigboat_compose, filename);
            let contents = repository.get_contents(&full).map_err(|err| {
                PipelineError::DashboardUpdateFailed(format!(
                    "Could not read compose file {full}: {err:#}"
                ))
            })?;
            files.push((file_id, contents));
            paths.push(full);
        }

        let changed = repository.paths_changed(&paths).map_err(|err| {
            PipelineError::DashboardUpdateFailed(format!(
                "Could not inspect compose file changes: {err:#}"
            ))
        })?;
        if !changed {
            self.publish(
                DeployState::Progress,
                "BigBoat compose files were unchanged, skipping.",
            )?;
            return Ok(());
        }

        self.publish(DeployState::Progress, "Updating BigBoat compose files")?;
        let compose: ComposeInfo = serde_yaml::from_slice(
            &files
                .iter()
                .find(|(file_id, _)| *file_id == "bigboatCompose")
                .map(|(_, contents)| contents.clone())
                .unwrap_or_default(),
        )
        .map_err(|err| {
            PipelineError::DashboardUpdateFailed(format!("Could not parse compose file: {err}"))
        })?;

        let client = BigBoat::new(&deployment.bigboat_url, &deployment.bigboat_key)
            .map_err(|err| PipelineError::DashboardUpdateFailed(format!("{err:#}")))?;

        let app = client
            .app(&compose.name, &compose.version)
            .map_err(|err| PipelineError::DashboardUpdateFailed(format!("{err:#}")))?;
        if app.is_none() {
            warn!(
                "application {} version {} not on {}, creating",
                compose.name, compose.version, deployment.bigboat_url
            );
            let created = client
                .update_app(&compose.name, &compose.version)
                .map_err(|err| PipelineError::DashboardUpdateFailed(format!("{err:#}")))?;
            if created.is_none() {
                return Err(PipelineError::DashboardUpdateFailed(
                    "Cannot register application".to_string(),
                ));
            }
        }

        for (file_id, contents) in &files {
            let uploaded = client
                .update_compose(&compose.name, &compose.version, file_id, contents)
                .map_err(|err| PipelineError::DashboardUpdateFailed(format!("{err:#}")))?;
            if !uploaded {
                return Err(PipelineError::DashboardUpdateFailed(
                    "Cannot update compose file".to_string(),
                ));
            }
        }

        self.publish(DeployState::Progress, "Updating BigBoat instances")?;
        let updated = client
            .update_instance(&compose.name, &compose.name, &compose.version)
            .map_err(|err| PipelineError::DashboardUpdateFailed(format!("{err:#}")))?;
        if !updated {
            return Err(PipelineError::DashboardUpdateFailed(
                "Cannot update instance".to_string(),
            ));
        }

        Ok(())
    }
}

/// Repository path of a compose file under the configured compose directory.
fn compose_path(base: &str, filename: &str) -> String {
    format!("{base}/{filename}")
        .trim_start_matches(['.', '/'])
        .to_string()
}

/// Restart one host service through the service-restart tool. The tool
/// defaults to `systemctl` and can be overridden through
/// `DEPLOYD_SYSTEMCTL_BIN` for tests.
fn restart_service(service: &str) -> Result<(), PipelineError> {
    let status = Command::new(systemctl_program())
        .arg("restart")
        .arg(service)
        .status()
        .map_err(|_| PipelineError::ServiceRestartFailed(service.to_string()))?;
    if !status.success() {
        return Err(PipelineError::ServiceRestartFailed(service.to_string()));
    }
    Ok(())
}

fn systemctl_program() -> String {
    env::var("DEPLOYD_SYSTEMCTL_BIN").unwrap_or_else(|_| "systemctl".to_string())
}

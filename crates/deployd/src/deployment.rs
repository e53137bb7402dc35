//! A single deployment configuration and its derived behaviors.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::fields;
use crate::git::{self, GitSource};
use crate::jenkins::{Build, Jenkins};

/// One deployment: how to bring a service up to date from its source.
///
/// All fields except `name` are optional on the wire; missing fields take
/// the schema defaults. `secret_files` maps destination paths (relative to
/// `git_path`) to operator-supplied contents and preserves insertion order,
/// which the edit-time reconciliation relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Deployment {
    pub name: String,
    pub git_path: String,
    pub git_url: String,
    pub git_branch: String,
    pub deploy_key: String,
    pub jenkins_job: String,
    pub jenkins_git: bool,
    pub jenkins_states: Vec<String>,
    pub artifacts: bool,
    pub script: String,
    pub services: Vec<String>,
    pub bigboat_url: String,
    pub bigboat_key: String,
    pub bigboat_compose: String,
    pub secret_files: IndexMap<String, String>,
}

impl Default for Deployment {
    fn default() -> Self {
        Self {
            name: String::new(),
            git_path: String::new(),
            git_url: String::new(),
            git_branch: fields::DEFAULT_BRANCH.to_string(),
            deploy_key: String::new(),
            jenkins_job: String::new(),
            jenkins_git: true,
            jenkins_states: fields::DEFAULT_STATES
                .iter()
                .map(|state| state.to_string())
                .collect(),
            artifacts: false,
            script: String::new(),
            services: Vec::new(),
            bigboat_url: String::new(),
            bigboat_key: String::new(),
            bigboat_compose: String::new(),
            secret_files: IndexMap::new(),
        }
    }
}

impl Deployment {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// The source descriptor for this deployment's upstream repository.
    pub fn source(&self) -> Result<GitSource, PipelineError> {
        if self.git_url.is_empty() {
            return Err(PipelineError::Misconfigured(
                "Cannot retrieve Git repository: misconfiguration".to_string(),
            ));
        }

        let deploy_key = if self.deploy_key.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.deploy_key))
        };
        Ok(GitSource::new(&self.name, &self.git_url, deploy_key))
    }

    /// The source descriptor and the HEAD of the local working copy, when
    /// both exist. A misconfigured source yields `(None, None)`; an empty or
    /// absent working copy yields `(source, None)`.
    pub fn latest_local_version(&self) -> (Option<GitSource>, Option<String>) {
        let Ok(source) = self.source() else {
            return (None, None);
        };
        let head = git::local_head(Path::new(&self.git_path));
        (Some(source), head)
    }

    /// Whether the working copy's HEAD equals the upstream HEAD of the
    /// tracked branch. Any source failure reads as "not up to date".
    pub fn is_up_to_date(&self) -> bool {
        let (source, version) = self.latest_local_version();
        match (source, version) {
            (Some(source), Some(version)) => {
                git::is_up_to_date(&source, &version, &self.git_branch).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// A human-readable comparison page for the changes since the latest
    /// local version, when the upstream has a review system.
    pub fn compare_url(&self) -> Option<String> {
        let (source, version) = self.latest_local_version();
        source?.compare_url(&version?, &self.git_branch)
    }

    /// A human-readable page showing the repository at the latest local
    /// version, when the upstream has a review system.
    pub fn tree_url(&self) -> Option<String> {
        let (source, version) = self.latest_local_version();
        source?.tree_url(&version?)
    }

    /// Branch names present on the upstream repository; empty on failure.
    pub fn branches(&self) -> Vec<String> {
        match self.source() {
            Ok(source) => git::remote_branches(&source).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Check build stability before deployment based on the Jenkins job.
    ///
    /// Returns the latest accepted build for the tracked branch, or a
    /// `BadBuild` describing why the build cannot be trusted.
    pub fn check_ci(&self, jenkins: &Jenkins) -> Result<Build, PipelineError> {
        let bad = PipelineError::BadBuild;

        let mut job = jenkins
            .job(&self.jenkins_job)
            .map_err(|err| bad(format!("Could not retrieve job {}: {err:#}", self.jenkins_job)))?
            .ok_or_else(|| bad(format!("Job {} does not exist", self.jenkins_job)))?;

        if !job.jobs.is_empty() {
            // Descend into the branch job of a multibranch pipeline job.
            job = jenkins
                .child_job(&job, &self.git_branch)
                .map_err(|err| bad(format!("Could not retrieve branch job: {err:#}")))?
                .ok_or_else(|| bad("Branch build could not be found".to_string()))?;
        }

        // Retrieve the latest branch build. Branch names may be recorded
        // either plain or with the origin/ remote prefix.
        let mut found = None;
        for branch in [
            self.git_branch.clone(),
            format!("origin/{}", self.git_branch),
        ] {
            let Some((build, branch_build)) = jenkins
                .last_branch_build(&job, &branch)
                .map_err(|err| bad(format!("Could not retrieve branch build: {err:#}")))?
            else {
                continue;
            };

            if let Some(revision) = &branch_build.revision {
                // We only accept branch builds where the latest build for
                // that branch is not a merge request build, since the
                // stability of the branch code is not demonstrated by such
                // a build.
                if revision.branch_names().len() > 1 {
                    return Err(bad("Latest build is caused by merge request".to_string()));
                }

                if self.jenkins_git {
                    let source = self.source()?;
                    let fresh = git::is_up_to_date(&source, &revision.sha1, &self.git_branch)
                        .map_err(|err| {
                            bad(format!("Could not inspect upstream repository: {err:#}"))
                        })?;
                    if !fresh {
                        return Err(bad(
                            "Latest build is stale compared to Git repository".to_string(),
                        ));
                    }
                }
            }

            found = Some(build);
            break;
        }

        let build = found.ok_or_else(|| bad("Branch build could not be found".to_string()))?;

        if build.building {
            return Err(bad("Build is not complete".to_string()));
        }
        let result = build.result.clone().unwrap_or_default();
        if !self.jenkins_states.iter().any(|state| *state == result) {
            return Err(bad(format!(
                "Build result was not {}, but {}",
                self.jenkins_states.join(","),
                result
            )));
        }

        Ok(build)
    }
}

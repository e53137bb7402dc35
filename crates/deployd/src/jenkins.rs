//! Blocking client for the Jenkins JSON API.
//!
//! Covers the slice of the API the deployment pipeline needs: job lookup
//! (including multibranch pipeline children), resolving the last build for a
//! branch through the `buildsByBranchName` build action, and downloading
//! build artifacts.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;

/// Connection settings for a Jenkins server.
#[derive(Debug, Clone)]
pub struct JenkinsConfig {
    pub url: String,
    pub user: Option<String>,
    pub token: Option<String>,
}

/// A Jenkins API client.
#[derive(Debug, Clone)]
pub struct Jenkins {
    base: String,
    http: Client,
    auth: Option<(String, String)>,
}

/// A job as returned by `/job/<name>/api/json`. Multibranch pipeline jobs
/// carry their per-branch children in `jobs`.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub url: String,
    #[serde(default)]
    pub jobs: Vec<JobRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobRef {
    pub name: String,
}

/// One build of a job.
#[derive(Debug, Clone, Deserialize)]
pub struct Build {
    pub number: u64,
    pub url: String,
    #[serde(default)]
    pub building: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Artifact {
    #[serde(rename = "relativePath")]
    pub relative_path: String,
}

/// A build action; only the `buildsByBranchName` payload is of interest.
#[derive(Debug, Clone, Deserialize)]
pub struct Action {
    #[serde(rename = "buildsByBranchName", default)]
    pub builds_by_branch_name: Option<BTreeMap<String, BranchBuild>>,
}

/// Per-branch build record inside the `buildsByBranchName` action.
#[derive(Debug, Clone, Deserialize)]
pub struct BranchBuild {
    #[serde(rename = "buildNumber")]
    pub build_number: u64,
    #[serde(default)]
    pub revision: Option<Revision>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Revision {
    #[serde(rename = "SHA1")]
    pub sha1: String,
    #[serde(default)]
    pub branch: Vec<NamedBranch>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedBranch {
    pub name: String,
}

impl Revision {
    /// The distinct branch names recorded for this revision. Branches may be
    /// duplicated by merge strategies; more than one distinct name means the
    /// build was caused by a merge request.
    pub fn branch_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.branch.iter().map(|branch| branch.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

impl Build {
    /// The `buildsByBranchName` record for `branch`, if any action has one.
    pub fn branch_build(&self, branch: &str) -> Option<&BranchBuild> {
        self.actions
            .iter()
            .filter_map(|action| action.builds_by_branch_name.as_ref())
            .find_map(|builds| builds.get(branch))
    }
}

impl Jenkins {
    pub fn new(config: &JenkinsConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("deployd/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build Jenkins HTTP client")?;

        let auth = match (&config.user, &config.token) {
            (Some(user), Some(token)) => Some((user.clone(), token.clone())),
            _ => None,
        };

        Ok(Self {
            base: config.url.trim_end_matches('/').to_string(),
            http,
            auth,
        })
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        let mut request = self.http.get(url);
        if let Some((user, token)) = &self.auth {
            request = request.basic_auth(user, Some(token));
        }
        let resp = request.send().context("Jenkins request failed")?;
        match resp.status() {
            StatusCode::OK => {
                let parsed = resp.json().context("failed to parse Jenkins JSON")?;
                Ok(Some(parsed))
            }
            StatusCode::NOT_FOUND => Ok(None),
            s => bail!("unexpected status from Jenkins for {url}: {s}"),
        }
    }

    /// Look up a top-level job by name.
    pub fn job(&self, name: &str) -> Result<Option<Job>> {
        self.get_json(&format!("{}/job/{}/api/json", self.base, name))
    }

    /// Look up a child job of a multibranch pipeline job.
    pub fn child_job(&self, parent: &Job, name: &str) -> Result<Option<Job>> {
        self.get_json(&format!("{}job/{}/api/json", parent.url, name))
    }

    /// The last build of `job`, if it has any builds.
    pub fn last_build(&self, job: &Job) -> Result<Option<Build>> {
        self.get_json(&format!("{}lastBuild/api/json", job.url))
    }

    /// A specific build of `job` by number.
    pub fn build(&self, job: &Job, number: u64) -> Result<Option<Build>> {
        self.get_json(&format!("{}{}/api/json", job.url, number))
    }

    /// The last build of `job` recorded for `branch`, resolved through the
    /// `buildsByBranchName` action of the latest build. Returns the build
    /// together with its per-branch record.
    pub fn last_branch_build(&self, job: &Job, branch: &str) -> Result<Option<(Build, BranchBuild)>> {
        let Some(last) = self.last_build(job)? else {
            return Ok(None);
        };
        let Some(branch_build) = last.branch_build(branch).cloned() else {
            return Ok(None);
        };
        let build = if branch_build.build_number == last.number {
            last
        } else {
            match self.build(job, branch_build.build_number)? {
                Some(build) => build,
                None => return Ok(None),
            }
        };
        Ok(Some((build, branch_build)))
    }

    /// Download one artifact of `build` by its relative path.
    pub fn artifact(&self, build: &Build, relative_path: &str) -> Result<Vec<u8>> {
        let url = format!("{}artifact/{}", build.url, relative_path);
        let mut request = self.http.get(&url);
        if let Some((user, token)) = &self.auth {
            request = request.basic_auth(user, Some(token));
        }
        let resp = request.send().context("Jenkins artifact request failed")?;
        if resp.status() != StatusCode::OK {
            bail!("unexpected status while downloading artifact {url}: {}", resp.status());
        }
        Ok(resp.bytes().context("failed to read artifact body")?.to_vec())
    }
}

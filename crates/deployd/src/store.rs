//! Deployment collections and their JSON persistence.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use indexmap::IndexMap;

use crate::deployment::Deployment;

pub const DEPLOYMENT_FILE: &str = "deployment.json";

/// Path of the deployments document inside the deploy data directory.
pub fn deployment_path(deploy_path: &Path) -> PathBuf {
    deploy_path.join(DEPLOYMENT_FILE)
}

/// An insertion-ordered set of deployments keyed by name.
#[derive(Debug, Default)]
pub struct DeploymentSet {
    deployments: IndexMap<String, Deployment>,
}

impl DeploymentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a deployments collection from a JSON file. A missing file is an
    /// empty collection; missing fields expand to their schema defaults.
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read deployments file {}", path.display()))?;
        let deployments: Vec<Deployment> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse deployments JSON {}", path.display()))?;

        let mut set = Self::new();
        for deployment in deployments {
            set.add(deployment);
        }
        Ok(set)
    }

    /// Write the deployments to a JSON file as a plain array of objects.
    /// The write is atomic: a temp file is renamed over the target.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create deploy dir {}", parent.display()))?;
        }

        let deployments: Vec<&Deployment> = self.deployments.values().collect();
        let data =
            serde_json::to_vec(&deployments).context("failed to serialize deployments JSON")?;

        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("failed to create temp file {}", tmp.display()))?;
            file.write_all(&data)
                .with_context(|| format!("failed to write temp file {}", tmp.display()))?;
            file.sync_all().context("failed to sync deployments file")?;
        }
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename deployments file to {}", path.display()))?;

        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.deployments.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Deployment> {
        self.deployments.get(name)
    }

    /// Add a deployment. Duplicate names are ignored: the first write wins.
    pub fn add(&mut self, deployment: Deployment) {
        if self.deployments.contains_key(&deployment.name) {
            return;
        }
        self.deployments
            .insert(deployment.name.clone(), deployment);
    }

    /// Remove a deployment by name; removing an absent name is a no-op.
    pub fn discard(&mut self, name: &str) {
        self.deployments.shift_remove(name);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Deployment> {
        self.deployments.values()
    }

    pub fn len(&self) -> usize {
        self.deployments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deployments.is_empty()
    }
}

/// Owner of the deployment set and its on-disk document.
///
/// The set is read lazily on first access and every mutation rewrites the
/// document, so the file is always a faithful snapshot of memory. All access
/// goes through the mutex; web handlers run concurrently.
#[derive(Debug)]
pub struct DeploymentStore {
    path: PathBuf,
    set: Mutex<Option<DeploymentSet>>,
}

impl DeploymentStore {
    pub fn new(deploy_path: &Path) -> Self {
        Self {
            path: deployment_path(deploy_path),
            set: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a read-only closure against the current set.
    pub fn with_set<T>(&self, f: impl FnOnce(&DeploymentSet) -> T) -> Result<T> {
        let mut guard = self.set.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(DeploymentSet::read(&self.path)?);
        }
        let set = guard.as_ref().context("deployment set not loaded")?;
        Ok(f(set))
    }

    /// Run a mutating closure against the set and persist the result.
    pub fn mutate<T>(&self, f: impl FnOnce(&mut DeploymentSet) -> T) -> Result<T> {
        let mut guard = self.set.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(DeploymentSet::read(&self.path)?);
        }
        let set = guard.as_mut().context("deployment set not loaded")?;
        let value = f(set);
        set.write(&self.path)?;
        Ok(value)
    }

    /// A clone of the named deployment, if present.
    pub fn get(&self, name: &str) -> Result<Option<Deployment>> {
        self.with_set(|set| set.get(name).cloned())
    }

    /// Clones of all deployments in insertion order.
    pub fn snapshot(&self) -> Result<Vec<Deployment>> {
        self.with_set(|set| set.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use proptest::prelude::*;
    use tempfile::tempdir;

    use super::*;

    fn sample(name: &str) -> Deployment {
        let mut deployment = Deployment::named(name);
        deployment.git_url = format!("https://gitlab.test/foo/{name}");
        deployment.services = vec!["nginx".to_string()];
        deployment
    }

    #[test]
    fn read_of_missing_file_is_empty() {
        let td = tempdir().expect("tempdir");
        let set = DeploymentSet::read(&td.path().join("missing.json")).expect("read");
        assert!(set.is_empty());
    }

    #[test]
    fn write_then_read_round_trips() {
        let td = tempdir().expect("tempdir");
        let path = deployment_path(td.path());

        let mut set = DeploymentSet::new();
        set.add(sample("monetdb-import"));
        set.add(sample("agent-config"));
        set.write(&path).expect("write");

        let reread = DeploymentSet::read(&path).expect("read");
        assert_eq!(reread.len(), 2);
        let names: Vec<&str> = reread.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["monetdb-import", "agent-config"]);
        assert_eq!(
            reread.get("monetdb-import").expect("present").git_url,
            "https://gitlab.test/foo/monetdb-import"
        );
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn read_expands_schema_defaults() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("deployment.json");
        std::fs::write(&path, r#"[{"name": "minimal"}]"#).expect("write");

        let set = DeploymentSet::read(&path).expect("read");
        let deployment = set.get("minimal").expect("present");
        assert_eq!(deployment.git_branch, "master");
        assert!(deployment.jenkins_git);
        assert_eq!(deployment.jenkins_states, vec!["SUCCESS".to_string()]);
    }

    #[test]
    fn add_ignores_duplicates() {
        let mut set = DeploymentSet::new();
        set.add(sample("test"));
        let mut other = sample("test");
        other.git_url = "https://example.test/other".to_string();
        set.add(other);

        assert_eq!(set.len(), 1);
        assert_eq!(
            set.get("test").expect("present").git_url,
            "https://gitlab.test/foo/test"
        );
    }

    #[test]
    fn discard_of_absent_name_is_noop() {
        let mut set = DeploymentSet::new();
        set.add(sample("test"));
        set.discard("other");
        assert_eq!(set.len(), 1);
        set.discard("test");
        assert!(set.is_empty());
    }

    #[test]
    fn store_reads_lazily_and_persists_mutations() {
        let td = tempdir().expect("tempdir");
        let store = DeploymentStore::new(td.path());

        assert!(store.get("test").expect("get").is_none());
        store
            .mutate(|set| set.add(sample("test")))
            .expect("mutate");

        // A second store over the same directory sees the persisted set.
        let other = DeploymentStore::new(td.path());
        assert_eq!(
            other.get("test").expect("get").expect("present").name,
            "test"
        );
        assert_eq!(other.snapshot().expect("snapshot").len(), 1);
    }

    proptest! {
        // Whatever combination of fields a deployment carries, persisting a
        // set and reading it back yields the same set, including the order
        // of secret files.
        #[test]
        fn persisted_set_round_trips(
            names in proptest::collection::vec("[a-z][a-z0-9-]{0,12}", 1..5),
            branch in "[a-z][a-z0-9/-]{0,10}",
            secrets in proptest::collection::vec(("[a-z0-9.-]{1,8}", "[ -~]{0,16}"), 0..4),
        ) {
            let td = tempdir().expect("tempdir");
            let path = deployment_path(td.path());

            let mut set = DeploymentSet::new();
            for name in &names {
                let mut deployment = Deployment::named(name);
                deployment.git_branch = branch.clone();
                deployment.secret_files = secrets
                    .iter()
                    .cloned()
                    .collect::<IndexMap<String, String>>();
                set.add(deployment);
            }
            set.write(&path).expect("write");

            let reread = DeploymentSet::read(&path).expect("read");
            prop_assert_eq!(reread.len(), set.len());
            for (original, reloaded) in set.iter().zip(reread.iter()) {
                prop_assert_eq!(original, reloaded);
            }
        }
    }
}

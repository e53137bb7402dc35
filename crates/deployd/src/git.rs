//! Subprocess-based Git client for deployment working copies.
//!
//! All operations shell out to `git`; the binary can be overridden through
//! the `DEPLOYD_GIT_BIN` environment variable so tests can substitute fakes.
//! Deploy-key authentication rides on `GIT_SSH_COMMAND`.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use log::debug;

/// Descriptor for one deployment's upstream repository.
#[derive(Debug, Clone)]
pub struct GitSource {
    pub name: String,
    pub url: String,
    pub deploy_key: Option<PathBuf>,
}

impl GitSource {
    pub fn new(name: &str, url: &str, deploy_key: Option<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            deploy_key,
        }
    }

    /// Base URL of the review system, for http(s) upstreams only.
    fn web_base(&self) -> Option<String> {
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return None;
        }
        let base = self.url.trim_end_matches('/');
        Some(base.strip_suffix(".git").unwrap_or(base).to_string())
    }

    /// Human-readable page comparing `revision` against the upstream branch.
    pub fn compare_url(&self, revision: &str, branch: &str) -> Option<String> {
        self.web_base()
            .map(|base| format!("{base}/compare/{revision}...{branch}"))
    }

    /// Human-readable page showing the repository tree at `revision`.
    pub fn tree_url(&self, revision: &str) -> Option<String> {
        self.web_base().map(|base| format!("{base}/tree/{revision}"))
    }

    fn ssh_command(&self) -> Option<String> {
        self.deploy_key.as_ref().map(|key| {
            format!(
                "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=no",
                key.display()
            )
        })
    }
}

/// A refreshed working copy, with the heads before and after the refresh.
#[derive(Debug)]
pub struct WorkingCopy {
    path: PathBuf,
    source: GitSource,
    head: String,
    prev_head: String,
}

impl WorkingCopy {
    pub fn repo_name(&self) -> &str {
        &self.source.name
    }

    pub fn head(&self) -> &str {
        &self.head
    }

    pub fn prev_head(&self) -> &str {
        &self.prev_head
    }

    /// Whether any of `paths` changed between the previous and current head.
    pub fn paths_changed(&self, paths: &[String]) -> Result<bool> {
        if self.prev_head == self.head {
            return Ok(false);
        }
        let mut args = vec![
            "diff".to_string(),
            "--name-only".to_string(),
            self.prev_head.clone(),
            self.head.clone(),
            "--".to_string(),
        ];
        args.extend(paths.iter().cloned());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = run_git(&args, Some(&self.path), None)?;
        Ok(!out.trim().is_empty())
    }

    /// Contents of `path` at the current head.
    pub fn get_contents(&self, path: &str) -> Result<Vec<u8>> {
        let spec = format!("HEAD:{path}");
        let output = git_command(&["show", &spec], Some(&self.path), None)
            .output()
            .context("failed to execute git show; is git installed?")?;
        if !output.status.success() {
            bail!(
                "git show {} failed: {}",
                spec,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }
}

/// HEAD commit of the working copy at `path`, or `None` when the directory
/// holds no repository or the repository is empty.
pub fn local_head(path: &Path) -> Option<String> {
    if !path.join(".git").exists() {
        return None;
    }
    let output = git_command(&["rev-parse", "HEAD"], Some(path), None)
        .output()
        .ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}

/// HEAD commit of `branch` on the upstream repository.
pub fn upstream_head(source: &GitSource, branch: &str) -> Result<Option<String>> {
    let refspec = format!("refs/heads/{branch}");
    let out = run_git(&["ls-remote", &source.url, &refspec], None, Some(source))?;
    Ok(out
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string))
}

/// Whether `revision` is the upstream HEAD of `branch`.
pub fn is_up_to_date(source: &GitSource, revision: &str, branch: &str) -> Result<bool> {
    Ok(upstream_head(source, branch)?.as_deref() == Some(revision))
}

/// Branch names present on the upstream repository.
pub fn remote_branches(source: &GitSource) -> Result<Vec<String>> {
    let out = run_git(&["ls-remote", "--heads", &source.url], None, Some(source))?;
    Ok(out
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|name| name.strip_prefix("refs/heads/"))
        .map(str::to_string)
        .collect())
}

/// Bring the working copy at `path` up to date with the upstream `branch`,
/// cloning first when no repository exists there yet. The checkout is forced
/// so that local drift (including previously written secret files) never
/// blocks an update.
pub fn refresh(source: &GitSource, path: &Path, branch: &str) -> Result<WorkingCopy> {
    let prev_head;
    if path.join(".git").exists() {
        prev_head = local_head(path);
        run_git(&["fetch", "origin", branch], Some(path), Some(source))?;
        run_git(
            &["checkout", "--force", "-B", branch, "FETCH_HEAD"],
            Some(path),
            None,
        )?;
    } else {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create clone dir {}", parent.display()))?;
        }
        let target = path.to_string_lossy().to_string();
        run_git(
            &["clone", "--branch", branch, &source.url, &target],
            None,
            Some(source),
        )?;
        prev_head = None;
    }

    let head = local_head(path)
        .with_context(|| format!("no HEAD in working copy {} after refresh", path.display()))?;
    debug!("refreshed {} to {}", path.display(), head);

    Ok(WorkingCopy {
        path: path.to_path_buf(),
        source: source.clone(),
        prev_head: prev_head.unwrap_or_else(|| head.clone()),
        head,
    })
}

fn git_command(args: &[&str], cwd: Option<&Path>, source: Option<&GitSource>) -> Command {
    let mut command = Command::new(git_program());
    command.args(args);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    if let Some(ssh) = source.and_then(GitSource::ssh_command) {
        command.env("GIT_SSH_COMMAND", ssh);
    }
    command
}

fn run_git(args: &[&str], cwd: Option<&Path>, source: Option<&GitSource>) -> Result<String> {
    let output = git_command(args, cwd, source)
        .output()
        .context("failed to execute git; is git installed?")?;

    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.first().copied().unwrap_or(""),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn git_program() -> String {
    env::var("DEPLOYD_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use serial_test::serial;
    use tempfile::tempdir;

    use super::*;

    fn write_fake_git(bin_dir: &Path) -> PathBuf {
        #[cfg(windows)]
        {
            let path = bin_dir.join("git.cmd");
            fs::write(
                &path,
                "@echo off\r\nif \"%1\"==\"ls-remote\" (\r\n  echo abcd1234	refs/heads/master\r\n  echo ffff0000	refs/heads/feature\r\n  exit /b 0\r\n)\r\nif \"%1\"==\"rev-parse\" (\r\n  echo abcd1234\r\n  exit /b 0\r\n)\r\nexit /b 1\r\n",
            )
            .expect("write fake git");
            path
        }

        #[cfg(not(windows))]
        {
            use std::os::unix::fs::PermissionsExt;

            let path = bin_dir.join("git");
            fs::write(
                &path,
                "#!/usr/bin/env sh\nif [ \"$1\" = \"ls-remote\" ]; then\n  printf 'abcd1234\\trefs/heads/master\\n'\n  printf 'ffff0000\\trefs/heads/feature\\n'\n  exit 0\nfi\nif [ \"$1\" = \"rev-parse\" ]; then\n  echo abcd1234\n  exit 0\nfi\nexit 1\n",
            )
            .expect("write fake git");
            let mut perms = fs::metadata(&path).expect("meta").permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).expect("chmod");
            path
        }
    }

    fn source() -> GitSource {
        GitSource::new("demo", "https://gitlab.test/foo/bar.git", None)
    }

    #[test]
    fn compare_url_derives_from_http_upstream() {
        assert_eq!(
            source().compare_url("abc123", "master"),
            Some("https://gitlab.test/foo/bar/compare/abc123...master".to_string())
        );
    }

    #[test]
    fn tree_url_derives_from_http_upstream() {
        assert_eq!(
            source().tree_url("abc123"),
            Some("https://gitlab.test/foo/bar/tree/abc123".to_string())
        );
    }

    #[test]
    fn review_urls_absent_for_ssh_upstream() {
        let source = GitSource::new("demo", "git@gitlab.test:foo/bar.git", None);
        assert!(source.compare_url("abc123", "master").is_none());
        assert!(source.tree_url("abc123").is_none());
    }

    #[test]
    fn ssh_command_points_at_deploy_key() {
        let source = GitSource::new(
            "demo",
            "git@gitlab.test:foo/bar.git",
            Some(PathBuf::from("/data/key-demo")),
        );
        let ssh = source.ssh_command().expect("ssh command");
        assert!(ssh.contains("-i /data/key-demo"));
        assert!(GitSource::new("demo", "x", None).ssh_command().is_none());
    }

    #[test]
    fn local_head_is_none_without_repository() {
        let td = tempdir().expect("tempdir");
        assert!(local_head(td.path()).is_none());
    }

    #[test]
    #[serial]
    fn upstream_head_parses_ls_remote_output() {
        let td = tempdir().expect("tempdir");
        let fake_git = write_fake_git(td.path());
        temp_env::with_var("DEPLOYD_GIT_BIN", Some(&fake_git), || {
            let head = upstream_head(&source(), "master").expect("ls-remote");
            assert_eq!(head, Some("abcd1234".to_string()));

            assert!(is_up_to_date(&source(), "abcd1234", "master").expect("up to date"));
            assert!(!is_up_to_date(&source(), "ffff0000", "master").expect("up to date"));
        });
    }

    #[test]
    #[serial]
    fn remote_branches_strips_ref_prefix() {
        let td = tempdir().expect("tempdir");
        let fake_git = write_fake_git(td.path());
        temp_env::with_var("DEPLOYD_GIT_BIN", Some(&fake_git), || {
            let branches = remote_branches(&source()).expect("branches");
            assert_eq!(branches, vec!["master".to_string(), "feature".to_string()]);
        });
    }

    #[test]
    #[serial]
    fn run_git_surfaces_failure_with_stderr() {
        let td = tempdir().expect("tempdir");
        let fake_git = write_fake_git(td.path());
        temp_env::with_var("DEPLOYD_GIT_BIN", Some(&fake_git), || {
            let err = run_git(&["status"], None, None).expect_err("must fail");
            assert!(format!("{err:#}").contains("git status failed"));
        });
    }
}

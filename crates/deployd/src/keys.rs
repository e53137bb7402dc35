//! Deploy-key lifecycle.
//!
//! Every deployment gets its own SSH keypair under the deploy data
//! directory. The key tool defaults to `ssh-keygen` and can be overridden
//! through `DEPLOYD_SSH_KEYGEN_BIN` for tests.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use log::info;

/// Path of the private deploy key for `name` inside the data directory.
/// The public counterpart lives at the same path with a `.pub` suffix.
pub fn key_path(deploy_path: &Path, name: &str) -> PathBuf {
    deploy_path.join(format!("key-{name}"))
}

/// Generate a fresh keypair for the deployment, removing any stale key file
/// at the target path first. Returns the private key path.
pub fn generate(deploy_path: &Path, name: &str) -> Result<PathBuf> {
    let key_file = key_path(deploy_path, name);
    if key_file.exists() {
        info!("removing old key file {}", key_file.display());
        fs::remove_file(&key_file)
            .with_context(|| format!("failed to remove old key file {}", key_file.display()))?;
    }
    fs::create_dir_all(deploy_path)
        .with_context(|| format!("failed to create deploy dir {}", deploy_path.display()))?;

    let purpose = format!("deploy key for {name}");
    let output = Command::new(keygen_program())
        .arg("-t")
        .arg("rsa")
        .arg("-b")
        .arg("4096")
        .arg("-N")
        .arg("")
        .arg("-C")
        .arg(&purpose)
        .arg("-f")
        .arg(&key_file)
        .output()
        .context("failed to execute ssh-keygen; is it installed?")?;

    if !output.status.success() {
        bail!(
            "ssh-keygen failed for {}: {}",
            key_file.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    info!("generated deploy key {}", key_file.display());
    Ok(key_file)
}

/// Read the public counterpart of a private key path.
pub fn public_key(key_file: &Path) -> Result<String> {
    let path = public_key_path(key_file);
    fs::read_to_string(&path)
        .with_context(|| format!("failed to read public key {}", path.display()))
}

pub fn public_key_path(key_file: &Path) -> PathBuf {
    let mut path = key_file.as_os_str().to_os_string();
    path.push(".pub");
    PathBuf::from(path)
}

fn keygen_program() -> String {
    env::var("DEPLOYD_SSH_KEYGEN_BIN").unwrap_or_else(|_| "ssh-keygen".to_string())
}

//! Operator credentials and login sessions.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use rand::RngExt;
use sha2::{Digest, Sha256};

/// Verifies operator credentials. The web layer only cares about a binary
/// "logged in"; anything richer is a back-end concern.
pub trait Authenticator: Send + Sync {
    fn verify(&self, username: &str, password: &str) -> bool;
}

/// Credentials file back-end: one `user:sha256hex` entry per line.
/// Empty lines and `#` comments are skipped.
#[derive(Debug)]
pub struct FileAuthenticator {
    users: HashMap<String, String>,
}

impl FileAuthenticator {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read credentials file {}", path.display()))?;

        let mut users = HashMap::new();
        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((user, digest)) = line.split_once(':') else {
                bail!(
                    "invalid credentials line {} in {}: expected user:sha256hex",
                    number + 1,
                    path.display()
                );
            };
            users.insert(user.to_string(), digest.to_lowercase());
        }

        Ok(Self { users })
    }

    /// Hex digest of a password as stored in the credentials file.
    pub fn digest(password: &str) -> String {
        hex::encode(Sha256::digest(password.as_bytes()))
    }
}

impl Authenticator for FileAuthenticator {
    fn verify(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|digest| *digest == Self::digest(password))
    }
}

/// In-memory session registry mapping cookie tokens to usernames.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, String>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session for the user and return its cookie token.
    pub fn create(&self, username: &str) -> String {
        let bytes: [u8; 32] = rand::rng().random();
        let token = hex::encode(bytes);
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(token.clone(), username.to_string());
        token
    }

    /// The user behind a session token, if the session is live.
    pub fn user(&self, token: &str) -> Option<String> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(token).cloned()
    }

    /// Close a session; closing an unknown token is a no-op.
    pub fn remove(&self, token: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(token);
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn file_authenticator_accepts_matching_digest() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("credentials");
        std::fs::write(
            &path,
            format!(
                "# operators\n\nadmin:{}\n",
                FileAuthenticator::digest("secret")
            ),
        )
        .expect("write");

        let auth = FileAuthenticator::from_file(&path).expect("parse");
        assert!(auth.verify("admin", "secret"));
        assert!(!auth.verify("admin", "wrong"));
        assert!(!auth.verify("other", "secret"));
    }

    #[test]
    fn file_authenticator_rejects_malformed_lines() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("credentials");
        std::fs::write(&path, "admin\n").expect("write");

        let err = FileAuthenticator::from_file(&path).expect_err("malformed");
        assert!(format!("{err:#}").contains("line 1"));
    }

    #[test]
    fn digests_are_stored_case_insensitively() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("credentials");
        std::fs::write(
            &path,
            format!("admin:{}\n", FileAuthenticator::digest("secret").to_uppercase()),
        )
        .expect("write");

        let auth = FileAuthenticator::from_file(&path).expect("parse");
        assert!(auth.verify("admin", "secret"));
    }

    #[test]
    fn sessions_round_trip_and_expire() {
        let sessions = SessionStore::new();
        let token = sessions.create("admin");
        assert_eq!(sessions.user(&token), Some("admin".to_string()));

        sessions.remove(&token);
        assert!(sessions.user(&token).is_none());
        // Unknown tokens are a no-op to remove.
        sessions.remove("bogus");
    }

    #[test]
    fn tokens_are_unique_per_session() {
        let sessions = SessionStore::new();
        let first = sessions.create("admin");
        let second = sessions.create("admin");
        assert_ne!(first, second);
        assert_eq!(first.len(), 64);
    }
}

//! Secrets as per-session env files.

use std::path::{Path, PathBuf};

use slotkeeper_protocol::SessionId;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

use crate::{OrchestratorError, SecretLease, SecretVault};

/// Writes each session's secrets to `<dir>/<session>.env`, readable only by
/// this user. The file is what `docker run --env-file` consumes.
///
/// The directory is a private temp dir removed when the vault is dropped.
pub struct EnvFileVault {
    dir: TempDir,
}

impl EnvFileVault {
    /// Creates the vault in a fresh temp directory.
    pub fn new() -> Result<Self, OrchestratorError> {
        let dir = tempfile::Builder::new().prefix("slotkeeper-secrets-").tempdir()?;
        Ok(Self { dir })
    }

    /// The directory secret files are written to.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

/// Renders `NAME=value` lines. Values may not contain line breaks: the env
/// file format has no quoting.
fn render(secrets: &[(String, String)]) -> Result<String, OrchestratorError> {
    let mut out = String::new();
    for (name, value) in secrets {
        if value.contains(['\n', '\r']) {
            return Err(OrchestratorError::Secrets(format!(
                "value of {name} contains a line break"
            )));
        }
        out.push_str(name);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    Ok(out)
}

impl SecretVault for EnvFileVault {
    type Lease = EnvFileLease;

    async fn materialize(
        &self,
        session: SessionId,
        secrets: &[(String, String)],
    ) -> Result<EnvFileLease, OrchestratorError> {
        let body = render(secrets)?;
        let path = self.dir.path().join(format!("{}.env", session.short()));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&path).await?;
        file.write_all(body.as_bytes()).await?;
        file.flush().await?;

        tracing::debug!(%session, count = secrets.len(), "secrets materialized");
        let reference = path.to_string_lossy().into_owned();
        Ok(EnvFileLease { path, reference })
    }
}

/// An env file on disk. Released by deleting it.
#[derive(Debug)]
pub struct EnvFileLease {
    path: PathBuf,
    reference: String,
}

impl SecretLease for EnvFileLease {
    fn reference(&self) -> &str {
        &self.reference
    }

    async fn release(self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => tracing::debug!(path = %self.reference, "secrets released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.reference, error = %e, "failed to remove secrets"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets() -> Vec<(String, String)> {
        vec![
            ("JIRA_EMAIL".into(), "dev@example.com".into()),
            ("JIRA_API_TOKEN".into(), "s3cr3t".into()),
        ]
    }

    #[tokio::test]
    async fn test_materialize_writes_env_file() {
        let vault = EnvFileVault::new().unwrap();

        let lease = vault.materialize(SessionId::new(), &secrets()).await.unwrap();

        let body = tokio::fs::read_to_string(lease.reference()).await.unwrap();
        assert_eq!(body, "JIRA_EMAIL=dev@example.com\nJIRA_API_TOKEN=s3cr3t\n");
        assert!(Path::new(lease.reference()).starts_with(vault.dir()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_materialize_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let vault = EnvFileVault::new().unwrap();
        let lease = vault.materialize(SessionId::new(), &secrets()).await.unwrap();

        let mode = std::fs::metadata(lease.reference()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_release_removes_file() {
        let vault = EnvFileVault::new().unwrap();
        let lease = vault.materialize(SessionId::new(), &secrets()).await.unwrap();
        let path = PathBuf::from(lease.reference());

        lease.release().await;

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_materialize_rejects_multiline_value() {
        let vault = EnvFileVault::new().unwrap();
        let bad = vec![("X".to_string(), "a\nb".to_string())];

        let result = vault.materialize(SessionId::new(), &bad).await;

        assert!(matches!(result, Err(OrchestratorError::Secrets(_))));
    }
}

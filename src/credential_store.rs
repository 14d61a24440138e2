/// Encrypted per-profile credential files: `<dir>/<profile>.cred`.
#[derive(Clone)]
pub struct CredentialStore {
    dir: std::path::PathBuf,
    cipher: std::sync::Arc<crate::cipher::CredentialCipher>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("dir", &self.dir)
            .finish()
    }
}

const EXTENSION: &str = "cred";

impl CredentialStore {
    pub fn new(
        dir: impl Into<std::path::PathBuf>,
        cipher: std::sync::Arc<crate::cipher::CredentialCipher>,
    ) -> Self {
        Self {
            dir: dir.into(),
            cipher,
        }
    }

    /// Opens the store under the state directory, deriving the key off the async runtime.
    pub async fn open_default(scope: crate::cipher::KeyScope) -> crate::Result<Self> {
        let cipher = tokio::task::spawn_blocking(move || {
            crate::cipher::CredentialCipher::new(crate::config::salt_path(), scope)
        })
        .await
        .map_err(|e| crate::Error::Encryption(format!("key derivation task failed: {e}")))??;
        Ok(Self::new(
            crate::config::credential_store_dir(),
            std::sync::Arc::new(cipher),
        ))
    }

    fn path_for(&self, profile: &str) -> crate::Result<std::path::PathBuf> {
        if !is_valid_profile(profile) {
            return Err(crate::Error::UserError(format!(
                "invalid profile name: {profile:?}"
            )));
        }
        Ok(self.dir.join(format!("{profile}.{EXTENSION}")))
    }

    pub async fn store(
        &self,
        profile: &str,
        credentials: &crate::credentials::Credentials,
    ) -> crate::Result<()> {
        let path = self.path_for(profile)?;
        let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(credentials)?);
        let data = self.cipher.encrypt(&plaintext)?;

        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.dir)
            .await?;
        let suffix: u64 = rand::random();
        let tmp = path.with_extension(format!(
            "{EXTENSION}.tmp.{}.{:x}",
            std::process::id(),
            suffix
        ));
        if let Err(e) = write_and_rename(&tmp, &path, &data).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(e.into());
        }
        tracing::debug!(profile = profile, path = %path.display(), expiration = ?credentials.expiration, "stored credentials");
        Ok(())
    }

    /// Fails with `CredentialsNotFound` or `CredentialsExpired` rather than returning stale data.
    pub async fn retrieve(&self, profile: &str) -> crate::Result<crate::credentials::Credentials> {
        let path = self.path_for(profile)?;
        let data = match tokio::fs::read(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(crate::Error::CredentialsNotFound(profile.to_owned()));
            }
            Err(e) => return Err(e.into()),
        };
        let plaintext = zeroize::Zeroizing::new(self.cipher.decrypt(&data)?);
        let credentials: crate::credentials::Credentials = serde_json::from_slice(&plaintext)?;
        if credentials.is_expired_at(chrono::Utc::now()) {
            return Err(crate::Error::CredentialsExpired(profile.to_owned()));
        }
        Ok(credentials)
    }

    /// Removing a missing profile is not an error.
    pub async fn delete(&self, profile: &str) -> crate::Result<()> {
        let path = self.path_for(profile)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(profile = profile, "deleted credentials");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Profiles holding valid credentials, sorted. Unreadable or expired entries are skipped.
    pub async fn list(&self) -> crate::Result<Vec<String>> {
        let mut d = match tokio::fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut profiles = Vec::new();
        while let Some(entry) = d.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != EXTENSION) {
                continue;
            }
            let Some(profile) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.retrieve(profile).await {
                Ok(_) => profiles.push(profile.to_owned()),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Skipping unusable credential file",
                    );
                }
            }
        }
        profiles.sort();
        Ok(profiles)
    }
}

async fn write_and_rename(
    tmp: &std::path::Path,
    path: &std::path::Path,
    data: &[u8],
) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(tmp)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await?;
    }
    tokio::fs::rename(tmp, path).await
}

fn is_valid_profile(profile: &str) -> bool {
    !profile.is_empty()
        && !profile.starts_with('.')
        && profile
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

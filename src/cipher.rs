//! Authenticated encryption for credentials at rest.
//!
//! Ciphertext layout is `nonce (12 bytes) || AES-256-GCM ciphertext || tag (16 bytes)`. The key is
//! derived with PBKDF2-HMAC-SHA256 from machine/user entropy and a random salt persisted next to
//! the stored credentials, so every process of the same user on the same host derives the same key.

const KEY_LEN: usize = 32;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const PBKDF2_ROUNDS: u32 = 100_000;

/// What the derived key is bound to besides the salt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyScope {
    /// Host, user, OS and architecture. Shared by all processes of the user.
    #[default]
    User,
    /// Additionally the PID; data is only readable by the process which wrote it.
    Process,
}

pub struct CredentialCipher {
    key: zeroize::Zeroizing<[u8; KEY_LEN]>,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    /// Derives the key from the salt at `salt_path` (created when missing) and local entropy.
    pub fn new(salt_path: impl AsRef<std::path::Path>, scope: KeyScope) -> crate::Result<Self> {
        let salt = read_or_create_salt(salt_path.as_ref())?;
        let entropy = machine_entropy(scope)?;
        Ok(Self::derive(entropy.as_bytes(), &salt))
    }

    pub fn derive(password: &[u8], salt: &[u8]) -> Self {
        let mut key = zeroize::Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2::pbkdf2_hmac::<sha2::Sha256>(password, salt, PBKDF2_ROUNDS, key.as_mut());
        Self { key }
    }

    pub fn from_key(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: zeroize::Zeroizing::new(key),
        }
    }

    fn aead(&self) -> aes_gcm::Aes256Gcm {
        use aes_gcm::KeyInit;
        aes_gcm::Aes256Gcm::new(aes_gcm::Key::<aes_gcm::Aes256Gcm>::from_slice(
            self.key.as_ref(),
        ))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> crate::Result<Vec<u8>> {
        use aes_gcm::aead::Aead;
        let nonce: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .aead()
            .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| crate::Error::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> crate::Result<Vec<u8>> {
        use aes_gcm::aead::Aead;
        if data.len() < NONCE_LEN {
            return Err(crate::Error::Decryption("ciphertext too short".to_owned()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.aead()
            .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                crate::Error::Decryption(
                    "authentication failed: ciphertext tampered or wrong key".to_owned(),
                )
            })
    }

    /// [`encrypt`](Self::encrypt), encoded as standard padded base64.
    pub fn encrypt_string(&self, plaintext: &str) -> crate::Result<String> {
        use base64::Engine;
        let data = self.encrypt(plaintext.as_bytes())?;
        Ok(base64::engine::general_purpose::STANDARD.encode(data))
    }

    pub fn decrypt_string(&self, encoded: &str) -> crate::Result<String> {
        use base64::Engine;
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| crate::Error::Decryption(format!("invalid base64: {e}")))?;
        let plaintext = self.decrypt(&data)?;
        String::from_utf8(plaintext)
            .map_err(|e| crate::Error::Decryption(format!("invalid UTF-8: {e}")))
    }
}

fn machine_entropy(scope: KeyScope) -> crate::Result<zeroize::Zeroizing<String>> {
    let hostname = nix::unistd::gethostname()?;
    let user = nix::unistd::User::from_uid(nix::unistd::getuid())?
        .map(|u| u.name)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_default();
    let mut entropy = zeroize::Zeroizing::new(format!(
        "{}\0{}\0{}\0{}",
        hostname.to_string_lossy(),
        user,
        std::env::consts::OS,
        std::env::consts::ARCH,
    ));
    if scope == KeyScope::Process {
        entropy.push('\0');
        entropy.push_str(&std::process::id().to_string());
    }
    Ok(entropy)
}

/// Returns the salt stored at `path`, creating it if missing.
///
/// A new salt is written to a private temporary file and hard-linked into place, so concurrent
/// creators never observe a partially written salt and all of them end up with the winner's bytes.
pub fn read_or_create_salt(path: &std::path::Path) -> crate::Result<[u8; SALT_LEN]> {
    use std::io::Write;
    use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

    match read_salt(path) {
        Ok(salt) => return Ok(salt),
        Err(crate::Error::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    if let Some(dir) = path.parent() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)?;
    }

    let salt: [u8; SALT_LEN] = rand::random();
    let suffix: u64 = rand::random();
    let tmp = path.with_extension(format!("tmp.{}.{:x}", std::process::id(), suffix));
    {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(&salt)?;
        file.sync_all()?;
    }
    let linked = std::fs::hard_link(&tmp, path);
    std::fs::remove_file(&tmp).ok();
    match linked {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "created new salt");
            Ok(salt)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => read_salt(path),
        Err(e) => Err(e.into()),
    }
}

fn read_salt(path: &std::path::Path) -> crate::Result<[u8; SALT_LEN]> {
    let data = std::fs::read(path)?;
    data.as_slice().try_into().map_err(|_| {
        crate::Error::Encryption(format!(
            "salt file {} has {} bytes, expected {}",
            path.display(),
            data.len(),
            SALT_LEN
        ))
    })
}

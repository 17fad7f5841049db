//! Per-user persisted state.
//!
//! One file per user under the data directory. When an encryption passphrase
//! is configured the JSON payload is sealed with AES-256-GCM (key derived by
//! hashing the passphrase, fresh random nonce per write) and stored as
//! `enc:v1:<base64(nonce || ciphertext)>`. Files are written 0600 on unix.

use std::collections::HashMap;
use std::path::PathBuf;

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{
    binding::FolderBinding,
    domain::{FolderId, UserId},
    errors::Error,
    remote::CredentialBlob,
    Result,
};

const ENC_PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;

/// Everything we remember about one user between runs.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistedSession {
    /// Credential for silent re-authentication, if the user ever logged in.
    #[serde(default)]
    pub credential: Option<CredentialBlob>,
    /// Folders that should resume forwarding on restart.
    #[serde(default)]
    pub active_folders: HashMap<FolderId, FolderBinding>,
    /// Every folder-to-channel mapping ever created, kept even after a
    /// folder is deactivated so reactivation reuses the same channel.
    #[serde(default)]
    pub folder_channels: HashMap<FolderId, FolderBinding>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Missing state is not an error: a user we have never seen loads as the
    /// default (empty) session.
    async fn load(&self, user: UserId) -> Result<PersistedSession>;
    async fn save(&self, user: UserId, session: &PersistedSession) -> Result<()>;
}

pub struct FileSessionStore {
    dir: PathBuf,
    key: Option<[u8; 32]>,
}

impl FileSessionStore {
    pub fn new(dir: PathBuf, passphrase: Option<&str>) -> Self {
        let key = passphrase.map(derive_key);
        Self { dir, key }
    }

    fn path_for(&self, user: UserId) -> PathBuf {
        self.dir.join(format!("{user}.session"))
    }

    fn encode(&self, session: &PersistedSession) -> Result<String> {
        let json = serde_json::to_string_pretty(session)?;
        let Some(key) = &self.key else {
            return Ok(json);
        };
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), json.as_bytes())
            .map_err(|_| Error::Storage("session encryption failed".to_string()))?;
        let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&sealed);
        Ok(format!("{ENC_PREFIX}{}", BASE64.encode(payload)))
    }

    fn decode(&self, raw: &str) -> Result<PersistedSession> {
        let Some(b64) = raw.strip_prefix(ENC_PREFIX) else {
            return Ok(serde_json::from_str(raw)?);
        };
        let key = self.key.as_ref().ok_or_else(|| {
            Error::Storage("session file is encrypted but no key is configured".to_string())
        })?;
        let payload = BASE64
            .decode(b64.trim())
            .map_err(|e| Error::Storage(format!("bad session payload: {e}")))?;
        if payload.len() <= NONCE_LEN {
            return Err(Error::Storage("session payload too short".to_string()));
        }
        let (nonce, sealed) = payload.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let json = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| Error::Storage("session decryption failed".to_string()))?;
        Ok(serde_json::from_slice(&json)?)
    }
}

fn derive_key(passphrase: &str) -> [u8; 32] {
    let digest = Sha256::digest(passphrase.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, user: UserId) -> Result<PersistedSession> {
        let path = self.path_for(user);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => self.decode(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(PersistedSession::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, user: UserId, session: &PersistedSession) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(user);
        let encoded = self.encode(session)?;
        // Write to a sibling temp file first so a crash never leaves a
        // truncated session behind.
        let tmp = path.with_extension("session.tmp");
        tokio::fs::write(&tmp, encoded).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }
        tokio::fs::rename(&tmp, &path).await?;
        debug!(user = %user, "session state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChannelId;

    fn sample() -> PersistedSession {
        let binding = FolderBinding {
            folder_id: FolderId(3),
            channel_id: ChannelId(900),
            title: "Work".to_string(),
            created_at: 1_700_000_000,
        };
        let mut s = PersistedSession {
            credential: Some(CredentialBlob("blob".to_string())),
            ..Default::default()
        };
        s.active_folders.insert(FolderId(3), binding.clone());
        s.folder_channels.insert(FolderId(3), binding);
        s
    }

    fn tmp_store(encrypted: bool) -> FileSessionStore {
        let dir = std::env::temp_dir().join(format!(
            "fcast-store-{}-{}",
            std::process::id(),
            encrypted
        ));
        FileSessionStore::new(dir, encrypted.then_some("hunter2"))
    }

    #[tokio::test]
    async fn missing_file_loads_default() {
        let store = tmp_store(false);
        let loaded = store.load(UserId(424242)).await.unwrap();
        assert_eq!(loaded, PersistedSession::default());
    }

    #[tokio::test]
    async fn plaintext_round_trip() {
        let store = tmp_store(false);
        let user = UserId(1);
        store.save(user, &sample()).await.unwrap();
        assert_eq!(store.load(user).await.unwrap(), sample());
    }

    #[tokio::test]
    async fn encrypted_file_is_opaque_on_disk() {
        let store = tmp_store(true);
        let user = UserId(2);
        store.save(user, &sample()).await.unwrap();

        let raw = tokio::fs::read_to_string(store.path_for(user)).await.unwrap();
        assert!(raw.starts_with(ENC_PREFIX));
        assert!(!raw.contains("blob"));
        assert!(!raw.contains("Work"));

        assert_eq!(store.load(user).await.unwrap(), sample());
    }

    #[tokio::test]
    async fn wrong_key_fails_to_decrypt() {
        let store = tmp_store(true);
        let user = UserId(3);
        store.save(user, &sample()).await.unwrap();

        let other = FileSessionStore::new(store.dir.clone(), Some("not-hunter2"));
        let err = other.load(user).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn encrypted_file_without_key_is_an_error() {
        let store = tmp_store(true);
        let user = UserId(4);
        store.save(user, &sample()).await.unwrap();

        let keyless = FileSessionStore::new(store.dir.clone(), None);
        let err = keyless.load(user).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn session_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let store = tmp_store(false);
        let user = UserId(5);
        store.save(user, &sample()).await.unwrap();
        let meta = tokio::fs::metadata(store.path_for(user)).await.unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}

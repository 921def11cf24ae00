//! Persistent identity store.

use super::{AgentIdentity, SecretSealer};
use crate::utils;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Identity file location, relative to the data directory.
static RUNTIME_CONFIG_PATH: &str = "runtime_config/runtime_config.json";

/// Store for the persisted [`AgentIdentity`].
///
/// Writes are atomic (write-to-temp plus rename) and the identity is cached
/// in memory after the first load. All access goes through a single mutex;
/// there is exactly one store handle per process.
#[derive(Debug)]
pub(crate) struct IdentityStore {
    path: PathBuf,
    sealer: Box<dyn SecretSealer>,
    cache: Mutex<Option<AgentIdentity>>,
}

impl IdentityStore {
    /// Create a store handle rooted at the given data directory.
    pub(crate) fn open(data_dir: &Path, sealer: Box<dyn SecretSealer>) -> Self {
        Self {
            path: data_dir.join(RUNTIME_CONFIG_PATH),
            sealer,
            cache: Mutex::new(None),
        }
    }

    /// Load the persisted identity, if any.
    pub(crate) fn load(&self) -> Result<Option<AgentIdentity>> {
        let mut cache = self.cache.lock().expect("poisoned identity cache");
        if let Some(identity) = cache.as_ref() {
            return Ok(Some(identity.clone()));
        }

        let content = match std::fs::read(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read '{}'", self.path.display()))
            }
        };
        let identity: AgentIdentity = serde_json::from_slice(&content)
            .with_context(|| format!("failed to parse '{}'", self.path.display()))?;
        identity.validate()?;

        *cache = Some(identity.clone());
        Ok(Some(identity))
    }

    /// Persist a new identity, replacing any previous one.
    pub(crate) fn save(&self, identity: &AgentIdentity) -> Result<()> {
        identity.validate()?;
        let content = serde_json::to_vec_pretty(identity)?;

        let mut cache = self.cache.lock().expect("poisoned identity cache");
        utils::atomic_write(&self.path, &content)?;
        *cache = Some(identity.clone());
        Ok(())
    }

    /// Seal a freshly issued session token for at-rest storage.
    pub(crate) fn seal_token(&self, token: &str) -> Result<Vec<u8>> {
        self.sealer.seal(token.as_bytes())
    }

    /// Recover the bearer token for the current session.
    pub(crate) fn unseal_token(&self, identity: &AgentIdentity) -> Result<String> {
        let raw = self.sealer.open(&identity.encrypted_token)?;
        String::from_utf8(raw).context("sealed token is not valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NoopSealer;

    fn store_in(dir: &Path) -> IdentityStore {
        IdentityStore::open(dir, Box::new(NoopSealer::default()))
    }

    #[test]
    fn load_missing_is_none() {
        let tmpdir = tempfile::tempdir().unwrap();
        let store = store_in(tmpdir.path());
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn save_load_roundtrip() {
        let tmpdir = tempfile::tempdir().unwrap();
        let store = store_in(tmpdir.path());

        let identity = AgentIdentity::mock_default();
        store.save(&identity).unwrap();
        assert_eq!(store.load().unwrap(), Some(identity.clone()));

        // A fresh handle reads the same state back from disk.
        let store = store_in(tmpdir.path());
        assert_eq!(store.load().unwrap(), Some(identity));
    }

    #[test]
    fn save_rejects_invalid() {
        let tmpdir = tempfile::tempdir().unwrap();
        let store = store_in(tmpdir.path());

        let mut identity = AgentIdentity::mock_default();
        identity.encrypted_token.clear();
        store.save(&identity).unwrap_err();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn token_roundtrip() {
        let tmpdir = tempfile::tempdir().unwrap();
        let store = store_in(tmpdir.path());

        let sealed = store.seal_token("bearer-xyz").unwrap();
        let identity = AgentIdentity {
            agent_id: "a1".to_string(),
            encrypted_token: sealed,
            position: Default::default(),
        };
        assert_eq!(store.unseal_token(&identity).unwrap(), "bearer-xyz");
    }
}

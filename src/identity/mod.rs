//! Agent identity.

mod store;
pub(crate) use store::IdentityStore;

use anyhow::{ensure, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Agent identifiers travel in headers and filenames.
static VALID_AGENT_ID: &str = "^[a-zA-Z0-9._-]+$";

/// Physical position of the endpoint, as assigned by the control plane.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Position {
    /// Human-readable room label.
    pub(crate) room: String,
    /// Grid coordinates within the room.
    pub(crate) x: i32,
    pub(crate) y: i32,
    /// Control-plane room identifier.
    pub(crate) room_id: String,
}

/// Agent identity, as registered with the control plane.
///
/// Created once at first successful registration and mutated only through
/// the [`IdentityStore`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct AgentIdentity {
    /// Control-plane assigned agent identifier.
    pub(crate) agent_id: String,
    /// Session token, sealed through the platform secret protection.
    #[serde(with = "hex_bytes")]
    pub(crate) encrypted_token: Vec<u8>,
    /// Assigned position.
    #[serde(default)]
    pub(crate) position: Position,
}

impl AgentIdentity {
    /// Validate internal consistency.
    pub(crate) fn validate(&self) -> Result<()> {
        lazy_static! {
            static ref VALID_AGENT_ID_REGEX: Regex = Regex::new(VALID_AGENT_ID).unwrap();
        }
        ensure!(!self.agent_id.is_empty(), "empty agent ID");
        ensure!(
            VALID_AGENT_ID_REGEX.is_match(&self.agent_id),
            "invalid agent ID '{}': not conforming to expression '{}'",
            self.agent_id,
            VALID_AGENT_ID
        );
        ensure!(
            !self.encrypted_token.is_empty(),
            "agent ID '{}' has no sealed token",
            self.agent_id
        );
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn mock_default() -> Self {
        Self {
            agent_id: "mock-agent-0001".to_string(),
            encrypted_token: b"mock-token".to_vec(),
            position: Position {
                room: "mock-lab".to_string(),
                x: 3,
                y: 7,
                room_id: "room-42".to_string(),
            },
        }
    }
}

/// Machine-scoped secret protection.
///
/// Platform keystore integrations live behind this seam; the agent only
/// ever holds the unsealed token in memory for the current session.
pub(crate) trait SecretSealer: Send + Sync + std::fmt::Debug {
    /// Protect a secret for at-rest storage.
    fn seal(&self, secret: &[u8]) -> Result<Vec<u8>>;
    /// Recover a previously sealed secret.
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through sealer for platforms without a system keystore.
///
/// The identity file still relies on filesystem permissions in this mode.
#[derive(Clone, Debug, Default)]
pub(crate) struct NoopSealer {}

impl SecretSealer for NoopSealer {
    fn seal(&self, secret: &[u8]) -> Result<Vec<u8>> {
        Ok(secret.to_vec())
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        Ok(sealed.to_vec())
    }
}

/// Compute the hardware fingerprint sent on first registration.
pub(crate) fn hardware_fingerprint() -> Result<String> {
    let machine_id = std::fs::read_to_string("/etc/machine-id")
        .context("failed to read '/etc/machine-id'")?;
    let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .context("failed to read kernel hostname")?;
    Ok(fingerprint_from(machine_id.trim(), hostname.trim()))
}

fn fingerprint_from(machine_id: &str, hostname: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(machine_id.as_bytes());
    hasher.update(b":");
    hasher.update(hostname.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hex (de)serialization for sealed token bytes.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

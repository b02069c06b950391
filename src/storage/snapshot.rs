use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Current snapshot format version
pub const SNAPSHOT_VERSION: &str = "1.0";

/// On-disk wrapper around every persisted blob
#[derive(Debug, Deserialize, Serialize)]
struct Envelope {
    version: String,
    checksum: String,
    payload: serde_json::Value,
}

/// Serialize `value` into a versioned, checksummed blob
pub fn encode_snapshot<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_value(value).context("Failed to serialize snapshot payload")?;
    let envelope = Envelope {
        version: SNAPSHOT_VERSION.to_string(),
        checksum: compute_checksum(&payload)?,
        payload,
    };

    serde_json::to_vec_pretty(&envelope).context("Failed to serialize snapshot")
}

/// Parse a blob written by `encode_snapshot`.
///
/// A blob from another format version is ignored (with a warning) and
/// treated as absent. A checksum mismatch is an error.
pub fn decode_snapshot<T: DeserializeOwned>(blob: &[u8], what: &str) -> Result<Option<T>> {
    let envelope: Envelope = serde_json::from_slice(blob)
        .with_context(|| format!("Failed to parse {} snapshot", what))?;

    if envelope.version != SNAPSHOT_VERSION {
        warn!(
            "{} snapshot version mismatch (expected {}, got {}). Treating as new state.",
            what, SNAPSHOT_VERSION, envelope.version
        );
        return Ok(None);
    }

    let checksum = compute_checksum(&envelope.payload)?;
    if checksum != envelope.checksum {
        anyhow::bail!(
            "{} snapshot is corrupt (checksum {} does not match {})",
            what,
            envelope.checksum,
            checksum
        );
    }

    let value = serde_json::from_value(envelope.payload)
        .with_context(|| format!("Failed to decode {} snapshot payload", what))?;
    Ok(Some(value))
}

fn compute_checksum(payload: &serde_json::Value) -> Result<String> {
    let json = serde_json::to_string(payload).context("Failed to serialize payload for hashing")?;

    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    let result = hasher.finalize();

    Ok(format!("sha256:{}", hex::encode(&result)))
}

mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

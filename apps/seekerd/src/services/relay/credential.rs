//! Request/response binding for the relay plane.
//!
//! Every agent-to-controller upload carries a credential binding the
//! request id, the agent name, and (for file bodies) the filename to the
//! agent's pre-shared secret. The same primitive signs the channel
//! handshake proofs.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 over the concatenated parts.
pub fn sign(secret: &str, parts: &[&str]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    for part in parts {
        mac.update(part.as_bytes());
    }
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a presented hex credential.
pub fn verify(secret: &str, parts: &[&str], presented: &str) -> bool {
    let Ok(bytes) = hex::decode(presented) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    for part in parts {
        mac.update(part.as_bytes());
    }
    mac.verify_slice(&bytes).is_ok()
}

/// Credential for a relayed file body: signed over id, agent, and filename.
pub fn file_credential(secret: &str, id: Uuid, agent: &str, filename: &str) -> String {
    sign(secret, &[&id.to_string(), agent, filename])
}

/// Credential for a share-index upload: signed over id and agent.
pub fn share_credential(secret: &str, id: Uuid, agent: &str) -> String {
    sign(secret, &[&id.to_string(), agent])
}

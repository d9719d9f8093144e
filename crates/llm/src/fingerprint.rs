//! Stable request fingerprints for the cache and in-flight deduplication.

use sha2::{Digest, Sha256};

use crate::{ChatRequest, RequestKind};

/// Digest of (kind, model, message contents, canonical parameters).
///
/// Stable under parameter-map key reordering because the parameters are
/// serialized in a fixed field order here, and under message identity because
/// only the content strings participate.
pub fn fingerprint(kind: RequestKind, model: &str, request: &ChatRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(model.as_bytes());
    hasher.update(b"\x1f");

    let joined: String = request
        .messages
        .iter()
        .map(|message| message.content.as_str())
        .collect::<Vec<_>>()
        .join("|");
    hasher.update(joined.as_bytes());
    hasher.update(b"\x1f");

    // Canonical parameter form: fixed order, explicit null markers.
    let params = format!(
        "temperature={:?};max_tokens={:?};json={}",
        request.temperature, request.max_tokens, request.json_response
    );
    hasher.update(params.as_bytes());

    format!("{:x}", hasher.finalize())
}

//! Cache key generation using SHA-256 hashes

use sha2::{Digest, Sha256};

/// Generate a deterministic cache key from a namespace and parameters.
///
/// The key is the namespace followed by a SHA-256 hash of the sorted
/// parameters, so the same request yields the same key regardless of
/// parameter order while entries stay grouped by namespace.
pub fn cache_key(namespace: &str, params: &[(&str, &str)]) -> String {
    let mut hasher = Sha256::new();

    hasher.update(namespace.as_bytes());
    hasher.update(b"|");

    // Sort params for deterministic key
    let mut sorted_params: Vec<_> = params.iter().collect();
    sorted_params.sort_by_key(|(k, _)| *k);

    for (k, v) in sorted_params {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b"&");
    }

    format!("{}:{:x}", namespace, hasher.finalize())
}

/// Key under which a single vulnerability record is cached.
pub fn vulnerability_key(vuln_id: &str) -> String {
    format!("cve:{}", vuln_id)
}

//! Cache keys derived from connection targets.
//!
//! key = `<kind>-<hex SHA-256 over the target and credential fields>`. A
//! changed password or address gives a new key.

use crate::service::BackendKind;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 over a list of fields.
///
/// Each field is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Cache key for a backend connection.
pub fn service_key(kind: BackendKind, parts: &[&str]) -> String {
    format!("{}-{}", kind, fingerprint(parts))
}

/// First 12 hex chars of a key's fingerprint, for log lines.
pub fn short_key(key: &str) -> &str {
    let (prefix, fp) = key.split_once('-').unwrap_or(("", key));
    let end = 12.min(fp.len());
    let start = if prefix.is_empty() { 0 } else { prefix.len() + 1 };
    &key[..start + end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = fingerprint(&["10.0.0.1:22", "root", "secret"]);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fields_are_not_ambiguous() {
        assert_ne!(fingerprint(&["ab", "c"]), fingerprint(&["a", "bc"]));
    }

    #[test]
    fn credential_change_changes_key() {
        let a = service_key(BackendKind::Ssh, &["host:22", "root", "old"]);
        let b = service_key(BackendKind::Ssh, &["host:22", "root", "new"]);
        assert_ne!(a, b);
        assert!(a.starts_with("ssh-"));
    }

    #[test]
    fn short_key_keeps_kind_prefix() {
        let key = service_key(BackendKind::Elasticsearch, &["http://127.0.0.1:9200"]);
        let short = short_key(&key);
        assert!(short.starts_with("elasticsearch-"));
        assert_eq!(short.len(), "elasticsearch-".len() + 12);
    }
}

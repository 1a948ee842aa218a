//! Secrets-hash derivation.
//!
//! An exec's cache key must change when the secrets it uses change, and only
//! then. The global hash digests every declared secret value; steps using a
//! subset get a derived hash over just that subset (see the helper chain in
//! [`crate::graph::BuildGraph`]).

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Digest of the values of the named secrets, read from the environment.
/// Names are sorted first so the digest is order-insensitive; `None` when no
/// secrets are declared.
#[must_use]
pub fn global_secrets_hash(
    env: &BTreeMap<String, String>,
    secret_names: &[String],
) -> Option<String> {
    if secret_names.is_empty() {
        return None;
    }

    let mut names: Vec<&String> = secret_names.iter().collect();
    names.sort();
    names.dedup();

    let mut hasher = Sha256::new();
    for name in names {
        if let Some(value) = env.get(name) {
            hasher.update(value.as_bytes());
        }
    }
    Some(hex::encode(hasher.finalize()))
}

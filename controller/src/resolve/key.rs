//! Key derives the hash identifying one resolution.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::{EffectiveConfig, hex};

/// ResolutionKey identifies a (repository, component, version, configuration)
/// tuple; it keys the cache and the in-flight registry.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct ResolutionKey([u8; 32]);

impl std::fmt::Display for ResolutionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex(&self.0[..6]))
    }
}

impl std::fmt::Debug for ResolutionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResolutionKey({self})")
    }
}

/// Resolution_key hashes the identifying tuple of one resolution.
///
/// The configuration contributes its canonical rendering, so reference order
/// and propagation metadata cannot split the cache.
pub fn resolution_key(
    repository_spec: &Value,
    component: &str,
    version: &str,
    config: &EffectiveConfig,
) -> ResolutionKey {
    let mut h = Sha256::new();
    h.update(serde_json::to_vec(repository_spec).unwrap_or_default());
    h.update([0]);
    h.update(component);
    h.update([0]);
    h.update(version);
    h.update([0]);
    h.update(config.canonical_bytes());
    ResolutionKey(h.finalize().into())
}

//! Shared fixtures for consensus integration tests.

use std::sync::Arc;

use pnyx_keyring::{KeyRing, TrustLevel};

/// Build `n` keyrings, identities `"0"` to `"n-1"`, that all trust each
/// other directly at HIGH.
pub fn test_keyrings(n: usize) -> Vec<Arc<KeyRing>> {
    let rings: Vec<Arc<KeyRing>> = (0..n)
        .map(|i| {
            let ring = KeyRing::new(i.to_string());
            ring.create_private(b"test-passphrase")
                .expect("key generation");
            Arc::new(ring)
        })
        .collect();

    for ring in &rings {
        for other in &rings {
            if ring.identity() == other.identity() {
                continue;
            }
            let (public, _) = other
                .get_public(other.identity())
                .expect("own key is present");
            ring.add_public(other.identity(), TrustLevel::HIGH, &public)
                .expect("trusted peer import");
        }
    }

    rings
}

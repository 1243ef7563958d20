//! The keyring: identity directory, signing, and the web of trust.
//!
//! Trust evaluation is lazy: mutations mark the ring stale, and the next
//! reader that needs the trust web rebuilds it (single writer, other
//! readers wait for the stale flag to clear).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, RwLock, RwLockReadGuard};

use pem::Pem;
use pnyx_model::crypto;

use crate::armor::{self, PEM_PRIVATE_TYPE, PEM_PUBLIC_TYPE};
use crate::error::KeyRingError;
use crate::trust::TrustLevel;

/// A third-party attestation: the signer vouches for a peer's key at a
/// given trust level. The signed message is `public_bytes ‖ trust_byte`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TrustSignature {
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
    pub trust: TrustLevel,
}

/// One directory entry.
#[derive(Debug, Clone)]
pub struct Key {
    identity: String,
    public: Vec<u8>,
    /// Attestations emitted by this key over other identities (signee → signature).
    signatures: HashMap<String, TrustSignature>,
    /// Trust set locally by the operator.
    trust: TrustLevel,
    /// Trust computed from the web of trust; always >= `trust`.
    effective_trust: TrustLevel,
    /// Identities whose attestations contributed to `effective_trust`.
    signed_by: Vec<String>,
}

impl Key {
    pub fn info(&self) -> (&str, &[u8], TrustLevel) {
        (&self.identity, &self.public, self.trust)
    }
}

/// JSON body of an exported `PNYXDB PUBLIC KEY` block.
#[derive(serde::Serialize, serde::Deserialize)]
struct KeyBody {
    #[serde(with = "hex::serde")]
    public: Vec<u8>,
    signatures: HashMap<String, TrustSignature>,
}

struct Directory {
    keys: HashMap<String, Key>,
    stale: bool,
}

struct SecretState {
    signing: Option<ed25519_dalek::SigningKey>,
    armored: Option<Pem>,
}

/// Ed25519 keyring with lazy web-of-trust evaluation.
pub struct KeyRing {
    self_identity: String,
    inner: RwLock<Directory>,
    secret: Mutex<SecretState>,
}

impl KeyRing {
    /// Instantiate a new keyring for the given self identity.
    pub fn new(self_identity: impl Into<String>) -> Self {
        let self_identity = self_identity.into();
        let mut keys = HashMap::new();
        keys.insert(
            self_identity.clone(),
            Key {
                identity: self_identity.clone(),
                public: Vec::new(),
                signatures: HashMap::new(),
                trust: TrustLevel::ULTIMATE,
                effective_trust: TrustLevel::ULTIMATE,
                signed_by: Vec::new(),
            },
        );

        KeyRing {
            self_identity,
            inner: RwLock::new(Directory { keys, stale: false }),
            secret: Mutex::new(SecretState {
                signing: None,
                armored: None,
            }),
        }
    }

    pub fn identity(&self) -> &str {
        &self.self_identity
    }

    /// True when no cleartext private key is held in memory.
    pub fn locked(&self) -> bool {
        self.secret.lock().expect("keyring lock poisoned").signing.is_none()
    }

    /// Remove the cleartext private key from memory.
    pub fn lock_private(&self) {
        self.secret.lock().expect("keyring lock poisoned").signing = None;
    }

    /// Decrypt the armored private key block back into memory.
    pub fn unlock_private(&self, passphrase: &[u8]) -> Result<(), KeyRingError> {
        let mut secret = self.secret.lock().expect("keyring lock poisoned");
        if secret.signing.is_some() {
            return Ok(()); // already unlocked
        }

        let armored = secret.armored.as_ref().ok_or(KeyRingError::Locked)?;
        let raw = armor::decrypt_private(armored, passphrase)?;
        let seed: [u8; 32] = raw.as_slice().try_into().map_err(|_| KeyRingError::Decrypt)?;
        secret.signing = Some(ed25519_dalek::SigningKey::from_bytes(&seed));
        Ok(())
    }

    /// Generate a new Ed25519 private key and its armored PEM block.
    pub fn create_private(&self, passphrase: &[u8]) -> Result<(), KeyRingError> {
        let signing = crypto::generate_signing_key();
        let public = signing.verifying_key().to_bytes().to_vec();

        let mut secret = self.secret.lock().expect("keyring lock poisoned");
        secret.armored = Some(armor::encrypt_private(&signing.to_bytes(), passphrase)?);
        secret.signing = Some(signing);
        drop(secret);

        let mut dir = self.inner.write().expect("keyring lock poisoned");
        if let Some(key) = dir.keys.get_mut(&self.self_identity) {
            key.public = public;
        }
        dir.stale = true;
        Ok(())
    }

    /// Sign a message with the unlocked private key.
    pub fn sign(&self, cleartext: &[u8]) -> Result<Vec<u8>, KeyRingError> {
        let secret = self.secret.lock().expect("keyring lock poisoned");
        let signing = secret.signing.as_ref().ok_or(KeyRingError::Locked)?;
        Ok(crypto::sign_bytes(signing, cleartext))
    }

    /// Check a message signed by `from`.
    ///
    /// The signer's effective trust must reach [`TrustLevel::THRESHOLD`].
    pub fn verify(&self, from: &str, cleartext: &[u8], signature: &[u8]) -> Result<(), KeyRingError> {
        let dir = self.directory();
        let key = dir.keys.get(from).ok_or_else(|| KeyRingError::UnknownIdentity {
            identity: from.to_string(),
        })?;

        crypto::verify_bytes(&key.public, cleartext, signature)
            .map_err(|_| KeyRingError::InvalidSignature)?;

        trusted_key(key)
    }

    /// Returns Ok if an identity is currently trusted by the keyring.
    pub fn trusted(&self, identity: &str) -> Result<(), KeyRingError> {
        let dir = self.directory();
        let key = dir.keys.get(identity).ok_or_else(|| KeyRingError::UnknownIdentity {
            identity: identity.to_string(),
        })?;
        trusted_key(key)
    }

    /// Add or overwrite a public key. Attestations emitted by the key are
    /// reset when the key bytes change.
    pub fn add_public(
        &self,
        identity: &str,
        trust: TrustLevel,
        data: &[u8],
    ) -> Result<(), KeyRingError> {
        if identity == self.self_identity {
            return Err(KeyRingError::InvalidIdentity);
        }
        if !crypto::validate_public(data) {
            return Err(KeyRingError::InvalidPublicKey);
        }

        let mut dir = self.inner.write().expect("keyring lock poisoned");
        let key = dir.keys.entry(identity.to_string()).or_insert_with(|| Key {
            identity: identity.to_string(),
            public: Vec::new(),
            signatures: HashMap::new(),
            trust: TrustLevel::NONE,
            effective_trust: TrustLevel::NONE,
            signed_by: Vec::new(),
        });

        if key.public != data {
            key.public = data.to_vec();
            key.signatures.clear();
        }
        key.trust = trust;
        dir.stale = true;
        Ok(())
    }

    /// The stored public key and local trust for an identity.
    pub fn get_public(&self, identity: &str) -> Result<(Vec<u8>, TrustLevel), KeyRingError> {
        let dir = self.inner.read().expect("keyring lock poisoned");
        let key = dir.keys.get(identity).ok_or_else(|| KeyRingError::UnknownIdentity {
            identity: identity.to_string(),
        })?;
        Ok((key.public.clone(), key.trust))
    }

    /// Remove a key from the ring. The self key cannot be removed.
    pub fn remove_public(&self, identity: &str) {
        if identity == self.self_identity {
            return;
        }

        let mut dir = self.inner.write().expect("keyring lock poisoned");
        dir.keys.remove(identity);
        dir.stale = true;
    }

    /// Every stored key (self included), sorted by identity.
    pub fn list_public(&self) -> Vec<(String, Vec<u8>, TrustLevel)> {
        let dir = self.inner.read().expect("keyring lock poisoned");
        let mut keys: Vec<_> = dir
            .keys
            .values()
            .map(|k| (k.identity.clone(), k.public.clone(), k.trust))
            .collect();
        keys.sort_by(|a, b| a.0.cmp(&b.0));
        keys
    }

    /// Attestations covering `identity`, keyed by signer.
    pub fn get_signatures(&self, identity: &str) -> HashMap<String, TrustSignature> {
        let dir = self.directory();
        let Some(key) = dir.keys.get(identity) else {
            return HashMap::new();
        };

        let mut out = HashMap::new();
        for signer in &key.signed_by {
            if let Some(sig) = dir
                .keys
                .get(signer)
                .and_then(|s| s.signatures.get(identity))
            {
                out.insert(signer.clone(), sig.clone());
            }
        }
        out
    }

    /// Record an attestation of `identity` emitted by `from`.
    ///
    /// When `from` is the self identity a fresh attestation is signed with
    /// the private key; otherwise the provided signature is verified first.
    pub fn add_signature(
        &self,
        identity: &str,
        from: &str,
        signature: Option<TrustSignature>,
    ) -> Result<(), KeyRingError> {
        let (signee_public, signee_trust, signer_public) = {
            let dir = self.inner.read().expect("keyring lock poisoned");
            let signee = dir.keys.get(identity).ok_or_else(|| KeyRingError::UnknownIdentity {
                identity: identity.to_string(),
            })?;
            let signer = dir.keys.get(from).ok_or_else(|| KeyRingError::UnknownIdentity {
                identity: from.to_string(),
            })?;
            (signee.public.clone(), signee.trust, signer.public.clone())
        };

        let signature = if from == self.self_identity {
            let mut message = signee_public;
            message.push(signee_trust.0);
            TrustSignature {
                data: self.sign(&message)?,
                trust: signee_trust,
            }
        } else {
            let signature = signature.ok_or(KeyRingError::InvalidSignature)?;
            let mut message = signee_public;
            message.push(signature.trust.0);
            crypto::verify_bytes(&signer_public, &message, &signature.data)
                .map_err(|_| KeyRingError::InvalidSignature)?;
            signature
        };

        let mut dir = self.inner.write().expect("keyring lock poisoned");
        if let Some(signer) = dir.keys.get_mut(from) {
            signer.signatures.insert(identity.to_string(), signature);
        }
        dir.stale = true;
        Ok(())
    }

    /// Export one identity's key as a PEM block.
    ///
    /// A local export of the self key omits the `identity`/`trust` headers.
    pub fn export(&self, identity: &str) -> Result<Vec<u8>, KeyRingError> {
        let dir = self.inner.read().expect("keyring lock poisoned");
        let key = dir.keys.get(identity).ok_or_else(|| KeyRingError::UnknownIdentity {
            identity: identity.to_string(),
        })?;
        Ok(pem::encode(&export_block(key, identity == self.self_identity)).into_bytes())
    }

    /// PEM-armored version of the whole ring: the encrypted private block
    /// followed by every public key block.
    pub fn marshal(&self) -> Result<Vec<u8>, KeyRingError> {
        let mut buf = Vec::new();
        {
            let secret = self.secret.lock().expect("keyring lock poisoned");
            if let Some(armored) = &secret.armored {
                buf.extend_from_slice(pem::encode(armored).as_bytes());
            }
        }

        let dir = self.inner.read().expect("keyring lock poisoned");
        let mut identities: Vec<_> = dir.keys.keys().cloned().collect();
        identities.sort();
        for identity in identities {
            let key = &dir.keys[&identity];
            let block = export_block(key, identity == self.self_identity);
            buf.extend_from_slice(pem::encode(&block).as_bytes());
        }
        Ok(buf)
    }

    /// Import a public PEM block under an explicit identity and trust.
    pub fn import(
        &self,
        data: &[u8],
        identity: &str,
        trust: TrustLevel,
    ) -> Result<(), KeyRingError> {
        if identity.is_empty() || identity == self.self_identity {
            return Err(KeyRingError::InvalidIdentity);
        }

        let blocks = pem::parse_many(data).map_err(|e| KeyRingError::Armor(e.to_string()))?;
        for block in &blocks {
            self.import_block(block, Some((identity, trust)))?;
        }
        Ok(())
    }

    /// Rebuild a ring from its PEM-armored form. Unknown blocks are skipped.
    pub fn unmarshal(&self, data: &[u8]) -> Result<(), KeyRingError> {
        let blocks = pem::parse_many(data).map_err(|e| KeyRingError::Armor(e.to_string()))?;
        for block in &blocks {
            // Parse errors on individual blocks do not abort the whole load.
            let _ = self.import_block(block, None);
        }
        Ok(())
    }

    fn import_block(
        &self,
        block: &Pem,
        identity_override: Option<(&str, TrustLevel)>,
    ) -> Result<(), KeyRingError> {
        match block.tag() {
            PEM_PRIVATE_TYPE => {
                // Avoid private key override when importing a peer's export.
                if identity_override.is_some() {
                    return Err(KeyRingError::InvalidIdentity);
                }
                let mut secret = self.secret.lock().expect("keyring lock poisoned");
                secret.armored = Some(block.clone());
                Ok(())
            }
            PEM_PUBLIC_TYPE => {
                let body: KeyBody = serde_json::from_slice(block.contents())
                    .map_err(|_| KeyRingError::InvalidSignature)?;

                let header_identity = block.headers().get("identity").unwrap_or_default();
                let header_trust = block
                    .headers()
                    .get("trust")
                    .and_then(|t| t.parse().ok())
                    .unwrap_or(TrustLevel::NONE);

                let (identity, trust) = match identity_override {
                    Some((id, trust)) => {
                        if !header_identity.is_empty() && header_identity != id {
                            return Err(KeyRingError::InvalidIdentity);
                        }
                        (id.to_string(), trust)
                    }
                    None if header_identity.is_empty() => {
                        // Headerless block: a local export of the self key.
                        (self.self_identity.clone(), TrustLevel::ULTIMATE)
                    }
                    None => (header_identity.to_string(), header_trust),
                };

                let mut dir = self.inner.write().expect("keyring lock poisoned");
                dir.keys.insert(
                    identity.clone(),
                    Key {
                        identity,
                        public: body.public,
                        signatures: body.signatures,
                        trust,
                        effective_trust: TrustLevel::NONE,
                        signed_by: Vec::new(),
                    },
                );
                dir.stale = true;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Read access to the directory with a guaranteed fresh trust web.
    ///
    /// Readers loop until the stale flag is cleared; the writer that wins
    /// the race performs the rebuild.
    fn directory(&self) -> RwLockReadGuard<'_, Directory> {
        loop {
            {
                let dir = self.inner.read().expect("keyring lock poisoned");
                if !dir.stale {
                    return dir;
                }
            }

            let mut dir = self.inner.write().expect("keyring lock poisoned");
            if dir.stale {
                dir.build_trust_web();
            }
        }
    }
}

fn trusted_key(key: &Key) -> Result<(), KeyRingError> {
    if key.effective_trust < TrustLevel::THRESHOLD {
        return Err(KeyRingError::InsufficientTrust {
            identity: key.identity.clone(),
            level: key.effective_trust,
        });
    }
    Ok(())
}

fn export_block(key: &Key, is_self: bool) -> Pem {
    let body = KeyBody {
        public: key.public.clone(),
        signatures: key.signatures.clone(),
    };
    let json = serde_json::to_vec(&body).expect("key body serialization cannot fail");

    let mut block = Pem::new(PEM_PUBLIC_TYPE, json);
    if !is_self {
        let headers = block.headers_mut();
        headers.add("identity", &key.identity).ok();
        headers.add("trust", &key.trust.to_string()).ok();
    }
    block
}

impl Directory {
    /// Construct the web of trust with a greedy BFS over the attestation
    /// graph, starting from every locally trusted key. Iterative deepening
    /// is required because trusting one peer can make further attestation
    /// chains trustworthy.
    fn build_trust_web(&mut self) {
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();

        for key in self.keys.values_mut() {
            if key.trust >= TrustLevel::THRESHOLD {
                queue.push_back(key.identity.clone());
                visited.insert(key.identity.clone());
            }

            key.effective_trust = key.trust;
            key.signed_by.clear();
        }

        while let Some(current) = queue.pop_front() {
            let Some(key) = self.keys.get(&current) else {
                continue;
            };
            let current_trust = key.effective_trust;
            let attestations: Vec<(String, TrustLevel)> = key
                .signatures
                .iter()
                .map(|(signee, sig)| (signee.clone(), sig.trust))
                .collect();

            for (signee, sig_trust) in attestations {
                let Some(signee_key) = self.keys.get_mut(&signee) else {
                    continue;
                };

                // Accumulated trust is capped by the signer's own standing.
                signee_key.effective_trust = signee_key
                    .effective_trust
                    .add(sig_trust.min_with(current_trust));
                signee_key.signed_by.push(current.clone());

                if signee_key.effective_trust >= TrustLevel::THRESHOLD
                    && visited.insert(signee.clone())
                {
                    queue.push_back(signee);
                }
            }
        }

        self.stale = false;
    }
}

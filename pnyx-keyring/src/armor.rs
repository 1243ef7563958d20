//! PEM armor for keyring material.
//!
//! Private keys live in a `PNYXDB PRIVATE KEY` block, AES-256-CBC encrypted
//! with a PBKDF2-SHA512 key derived from the passphrase (OpenSSL-style
//! `Proc-Type` / `DEK-Info` headers carry the IV). Public keys live in
//! `PNYXDB PUBLIC KEY` blocks whose body is JSON.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pem::Pem;
use rand::RngCore;
use sha2::Sha512;

use crate::error::KeyRingError;

pub const PEM_PUBLIC_TYPE: &str = "PNYXDB PUBLIC KEY";
pub const PEM_PRIVATE_TYPE: &str = "PNYXDB PRIVATE KEY";

const DEK_ALGORITHM: &str = "AES-256-CBC";
const PBKDF2_ROUNDS: u32 = 10_000;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

fn derive_key(passphrase: &[u8], iv: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha512>(passphrase, iv, PBKDF2_ROUNDS, &mut key);
    key
}

/// Encrypt a private key into an armored PEM block.
pub fn encrypt_private(secret: &[u8], passphrase: &[u8]) -> Result<Pem, KeyRingError> {
    let mut iv = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let key = derive_key(passphrase, &iv);
    let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
        .map_err(|e| KeyRingError::Armor(e.to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(secret);

    let mut block = Pem::new(PEM_PRIVATE_TYPE, ciphertext);
    let headers = block.headers_mut();
    headers.add("Proc-Type", "4,ENCRYPTED").ok();
    headers
        .add("DEK-Info", &format!("{},{}", DEK_ALGORITHM, hex::encode(iv)))
        .ok();
    Ok(block)
}

/// Decrypt the private key held in an armored PEM block.
pub fn decrypt_private(block: &Pem, passphrase: &[u8]) -> Result<Vec<u8>, KeyRingError> {
    if block.tag() != PEM_PRIVATE_TYPE {
        return Err(KeyRingError::Armor(format!(
            "unexpected block type {:?}",
            block.tag()
        )));
    }

    let dek = block
        .headers()
        .get("DEK-Info")
        .ok_or_else(|| KeyRingError::Armor("missing DEK-Info header".into()))?;
    let (algorithm, iv_hex) = dek
        .split_once(',')
        .ok_or_else(|| KeyRingError::Armor("malformed DEK-Info header".into()))?;
    if algorithm != DEK_ALGORITHM {
        return Err(KeyRingError::Armor(format!(
            "unsupported cipher {algorithm:?}"
        )));
    }

    let iv = hex::decode(iv_hex).map_err(|e| KeyRingError::Armor(e.to_string()))?;
    let key = derive_key(passphrase, &iv);
    let cipher =
        Aes256CbcDec::new_from_slices(&key, &iv).map_err(|e| KeyRingError::Armor(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(block.contents())
        .map_err(|_| KeyRingError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let secret = b"super secret key material";
        let block = encrypt_private(secret, b"passphrase").unwrap();
        assert_eq!(block.tag(), PEM_PRIVATE_TYPE);
        assert_ne!(block.contents(), secret);

        let recovered = decrypt_private(&block, b"passphrase").unwrap();
        assert_eq!(recovered, secret);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let block = encrypt_private(b"material", b"right").unwrap();
        assert!(decrypt_private(&block, b"wrong").is_err());
    }

    #[test]
    fn pem_text_round_trip() {
        let block = encrypt_private(b"material", b"pw").unwrap();
        let text = pem::encode(&block);
        assert!(text.contains("PNYXDB PRIVATE KEY"));

        let parsed = pem::parse(text).unwrap();
        let recovered = decrypt_private(&parsed, b"pw").unwrap();
        assert_eq!(recovered, b"material");
    }
}

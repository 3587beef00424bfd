//! ML-DSA-65 identities for downloaders and storage nodes.
//!
//! Every party on the ledger is an [`Address`] derived from its ML-DSA-65
//! public key. Passports and settlement vouchers are signed with a
//! [`KeyPair`] under a per-record signing context, so a signature over one
//! record kind can never be replayed as another.

use crate::error::{Error, Result};
use saorsa_pqc::api::sig::{
    ml_dsa_65, MlDsaPublicKey, MlDsaSecretKey, MlDsaSignature, MlDsaVariant,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// ML-DSA-65 signature size in bytes.
pub const SIGNATURE_SIZE: usize = 3309;

/// ML-DSA-65 public key size in bytes.
pub const PUBLIC_KEY_SIZE: usize = 1952;

/// Address length in bytes.
pub const ADDRESS_LEN: usize = 20;

/// File name of the secret key written by [`KeyPair::save`].
pub const SECRET_KEY_FILE: &str = "node.key";

/// File name of the public key written by [`KeyPair::save`].
pub const PUBLIC_KEY_FILE: &str = "node.pub";

/// Ledger address: the first 20 bytes of SHA-256 over the public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    /// Derive the address owned by a public key.
    #[must_use]
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&digest[..ADDRESS_LEN]);
        Self(out)
    }

    /// Raw address bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| Error::Protocol(format!("invalid address '{s}': {e}")))?;
        let arr: [u8; ADDRESS_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            Error::Protocol(format!(
                "invalid address length: expected {ADDRESS_LEN}, got {}",
                b.len()
            ))
        })?;
        Ok(Self(arr))
    }
}

/// An ML-DSA-65 signing key pair together with its derived address.
pub struct KeyPair {
    public_key: MlDsaPublicKey,
    secret_key: MlDsaSecretKey,
    public_bytes: Vec<u8>,
    address: Address,
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    public_key: Vec<u8>,
    secret_key: Vec<u8>,
}

impl KeyPair {
    /// Generate a fresh key pair.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation fails.
    pub fn generate() -> Result<Self> {
        let (public_key, secret_key) = ml_dsa_65()
            .generate_keypair()
            .map_err(|e| Error::Crypto(format!("Key generation failed: {e}")))?;
        Ok(Self::assemble(public_key, secret_key))
    }

    /// Rebuild a key pair from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if either key is not a valid ML-DSA-65 key.
    pub fn from_bytes(public_key: &[u8], secret_key: &[u8]) -> Result<Self> {
        let public_key = MlDsaPublicKey::from_bytes(MlDsaVariant::MlDsa65, public_key)
            .map_err(|e| Error::Crypto(format!("Invalid public key: {e}")))?;
        let secret_key = MlDsaSecretKey::from_bytes(MlDsaVariant::MlDsa65, secret_key)
            .map_err(|e| Error::Crypto(format!("Invalid secret key: {e}")))?;
        Ok(Self::assemble(public_key, secret_key))
    }

    fn assemble(public_key: MlDsaPublicKey, secret_key: MlDsaSecretKey) -> Self {
        let public_bytes = public_key.to_bytes().to_vec();
        let address = Address::from_public_key(&public_bytes);
        Self {
            public_key,
            secret_key,
            public_bytes,
            address,
        }
    }

    /// The address owned by this key pair.
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// Serialized public key.
    #[must_use]
    pub fn public_key_bytes(&self) -> &[u8] {
        &self.public_bytes
    }

    /// The parsed public key.
    #[must_use]
    pub fn public_key(&self) -> &MlDsaPublicKey {
        &self.public_key
    }

    /// Sign `message` under `context`.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn sign(&self, message: &[u8], context: &[u8]) -> Result<Vec<u8>> {
        let sig = ml_dsa_65()
            .sign_with_context(&self.secret_key, message, context)
            .map_err(|e| Error::Crypto(format!("Signing failed: {e}")))?;
        Ok(sig.to_bytes().to_vec())
    }

    /// Write the key pair into `dir` as [`SECRET_KEY_FILE`] and [`PUBLIC_KEY_FILE`].
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or files cannot be written.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let file = KeyFile {
            public_key: self.public_bytes.clone(),
            secret_key: self.secret_key.to_bytes().to_vec(),
        };
        let encoded =
            rmp_serde::to_vec(&file).map_err(|e| Error::Serialization(e.to_string()))?;
        let key_path = dir.join(SECRET_KEY_FILE);
        fs::write(&key_path, encoded)?;
        fs::write(dir.join(PUBLIC_KEY_FILE), &self.public_bytes)?;
        debug!("Saved key pair for {} to {}", self.address, key_path.display());
        Ok(key_path)
    }

    /// Load a key pair previously written by [`KeyPair::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or holds invalid keys.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path)?;
        let file: KeyFile = rmp_serde::from_slice(&raw).map_err(|e| {
            Error::Serialization(format!("Invalid key file '{}': {e}", path.display()))
        })?;
        Self::from_bytes(&file.public_key, &file.secret_key)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Verify `signature` over `message` under `context` with a serialized public key.
///
/// # Errors
///
/// Returns [`Error::BadSignature`] if the signature does not verify, and
/// `malformed` (built from the failure text) if the key or signature cannot be
/// parsed.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
    context: &[u8],
    malformed: fn(String) -> Error,
) -> Result<()> {
    if public_key.len() != PUBLIC_KEY_SIZE {
        return Err(malformed(format!(
            "invalid public key size: expected {PUBLIC_KEY_SIZE}, got {}",
            public_key.len()
        )));
    }
    if signature.len() != SIGNATURE_SIZE {
        return Err(malformed(format!(
            "invalid signature size: expected {SIGNATURE_SIZE}, got {}",
            signature.len()
        )));
    }

    let public_key = MlDsaPublicKey::from_bytes(MlDsaVariant::MlDsa65, public_key)
        .map_err(|e| malformed(format!("invalid public key: {e}")))?;
    let sig = MlDsaSignature::from_bytes(MlDsaVariant::MlDsa65, signature)
        .map_err(|e| malformed(format!("invalid signature format: {e}")))?;

    let valid = ml_dsa_65()
        .verify_with_context(&public_key, message, &sig, context)
        .map_err(|e| Error::BadSignature(format!("verification error: {e}")))?;

    if valid {
        Ok(())
    } else {
        Err(Error::BadSignature("signature does not match".to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CTX: &[u8] = b"custody-test-v1";

    #[test]
    fn test_sign_and_verify() {
        let key = KeyPair::generate().unwrap();
        let sig = key.sign(b"hello", CTX).unwrap();
        assert_eq!(sig.len(), SIGNATURE_SIZE);
        verify_signature(key.public_key_bytes(), b"hello", &sig, CTX, Error::Crypto).unwrap();
    }

    #[test]
    fn test_wrong_message_rejected() {
        let key = KeyPair::generate().unwrap();
        let sig = key.sign(b"hello", CTX).unwrap();
        let err = verify_signature(key.public_key_bytes(), b"hellO", &sig, CTX, Error::Crypto)
            .unwrap_err();
        assert!(matches!(err, Error::BadSignature(_)));
    }

    #[test]
    fn test_wrong_context_rejected() {
        let key = KeyPair::generate().unwrap();
        let sig = key.sign(b"hello", b"other-context").unwrap();
        let result = verify_signature(key.public_key_bytes(), b"hello", &sig, CTX, Error::Crypto);
        assert!(result.is_err(), "Wrong context should fail verification");
    }

    #[test]
    fn test_short_signature_is_malformed() {
        let key = KeyPair::generate().unwrap();
        let err = verify_signature(key.public_key_bytes(), b"x", &[0u8; 10], CTX, Error::Crypto)
            .unwrap_err();
        assert!(err.to_string().contains("invalid signature size"));
    }

    #[test]
    fn test_address_derivation_and_parse() {
        let key = KeyPair::generate().unwrap();
        let addr = key.address();
        assert_eq!(addr, Address::from_public_key(key.public_key_bytes()));

        let parsed: Address = addr.to_string().parse().unwrap();
        assert_eq!(parsed, addr);
        assert!("zz".parse::<Address>().is_err());
        assert!("abcd".parse::<Address>().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let key = KeyPair::generate().unwrap();
        let path = key.save(dir.path()).unwrap();

        let loaded = KeyPair::load(&path).unwrap();
        assert_eq!(loaded.address(), key.address());

        let sig = loaded.sign(b"payload", CTX).unwrap();
        verify_signature(key.public_key_bytes(), b"payload", &sig, CTX, Error::Crypto).unwrap();
    }
}

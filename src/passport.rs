//! Height-bound capabilities authorizing ledger state queries.
//!
//! A passport binds the holder's identity to a recent block (height and
//! hash) and is signed with the holder's key. Verifiers accept it only while
//! their own view of the chain is within a tolerance window of the issuing
//! height, so both parties measure validity against the ledger rather than
//! their local clocks.
//!
//! Passports are issued per call and never persisted. Nothing prevents reuse
//! inside the window: validity is bounded by height, not by a nonce.

use crate::error::{Error, Result};
use crate::identity::{verify_signature, Address, KeyPair};
use crate::ledger::{BlockHash, Ledger};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Signing context for passports.
pub const PASSPORT_CONTEXT: &[u8] = b"custody-passport-v1";

/// A signed, height-bound capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passport {
    /// Height the passport was issued at.
    pub height: u64,
    /// Hash of the block at `height`.
    pub block_hash: BlockHash,
    /// Address of the holder.
    pub holder: Address,
    /// Holder's serialized public key.
    pub public_key: Vec<u8>,
    /// Signature over every field above.
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct SignedPortion<'a> {
    height: u64,
    block_hash: &'a BlockHash,
    holder: &'a Address,
    public_key: &'a [u8],
}

impl Passport {
    /// Issue a passport for `holder` at the given chain position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedCapability`] if `holder` is not the key's
    /// address, or a crypto error if signing fails.
    pub fn issue(
        height: u64,
        block_hash: BlockHash,
        holder: Address,
        key: &KeyPair,
    ) -> Result<Self> {
        if holder != key.address() {
            return Err(Error::MalformedCapability(format!(
                "holder {holder} is not the signing key's address {}",
                key.address()
            )));
        }
        let mut passport = Self {
            height,
            block_hash,
            holder,
            public_key: key.public_key_bytes().to_vec(),
            signature: Vec::new(),
        };
        passport.signature = key.sign(&passport.signed_bytes()?, PASSPORT_CONTEXT)?;
        Ok(passport)
    }

    /// Issue a passport at the ledger's current height.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be queried or signing fails.
    pub async fn issue_current(ledger: &dyn Ledger, key: &KeyPair) -> Result<Self> {
        let height = ledger.current_height().await?;
        let block_hash = ledger.block_hash(height).await?;
        Self::issue(height, block_hash, key.address(), key)
    }

    /// Deterministic encoding of the signed fields.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn signed_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(&SignedPortion {
            height: self.height,
            block_hash: &self.block_hash,
            holder: &self.holder,
            public_key: &self.public_key,
        })
        .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Verify the passport at `current_height` and return the holder's address.
    ///
    /// Valid while `current_height - height <= window`. A passport may be
    /// ahead of the verifier by at most `clock_skew` blocks.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedCapability`] if a required field is missing or the
    ///   holder does not match the public key.
    /// - [`Error::BadSignature`] if the signature does not verify.
    /// - [`Error::ExpiredCapability`] if the height is outside the window.
    pub fn verify(&self, current_height: u64, window: u64, clock_skew: u64) -> Result<Address> {
        if self.public_key.is_empty() {
            return Err(Error::MalformedCapability("missing public key".to_string()));
        }
        if self.signature.is_empty() {
            return Err(Error::MalformedCapability("missing signature".to_string()));
        }
        if self.block_hash.is_zero() {
            return Err(Error::MalformedCapability("missing block hash".to_string()));
        }

        verify_signature(
            &self.public_key,
            &self.signed_bytes()?,
            &self.signature,
            PASSPORT_CONTEXT,
            Error::MalformedCapability,
        )?;

        let derived = Address::from_public_key(&self.public_key);
        if derived != self.holder {
            return Err(Error::MalformedCapability(format!(
                "holder {} does not match public key address {derived}",
                self.holder
            )));
        }

        let expired = Error::ExpiredCapability {
            issued: self.height,
            current: current_height,
            window,
        };
        if current_height >= self.height {
            if current_height - self.height > window {
                return Err(expired);
            }
        } else if self.height - current_height > clock_skew {
            return Err(expired);
        }

        debug!("Passport for {} valid at height {current_height}", self.holder);
        Ok(derived)
    }

    /// Encode for transmission.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode a transmitted passport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedCapability`] if the bytes are not a passport.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::MalformedCapability(e.to_string()))
    }
}

//! Per-block settlement vouchers.

use crate::error::{Error, Result};
use crate::identity::{verify_signature, Address, KeyPair};
use crate::ledger::FileId;
use serde::{Deserialize, Serialize};

/// Signing context for settlement vouchers.
pub const VOUCHER_CONTEXT: &[u8] = b"custody-settle-slice-v1";

/// A payer's signed authorization to pay for blocks `0..=slice_id` of an allocation.
///
/// The signature covers exactly `{file_id, payer, payee, slice_id,
/// pledge_height}`; the signature and public key are not part of the signed
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    /// File being read.
    pub file_id: FileId,
    /// Downloader paying for the blocks.
    pub payer: Address,
    /// Storage node being paid.
    pub payee: Address,
    /// Slice index this voucher pays up to.
    pub slice_id: u64,
    /// Height of the read allocation this voucher draws on.
    pub pledge_height: u64,
    /// Signature over the fields above.
    pub signature: Vec<u8>,
    /// Payer's serialized public key.
    pub public_key: Vec<u8>,
}

#[derive(Serialize)]
struct SignedFields<'a> {
    file_id: &'a FileId,
    payer: &'a Address,
    payee: &'a Address,
    slice_id: u64,
    pledge_height: u64,
}

impl Voucher {
    /// Mint and sign a voucher with the payer's key.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or signing fails.
    pub fn mint(
        file_id: &FileId,
        payer: &KeyPair,
        payee: Address,
        slice_id: u64,
        pledge_height: u64,
    ) -> Result<Self> {
        let mut voucher = Self {
            file_id: file_id.clone(),
            payer: payer.address(),
            payee,
            slice_id,
            pledge_height,
            signature: Vec::new(),
            public_key: payer.public_key_bytes().to_vec(),
        };
        voucher.signature = payer.sign(&voucher.signed_bytes()?, VOUCHER_CONTEXT)?;
        Ok(voucher)
    }

    /// Deterministic encoding of the signed fields.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn signed_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(&SignedFields {
            file_id: &self.file_id,
            payer: &self.payer,
            payee: &self.payee,
            slice_id: self.slice_id,
            pledge_height: self.pledge_height,
        })
        .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Check the signature against the transmitted public key.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedVoucher`] if fields are missing or cannot be parsed.
    /// - [`Error::BadSignature`] if the signature does not verify or the
    ///   public key does not belong to the payer.
    pub fn verify(&self) -> Result<()> {
        if self.file_id.is_empty() {
            return Err(Error::MalformedVoucher("missing file id".to_string()));
        }
        if self.signature.is_empty() {
            return Err(Error::MalformedVoucher("missing signature".to_string()));
        }
        if self.public_key.is_empty() {
            return Err(Error::MalformedVoucher("missing public key".to_string()));
        }

        verify_signature(
            &self.public_key,
            &self.signed_bytes()?,
            &self.signature,
            VOUCHER_CONTEXT,
            Error::MalformedVoucher,
        )
        .map_err(|e| match e {
            Error::BadSignature(reason) => {
                Error::BadSignature(format!("voucher slice {}: {reason}", self.slice_id))
            }
            other => other,
        })?;

        if Address::from_public_key(&self.public_key) != self.payer {
            return Err(Error::BadSignature(format!(
                "voucher slice {}: public key does not belong to payer {}",
                self.slice_id, self.payer
            )));
        }
        Ok(())
    }

    /// Encode for the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode a voucher received from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedVoucher`] if the bytes are not a voucher.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::MalformedVoucher(e.to_string()))
    }

    /// Hex encoding used on the session transport.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn to_hex(&self) -> Result<String> {
        Ok(hex::encode(self.encode()?))
    }

    /// Parse the hex encoding used on the session transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedVoucher`] if the text is not a hex-encoded voucher.
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| Error::MalformedVoucher(format!("invalid hex: {e}")))?;
        Self::decode(&bytes)
    }
}

/// True only if `voucher` is the immediate successor of `previous_slice`.
#[must_use]
pub fn check_ordering(previous_slice: u64, voucher: &Voucher) -> bool {
    previous_slice.checked_add(1) == Some(voucher.slice_id)
}

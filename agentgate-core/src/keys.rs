//! Signing key material
//!
//! RS256 keys for access-token signing. Keys are read from the filesystem
//! once at construction and cached for the life of the engine; the cold
//! read is the only filesystem I/O on the issuance path.

use crate::error::{AuthError, Result};
use jsonwebtoken::{DecodingKey, EncodingKey};
use std::path::Path;

/// RS256 signing and verification keys
pub struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SigningKeys {
    /// Load keys from PEM-encoded byte slices
    pub fn from_pems(private_pem: &[u8], public_pem: &[u8]) -> Result<Self> {
        let encoding = EncodingKey::from_rsa_pem(private_pem)
            .map_err(|e| AuthError::SigningKey(format!("invalid private key: {}", e)))?;
        let decoding = DecodingKey::from_rsa_pem(public_pem)
            .map_err(|e| AuthError::SigningKey(format!("invalid public key: {}", e)))?;
        Ok(Self { encoding, decoding })
    }

    /// Load keys from PEM files on disk
    pub fn from_pem_files(private_path: &Path, public_path: &Path) -> Result<Self> {
        let private_pem = std::fs::read(private_path).map_err(|e| {
            AuthError::SigningKey(format!(
                "cannot read private key {}: {}",
                private_path.display(),
                e
            ))
        })?;
        let public_pem = std::fs::read(public_path).map_err(|e| {
            AuthError::SigningKey(format!(
                "cannot read public key {}: {}",
                public_path.display(),
                e
            ))
        })?;
        Self::from_pems(&private_pem, &public_pem)
    }

    /// Key for signing
    pub fn encoding(&self) -> &EncodingKey {
        &self.encoding
    }

    /// Key for verification
    pub fn decoding(&self) -> &DecodingKey {
        &self.decoding
    }
}

impl std::fmt::Debug for SigningKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never appears in debug output.
        f.debug_struct("SigningKeys").finish_non_exhaustive()
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Credential abstraction over the device's TLS client key.
//!
//! The same P-256 key that authenticates the device over mutual TLS also
//! decrypts its configuration via ECIES. The key lives either in a PEM
//! file or in a PKCS#11 token; [`Credential`] hides the difference behind
//! one decrypt/encrypt/derive surface.
//!
//! A credential is constructed per operation and released deterministically
//! when dropped (the token session is closed on drop).

pub mod ecies;

#[cfg(feature = "pkcs11")]
pub mod pkcs11;

#[cfg(feature = "pkcs11")]
pub use pkcs11::{HsmConfig, HsmCredential};

use base64::prelude::*;
use p256::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
use p256::{PublicKey, SecretKey};

use crate::error::{Error, Result};

/// The device credential: an in-process EC key or a hardware token.
pub enum Credential {
    /// P-256 private scalar held in memory, loaded from a PEM file.
    Local {
        /// The private key.
        key: SecretKey,
    },

    /// Key held by a PKCS#11 token; ECDH is delegated to the hardware.
    ///
    /// Shared (`Arc`) because the TLS client certificate resolver signs
    /// handshakes through the same token session.
    #[cfg(feature = "pkcs11")]
    Hsm(std::sync::Arc<HsmCredential>),
}

impl Credential {
    /// Load a local credential from a PEM-encoded private key.
    ///
    /// Accepts both SEC1 (`EC PRIVATE KEY`) and PKCS#8 (`PRIVATE KEY`)
    /// encodings.
    pub fn from_key_pem(pem: &str) -> Result<Self> {
        let key = if pem.contains("BEGIN EC PRIVATE KEY") {
            SecretKey::from_sec1_pem(pem)
                .map_err(|e| Error::crypto(format!("unable to parse EC private key: {e}")))?
        } else {
            SecretKey::from_pkcs8_pem(pem)
                .map_err(|e| Error::crypto(format!("unable to parse private key: {e}")))?
        };
        Ok(Self::Local { key })
    }

    /// The public EC point of this credential.
    pub fn public(&self) -> PublicKey {
        match self {
            Self::Local { key } => key.public_key(),
            #[cfg(feature = "pkcs11")]
            Self::Hsm(hsm) => hsm.public(),
        }
    }

    /// The public key as a SubjectPublicKeyInfo PEM string.
    pub fn public_key_pem(&self) -> Result<String> {
        self.public()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::crypto(format!("unable to encode public key: {e}")))
    }

    /// Raw ECDH shared secret with a peer point: the big-endian X
    /// coordinate of `d*P`, zero padded to the curve byte length.
    pub fn derive_shared(&self, peer: &PublicKey) -> Result<Vec<u8>> {
        match self {
            Self::Local { key } => {
                let z = p256::ecdh::diffie_hellman(key.to_nonzero_scalar(), peer.as_affine());
                Ok(z.raw_secret_bytes().as_slice().to_vec())
            }
            #[cfg(feature = "pkcs11")]
            Self::Hsm(hsm) => hsm.derive_shared(peer),
        }
    }

    /// Decrypt a base64-encoded ECIES ciphertext.
    pub fn decrypt(&self, value: &str) -> Result<Vec<u8>> {
        let data = BASE64_STANDARD.decode(value)?;
        ecies::decrypt_with(|peer| self.derive_shared(peer), &data, b"", b"")
    }

    /// Encrypt a value under this credential's public key, returning the
    /// base64 of the ciphertext.
    pub fn encrypt(&self, value: &[u8]) -> Result<String> {
        let ct = ecies::encrypt(&self.public(), value, b"", b"")?;
        Ok(BASE64_STANDARD.encode(ct))
    }

    /// Whether this credential is backed by a PKCS#11 token.
    pub fn use_hsm(&self) -> bool {
        match self {
            Self::Local { .. } => false,
            #[cfg(feature = "pkcs11")]
            Self::Hsm(_) => true,
        }
    }
}

/// Generate a fresh local P-256 key, returning it with its SEC1
/// (`EC PRIVATE KEY`) PEM serialization.
pub fn generate_local_key() -> Result<(SecretKey, String)> {
    let key = SecretKey::random(&mut rand::rngs::OsRng);
    let pem = key
        .to_sec1_pem(LineEnding::LF)
        .map_err(|e| Error::crypto(format!("unable to serialize new private key: {e}")))?;
    Ok((key, pem.to_string()))
}

/// Convert a PKCS#11 slot id string into the CKA_ID byte sequence.
///
/// Config files carry slot ids as strings like `"07"`; the token wants
/// `[7]`. Each character is taken as a digit and leading zero bytes are
/// stripped.
pub fn id_to_bytes(id: &str) -> Vec<u8> {
    let bytes: Vec<u8> = id.bytes().map(|b| b.wrapping_sub(b'0')).collect();
    match bytes.iter().position(|&b| b != 0) {
        Some(start) => bytes[start..].to_vec(),
        None => vec![0],
    }
}

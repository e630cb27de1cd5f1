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

//! PKCS#11 token backend for the device credential.
//!
//! The private key never leaves the token: TLS handshake signatures and
//! the ECIES key agreement (`C_DeriveKey` with the ECDH1 mechanism) are
//! both performed by the hardware. Keys and certificates are addressed by
//! their `CKA_ID` slot bytes as configured in `p11.tls_pkey_id` /
//! `p11.tls_clientcert_id`.
//!
//! Tested against SoftHSM 2.x; other PKCS#11 implementations that support
//! `CKM_ECDH1_DERIVE` should work.

use std::sync::Mutex;

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::elliptic_curve::{Ecdh1DeriveParams, EcKdf};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, CertificateType, KeyType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::types::AuthPin;
use der::Encode;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Shared-secret length for P-256: the byte length of the X coordinate.
const SHARED_SECRET_LEN: u64 = 32;

/// Connection parameters for the token, taken from the `p11.*` config keys.
#[derive(Debug, Clone)]
pub struct HsmConfig {
    /// Path to the PKCS#11 module (`p11.module`).
    pub module: String,
    /// Token label (`p11.label`, default `aktualizr`).
    pub label: String,
    /// User PIN (`p11.pass`).
    pub pin: String,
}

/// A logged-in token session bound to one private key.
pub struct HsmCredential {
    #[allow(dead_code)] // owns the library handle for the session's lifetime
    pkcs11: Pkcs11,
    session: Mutex<Session>,
    private_key: ObjectHandle,
    public: PublicKey,
}

impl HsmCredential {
    /// Open the token and locate the private key stored at `key_id`.
    pub fn open(config: &HsmConfig, key_id: &[u8]) -> Result<Self> {
        let pkcs11 = Pkcs11::new(&config.module).map_err(|e| {
            Error::hsm(format!(
                "failed to load PKCS#11 library at {}: {}",
                config.module, e
            ))
        })?;
        pkcs11
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|e| Error::hsm(format!("failed to initialize PKCS#11 library: {e}")))?;

        let slots = pkcs11
            .get_slots_with_token()
            .map_err(|e| Error::hsm(format!("failed to get slots: {e}")))?;
        let slot = slots
            .into_iter()
            .find(|s| {
                pkcs11
                    .get_token_info(*s)
                    .map(|info| info.label().trim() == config.label)
                    .unwrap_or(false)
            })
            .ok_or_else(|| Error::hsm(format!("no token labelled '{}' found", config.label)))?;

        let session = pkcs11
            .open_rw_session(slot)
            .map_err(|e| Error::hsm(format!("failed to open session: {e}")))?;
        session
            .login(UserType::User, Some(&AuthPin::new(config.pin.clone())))
            .map_err(|e| Error::hsm(format!("failed to login to token: {e}")))?;

        let private_key = find_one(
            &session,
            &[
                Attribute::Class(ObjectClass::PRIVATE_KEY),
                Attribute::Id(key_id.to_vec()),
            ],
        )?
        .ok_or_else(|| Error::hsm(format!("no private key at slot {key_id:02x?}")))?;

        let public = read_public_key(&session, key_id)?;

        Ok(Self {
            pkcs11,
            session: Mutex::new(session),
            private_key,
            public,
        })
    }

    /// The public point of the bound private key.
    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// ECDH through the token: `C_DeriveKey` with `CKM_ECDH1_DERIVE` and a
    /// null KDF, yielding the raw X coordinate as a throwaway session
    /// secret that is read out and destroyed.
    pub fn derive_shared(&self, peer: &PublicKey) -> Result<Vec<u8>> {
        let session = self.session.lock().unwrap();
        let point = peer.to_encoded_point(false);
        let params = Ecdh1DeriveParams::new(EcKdf::null(), point.as_bytes());
        let template = [
            Attribute::Class(ObjectClass::SECRET_KEY),
            Attribute::KeyType(KeyType::GENERIC_SECRET),
            Attribute::Token(false),
            Attribute::Sensitive(false),
            Attribute::Extractable(true),
            Attribute::ValueLen(SHARED_SECRET_LEN.into()),
        ];
        let secret = session
            .derive_key(&Mechanism::Ecdh1Derive(params), self.private_key, &template)
            .map_err(|e| Error::hsm(format!("ECDH derive failed: {e}")))?;

        let attrs = session
            .get_attributes(secret, &[AttributeType::Value])
            .map_err(|e| Error::hsm(format!("failed to read derived secret: {e}")))?;
        let value = match attrs.first() {
            Some(Attribute::Value(v)) => v.clone(),
            _ => return Err(Error::hsm("derived secret has no value")),
        };
        let _ = session.destroy_object(secret);
        Ok(value)
    }

    /// Sign `msg` with the bound key: SHA-256 digest, `CKM_ECDSA`, result
    /// re-encoded as a DER ECDSA-Sig-Value.
    pub fn sign_ecdsa_sha256(&self, msg: &[u8]) -> Result<Vec<u8>> {
        self.sign_with(self.private_key, msg)
    }

    /// As [`sign_ecdsa_sha256`](Self::sign_ecdsa_sha256) but with an
    /// explicit key handle (used for a freshly generated rotation key).
    pub fn sign_with(&self, key: ObjectHandle, msg: &[u8]) -> Result<Vec<u8>> {
        let digest = Sha256::digest(msg);
        let session = self.session.lock().unwrap();
        let raw = session
            .sign(&Mechanism::Ecdsa, key, &digest)
            .map_err(|e| Error::hsm(format!("failed to sign: {e}")))?;
        let sig = p256::ecdsa::Signature::from_slice(&raw)
            .map_err(|e| Error::hsm(format!("token returned malformed signature: {e}")))?;
        Ok(sig.to_der().as_bytes().to_vec())
    }

    /// DER of the certificate stored at `cert_id`.
    pub fn certificate_der(&self, cert_id: &[u8]) -> Result<Vec<u8>> {
        let session = self.session.lock().unwrap();
        let handle = find_one(
            &session,
            &[
                Attribute::Class(ObjectClass::CERTIFICATE),
                Attribute::Id(cert_id.to_vec()),
            ],
        )?
        .ok_or_else(|| Error::hsm(format!("no certificate at slot {cert_id:02x?}")))?;
        let attrs = session
            .get_attributes(handle, &[AttributeType::Value])
            .map_err(|e| Error::hsm(format!("failed to read certificate: {e}")))?;
        match attrs.first() {
            Some(Attribute::Value(v)) => Ok(v.clone()),
            _ => Err(Error::hsm("certificate object has no value")),
        }
    }

    /// Remove any key pair stored at `id`.
    pub fn delete_key_pair(&self, id: &[u8]) -> Result<()> {
        self.destroy_all(&[
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::Id(id.to_vec()),
        ])?;
        self.destroy_all(&[
            Attribute::Class(ObjectClass::PUBLIC_KEY),
            Attribute::Id(id.to_vec()),
        ])
    }

    /// Remove any certificate stored at `id`.
    pub fn delete_certificate(&self, id: &[u8]) -> Result<()> {
        self.destroy_all(&[
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::Id(id.to_vec()),
        ])
    }

    /// Generate a new P-256 key pair at `id` with label `tls`.
    ///
    /// `CKA_DERIVE` is set on both halves - the default ECDSA templates of
    /// most tooling omit it, and without it the token refuses the ECDH
    /// required for ECIES decryption.
    pub fn generate_tls_keypair(&self, id: &[u8]) -> Result<(ObjectHandle, PublicKey)> {
        let ec_params = const_oid::db::rfc5912::SECP_256_R_1
            .to_der()
            .map_err(|e| Error::hsm(format!("unable to encode curve OID: {e}")))?;
        let label = b"tls".to_vec();
        let pub_template = [
            Attribute::EcParams(ec_params),
            Attribute::Label(label.clone()),
            Attribute::Id(id.to_vec()),
            Attribute::Token(true),
            Attribute::Verify(true),
            Attribute::Derive(true),
        ];
        let priv_template = [
            Attribute::Label(label),
            Attribute::Id(id.to_vec()),
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Sign(true),
            Attribute::Derive(true),
        ];

        let session = self.session.lock().unwrap();
        let (pub_handle, priv_handle) = session
            .generate_key_pair(&Mechanism::EccKeyPairGen, &pub_template, &priv_template)
            .map_err(|e| Error::hsm(format!("unable to generate new keypair in HSM: {e}")))?;

        let attrs = session
            .get_attributes(pub_handle, &[AttributeType::EcPoint])
            .map_err(|e| Error::hsm(format!("failed to read EC_POINT: {e}")))?;
        let point = match attrs.first() {
            Some(Attribute::EcPoint(p)) => parse_ec_point(p)?,
            _ => return Err(Error::hsm("generated key has no EC_POINT")),
        };
        Ok((priv_handle, point))
    }

    /// Import a certificate at `id` with the given label.
    pub fn import_certificate(
        &self,
        id: &[u8],
        label: &[u8],
        cert_der: &[u8],
        subject_der: &[u8],
    ) -> Result<()> {
        let template = [
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::CertificateType(CertificateType::X_509),
            Attribute::Token(true),
            Attribute::Id(id.to_vec()),
            Attribute::Label(label.to_vec()),
            Attribute::Value(cert_der.to_vec()),
            Attribute::Subject(subject_der.to_vec()),
        ];
        let session = self.session.lock().unwrap();
        session
            .create_object(&template)
            .map_err(|e| Error::hsm(format!("unable to import certificate into HSM: {e}")))?;
        Ok(())
    }

    fn destroy_all(&self, template: &[Attribute]) -> Result<()> {
        let session = self.session.lock().unwrap();
        let handles = session
            .find_objects(template)
            .map_err(|e| Error::hsm(format!("failed to find objects: {e}")))?;
        for handle in handles {
            session
                .destroy_object(handle)
                .map_err(|e| Error::hsm(format!("failed to destroy object: {e}")))?;
        }
        Ok(())
    }
}

impl Drop for HsmCredential {
    fn drop(&mut self) {
        if let Ok(session) = self.session.lock() {
            let _ = session.logout();
        }
    }
}

fn find_one(session: &Session, template: &[Attribute]) -> Result<Option<ObjectHandle>> {
    session
        .find_objects(template)
        .map_err(|e| Error::hsm(format!("failed to find object: {e}")))
        .map(|handles| handles.into_iter().next())
}

fn read_public_key(session: &Session, key_id: &[u8]) -> Result<PublicKey> {
    let handle = find_one(
        session,
        &[
            Attribute::Class(ObjectClass::PUBLIC_KEY),
            Attribute::Id(key_id.to_vec()),
        ],
    )?
    .ok_or_else(|| Error::hsm(format!("no public key at slot {key_id:02x?}")))?;

    let attrs = session
        .get_attributes(handle, &[AttributeType::EcPoint])
        .map_err(|e| Error::hsm(format!("failed to read EC_POINT: {e}")))?;
    match attrs.first() {
        Some(Attribute::EcPoint(p)) => parse_ec_point(p),
        _ => Err(Error::hsm("public key has no EC_POINT")),
    }
}

// CKA_EC_POINT is a DER OCTET STRING wrapping the SEC1 point; some tokens
// hand back the bare point instead.
fn parse_ec_point(bytes: &[u8]) -> Result<PublicKey> {
    let point = if bytes.len() == 67 && bytes[0] == 0x04 && bytes[1] == 0x41 {
        &bytes[2..]
    } else {
        bytes
    };
    PublicKey::from_sec1_bytes(point)
        .map_err(|e| Error::hsm(format!("token returned invalid EC point: {e}")))
}

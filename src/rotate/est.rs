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

//! EST re-enrollment: the first rotation step.
//!
//! Generates a fresh P-256 key (in memory or in the token's next slot),
//! builds a PKCS#10 request reusing the current certificate's subject,
//! POSTs it to `<est>/simplereenroll`, and sanity checks the returned
//! certificate before recording it in the rotation state.

use async_trait::async_trait;
use base64::prelude::*;
use const_oid::db::rfc5912::{ECDSA_WITH_SHA_256, ID_EXTENSION_REQ, ID_KP_CLIENT_AUTH};
use const_oid::AssociatedOid;
use der::asn1::{BitString, OctetString, SetOfVec};
use der::{Any, Decode, Encode, EncodePem};
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::attr::Attribute;
use x509_cert::ext::pkix::{ExtendedKeyUsage, KeyUsage, KeyUsages};
use x509_cert::ext::Extension;
use x509_cert::request::{CertReq, CertReqInfo, Version};
use x509_cert::Certificate;

use crate::app_config::AppConfig;
use crate::crypto::generate_local_key;
use crate::error::{Error, Result};
use crate::http;
use crate::state::{StateContext, StateStep};

use super::CertRotationState;

const PKCS7_MIME: &str = "application/pkcs7-mime";

pub(crate) struct EstStep;

#[async_trait]
impl StateStep<CertRotationState> for EstStep {
    fn name(&self) -> &'static str {
        "Generate new certificate"
    }

    async fn execute(&self, ctx: &mut StateContext<'_, CertRotationState>) -> Result<()> {
        // The EST server keys re-enrollment off the current cert's subject
        let current = Certificate::from_der(&ctx.client_cert_der)
            .map_err(|e| Error::certificate_parsing(format!("unable to parse client cert: {e}")))?;

        let (new_key, csr_der) = generate_key_and_csr(ctx, &current)?;

        let url = format!("{}/simplereenroll", ctx.state.est_server);
        let body = BASE64_STANDARD.encode(&csr_der).into_bytes();
        let res = http::post_raw(&ctx.client, &url, "application/pkcs10", body).await?;
        if res.status != 201 {
            return Err(Error::status("POST", &url, res.status, &res.body));
        }
        match res.header("content-type") {
            Some(PKCS7_MIME) => {}
            other => {
                return Err(Error::cms_parsing(format!(
                    "unexpected content-type in certificate response: {other:?}"
                )))
            }
        }

        let new_cert = crate::pkcs7::parse_certs_only(&res.body)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::cms_parsing("no certificates in EST response"))?;
        verify_new_cert(&current, &new_cert)?;

        store_new_cert(ctx, &new_cert)?;
        ctx.state.new_key = new_key;
        Ok(())
    }
}

// Returns (state value for NewKey, DER CSR).
fn generate_key_and_csr(
    ctx: &StateContext<'_, CertRotationState>,
    current: &Certificate,
) -> Result<(String, Vec<u8>)> {
    match &ctx.crypto {
        crate::crypto::Credential::Local { .. } => {
            let (secret, pem) = generate_local_key()?;
            let signing = p256::ecdsa::SigningKey::from(&secret);
            let csr = build_csr(current, &secret.public_key(), |tbs| {
                use p256::ecdsa::signature::Signer;
                let sig: p256::ecdsa::Signature = signing.sign(tbs);
                Ok(sig.to_der().as_bytes().to_vec())
            })?;
            Ok((pem, csr))
        }
        #[cfg(feature = "pkcs11")]
        crate::crypto::Credential::Hsm(hsm) => {
            let slot = next_slot(
                &ctx.app.sota,
                "p11.tls_pkey_id",
                &ctx.state.pkey_slot_ids,
                "07",
            );
            let id = crate::crypto::id_to_bytes(&slot);
            hsm.delete_key_pair(&id)
                .map_err(|e| Error::hsm(format!("unable to free up slot({slot}): {e}")))?;
            let (handle, public) = hsm.generate_tls_keypair(&id)?;
            let csr = build_csr(current, &public, |tbs| hsm.sign_with(handle, tbs))?;
            Ok((slot, csr))
        }
    }
}

fn store_new_cert(
    ctx: &mut StateContext<'_, CertRotationState>,
    new_cert: &Certificate,
) -> Result<()> {
    if !ctx.crypto.use_hsm() {
        ctx.state.new_cert = new_cert
            .to_pem(der::pem::LineEnding::LF)
            .map_err(|e| Error::certificate_parsing(format!("unable to encode new cert: {e}")))?;
        return Ok(());
    }
    #[cfg(feature = "pkcs11")]
    if let crate::crypto::Credential::Hsm(hsm) = &ctx.crypto {
        let slot = next_slot(
            &ctx.app.sota,
            "p11.tls_clientcert_id",
            &ctx.state.cert_slot_ids,
            "09",
        );
        let id = crate::crypto::id_to_bytes(&slot);
        hsm.delete_certificate(&id)
            .map_err(|e| Error::hsm(format!("unable to free up slot({slot}): {e}")))?;
        hsm.import_certificate(
            &id,
            b"client",
            &new_cert.to_der()?,
            &new_cert.tbs_certificate.subject.to_der()?,
        )?;
        ctx.state.new_cert = slot;
    }
    Ok(())
}

// Pick the first configured slot id we are not currently using.
fn next_slot(sota: &AppConfig, config_key: &str, ids: &[String], fallback: &str) -> String {
    let current = sota.get_or_fail(config_key);
    for id in ids {
        if *id != current {
            return id.clone();
        }
    }
    tracing::error!("unable to find a new slot id, will use slot {}", fallback);
    fallback.to_string()
}

/// Build a PKCS#10 request for `public`, reusing `current`'s subject and
/// requesting KeyUsage=digitalSignature + EKU=TLS client auth.
///
/// `sign` receives the DER of the CertificationRequestInfo and must
/// return a DER-encoded ECDSA-with-SHA256 signature.
pub(crate) fn build_csr<F>(
    current: &Certificate,
    public: &p256::PublicKey,
    sign: F,
) -> Result<Vec<u8>>
where
    F: FnOnce(&[u8]) -> Result<Vec<u8>>,
{
    use p256::pkcs8::EncodePublicKey;

    let spki_der = public
        .to_public_key_der()
        .map_err(|e| Error::csr(format!("unable to encode public key: {e}")))?;
    let public_key = SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes())?;

    let key_usage = KeyUsage(KeyUsages::DigitalSignature.into());
    let eku = ExtendedKeyUsage(vec![ID_KP_CLIENT_AUTH]);
    let extensions: x509_cert::ext::Extensions = vec![
        Extension {
            extn_id: KeyUsage::OID,
            critical: true,
            extn_value: OctetString::new(key_usage.to_der()?)?,
        },
        Extension {
            extn_id: ExtendedKeyUsage::OID,
            critical: true,
            extn_value: OctetString::new(eku.to_der()?)?,
        },
    ];

    let mut attributes = SetOfVec::new();
    attributes
        .insert(Attribute {
            oid: ID_EXTENSION_REQ,
            values: SetOfVec::try_from(vec![Any::from_der(&extensions.to_der()?)?])?,
        })
        .map_err(Error::Der)?;

    let info = CertReqInfo {
        version: Version::V1,
        subject: current.tbs_certificate.subject.clone(),
        public_key,
        attributes,
    };

    let signature = sign(&info.to_der()?)?;
    let req = CertReq {
        info,
        algorithm: AlgorithmIdentifierOwned {
            oid: ECDSA_WITH_SHA_256,
            parameters: None,
        },
        signature: BitString::from_bytes(&signature)?,
    };
    Ok(req.to_der()?)
}

/// Minimal sanity checks on a re-enrolled certificate: the subject must
/// be unchanged and the required extensions present.
pub(crate) fn verify_new_cert(current: &Certificate, new_cert: &Certificate) -> Result<()> {
    if current.tbs_certificate.subject != new_cert.tbs_certificate.subject {
        return Err(Error::certificate_parsing(
            "new cert's subject does not match current cert's",
        ));
    }

    let mut digital_signature = false;
    let mut client_auth = false;
    if let Some(extensions) = &new_cert.tbs_certificate.extensions {
        for ext in extensions {
            if ext.extn_id == KeyUsage::OID {
                if let Ok(ku) = KeyUsage::from_der(ext.extn_value.as_bytes()) {
                    digital_signature = ku.digital_signature();
                }
            } else if ext.extn_id == ExtendedKeyUsage::OID {
                if let Ok(parsed) = ExtendedKeyUsage::from_der(ext.extn_value.as_bytes()) {
                    client_auth = parsed.0.contains(&ID_KP_CLIENT_AUTH);
                }
            }
        }
    }

    if digital_signature && client_auth {
        Ok(())
    } else {
        Err(Error::certificate_parsing(
            "missing required extensions for Digital Signature and/or TLS Web Client Authentication",
        ))
    }
}

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

//! Root CA renewal.
//!
//! Fetches the CA bundle from `<est>/cacerts` and replaces the local
//! trust anchor file after validating continuity with the current bundle.
//! The validation supports a 2-phase root replacement: phase 1 serves
//! `{current, cross-signed(new key), self-signed(new key)}`, phase 2
//! serves only the self-signed replacement. A client that saw either
//! phase can verify the chain back to what it already trusts.

use async_trait::async_trait;
use const_oid::db::rfc5912::ECDSA_WITH_SHA_256;
use const_oid::AssociatedOid;
use der::{Decode, Encode, EncodePem};
use serde::{Deserialize, Serialize};
use x509_cert::ext::pkix::BasicConstraints;
use x509_cert::Certificate;

use crate::app::App;
use crate::error::{Error, Result};
use crate::http;
use crate::safe_write::safe_write;
use crate::state::{
    default_correlation_id, load_state, StateContext, StateHandler, StateRecord, StateStep,
};

/// Default name of the renewal state file inside `storage.path`.
pub const STATE_FILE: &str = "root-renewal.state";

const PKCS7_MIME: &str = "application/pkcs7-mime";

/// Durable progress of a root renewal (a single fetch step).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RootRenewalState {
    #[serde(rename = "RotationId", default)]
    pub rotation_id: String,
    #[serde(rename = "StepIdx", default)]
    pub step_idx: usize,
    #[serde(rename = "EstServer", default)]
    pub est_server: String,
}

impl StateRecord for RootRenewalState {
    fn correlation_id(&mut self) -> String {
        if self.rotation_id.is_empty() {
            self.rotation_id = default_correlation_id();
        }
        self.rotation_id.clone()
    }

    fn current_step(&self) -> usize {
        self.step_idx
    }

    fn advance(&mut self) {
        self.step_idx += 1;
    }
}

/// Drives a [`RootRenewalState`] to completion.
pub struct RootRenewalHandler<'a> {
    /// The underlying durable runtime; exposed so callers can swap the
    /// event sink or restarter.
    pub inner: StateHandler<'a, RootRenewalState>,
}

impl<'a> RootRenewalHandler<'a> {
    /// Construct a handler to renew against `est_server`.
    pub fn new(
        app: &'a mut App,
        state_file: impl Into<std::path::PathBuf>,
        est_server: &str,
    ) -> Result<Self> {
        let state = RootRenewalState {
            est_server: est_server.to_string(),
            ..Default::default()
        };
        Self::with_state(app, state_file.into(), state)
    }

    /// Load a previous renewal attempt, or `None` when none is pending.
    pub fn restore(
        app: &'a mut App,
        state_file: impl Into<std::path::PathBuf>,
    ) -> Result<Option<Self>> {
        let state_file = state_file.into();
        match load_state::<RootRenewalState>(&state_file) {
            None => Ok(None),
            Some(state) => Self::with_state(app, state_file, state).map(Some),
        }
    }

    fn with_state(
        app: &'a mut App,
        state_file: std::path::PathBuf,
        state: RootRenewalState,
    ) -> Result<Self> {
        let ctx = StateContext::for_app(app, state_file, state)?;
        Ok(Self {
            inner: StateHandler {
                ctx,
                steps: vec![Box::new(FetchRootStep)],
                restarter: Box::new(crate::services::SystemctlRestarter),
            },
        })
    }

    /// Run the renewal.
    pub async fn update(&mut self) -> Result<()> {
        self.inner
            .execute("RootCaUpdateStarted", "RootCaUpdateCompleted", true)
            .await
    }

    /// Complete an interrupted renewal. Everything here needs the
    /// network, so offline we only log.
    pub async fn resume(&mut self, online: bool) -> Result<()> {
        if !online {
            tracing::info!("incomplete root CA renewal state found");
            return Ok(());
        }
        tracing::info!("incomplete root CA renewal state found, attempting to complete");
        self.update().await
    }
}

struct FetchRootStep;

#[async_trait]
impl StateStep<RootRenewalState> for FetchRootStep {
    fn name(&self) -> &'static str {
        "Fetch new root"
    }

    async fn execute(&self, ctx: &mut StateContext<'_, RootRenewalState>) -> Result<()> {
        let ca_file = ctx.app.sota.get_or_fail("import.tls_cacert_path");
        let ca_buf = std::fs::read(&ca_file)?;
        let current = Certificate::load_pem_chain(&ca_buf)
            .map_err(|e| Error::certificate_parsing(format!("unable to parse root CA file: {e}")))?;
        if current.is_empty() {
            return Err(Error::certificate_parsing("root CA file has no certificates"));
        }

        let url = format!("{}/cacerts", ctx.state.est_server);
        let res = http::get(&ctx.client, &url, None).await?;
        if res.status != 200 {
            return Err(Error::status("GET", &url, res.status, &res.body));
        }
        match res.header("content-type") {
            Some(PKCS7_MIME) => {}
            other => {
                return Err(Error::cms_parsing(format!(
                    "unexpected content-type in root certificate response: {other:?}"
                )))
            }
        }
        let new_certs = crate::pkcs7::parse_certs_only(&res.body)?;
        if new_certs.is_empty() {
            return Err(Error::cms_parsing("no certificates in EST response"));
        }

        validate_root_certs(&current, &new_certs, ctx.app.unsafe_root_renewal)?;

        let mut content = String::new();
        for cert in &new_certs {
            content.push_str(
                &cert
                    .to_pem(der::pem::LineEnding::LF)
                    .map_err(|e| Error::certificate_parsing(format!("unable to encode CA: {e}")))?,
            );
        }
        safe_write(&ca_file, content.as_bytes())
    }
}

/// Validate a fetched CA bundle against the currently trusted one.
///
/// Every new certificate must be a CA whose subject equals the current
/// CAs' common subject, and must be either (a) a current CA, (b) signed
/// by a current CA, or (c) share its public key with a cert satisfying
/// (b). With `skip_signature_check` only the CA and subject checks run.
pub fn validate_root_certs(
    current: &[Certificate],
    new_certs: &[Certificate],
    skip_signature_check: bool,
) -> Result<()> {
    // All certs must share one subject; the first current CA defines it
    let subject = &current[0].tbs_certificate.subject;

    let mut signed_keys = Vec::new();
    let mut covered = vec![false; new_certs.len()];

    // First pass: conditions (a) and (b), remembering the public keys of
    // certs that cleared (b)
    for (idx, cert) in new_certs.iter().enumerate() {
        let serial = serial_hex(cert);
        if cert.tbs_certificate.subject != *subject {
            return Err(Error::ca_validation(format!(
                "unexpected subject '{}' in certificate with serial {}, must be '{}'",
                cert.tbs_certificate.subject, serial, subject
            )));
        }
        if !is_ca(cert) {
            return Err(Error::ca_validation(format!(
                "certificate with serial {serial} is not a certificate authority"
            )));
        }
        if skip_signature_check {
            covered[idx] = true;
            continue;
        }
        for ca in current {
            if cert == ca {
                covered[idx] = true;
                break;
            }
            if check_signature_from(cert, ca) {
                signed_keys.push(cert.tbs_certificate.subject_public_key_info.clone());
                covered[idx] = true;
                break;
            }
        }
    }

    // Second pass: condition (c)
    for (idx, cert) in new_certs.iter().enumerate() {
        if covered[idx] {
            continue;
        }
        let spki = &cert.tbs_certificate.subject_public_key_info;
        if !signed_keys.iter().any(|signed| signed == spki) {
            return Err(Error::ca_validation(format!(
                "certificate with serial {} is neither (1) signed by one of current CAs \
                 nor (2) has the same public key as another certificate which is signed \
                 by one of current CAs",
                serial_hex(cert)
            )));
        }
    }
    Ok(())
}

fn serial_hex(cert: &Certificate) -> String {
    cert.tbs_certificate
        .serial_number
        .as_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn is_ca(cert: &Certificate) -> bool {
    let Some(extensions) = &cert.tbs_certificate.extensions else {
        return false;
    };
    for ext in extensions {
        if ext.extn_id == BasicConstraints::OID {
            return BasicConstraints::from_der(ext.extn_value.as_bytes())
                .map(|bc| bc.ca)
                .unwrap_or(false);
        }
    }
    false
}

// Cryptographic "issued by": issuer name matches and the ECDSA-P256
// signature verifies under the CA's key. Other signature algorithms are
// simply not trusted here - the fleet PKI is P-256 end to end.
fn check_signature_from(cert: &Certificate, ca: &Certificate) -> bool {
    use p256::ecdsa::signature::Verifier;
    use p256::pkcs8::DecodePublicKey;

    if cert.tbs_certificate.issuer != ca.tbs_certificate.subject {
        return false;
    }
    if cert.signature_algorithm.oid != ECDSA_WITH_SHA_256 {
        return false;
    }
    let Ok(spki_der) = ca.tbs_certificate.subject_public_key_info.to_der() else {
        return false;
    };
    let Ok(verifying_key) = p256::ecdsa::VerifyingKey::from_public_key_der(&spki_der) else {
        return false;
    };
    let Ok(tbs) = cert.tbs_certificate.to_der() else {
        return false;
    };
    let Some(sig_bytes) = cert.signature.as_bytes() else {
        return false;
    };
    let Ok(signature) = p256::ecdsa::Signature::from_der(sig_bytes) else {
        return false;
    };
    verifying_key.verify(&tbs, &signature).is_ok()
}

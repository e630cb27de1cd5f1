//! PKCS#7/CMS helpers for EST payloads.
//!
//! EST servers deliver certificates as base64-encoded "certs-only"
//! SignedData envelopes (`application/pkcs7-mime`). This module parses
//! those responses and can build the degenerate envelope for tests and
//! tooling.

use base64::prelude::*;
use cms::content_info::{CmsVersion, ContentInfo};
use cms::cert::CertificateChoices;
use cms::signed_data::{CertificateSet, SignedData, SignerInfos};
use const_oid::db::rfc5911::{ID_DATA, ID_SIGNED_DATA};
use der::asn1::SetOfVec;
use der::{Any, Decode, Encode};
use x509_cert::Certificate;

use crate::error::{Error, Result};

/// Parse a PKCS#7 certs-only response body (base64 over DER).
pub fn parse_certs_only(body: &[u8]) -> Result<Vec<Certificate>> {
    let der_bytes = decode_base64(body)?;

    let content_info = ContentInfo::from_der(&der_bytes)
        .map_err(|e| Error::cms_parsing(format!("failed to parse ContentInfo: {e}")))?;
    let signed_data = extract_signed_data(&content_info)?;
    extract_certificates(&signed_data)
}

/// Build a degenerate certs-only SignedData envelope, base64 encoded.
///
/// This is the inverse of [`parse_certs_only`] and matches what EST
/// servers emit for `/cacerts` and `/simplereenroll`.
pub fn build_certs_only(certs: &[Certificate]) -> Result<Vec<u8>> {
    let choices: Vec<CertificateChoices> = certs
        .iter()
        .cloned()
        .map(CertificateChoices::Certificate)
        .collect();
    let cert_set = CertificateSet(
        SetOfVec::try_from(choices)
            .map_err(|e| Error::cms_parsing(format!("failed to build certificate set: {e}")))?,
    );

    let signed_data = SignedData {
        version: CmsVersion::V1,
        digest_algorithms: SetOfVec::new(),
        encap_content_info: cms::signed_data::EncapsulatedContentInfo {
            econtent_type: ID_DATA,
            econtent: None,
        },
        certificates: Some(cert_set),
        crls: None,
        signer_infos: SignerInfos(SetOfVec::new()),
    };

    let content_info = ContentInfo {
        content_type: ID_SIGNED_DATA,
        content: Any::encode_from(&signed_data)
            .map_err(|e| Error::cms_parsing(format!("failed to encode SignedData: {e}")))?,
    };

    let der = content_info
        .to_der()
        .map_err(|e| Error::cms_parsing(format!("failed to encode ContentInfo: {e}")))?;
    Ok(BASE64_STANDARD.encode(der).into_bytes())
}

/// Decode base64 data, tolerating embedded line breaks.
fn decode_base64(data: &[u8]) -> Result<Vec<u8>> {
    let cleaned: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    BASE64_STANDARD.decode(&cleaned).map_err(Error::Base64)
}

fn extract_signed_data(content_info: &ContentInfo) -> Result<SignedData> {
    if content_info.content_type != ID_SIGNED_DATA {
        return Err(Error::cms_parsing(format!(
            "expected SignedData OID, got {}",
            content_info.content_type
        )));
    }

    let content = content_info
        .content
        .to_der()
        .map_err(|e| Error::cms_parsing(format!("failed to encode content: {e}")))?;
    SignedData::from_der(&content)
        .map_err(|e| Error::cms_parsing(format!("failed to parse SignedData: {e}")))
}

fn extract_certificates(signed_data: &SignedData) -> Result<Vec<Certificate>> {
    let cert_set = match &signed_data.certificates {
        Some(certs) => certs,
        None => return Ok(Vec::new()),
    };

    let mut certificates = Vec::new();
    for cert_choice in cert_set.0.iter() {
        // CertificateChoices can also carry attribute certs; only standard
        // X.509 certificates are kept
        let cert_der = cert_choice
            .to_der()
            .map_err(|e| Error::cms_parsing(format!("failed to encode certificate: {e}")))?;
        match Certificate::from_der(&cert_der) {
            Ok(cert) => certificates.push(cert),
            Err(e) => {
                tracing::warn!("skipping non-X.509 certificate: {}", e);
            }
        }
    }
    Ok(certificates)
}

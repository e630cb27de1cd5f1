//! Mutual-TLS client construction.
//!
//! Builds the `reqwest` client the agent uses for all gateway and EST
//! traffic, together with the [`Credential`] backing its client
//! certificate. The CA pool and identity come from the layered config;
//! the identity is either a PEM pair on disk or a PKCS#11 token that
//! signs the handshake without releasing the key.

use std::time::Duration;

use crate::app_config::AppConfig;
use crate::crypto::Credential;
use crate::error::{Error, Result};

/// Per-attempt request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the mutual-TLS client from the layered config.
///
/// Returns the HTTP client, the credential sharing its private key, and
/// the DER of the current client certificate (needed to build re-enroll
/// CSRs).
///
/// Config keys consumed: `tls.ca_source` (must be `file`),
/// `tls.pkey_source`/`tls.cert_source` (equal, `file` or `pkcs11`),
/// `import.tls_cacert_path`, and either the `import.tls_pkey_path` /
/// `import.tls_clientcert_path` pair or the `p11.*` keys.
pub fn create_client(sota: &AppConfig) -> Result<(reqwest::Client, Credential, Vec<u8>)> {
    let ca_source = sota.get_or_fail("tls.ca_source");
    if ca_source != "file" {
        return Err(Error::config(format!("invalid tls.ca_source: {ca_source}")));
    }
    let source = sota.get_or_fail("tls.pkey_source");
    let cert_source = sota.get_or_fail("tls.cert_source");
    if cert_source != source {
        return Err(Error::config(format!(
            "tls.cert_source ({cert_source}) must match tls.pkey_source ({source})"
        )));
    }

    let ca_pem = std::fs::read(sota.get_or_fail("import.tls_cacert_path"))?;

    match source.as_str() {
        "file" => create_client_local(sota, &ca_pem),
        "pkcs11" => create_client_pkcs11(sota, &ca_pem),
        other => Err(Error::config(format!("invalid tls.pkey_source: {other}"))),
    }
}

fn create_client_local(
    sota: &AppConfig,
    ca_pem: &[u8],
) -> Result<(reqwest::Client, Credential, Vec<u8>)> {
    let cert_pem = std::fs::read(sota.get_or_fail("import.tls_clientcert_path"))?;
    let key_pem = std::fs::read(sota.get_or_fail("import.tls_pkey_path"))?;

    let key_str = std::str::from_utf8(&key_pem)
        .map_err(|_| Error::tls("client private key is not valid PEM"))?;
    let credential = Credential::from_key_pem(key_str)?;
    let cert_der = first_certificate_der(&cert_pem)?;

    // Combine cert and key into a single PEM buffer for reqwest
    let mut identity_pem = cert_pem.clone();
    identity_pem.push(b'\n');
    identity_pem.extend_from_slice(&key_pem);
    let identity = reqwest::Identity::from_pem(&identity_pem)
        .map_err(|e| Error::tls(format!("failed to create client identity: {e}")))?;

    let mut builder = base_builder(ca_pem)?;
    builder = builder.identity(identity);
    let client = builder
        .build()
        .map_err(|e| Error::tls(format!("failed to build HTTP client: {e}")))?;

    Ok((client, credential, cert_der))
}

fn base_builder(ca_pem: &[u8]) -> Result<reqwest::ClientBuilder> {
    let mut builder = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .use_rustls_tls()
        .tls_built_in_root_certs(false)
        .http1_only();
    for cert in reqwest::Certificate::from_pem_bundle(ca_pem)
        .map_err(|e| Error::tls(format!("failed to parse CA certificate: {e}")))?
    {
        builder = builder.add_root_certificate(cert);
    }
    Ok(builder)
}

/// Parse the first CERTIFICATE block out of a PEM buffer.
pub fn first_certificate_der(pem: &[u8]) -> Result<Vec<u8>> {
    let mut reader = std::io::BufReader::new(pem);
    for item in rustls_pemfile::certs(&mut reader) {
        match item {
            Ok(cert) => return Ok(cert.as_ref().to_vec()),
            Err(e) => return Err(Error::tls(format!("failed to parse PEM: {e}"))),
        }
    }
    Err(Error::tls("no certificates found in PEM data"))
}

#[cfg(not(feature = "pkcs11"))]
fn create_client_pkcs11(
    _sota: &AppConfig,
    _ca_pem: &[u8],
) -> Result<(reqwest::Client, Credential, Vec<u8>)> {
    Err(Error::config(
        "tls.pkey_source = pkcs11 but pkcs11 support is not compiled in",
    ))
}

#[cfg(feature = "pkcs11")]
fn create_client_pkcs11(
    sota: &AppConfig,
    ca_pem: &[u8],
) -> Result<(reqwest::Client, Credential, Vec<u8>)> {
    use std::sync::Arc;

    use crate::crypto::{id_to_bytes, HsmConfig, HsmCredential};

    let module = sota.get_or_fail("p11.module");
    let pin = sota.get_or_fail("p11.pass");
    let pkey_id = sota.get_or_fail("p11.tls_pkey_id");
    let cert_id = sota.get_or_fail("p11.tls_clientcert_id");
    let label = sota.get_default("p11.label", "aktualizr");

    let hsm = Arc::new(HsmCredential::open(
        &HsmConfig {
            module,
            label,
            pin,
        },
        &id_to_bytes(&pkey_id),
    )?);
    let cert_der = hsm.certificate_der(&id_to_bytes(&cert_id))?;

    let tls_config = pkcs11::client_config(ca_pem, cert_der.clone(), Arc::clone(&hsm))?;
    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .http1_only()
        .use_preconfigured_tls(tls_config)
        .build()
        .map_err(|e| Error::tls(format!("failed to build HTTP client: {e}")))?;

    Ok((client, Credential::Hsm(hsm), cert_der))
}

#[cfg(feature = "pkcs11")]
mod pkcs11 {
    //! rustls client identity backed by a PKCS#11 token.

    use std::sync::Arc;

    use rustls::client::ResolvesClientCert;
    use rustls::pki_types::CertificateDer;
    use rustls::sign::{CertifiedKey, Signer, SigningKey};
    use rustls::{SignatureAlgorithm, SignatureScheme};

    use crate::crypto::HsmCredential;
    use crate::error::{Error, Result};

    pub(super) fn client_config(
        ca_pem: &[u8],
        cert_der: Vec<u8>,
        hsm: Arc<HsmCredential>,
    ) -> Result<rustls::ClientConfig> {
        let mut roots = rustls::RootCertStore::empty();
        let mut reader = std::io::BufReader::new(ca_pem);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| Error::tls(format!("failed to parse CA cert: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| Error::tls(format!("failed to add CA cert: {e}")))?;
        }

        let certified = Arc::new(CertifiedKey::new(
            vec![CertificateDer::from(cert_der)],
            Arc::new(HsmSigningKey { hsm }),
        ));

        Ok(rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_cert_resolver(Arc::new(HsmCertResolver { certified })))
    }

    #[derive(Debug)]
    struct HsmCertResolver {
        certified: Arc<CertifiedKey>,
    }

    impl ResolvesClientCert for HsmCertResolver {
        fn resolve(
            &self,
            _root_hint_subjects: &[&[u8]],
            sigschemes: &[SignatureScheme],
        ) -> Option<Arc<CertifiedKey>> {
            if sigschemes.contains(&SignatureScheme::ECDSA_NISTP256_SHA256) {
                Some(Arc::clone(&self.certified))
            } else {
                None
            }
        }

        fn has_certs(&self) -> bool {
            true
        }
    }

    struct HsmSigningKey {
        hsm: Arc<HsmCredential>,
    }

    impl std::fmt::Debug for HsmSigningKey {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("HsmSigningKey")
        }
    }

    impl SigningKey for HsmSigningKey {
        fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
            if offered.contains(&SignatureScheme::ECDSA_NISTP256_SHA256) {
                Some(Box::new(HsmSigner {
                    hsm: Arc::clone(&self.hsm),
                }))
            } else {
                None
            }
        }

        fn algorithm(&self) -> SignatureAlgorithm {
            SignatureAlgorithm::ECDSA
        }
    }

    struct HsmSigner {
        hsm: Arc<HsmCredential>,
    }

    impl std::fmt::Debug for HsmSigner {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("HsmSigner")
        }
    }

    impl Signer for HsmSigner {
        fn sign(&self, message: &[u8]) -> std::result::Result<Vec<u8>, rustls::Error> {
            self.hsm
                .sign_ecdsa_sha256(message)
                .map_err(|e| rustls::Error::General(e.to_string()))
        }

        fn scheme(&self) -> SignatureScheme {
            SignatureScheme::ECDSA_NISTP256_SHA256
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Self-signed localhost pair generated for tests only
    fn test_assets(dir: &std::path::Path) -> AppConfig {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".into()])
            .unwrap()
            .self_signed(&key)
            .unwrap();

        std::fs::write(dir.join("root.crt"), cert.pem()).unwrap();
        std::fs::write(dir.join("client.pem"), cert.pem()).unwrap();
        std::fs::write(dir.join("pkey.pem"), key.serialize_pem()).unwrap();
        let sota = format!(
            r#"
[tls]
server = "https://dg"
ca_source = "file"
pkey_source = "file"
cert_source = "file"

[import]
tls_cacert_path = "{0}/root.crt"
tls_pkey_path = "{0}/pkey.pem"
tls_clientcert_path = "{0}/client.pem"

[storage]
path = "{0}"
"#,
            dir.display()
        );
        std::fs::write(dir.join("sota.toml"), sota).unwrap();
        AppConfig::new(&[dir.join("sota.toml")]).unwrap()
    }

    #[test]
    fn test_create_client_local() {
        let dir = tempfile::tempdir().unwrap();
        let sota = test_assets(dir.path());

        let (_client, credential, cert_der) = create_client(&sota).unwrap();
        assert!(!credential.use_hsm());
        assert!(!cert_der.is_empty());

        // The credential's public key matches the certificate's
        use der::Decode;
        let cert = x509_cert::Certificate::from_der(&cert_der).unwrap();
        let spki = cert
            .tbs_certificate
            .subject_public_key_info
            .subject_public_key
            .as_bytes()
            .unwrap()
            .to_vec();
        use p256::elliptic_curve::sec1::ToEncodedPoint;
        let point = credential.public().to_encoded_point(false);
        assert_eq!(spki, point.as_bytes());
    }

    #[test]
    fn test_mismatched_sources_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sota = test_assets(dir.path());
        // Patch cert_source to disagree
        let content = std::fs::read_to_string(dir.path().join("sota.toml"))
            .unwrap()
            .replace("cert_source = \"file\"", "cert_source = \"pkcs11\"");
        std::fs::write(dir.path().join("sota.toml"), content).unwrap();
        let sota2 = AppConfig::new(&[dir.path().join("sota.toml")]).unwrap();
        drop(sota);

        assert!(create_client(&sota2).is_err());
    }

    #[test]
    fn test_first_certificate_der() {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["x".into()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let der = first_certificate_der(cert.pem().as_bytes()).unwrap();
        assert_eq!(der, cert.der().as_ref());

        assert!(first_certificate_der(b"not pem").is_err());
    }
}

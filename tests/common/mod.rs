//! Shared test fixture: a fake device directory (TLS assets + sota.toml)
//! wired to a wiremock device-gateway.

// Not every test binary uses every helper
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use fioconfig::encrypted_config::{encrypt_envelope, ConfigFile, ConfigStruct};
use fioconfig::{App, Credential};
use wiremock::MockServer;

pub struct Fixture {
    pub tmp: tempfile::TempDir,
    pub server: MockServer,
    pub app: App,
    pub key_pem: String,
}

impl Fixture {
    pub async fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;

        let key = rcgen::KeyPair::generate().unwrap();
        let cert = client_cert_params().self_signed(&key).unwrap();
        let key_pem = key.serialize_pem();

        std::fs::write(tmp.path().join("root.crt"), cert.pem()).unwrap();
        std::fs::write(tmp.path().join("client.pem"), cert.pem()).unwrap();
        std::fs::write(tmp.path().join("pkey.pem"), &key_pem).unwrap();

        let secrets = tmp.path().join("secrets");
        std::fs::create_dir(&secrets).unwrap();

        let sota = format!(
            r#"
[tls]
server = "{server}"
ca_source = "file"
pkey_source = "file"
cert_source = "file"

[import]
tls_cacert_path = "{dir}/root.crt"
tls_pkey_path = "{dir}/pkey.pem"
tls_clientcert_path = "{dir}/client.pem"

[storage]
path = "{dir}"
"#,
            server = server.uri(),
            dir = tmp.path().display(),
        );
        std::fs::write(tmp.path().join("sota.toml"), sota).unwrap();

        let app = App::new(&[tmp.path().join("sota.toml")], secrets, true).unwrap();

        Self {
            tmp,
            server,
            app,
            key_pem,
        }
    }

    pub fn dir(&self) -> &Path {
        self.tmp.path()
    }

    pub fn credential(&self) -> Credential {
        Credential::from_key_pem(&self.key_pem).unwrap()
    }

    /// Encrypt an envelope under the device's public key, as the
    /// device-gateway would serve it.
    pub fn encrypt(&self, config: &ConfigStruct) -> Vec<u8> {
        encrypt_envelope(&self.credential(), config).unwrap()
    }

    pub fn secret_path(&self, name: &str) -> PathBuf {
        self.app.secrets_dir.join(name)
    }
}

/// Subject + extensions of a device TLS client certificate.
pub fn client_cert_params() -> rcgen::CertificateParams {
    let mut params = rcgen::CertificateParams::new(vec![]).unwrap();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::OrganizationalUnitName, "default");
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "98e9c40d-e125-4d23-a9f1-5e42457e6e07");
    params.key_usages = vec![rcgen::KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
    params
}

pub fn entry(value: &[u8]) -> ConfigFile {
    ConfigFile {
        value: value.to_vec(),
        ..Default::default()
    }
}

pub fn entry_with_handler(value: &[u8], on_changed: &[&str]) -> ConfigFile {
    ConfigFile {
        value: value.to_vec(),
        on_changed: on_changed.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// The envelope used by most scenarios: two files, one with a touch
/// handler.
pub fn sample_envelope(marker: &Path) -> ConfigStruct {
    let mut config = BTreeMap::new();
    config.insert("foo".to_string(), entry(b"foo file value"));
    config.insert(
        "bar".to_string(),
        entry_with_handler(
            b"bar file value",
            &["/bin/sh", "-c", &format!("touch {}", marker.display())],
        ),
    );
    config
}

//! Root CA renewal against a mock EST server.

mod common;

use common::Fixture;
use der::Decode as _;
use fioconfig::renew_root::{RootRenewalHandler, RootRenewalState};
use fioconfig::services::NoOpRestarter;
use fioconfig::state::load_state;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};
use x509_cert::Certificate;

const EST_PATH: &str = "/.well-known/est";

fn ca_params(serial: u64, org: &str) -> rcgen::CertificateParams {
    let mut params = rcgen::CertificateParams::new(vec![]).unwrap();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::OrganizationName, org);
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![
        rcgen::KeyUsagePurpose::KeyCertSign,
        rcgen::KeyUsagePurpose::CrlSign,
    ];
    params.serial_number = Some(serial.into());
    params
}

struct CaFixture {
    fx: Fixture,
    ca_key: rcgen::KeyPair,
    ca_rc: rcgen::Certificate,
}

impl CaFixture {
    async fn new() -> Self {
        let fx = Fixture::new().await;
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let ca_rc = ca_params(1, "Acme Co").self_signed(&ca_key).unwrap();
        // The trust anchor file now holds this CA (the TLS transport in
        // these tests is plain HTTP, so the pool content is only parsed)
        std::fs::write(fx.dir().join("root.crt"), ca_rc.pem()).unwrap();
        Self { fx, ca_key, ca_rc }
    }

    fn initial(&self) -> Certificate {
        Certificate::from_der(self.ca_rc.der()).unwrap()
    }

    async fn mount_cacerts(&self, certs: &[Certificate]) {
        let body = fioconfig::pkcs7::build_certs_only(certs).unwrap();
        Mock::given(method("GET"))
            .and(path(format!("{EST_PATH}/cacerts")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(body)
                    .insert_header("content-type", "application/pkcs7-mime"),
            )
            .mount(&self.fx.server)
            .await;
    }

    async fn mount_events(&self) {
        Mock::given(method("POST"))
            .and(path("/events"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&self.fx.server)
            .await;
    }

    fn handler(&mut self, state_file: &std::path::Path) -> RootRenewalHandler<'_> {
        let est_server = format!("{}{}", self.fx.server.uri(), EST_PATH);
        let mut handler =
            RootRenewalHandler::new(&mut self.fx.app, state_file, &est_server).unwrap();
        handler.inner.restarter = Box::new(NoOpRestarter);
        handler
    }
}

#[tokio::test]
async fn test_same_ca_accepted_and_rewritten() {
    let mut cafx = CaFixture::new().await;
    cafx.mount_events().await;
    cafx.mount_cacerts(&[cafx.initial()]).await;

    let state_file = cafx.fx.dir().join("root-renewal.state");
    let ca_file = cafx.fx.dir().join("root.crt");
    let mut handler = cafx.handler(&state_file);
    handler.update().await.unwrap();
    drop(handler);

    assert!(!state_file.exists());
    assert!(cafx.fx.dir().join("root-renewal.state.completed").exists());

    // The bundle was rewritten from the server's response
    let content = std::fs::read(&ca_file).unwrap();
    let certs = Certificate::load_pem_chain(&content).unwrap();
    assert_eq!(certs.len(), 1);
    assert_eq!(certs[0], cafx.initial());
}

#[tokio::test]
async fn test_two_phase_replacement() {
    let mut cafx = CaFixture::new().await;
    cafx.mount_events().await;

    let new_key = rcgen::KeyPair::generate().unwrap();
    let new_ca = ca_params(3, "Acme Co").self_signed(&new_key).unwrap();
    let cross = ca_params(4, "Acme Co")
        .signed_by(&new_key, &cafx.ca_rc, &cafx.ca_key)
        .unwrap();
    let new_ca_parsed = Certificate::from_der(new_ca.der()).unwrap();
    let cross_parsed = Certificate::from_der(cross.der()).unwrap();

    // Phase 1: {current, cross-signed(new), self-signed(new)}
    cafx.mount_cacerts(&[cafx.initial(), cross_parsed, new_ca_parsed.clone()])
        .await;
    let state_file = cafx.fx.dir().join("root-renewal.state");
    let mut handler = cafx.handler(&state_file);
    handler.update().await.unwrap();
    drop(handler);

    let ca_file = cafx.fx.dir().join("root.crt");
    let bundle = Certificate::load_pem_chain(&std::fs::read(&ca_file).unwrap()).unwrap();
    assert_eq!(bundle.len(), 3);

    // Phase 2: the server now returns only the replacement; the local
    // bundle from phase 1 covers it
    cafx.fx.server.reset().await;
    cafx.mount_events().await;
    cafx.mount_cacerts(&[new_ca_parsed.clone()]).await;
    let state_file2 = cafx.fx.dir().join("root-renewal-2.state");
    let mut handler = cafx.handler(&state_file2);
    handler.update().await.unwrap();
    drop(handler);

    let bundle = Certificate::load_pem_chain(&std::fs::read(&ca_file).unwrap()).unwrap();
    assert_eq!(bundle, vec![new_ca_parsed]);
}

#[tokio::test]
async fn test_invalid_bundle_leaves_file_and_state() {
    let mut cafx = CaFixture::new().await;
    cafx.mount_events().await;

    // A self-signed replacement without the cross-signed link is not
    // acceptable
    let new_key = rcgen::KeyPair::generate().unwrap();
    let rogue = ca_params(9, "Acme Co").self_signed(&new_key).unwrap();
    cafx.mount_cacerts(&[Certificate::from_der(rogue.der()).unwrap()])
        .await;

    let ca_file = cafx.fx.dir().join("root.crt");
    let before = std::fs::read(&ca_file).unwrap();

    let state_file = cafx.fx.dir().join("root-renewal.state");
    let mut handler = cafx.handler(&state_file);
    let err = handler.update().await.unwrap_err();
    assert!(err.to_string().contains("error validating root certificates"));
    drop(handler);

    // CA file untouched; the state file remains for a retry
    assert_eq!(std::fs::read(&ca_file).unwrap(), before);
    let state: RootRenewalState = load_state(&state_file).unwrap();
    assert_eq!(state.step_idx, 0);

    let restored = RootRenewalHandler::restore(&mut cafx.fx.app, &state_file).unwrap();
    assert!(restored.is_some());
}

#[tokio::test]
async fn test_empty_bundle_rejected() {
    let mut cafx = CaFixture::new().await;
    cafx.mount_events().await;
    cafx.mount_cacerts(&[]).await;

    let state_file = cafx.fx.dir().join("root-renewal.state");
    let mut handler = cafx.handler(&state_file);
    let err = handler.update().await.unwrap_err();
    assert!(err.to_string().contains("no certificates"));
}

#[tokio::test]
async fn test_wrong_content_type_rejected() {
    let mut cafx = CaFixture::new().await;
    cafx.mount_events().await;
    Mock::given(method("GET"))
        .and(path(format!("{EST_PATH}/cacerts")))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .mount(&cafx.fx.server)
        .await;

    let state_file = cafx.fx.dir().join("root-renewal.state");
    let mut handler = cafx.handler(&state_file);
    let err = handler.update().await.unwrap_err();
    assert!(err.to_string().contains("content-type"));
}

#[tokio::test]
async fn test_offline_resume_is_a_noop() {
    let mut cafx = CaFixture::new().await;
    let state_file = cafx.fx.dir().join("root-renewal.state");
    let mut handler = cafx.handler(&state_file);
    handler.resume(false).await.unwrap();
    // Nothing ran: no state file was even written
    assert!(!state_file.exists());
}

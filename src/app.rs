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

//! The agent itself: check-in protocol and offline extraction.
//!
//! A check-in asks the device-gateway for the current encrypted
//! configuration using `If-Modified-Since` against the persisted
//! ciphertext's mtime, extracts changes into the secrets directory, and
//! only then persists the new ciphertext. A crash between extraction and
//! persistence re-runs extraction on the next check-in and converges.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};

use crate::app_config::AppConfig;
use crate::crypto::Credential;
use crate::encrypted_config::{
    unmarshal_buffer, unmarshal_file, ConfigCreateRequest, ConfigFileReq, ConfigStruct,
};
use crate::error::{Error, Result};
use crate::extract::Extractor;
use crate::http;
use crate::safe_write::{safe_write, set_modtime};
use crate::tls;

/// Default device-gateway when `tls.server` is not configured.
const DEFAULT_SERVER: &str = "https://ota-lite.foundries.io:8443";

/// Name of the persisted ciphertext inside `storage.path`.
pub const ENCRYPTED_CONFIG_NAME: &str = "config.encrypted";

/// A one-time registration task run on check-in until it succeeds.
///
/// Callbacks contribute files to an initial `PATCH /config`; once the
/// server accepts them the callback list is drained so a later check-in
/// does not rerun them.
pub trait InitCallback: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Files to include in the registration request.
    fn config_files(&self, app: &App) -> Vec<ConfigFileReq>;

    /// Called after the server accepted the registration.
    fn on_complete(&self, app: &App);
}

/// The configuration agent.
pub struct App {
    /// Layered device configuration.
    pub sota: AppConfig,
    /// The configuration search paths (exported to handlers).
    pub config_paths: Vec<PathBuf>,
    /// `storage.path`: where state and the encrypted config live.
    pub storage_dir: PathBuf,
    /// Path of the persisted encrypted envelope.
    pub encrypted_config: PathBuf,
    /// Where secrets are materialized.
    pub secrets_dir: PathBuf,
    /// URL of the device's config endpoint.
    pub config_url: String,
    /// Allow change handlers outside the trusted prefix.
    pub unsafe_handlers: bool,
    /// Skip the signature checks of root CA renewal.
    pub unsafe_root_renewal: bool,

    init_callbacks: Vec<Box<dyn InitCallback>>,
}

impl App {
    /// Load the layered config from `config_paths` and build the agent.
    ///
    /// The TLS client is constructed once and dropped to fail fast on a
    /// broken credential configuration.
    pub fn new<P: AsRef<Path>>(
        config_paths: &[P],
        secrets_dir: impl Into<PathBuf>,
        unsafe_handlers: bool,
    ) -> Result<Self> {
        let sota = AppConfig::new(config_paths)?;
        let app = Self::with_config(sota, config_paths, secrets_dir, unsafe_handlers)?;
        drop(tls::create_client(&app.sota)?);
        Ok(app)
    }

    /// Build the agent from an already loaded configuration, without
    /// probing the TLS credential.
    pub fn with_config<P: AsRef<Path>>(
        sota: AppConfig,
        config_paths: &[P],
        secrets_dir: impl Into<PathBuf>,
        unsafe_handlers: bool,
    ) -> Result<Self> {
        let storage_dir = PathBuf::from(sota.get_or_fail("storage.path"));
        let config_url = match std::env::var("CONFIG_URL") {
            Ok(url) if !url.is_empty() => url,
            _ => sota.get_default("tls.server", DEFAULT_SERVER) + "/config",
        };

        Ok(Self {
            encrypted_config: storage_dir.join(ENCRYPTED_CONFIG_NAME),
            storage_dir,
            sota,
            config_paths: config_paths.iter().map(|p| p.as_ref().to_path_buf()).collect(),
            secrets_dir: secrets_dir.into(),
            config_url,
            unsafe_handlers,
            unsafe_root_renewal: false,
            init_callbacks: Vec::new(),
        })
    }

    /// Check in with the device-gateway and apply any changes.
    ///
    /// Returns whether the secrets directory changed; an unchanged server
    /// config surfaces as [`Error::NotModified`]. Pending init callbacks
    /// are run regardless of the check-in outcome.
    pub async fn check_in(&mut self) -> Result<bool> {
        let (client, crypto, _) = tls::create_client(&self.sota)?;
        let res = self.check_in_with(&client, &crypto).await;
        self.run_init_callbacks(&client).await;
        res
    }

    /// Re-apply the persisted encrypted config to the secrets directory.
    ///
    /// Used at early boot, before the network is up. Without a previous
    /// snapshot to diff against, no removals happen here.
    pub async fn extract(&self) -> Result<bool> {
        let (_client, crypto, _) = tls::create_client(&self.sota)?;
        let next = unmarshal_file(Some(&crypto), &self.encrypted_config, true)?;
        self.extractor().extract(None, &next).await
    }

    pub(crate) async fn check_in_with(
        &self,
        client: &reqwest::Client,
        crypto: &Credential,
    ) -> Result<bool> {
        // A previous envelope that fails to load forces a full re-apply
        let prev: Option<ConfigStruct> = match unmarshal_file(None, &self.encrypted_config, false) {
            Ok(config) => Some(config),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!("unable to load previous config ({}), forcing full apply", e);
                None
            }
        };

        let mut headers = HeaderMap::new();
        if prev.is_some() {
            if let Some(mtime) = file_mtime(&self.encrypted_config) {
                // Don't pull it down unless we need to
                if let Ok(value) = HeaderValue::from_str(&format_rfc1123(mtime)) {
                    headers.insert("If-Modified-Since", value);
                }
            }
        }

        let res = http::get(client, &self.config_url, Some(headers)).await?;
        match res.status {
            200 => {
                let next = unmarshal_buffer(Some(crypto), &res.body, true)?;
                let changed = self.extractor().extract(prev.as_ref(), &next).await?;
                safe_write(&self.encrypted_config, &res.body)?;

                let modtime = res
                    .header("date")
                    .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|| {
                        tracing::warn!("no usable Date header, using current time");
                        Utc::now()
                    });
                set_modtime(&self.encrypted_config, modtime)?;
                Ok(changed)
            }
            304 => {
                tracing::info!("config on server has not changed");
                Err(Error::NotModified)
            }
            204 => {
                tracing::info!("device has no config defined on server");
                Err(Error::NotModified)
            }
            status => Err(Error::status("GET", &self.config_url, status, &res.body)),
        }
    }

    pub(crate) fn extractor(&self) -> Extractor<'_> {
        let sota_dirs = self
            .config_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(",");
        Extractor {
            secrets_dir: &self.secrets_dir,
            storage_dir: &self.storage_dir,
            sota_dirs,
            unsafe_handlers: self.unsafe_handlers,
        }
    }

    /// Register a one-time initialization callback.
    pub fn register_init_callback(&mut self, callback: Box<dyn InitCallback>) {
        self.init_callbacks.push(callback);
    }

    /// Run pending init callbacks; successful ones are removed so they
    /// are not run again.
    pub async fn run_init_callbacks(&mut self, client: &reqwest::Client) {
        if self.init_callbacks.is_empty() {
            return;
        }

        let mut ccr = ConfigCreateRequest {
            reason: "Set initial fioconfig device data".to_string(),
            files: Vec::new(),
            public_key: None,
        };
        for callback in &self.init_callbacks {
            tracing::info!("running {} initialization", callback.name());
            ccr.files.extend(callback.config_files(self));
        }

        if !ccr.files.is_empty() {
            match http::patch_json(client, &self.config_url, &ccr).await {
                Ok(res) if res.status == 201 => {}
                Ok(res) => {
                    tracing::warn!(
                        "unable to update: {} - HTTP_{}: {}",
                        self.config_url,
                        res.status,
                        res.body_str()
                    );
                    return;
                }
                Err(e) => {
                    tracing::warn!("unexpected error creating initialization request: {}", e);
                    return;
                }
            }
        }

        let callbacks = std::mem::take(&mut self.init_callbacks);
        for callback in &callbacks {
            callback.on_complete(self);
        }
    }
}

fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.into())
}

/// RFC-1123 timestamp in UTC, e.g. `Tue, 15 Nov 1994 08:12:31 GMT`.
fn format_rfc1123(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn test_app(dir: &Path, config_url: String) -> App {
        let sota = format!(
            "[tls]\nserver = \"https://dg\"\n[storage]\npath = \"{}\"\n",
            dir.display()
        );
        std::fs::write(dir.join("sota.toml"), sota).unwrap();
        let config = AppConfig::new(&[dir.join("sota.toml")]).unwrap();
        let mut app =
            App::with_config(config, &[dir.join("sota.toml")], dir.join("secrets"), false).unwrap();
        app.config_url = config_url;
        app
    }

    #[test]
    fn test_format_rfc1123() {
        let t = DateTime::parse_from_rfc3339("1994-11-15T08:12:31Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_rfc1123(t), "Tue, 15 Nov 1994 08:12:31 GMT");
    }

    #[test]
    fn test_config_url_from_tls_server() {
        let dir = tempfile::tempdir().unwrap();
        let sota = format!(
            "[tls]\nserver = \"https://dg:8443\"\n[storage]\npath = \"{}\"\n",
            dir.path().display()
        );
        std::fs::write(dir.path().join("sota.toml"), sota).unwrap();
        let config = AppConfig::new(&[dir.path().join("sota.toml")]).unwrap();
        let app = App::with_config(
            config,
            &[dir.path().join("sota.toml")],
            dir.path().join("secrets"),
            false,
        )
        .unwrap();
        assert_eq!(app.config_url, "https://dg:8443/config");
        assert_eq!(
            app.encrypted_config,
            dir.path().join(ENCRYPTED_CONFIG_NAME)
        );
    }

    struct CountingCallback {
        files: Arc<AtomicUsize>,
        completed: Arc<AtomicUsize>,
    }

    impl InitCallback for CountingCallback {
        fn name(&self) -> &str {
            "counting"
        }

        fn config_files(&self, _app: &App) -> Vec<ConfigFileReq> {
            self.files.fetch_add(1, Ordering::SeqCst);
            vec![ConfigFileReq {
                name: "wireguard-pub".to_string(),
                value: "pubkey".to_string(),
                unencrypted: true,
                on_changed: Vec::new(),
            }]
        }

        fn on_complete(&self, _app: &App) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_init_callbacks_run_once() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/config"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let mut app = test_app(dir.path(), format!("{}/config", server.uri()));
        let files = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        app.register_init_callback(Box::new(CountingCallback {
            files: Arc::clone(&files),
            completed: Arc::clone(&completed),
        }));

        let client = reqwest::Client::new();
        app.run_init_callbacks(&client).await;
        assert_eq!(files.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        // Drained: a second run does nothing
        app.run_init_callbacks(&client).await;
        assert_eq!(files.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_init_callbacks_kept_on_server_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/config"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let mut app = test_app(dir.path(), format!("{}/config", server.uri()));
        let files = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        app.register_init_callback(Box::new(CountingCallback {
            files: Arc::clone(&files),
            completed: Arc::clone(&completed),
        }));

        let client = reqwest::Client::new();
        app.run_init_callbacks(&client).await;
        assert_eq!(completed.load(Ordering::SeqCst), 0);

        // Still registered, retried on the next check-in
        app.run_init_callbacks(&client).await;
        assert_eq!(files.load(Ordering::SeqCst), 2);
    }
}

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

//! TLS client key and certificate rotation.
//!
//! Rotation re-enrolls against an EST server with a fresh key, parks the
//! new public key on the device-gateway, re-encrypts the device's
//! configuration under it, and finally repoints the TOML config at the
//! new credential. Each step is durable (see [`crate::state`]); the
//! device can lose power at any point and still authenticate, because the
//! old key stays in place until the finalize step lands atomically.

mod est;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::app::App;
use crate::crypto::Credential;
use crate::encrypted_config::{
    encrypt_envelope, encrypt_values, nullable_vec, unmarshal_buffer, unmarshal_file,
    ConfigCreateRequest, ConfigFileReq,
};
use crate::error::{Error, Result};
use crate::http;
use crate::safe_write::safe_write;
use crate::state::{
    default_correlation_id, load_state, StateContext, StateHandler, StateRecord, StateStep,
};

pub(crate) use est::EstStep;

/// Default name of the rotation state file inside `storage.path`.
pub const STATE_FILE: &str = "cert-rotation.state";

/// Durable progress of one rotation.
///
/// Field names match the on-disk JSON written by existing deployments.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CertRotationState {
    /// EST server base URL.
    #[serde(rename = "EstServer", default)]
    pub est_server: String,

    /// Correlation id for telemetry.
    #[serde(rename = "RotationId", default)]
    pub rotation_id: String,

    /// Next step to execute.
    #[serde(rename = "StepIdx", default)]
    pub step_idx: usize,

    /// HSM slot ids available for the new private key.
    #[serde(rename = "PkeySlotIds", default, deserialize_with = "nullable_vec")]
    pub pkey_slot_ids: Vec<String>,

    /// HSM slot ids available for the new certificate.
    #[serde(rename = "CertSlotIds", default, deserialize_with = "nullable_vec")]
    pub cert_slot_ids: Vec<String>,

    /// New private key: PEM in file mode, slot id in HSM mode.
    #[serde(rename = "NewKey", default)]
    pub new_key: String,

    /// New certificate: PEM in file mode, slot id in HSM mode.
    #[serde(rename = "NewCert", default)]
    pub new_cert: String,

    /// The local envelope re-encrypted under the new key.
    #[serde(rename = "FullConfigEncrypted", default)]
    pub full_config_encrypted: String,

    /// Whether the device-specific config was re-uploaded.
    #[serde(rename = "DeviceConfigUpdated", default)]
    pub device_config_updated: bool,

    /// Whether the local config now points at the new credential.
    #[serde(rename = "Finalized", default)]
    pub finalized: bool,
}

impl StateRecord for CertRotationState {
    fn correlation_id(&mut self) -> String {
        if self.rotation_id.is_empty() {
            self.rotation_id = default_correlation_id();
            tracing::info!("setting default correlation id to: {}", self.rotation_id);
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

/// Drives a [`CertRotationState`] through the rotation steps.
pub struct CertRotationHandler<'a> {
    /// The underlying durable runtime; exposed so callers can swap the
    /// event sink or restarter.
    pub inner: StateHandler<'a, CertRotationState>,
}

impl<'a> CertRotationHandler<'a> {
    /// Construct a handler to initiate a rotation against `est_server`.
    pub fn new(
        app: &'a mut App,
        state_file: impl Into<std::path::PathBuf>,
        est_server: &str,
    ) -> Result<Self> {
        let state = CertRotationState {
            est_server: est_server.to_string(),
            ..Default::default()
        };
        Self::with_state(app, state_file.into(), state)
    }

    /// Load a previous rotation attempt. Returns `None` when no rotation
    /// is in progress (no state file).
    pub fn restore(
        app: &'a mut App,
        state_file: impl Into<std::path::PathBuf>,
    ) -> Result<Option<Self>> {
        let state_file = state_file.into();
        match load_state::<CertRotationState>(&state_file) {
            None => Ok(None),
            Some(state) => Self::with_state(app, state_file, state).map(Some),
        }
    }

    fn with_state(
        app: &'a mut App,
        state_file: std::path::PathBuf,
        state: CertRotationState,
    ) -> Result<Self> {
        let ctx = StateContext::for_app(app, state_file, state)?;
        Ok(Self {
            inner: StateHandler {
                ctx,
                steps: vec![
                    Box::new(EstStep),
                    Box::new(LockStep),
                    Box::new(FullCfgStep),
                    Box::new(DeviceCfgStep),
                    Box::new(FinalizeStep),
                ],
                restarter: Box::new(crate::services::SystemctlRestarter),
            },
        })
    }

    /// Run the rotation to completion.
    pub async fn rotate(&mut self) -> Result<()> {
        self.inner
            .execute("CertRotationStarted", "CertRotationCompleted", true)
            .await
    }

    /// Complete an interrupted rotation.
    ///
    /// Offline (early boot) only one recovery is possible: the finalize
    /// step updated the TOML config but not `config.encrypted`. That step
    /// runs locally; the sentinel rename waits for the next online
    /// invocation so the completion event still reaches the gateway.
    pub async fn resume(&mut self, online: bool) -> Result<()> {
        if !online {
            if self.inner.ctx.state.device_config_updated && !self.inner.ctx.state.finalized {
                tracing::info!("incomplete certificate rotation found, completing finalize step");
                FinalizeStep.execute(&mut self.inner.ctx).await?;
                return self.inner.ctx.save();
            }
            tracing::info!("incomplete certificate rotation found");
            return Ok(());
        }
        tracing::info!("incomplete certificate rotation found, attempting to complete");
        self.rotate().await
    }
}

/// Build the credential for the NEW key recorded in the rotation state.
fn new_credential(ctx: &StateContext<'_, CertRotationState>) -> Result<Credential> {
    if !ctx.crypto.use_hsm() {
        return Credential::from_key_pem(&ctx.state.new_key);
    }
    hsm_credential(ctx)
}

#[cfg(feature = "pkcs11")]
fn hsm_credential(ctx: &StateContext<'_, CertRotationState>) -> Result<Credential> {
    use crate::crypto::{id_to_bytes, HsmConfig, HsmCredential};

    let config = HsmConfig {
        module: ctx.app.sota.get_or_fail("p11.module"),
        label: ctx.app.sota.get_default("p11.label", "aktualizr"),
        pin: ctx.app.sota.get_or_fail("p11.pass"),
    };
    let hsm = HsmCredential::open(&config, &id_to_bytes(&ctx.state.new_key))?;
    Ok(Credential::Hsm(std::sync::Arc::new(hsm)))
}

#[cfg(not(feature = "pkcs11"))]
fn hsm_credential(_ctx: &StateContext<'_, CertRotationState>) -> Result<Credential> {
    Err(Error::hsm("pkcs11 support not compiled in"))
}

/// Body of the `PATCH /device` lock request.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceUpdate {
    #[serde(rename = "next_pubkey")]
    pub next_pubkey: String,
}

struct LockStep;

#[async_trait]
impl StateStep<CertRotationState> for LockStep {
    fn name(&self) -> &'static str {
        "Lock device configuration on server"
    }

    async fn execute(&self, ctx: &mut StateContext<'_, CertRotationState>) -> Result<()> {
        let next_pubkey = new_credential(ctx)?.public_key_pem()?;

        let url = ctx.app.sota.get_or_fail("tls.server") + "/device";
        let res = http::patch_json(&ctx.client, &url, &DeviceUpdate { next_pubkey }).await?;
        if res.status != 200 {
            return Err(Error::status("PATCH", &url, res.status, &res.body));
        }
        Ok(())
    }
}

struct FullCfgStep;

#[async_trait]
impl StateStep<CertRotationState> for FullCfgStep {
    fn name(&self) -> &'static str {
        "Update local configuration with new key"
    }

    async fn execute(&self, ctx: &mut StateContext<'_, CertRotationState>) -> Result<()> {
        let new = new_credential(ctx)?;

        // Open/decrypt the full config with the current key
        let config = match unmarshal_file(Some(&ctx.crypto), &ctx.app.encrypted_config, true) {
            Ok(config) => config,
            // A device with no config yet has nothing to re-encrypt
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let bytes = encrypt_envelope(&new, &config)?;
        ctx.state.full_config_encrypted = String::from_utf8(bytes)
            .map_err(|_| Error::crypto("re-encrypted config is not UTF-8"))?;
        Ok(())
    }
}

struct DeviceCfgStep;

#[async_trait]
impl StateStep<CertRotationState> for DeviceCfgStep {
    fn name(&self) -> &'static str {
        "Update device specific configuration on server with new key"
    }

    async fn execute(&self, ctx: &mut StateContext<'_, CertRotationState>) -> Result<()> {
        let new = new_credential(ctx)?;
        let pub_pem = new.public_key_pem()?;

        let url = format!("{}-device", ctx.app.config_url);
        let res = http::get(&ctx.client, &url, None).await?;
        if res.status == 204 {
            // Device has no device-specific configuration
            ctx.state.device_config_updated = true;
            return Ok(());
        } else if res.status != 200 {
            return Err(Error::status("GET", &url, res.status, &res.body));
        }

        let config = match unmarshal_buffer(Some(&ctx.crypto), &res.body, true) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    "unable to decrypt device config with old key, trying new key: {}",
                    e
                );
                // We may have uploaded this config with the new key and
                // crashed before saving the state. If the new key decrypts
                // it, only the save was lost.
                return match unmarshal_buffer(Some(&new), &res.body, true) {
                    Ok(_) => {
                        ctx.state.device_config_updated = true;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
            }
        };

        let encrypted = encrypt_values(&new, &config)?;
        let mut files = Vec::with_capacity(encrypted.len());
        for (name, entry) in &encrypted {
            files.push(ConfigFileReq {
                name: name.clone(),
                value: String::from_utf8(entry.value.clone())
                    .map_err(|_| Error::crypto(format!("re-encrypted {name} is not UTF-8")))?,
                unencrypted: entry.unencrypted,
                on_changed: entry.on_changed.clone(),
            });
        }
        let ccr = ConfigCreateRequest {
            reason: "Rotating device client certificate".to_string(),
            files,
            public_key: Some(pub_pem),
        };

        let res = http::patch_json(&ctx.client, &ctx.app.config_url, &ccr).await?;
        if !(200..=204).contains(&res.status) {
            return Err(Error::status(
                "PATCH",
                &ctx.app.config_url,
                res.status,
                &res.body,
            ));
        }
        ctx.state.device_config_updated = true;
        Ok(())
    }
}

struct FinalizeStep;

#[async_trait]
impl StateStep<CertRotationState> for FinalizeStep {
    fn name(&self) -> &'static str {
        "Finalize device configuration"
    }

    async fn execute(&self, ctx: &mut StateContext<'_, CertRotationState>) -> Result<()> {
        let mut keyvals = std::collections::BTreeMap::new();
        if ctx.crypto.use_hsm() {
            // Point at the new slot ids
            keyvals.insert("p11.tls_pkey_id".to_string(), ctx.state.new_key.clone());
            keyvals.insert(
                "p11.tls_clientcert_id".to_string(),
                ctx.state.new_cert.clone(),
            );
        } else {
            // Write two new files with unique names so readers of the old
            // paths are never torn, then repoint the config
            let pairs = [
                ("pkey.", "import.tls_pkey_path", &ctx.state.new_key),
                ("client.", "import.tls_clientcert_path", &ctx.state.new_cert),
            ];
            for (prefix, key, content) in pairs {
                let file = tempfile::Builder::new()
                    .prefix(prefix)
                    .suffix(".pem")
                    .tempfile_in(&ctx.app.storage_dir)?;
                std::io::Write::write_all(&mut file.as_file(), content.as_bytes())?;
                file.as_file().sync_all()?;
                let (_, path) = file.keep().map_err(|e| Error::Io(e.error))?;
                keyvals.insert(key.to_string(), path.display().to_string());
            }
        }
        ctx.app.sota.update_keys(&keyvals)?;

        if !ctx.state.full_config_encrypted.is_empty() {
            safe_write(
                &ctx.app.encrypted_config,
                ctx.state.full_config_encrypted.as_bytes(),
            )?;
        }
        ctx.state.finalized = true;
        Ok(())
    }
}

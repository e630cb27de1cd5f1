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

//! The encrypted configuration envelope.
//!
//! The device-gateway delivers configuration as a JSON object mapping a
//! relative file name to `{Value, OnChanged, Unencrypted}`. Encrypted
//! values are base64-wrapped ECIES ciphertexts under the device's TLS
//! public key; unencrypted values are opaque plaintext that never touches
//! the decrypt path.

use std::collections::BTreeMap;
use std::path::Component;

use serde::{Deserialize, Serialize};

use crate::crypto::Credential;
use crate::error::{Error, Result};

/// One entry of the envelope: a secret file plus its change handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// File content. Ciphertext (base64) on the wire unless
    /// [`unencrypted`](Self::unencrypted); plaintext bytes after
    /// decryption.
    #[serde(rename = "Value", with = "value_bytes")]
    pub value: Vec<u8>,

    /// Command to run when the file's bytes change; empty means none.
    #[serde(rename = "OnChanged", default, deserialize_with = "nullable_vec")]
    pub on_changed: Vec<String>,

    /// When set, the value is opaque plaintext.
    #[serde(rename = "Unencrypted", default)]
    pub unencrypted: bool,
}

/// The envelope: file name to entry.
pub type ConfigStruct = BTreeMap<String, ConfigFile>;

/// One file of a `PATCH /config` request (wire form).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFileReq {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub unencrypted: bool,
    #[serde(
        rename = "on-changed",
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "nullable_vec"
    )]
    pub on_changed: Vec<String>,
}

/// Body of a `PATCH /config` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigCreateRequest {
    pub reason: String,
    #[serde(default)]
    pub files: Vec<ConfigFileReq>,
    #[serde(rename = "public-key", default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// Parse an envelope from a file.
///
/// See [`unmarshal_buffer`] for the `decrypt` semantics.
pub fn unmarshal_file(
    credential: Option<&Credential>,
    path: impl AsRef<std::path::Path>,
    decrypt: bool,
) -> Result<ConfigStruct> {
    let content = std::fs::read(path.as_ref())?;
    unmarshal_buffer(credential, &content, decrypt)
}

/// Parse an envelope from a buffer.
///
/// With `decrypt` set, every entry not flagged `Unencrypted` has its value
/// base64-decoded and ECIES-decrypted through the credential. Without it,
/// values are left as ciphertext - that form is used to diff against a
/// previously persisted envelope.
pub fn unmarshal_buffer(
    credential: Option<&Credential>,
    data: &[u8],
    decrypt: bool,
) -> Result<ConfigStruct> {
    let mut config: ConfigStruct = serde_json::from_slice(data)
        .map_err(|e| Error::config(format!("unable to parse encrypted json: {e}")))?;

    for name in config.keys() {
        validate_name(name)?;
    }

    if decrypt {
        let credential = credential
            .ok_or_else(|| Error::crypto("credential required to decrypt config values"))?;
        for (name, entry) in config.iter_mut() {
            if entry.unencrypted {
                continue;
            }
            tracing::debug!("decoding value of {}", name);
            let ciphertext = std::str::from_utf8(&entry.value)
                .map_err(|e| Error::crypto(format!("unable to decode {name}: {e}")))?;
            entry.value = credential
                .decrypt(ciphertext)
                .map_err(|e| Error::crypto(format!("unable to decrypt {name}: {e}")))?;
        }
    }
    Ok(config)
}

/// Re-encrypt every non-`Unencrypted` value under `credential`'s public
/// key, returning a new envelope with base64 ciphertext values.
pub fn encrypt_values(credential: &Credential, config: &ConfigStruct) -> Result<ConfigStruct> {
    let mut out = config.clone();
    for (name, entry) in out.iter_mut() {
        if entry.unencrypted {
            continue;
        }
        let ct = credential
            .encrypt(&entry.value)
            .map_err(|e| Error::crypto(format!("unable to re-encrypt {name}: {e}")))?;
        entry.value = ct.into_bytes();
    }
    Ok(out)
}

/// [`encrypt_values`] serialized to canonical JSON.
pub fn encrypt_envelope(credential: &Credential, config: &ConfigStruct) -> Result<Vec<u8>> {
    let encrypted = encrypt_values(credential, config)?;
    Ok(serde_json::to_vec(&encrypted)?)
}

// Entry names become paths under the secrets root; nothing may escape it.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::EnvelopeName("empty name".to_string()));
    }
    let path = std::path::Path::new(name);
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(Error::EnvelopeName(name.to_string())),
        }
    }
    Ok(())
}

mod value_bytes {
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let s = std::str::from_utf8(value)
            .map_err(|_| S::Error::custom("config value is not valid UTF-8"))?;
        serializer.serialize_str(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.unwrap_or_default().into_bytes())
    }
}

// Go-produced JSON serializes absent string lists as `null`.
pub(crate) fn nullable_vec<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = Option::<Vec<String>>::deserialize(deserializer)?;
    Ok(v.unwrap_or_default())
}

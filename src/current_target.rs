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

//! The currently installed OTA target.
//!
//! The update client records what it booted in a small `KEY="value"` file.
//! The agent only reads it so rotation telemetry can name the running
//! target.

use std::path::Path;

use crate::error::{Error, Result};

/// Name and version of the installed target.
#[derive(Debug, Clone, Default)]
pub struct CurrentTarget {
    pub name: String,
    pub version: i32,
}

impl CurrentTarget {
    /// Parse a `current-target` file.
    ///
    /// `TARGET_NAME` and `CUSTOM_VERSION` are both required; the version is
    /// a decimal integer carried as a string.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let table: toml::Table = content.parse().map_err(|e| {
            Error::config(format!(
                "unable to parse {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let name = match table.get("TARGET_NAME").and_then(|v| v.as_str()) {
            Some(val) if !val.is_empty() => val.to_string(),
            _ => {
                return Err(Error::config(
                    "unable to parse current-target. No TARGET_NAME specified",
                ))
            }
        };
        let version = match table.get("CUSTOM_VERSION").and_then(|v| v.as_str()) {
            Some(val) if !val.is_empty() => val
                .parse::<i32>()
                .map_err(|e| Error::config(format!("invalid CUSTOM_VERSION: {e}")))?,
            _ => {
                return Err(Error::config(
                    "unable to parse current-target. No CUSTOM_VERSION specified",
                ))
            }
        };

        Ok(Self { name, version })
    }
}

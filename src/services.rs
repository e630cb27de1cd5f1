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

//! Service restart seam.
//!
//! After a completed rotation the update client and the agent itself must
//! be restarted so they pick up the new TLS identity. The actual restart
//! mechanism lives outside the core; [`UnitRestarter`] is its interface,
//! with a thin `systemctl` shim as the device implementation.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::exec::exec_indented;

/// Units restarted after a completed key rotation.
pub const ROTATION_RESTART_UNITS: &[&str] = &["aktualizr-lite.service", "fioconfig.service"];

/// Restarts system units after a completed operation.
#[async_trait]
pub trait UnitRestarter: Send + Sync {
    /// Restart the given units. Units that are already inactive/dead are
    /// skipped - restarting them would start services the device operator
    /// chose to keep down.
    async fn restart_units(&self, units: &[&str]) -> Result<()>;
}

/// `systemctl`-based restarter used on devices.
#[derive(Default)]
pub struct SystemctlRestarter;

#[async_trait]
impl UnitRestarter for SystemctlRestarter {
    async fn restart_units(&self, units: &[&str]) -> Result<()> {
        for unit in units {
            let output = tokio::process::Command::new("systemctl")
                .args(["is-active", unit])
                .output()
                .await?;
            let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if state == "inactive" || state == "dead" {
                tracing::info!("unit {} is {}, not restarting", unit, state);
                continue;
            }

            tracing::info!("restarting {}", unit);
            let mut cmd = tokio::process::Command::new("systemctl");
            cmd.args(["restart", unit]);
            let status = exec_indented(&mut cmd, "| ").await?;
            if !status.success() {
                return Err(Error::config(format!("unable to restart {unit}: {status}")));
            }
        }
        Ok(())
    }
}

/// Restarter that does nothing; used in CI and tests.
#[derive(Default)]
pub struct NoOpRestarter;

#[async_trait]
impl UnitRestarter for NoOpRestarter {
    async fn restart_units(&self, _units: &[&str]) -> Result<()> {
        tracing::info!("skipping service restarts");
        Ok(())
    }
}

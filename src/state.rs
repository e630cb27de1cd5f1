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

//! Durable multi-step state machine.
//!
//! Rotation operations run as an ordered list of steps over a state
//! record persisted after every successful step. A crash at any point
//! re-enters at the last saved step; a completed run renames the state
//! file to a `.completed` sentinel before any service restarts, so a
//! crash between the two never replays the sequence.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::app::App;
use crate::crypto::Credential;
use crate::current_target::CurrentTarget;
use crate::error::Result;
use crate::events::{DgEventSync, EventSync};
use crate::safe_write::safe_write;
use crate::services::{UnitRestarter, ROTATION_RESTART_UNITS};
use crate::tls;

/// Suffix marking a state file's operation as complete.
pub const COMPLETED_SUFFIX: &str = ".completed";

/// A persistable state record driven through a step sequence.
pub trait StateRecord: Serialize + DeserializeOwned + Default + Send + Sync {
    /// The operation's correlation id, generated on first use.
    fn correlation_id(&mut self) -> String;

    /// Index of the next step to execute.
    fn current_step(&self) -> usize;

    /// Mark the current step done.
    fn advance(&mut self);
}

/// Correlation id used when a state record has none yet.
pub(crate) fn default_correlation_id() -> String {
    format!("certs-{}", chrono::Utc::now().timestamp())
}

/// Everything a step may touch.
pub struct StateContext<'a, T> {
    /// The operation's durable state.
    pub state: T,
    /// Where the state is persisted.
    pub state_file: PathBuf,
    /// The agent.
    pub app: &'a mut App,
    /// Mutual-TLS client authenticated with the current key.
    pub client: reqwest::Client,
    /// The current credential.
    pub crypto: Credential,
    /// DER of the current TLS client certificate.
    pub client_cert_der: Vec<u8>,
    /// Telemetry sink.
    pub events: Box<dyn EventSync>,
}

impl<'a, T: StateRecord> StateContext<'a, T> {
    /// Build a context with the TLS client, credential, and gateway event
    /// sink derived from the app's configuration.
    pub fn for_app(app: &'a mut App, state_file: PathBuf, state: T) -> Result<Self> {
        let (client, crypto, client_cert_der) = tls::create_client(&app.sota)?;
        let event_url = app.sota.get_or_fail("tls.server") + "/events";

        let target = match CurrentTarget::load(app.storage_dir.join("current-target")) {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!(
                    "unable to parse current-target, events will be missing content: {}",
                    e
                );
                CurrentTarget::default()
            }
        };

        Ok(Self {
            state,
            state_file,
            app,
            client: client.clone(),
            crypto,
            client_cert_der,
            events: Box::new(DgEventSync::new(client, event_url, target)),
        })
    }

    /// Persist the state atomically.
    pub fn save(&self) -> Result<()> {
        safe_write(&self.state_file, &serde_json::to_vec(&self.state)?)
    }
}

/// Load a persisted state record.
///
/// `None` means no operation is in progress. An unreadable or corrupt
/// file is logged and yields a default record: it looks like an
/// operation was started, so we should try to finish it.
pub fn load_state<T: StateRecord>(path: &Path) -> Option<T> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!("error reading {}, using empty state: {}", path.display(), e);
            return Some(T::default());
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::warn!("error parsing {}, using empty state: {}", path.display(), e);
            Some(T::default())
        }
    }
}

/// One step of a durable operation.
#[async_trait]
pub trait StateStep<T: StateRecord>: Send + Sync {
    /// Step name, used in logs and telemetry.
    fn name(&self) -> &'static str;

    /// Execute the step. The runtime advances and saves the state only
    /// when this returns `Ok`.
    async fn execute(&self, ctx: &mut StateContext<'_, T>) -> Result<()>;
}

/// Drives a state record through its steps.
pub struct StateHandler<'a, T: StateRecord> {
    /// Shared step context.
    pub ctx: StateContext<'a, T>,
    /// The steps, in execution order.
    pub steps: Vec<Box<dyn StateStep<T>>>,
    /// Restart seam used after completion.
    pub restarter: Box<dyn UnitRestarter>,
}

impl<'a, T: StateRecord> StateHandler<'a, T> {
    /// Run the remaining steps.
    ///
    /// The state is saved before the first step so progress can be
    /// recorded durably before any side effect, and after every
    /// successful step. On step failure the index is NOT advanced; the
    /// next invocation retries the same step.
    pub async fn execute(
        &mut self,
        start_event: &str,
        complete_event: &str,
        restart: bool,
    ) -> Result<()> {
        let correlation_id = self.ctx.state.correlation_id();
        self.ctx.events.set_correlation_id(correlation_id);
        self.ctx.events.notify(start_event, None).await;

        if let Err(e) = self.run_steps().await {
            self.ctx.events.notify(complete_event, Some(&e.to_string())).await;
            return Err(e);
        }

        let mut completed = self.ctx.state_file.as_os_str().to_os_string();
        completed.push(COMPLETED_SUFFIX);
        if let Err(e) = std::fs::rename(&self.ctx.state_file, &completed) {
            let err = crate::error::Error::Io(e);
            self.ctx
                .events
                .notify(complete_event, Some(&err.to_string()))
                .await;
            return Err(err);
        }
        self.ctx.events.notify(complete_event, None).await;

        if restart {
            // Restart only *after* being complete. Otherwise we could wind
            // up in a loop of try-to-complete, restart-ourselves before
            // marking complete.
            if let Err(e) = self.restarter.restart_units(ROTATION_RESTART_UNITS).await {
                tracing::error!("unable to restart services: {}", e);
            }
        }
        Ok(())
    }

    async fn run_steps(&mut self) -> Result<()> {
        // Make sure we *can* save state before doing any I/O with side
        // effects
        self.ctx.save().map_err(|e| {
            tracing::error!("unable to save initial state: {}", e);
            e
        })?;

        for idx in 0..self.steps.len() {
            let step = &self.steps[idx];
            if idx < self.ctx.state.current_step() {
                tracing::info!("step already completed: {}", step.name());
                continue;
            }
            tracing::info!("executing step: {}", step.name());
            if let Err(e) = step.execute(&mut self.ctx).await {
                self.ctx.events.notify(step.name(), Some(&e.to_string())).await;
                return Err(e);
            }
            self.ctx.state.advance();
            self.ctx.events.notify(step.name(), None).await;
            self.ctx.save().map_err(|e| {
                tracing::error!("unable to save state: {}", e);
                e
            })?;
        }
        Ok(())
    }
}

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

//! Materializing an envelope into the secrets directory.
//!
//! The extractor diffs the decrypted envelope against what is on disk,
//! atomically writes changed files, deletes withdrawn ones, runs
//! whitelisted change handlers, and prunes directories that became empty.
//! Applying the same envelope twice is a no-op.

use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use tokio::process::Command;

use crate::encrypted_config::ConfigStruct;
use crate::error::{Error, Result};
use crate::exec::exec_indented;
use crate::safe_write::safe_write;

/// Handlers under this prefix are shipped in the OS image and trusted.
pub const HANDLERS_PREFIX: &str = "/usr/share/fioconfig/handlers/";

/// Context for applying envelopes to the secrets directory.
pub struct Extractor<'a> {
    /// Directory the secrets are materialized into. Must exist; its mode
    /// is reused for subdirectories the extractor creates.
    pub secrets_dir: &'a Path,
    /// The `storage.path` config, exported to handlers as `STORAGE_DIR`.
    pub storage_dir: &'a Path,
    /// Comma-joined configuration search paths, exported as `SOTA_DIR`.
    pub sota_dirs: String,
    /// Allow handlers outside [`HANDLERS_PREFIX`].
    pub unsafe_handlers: bool,
}

impl Extractor<'_> {
    /// Apply `next` to the secrets directory, using `prev` to detect
    /// withdrawn entries. Returns whether anything changed on disk.
    pub async fn extract(&self, prev: Option<&ConfigStruct>, next: &ConfigStruct) -> Result<bool> {
        let meta = std::fs::metadata(self.secrets_dir)?;
        let dir_mode = meta.permissions().mode() & 0o777;

        let mut changed_any = false;
        for (name, entry) in next {
            let full = self.secrets_dir.join(name);
            self.ensure_parent_dirs(&full, dir_mode)?;

            let current = match std::fs::read(&full) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };
            if current.as_deref() == Some(entry.value.as_slice()) {
                continue;
            }

            tracing::info!("extracting {}", name);
            safe_write(&full, &entry.value)?;
            changed_any = true;
            self.run_on_changed(name, &full, &entry.on_changed).await?;
        }

        if let Some(prev) = prev {
            for (name, entry) in prev {
                if next.contains_key(name) {
                    continue;
                }
                tracing::info!("removing {}", name);
                let full = self.secrets_dir.join(name);
                match std::fs::remove_file(&full) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                changed_any = true;
                self.run_on_changed(name, &full, &entry.on_changed).await?;
            }
        }

        prune_empty_dirs(self.secrets_dir)?;
        Ok(changed_any)
    }

    fn ensure_parent_dirs(&self, full: &Path, mode: u32) -> Result<()> {
        if let Some(parent) = full.parent() {
            if parent != self.secrets_dir && !parent.exists() {
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(mode)
                    .create(parent)?;
            }
        }
        Ok(())
    }

    /// Run an entry's change handler if the policy allows it.
    ///
    /// Exit code 123 is the handler's way to demand the agent terminate;
    /// any other failure is logged and extraction continues.
    async fn run_on_changed(&self, name: &str, full: &Path, on_changed: &[String]) -> Result<()> {
        let Some(program) = on_changed.first() else {
            return Ok(());
        };

        let cleaned = clean_path(program);
        if !cleaned.to_string_lossy().starts_with(HANDLERS_PREFIX) && !self.unsafe_handlers {
            tracing::warn!(
                "skipping on-change command for {} (not in {}): {:?}",
                name,
                HANDLERS_PREFIX,
                on_changed
            );
            return Ok(());
        }

        tracing::info!("running on-change command for {}: {:?}", name, on_changed);
        let mut cmd = Command::new(program);
        cmd.args(&on_changed[1..])
            .env("CONFIG_FILE", full)
            .env("STORAGE_DIR", self.storage_dir)
            .env("SOTA_DIR", &self.sota_dirs);
        if let Ok(bin) = std::env::current_exe() {
            cmd.env("FIOCONFIG_BIN", bin);
        }

        match exec_indented(&mut cmd, "| ").await {
            Ok(status) if status.code() == Some(123) => Err(Error::HandlerExit(123)),
            Ok(status) => {
                if !status.success() {
                    tracing::warn!("on-change command for {} failed: {}", name, status);
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!("unable to run on-change command for {}: {}", name, e);
                Ok(())
            }
        }
    }
}

/// Remove directories under `root` that are (or become) empty. The root
/// itself is kept.
pub fn prune_empty_dirs(root: &Path) -> Result<()> {
    delete_empty_dirs(root)?;
    Ok(())
}

fn delete_empty_dirs(path: &Path) -> Result<bool> {
    let mut is_empty = true;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let child = entry.path();
            if delete_empty_dirs(&child)? {
                std::fs::remove_dir(&child)?;
            } else {
                is_empty = false;
            }
        } else {
            is_empty = false;
        }
    }
    Ok(is_empty)
}

// Lexical path cleanup: resolve `.` and `..` without touching the
// filesystem, so the handler policy can't be bypassed with dot segments.
fn clean_path(path: &str) -> PathBuf {
    let p = Path::new(path);
    let mut out = PathBuf::new();
    for component in p.components() {
        match component {
            Component::RootDir => out.push("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
                if out.as_os_str().is_empty() && p.is_absolute() {
                    out.push("/");
                }
            }
            Component::Normal(c) => out.push(c),
            Component::Prefix(_) => {}
        }
    }
    out
}

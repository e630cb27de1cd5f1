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

//! Layered TOML configuration store.
//!
//! Device configuration is merged from several TOML files. Each search path
//! is either a regular file or a directory whose `*.toml` children are
//! collected. The merged set is sorted by filename in reverse lexicographic
//! order, so the first entry is the most significant: reading a key returns
//! the first non-empty string value along that order.
//!
//! Writes are atomic per file and land in a single layer - see
//! [`AppConfig::update_keys`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::safe_write::safe_write;

/// Default configuration search order, most significant last by filename.
pub const DEF_CONFIG_ORDER: &[&str] = &[
    "/usr/lib/sota/conf.d",
    "/var/sota/sota.toml",
    "/etc/sota/conf.d/",
];

/// The one layer the agent must never write: it is owned by the fleet
/// management tooling and would be overwritten on its next sync.
const MANAGED_FILE: &str = "z-50-fioctl.toml";

struct CfgFile {
    name: String,
    path: PathBuf,
    table: toml::Table,
}

/// An ordered set of TOML configuration layers.
pub struct AppConfig {
    cfgs: Vec<CfgFile>,
}

impl AppConfig {
    /// Load configuration from the given search paths.
    ///
    /// Missing paths are skipped. When two paths provide a file with the
    /// same name, the later path wins.
    pub fn new<P: AsRef<Path>>(config_paths: &[P]) -> Result<Self> {
        let mut by_name: BTreeMap<String, PathBuf> = BTreeMap::new();

        for path in config_paths {
            let path = path.as_ref();
            let Ok(meta) = std::fs::metadata(path) else {
                continue;
            };
            if meta.is_dir() {
                let Ok(entries) = std::fs::read_dir(path) else {
                    continue;
                };
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.ends_with(".toml") {
                        by_name.insert(name.clone(), path.join(name));
                    }
                }
            } else if let Some(name) = path.file_name() {
                by_name.insert(name.to_string_lossy().into_owned(), path.to_path_buf());
            }
        }

        // Reverse lexicographic: the first element is the most significant.
        let mut cfgs = Vec::with_capacity(by_name.len());
        for (name, path) in by_name.into_iter().rev() {
            let content = std::fs::read_to_string(&path)?;
            let table: toml::Table = content
                .parse()
                .map_err(|e| Error::config(format!("unable to parse {}: {}", path.display(), e)))?;
            cfgs.push(CfgFile { name, path, table });
        }

        Ok(Self { cfgs })
    }

    /// First non-empty string value for a dotted key, walking the layers in
    /// significance order.
    pub fn get(&self, key: &str) -> Option<String> {
        for cfg in &self.cfgs {
            if let Some(val) = lookup(&cfg.table, key) {
                if !val.is_empty() {
                    return Some(val.to_string());
                }
            }
        }
        None
    }

    /// As [`get`](Self::get), terminating the process when the key is
    /// missing. Required keys are startup preconditions; there is nothing
    /// the agent can do without them.
    pub fn get_or_fail(&self, key: &str) -> String {
        match self.get(key) {
            Some(val) => val,
            None => {
                let paths: Vec<String> = self
                    .cfgs
                    .iter()
                    .map(|c| c.path.display().to_string())
                    .collect();
                tracing::error!("missing {} in {}", key, paths.join(","));
                std::process::exit(1);
            }
        }
    }

    /// As [`get`](Self::get), falling back to `default`.
    pub fn get_default(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Paths of the loaded layers, in significance order.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.cfgs.iter().map(|c| c.path.clone()).collect()
    }

    /// Atomically apply a set of key/value pairs to a single layer.
    ///
    /// You could theoretically have the keys spread over more than one
    /// file, which would make the write non-atomic. So: all keys land in
    /// the first file that already holds any of them. If that file is the
    /// config-managed one the update is refused; if it is not writable,
    /// more significant layers are searched for a writable home.
    pub fn update_keys(&mut self, keyvals: &BTreeMap<String, String>) -> Result<()> {
        let idx = self.find_writable_file(keyvals)?;
        let cfg = &mut self.cfgs[idx];
        for (k, v) in keyvals {
            set(&mut cfg.table, k, v.clone());
        }
        let content = toml::to_string(&cfg.table)
            .map_err(|e| Error::config(format!("unable to serialize {}: {}", cfg.path.display(), e)))?;
        safe_write(&cfg.path, content.as_bytes())
    }

    fn find_writable_file(&self, keyvals: &BTreeMap<String, String>) -> Result<usize> {
        for (i, cfg) in self.cfgs.iter().enumerate() {
            if !keyvals.keys().any(|k| contains(&cfg.table, k)) {
                continue;
            }
            if cfg.name == MANAGED_FILE {
                return Err(Error::ConfigManaged(cfg.path.display().to_string()));
            }
            if is_writable(&cfg.path) {
                return Ok(i);
            }
            // Work back up through more significant files for one we can
            // update the value from.
            for j in (0..i).rev() {
                if self.cfgs[j].name != MANAGED_FILE && is_writable(&self.cfgs[j].path) {
                    return Ok(j);
                }
            }
            return Err(Error::NoWritableConfig);
        }
        Err(Error::NoWritableConfig)
    }
}

fn lookup<'a>(table: &'a toml::Table, key: &str) -> Option<&'a str> {
    let mut current = table;
    let mut parts = key.split('.').peekable();
    while let Some(part) = parts.next() {
        let val = current.get(part)?;
        if parts.peek().is_none() {
            return val.as_str();
        }
        current = val.as_table()?;
    }
    None
}

fn contains(table: &toml::Table, key: &str) -> bool {
    lookup(table, key).is_some()
}

fn set(table: &mut toml::Table, key: &str, value: String) {
    let mut current = table;
    let mut parts = key.split('.').peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), toml::Value::String(value));
            return;
        }
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        if !entry.is_table() {
            *entry = toml::Value::Table(toml::Table::new());
        }
        current = entry.as_table_mut().expect("just ensured table");
    }
}

// Probe writability the way the device actually writes: create a scratch
// file next to the target. Read-only mounts fail here, not at rename time.
fn is_writable(path: &Path) -> bool {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let probe = dir.join(format!(".{base}.tmp"));
    match std::fs::File::create(&probe) {
        Ok(f) => {
            drop(f);
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn kv(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_precedence_reverse_lexicographic() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.toml", "[tls]\nserver = \"from-a\"\n");
        write(dir.path(), "b.toml", "[tls]\nserver = \"from-b\"\n");

        let cfg = AppConfig::new(&[dir.path()]).unwrap();
        assert_eq!(cfg.get("tls.server").as_deref(), Some("from-b"));
    }

    #[test]
    fn test_get_falls_through_empty_values() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "z.toml", "[tls]\nserver = \"\"\n");
        write(dir.path(), "a.toml", "[tls]\nserver = \"fallback\"\n");

        let cfg = AppConfig::new(&[dir.path()]).unwrap();
        assert_eq!(cfg.get("tls.server").as_deref(), Some("fallback"));
        assert_eq!(cfg.get("tls.missing"), None);
        assert_eq!(cfg.get_default("tls.missing", "dflt"), "dflt");
    }

    #[test]
    fn test_file_and_dir_sources() {
        let dir = tempfile::tempdir().unwrap();
        let confd = dir.path().join("conf.d");
        std::fs::create_dir(&confd).unwrap();
        write(&confd, "x-60.toml", "[storage]\npath = \"/var/sota\"\n");
        let sota = write(dir.path(), "sota.toml", "[tls]\nserver = \"https://dg\"\n");

        let cfg = AppConfig::new(&[confd.as_path(), sota.as_path()]).unwrap();
        assert_eq!(cfg.get("tls.server").as_deref(), Some("https://dg"));
        assert_eq!(cfg.get("storage.path").as_deref(), Some("/var/sota"));
    }

    #[test]
    fn test_update_keys_lands_in_owning_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.toml", "[import]\ntls_pkey_path = \"old\"\n");
        write(dir.path(), "b.toml", "[tls]\nserver = \"https://dg\"\n");

        let mut cfg = AppConfig::new(&[dir.path()]).unwrap();
        cfg.update_keys(&kv(&[("import.tls_pkey_path", "new")])).unwrap();

        // b.toml is more significant but a.toml owned the key
        let reloaded = AppConfig::new(&[dir.path()]).unwrap();
        assert_eq!(reloaded.get("import.tls_pkey_path").as_deref(), Some("new"));
        let b = std::fs::read_to_string(dir.path().join("b.toml")).unwrap();
        assert!(!b.contains("tls_pkey_path"));
    }

    #[test]
    fn test_update_keys_refuses_managed_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "z-50-fioctl.toml", "[pacman]\ntags = \"main\"\n");

        let mut cfg = AppConfig::new(&[dir.path()]).unwrap();
        let err = cfg.update_keys(&kv(&[("pacman.tags", "devel")])).unwrap_err();
        assert!(err.to_string().starts_with("cannot override config-managed file"));
    }

    #[test]
    fn test_update_keys_no_owner() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.toml", "[tls]\nserver = \"https://dg\"\n");

        let mut cfg = AppConfig::new(&[dir.path()]).unwrap();
        let err = cfg.update_keys(&kv(&[("p11.module", "m.so")])).unwrap_err();
        assert!(matches!(err, Error::NoWritableConfig));
    }

    #[test]
    fn test_update_keys_falls_back_to_writable_layer() {
        let ro_dir = tempfile::tempdir().unwrap();
        let rw_dir = tempfile::tempdir().unwrap();
        write(ro_dir.path(), "a.toml", "[storage]\npath = \"/var/sota\"\n");
        write(rw_dir.path(), "b.toml", "[tls]\nserver = \"https://dg\"\n");

        let mut perms = std::fs::metadata(ro_dir.path()).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o555);
        std::fs::set_permissions(ro_dir.path(), perms.clone()).unwrap();

        let mut cfg = AppConfig::new(&[ro_dir.path(), rw_dir.path()]).unwrap();
        let res = cfg.update_keys(&kv(&[("storage.path", "/var/lib/sota")]));

        perms.set_mode(0o755);
        std::fs::set_permissions(ro_dir.path(), perms).unwrap();
        res.unwrap();

        // Value moved up into the more significant writable file
        let reloaded = AppConfig::new(&[ro_dir.path(), rw_dir.path()]).unwrap();
        assert_eq!(reloaded.get("storage.path").as_deref(), Some("/var/lib/sota"));
        let b = std::fs::read_to_string(rw_dir.path().join("b.toml")).unwrap();
        assert!(b.contains("path = \"/var/lib/sota\""));
    }

    #[test]
    fn test_update_keys_multiple_keys_one_file() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "sota.toml",
            "[p11]\ntls_pkey_id = \"01\"\ntls_clientcert_id = \"03\"\n",
        );

        let mut cfg = AppConfig::new(&[dir.path()]).unwrap();
        cfg.update_keys(&kv(&[
            ("p11.tls_pkey_id", "07"),
            ("p11.tls_clientcert_id", "09"),
        ]))
        .unwrap();

        let reloaded = AppConfig::new(&[dir.path()]).unwrap();
        assert_eq!(reloaded.get("p11.tls_pkey_id").as_deref(), Some("07"));
        assert_eq!(reloaded.get("p11.tls_clientcert_id").as_deref(), Some("09"));
    }
}

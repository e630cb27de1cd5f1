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

//! # fioconfig
//!
//! On-device configuration agent for fleet-managed embedded Linux
//! devices. The agent keeps a set of secret files in sync with a trusted
//! device-gateway, protects them with ECIES tied to the device's TLS
//! client key, and can rotate that key (with its X.509 certificate)
//! against an EST server without ever leaving the device unable to
//! authenticate.
//!
//! ## Features
//!
//! - **Async-first design** using Tokio
//! - **Encrypted-config lifecycle**: conditional fetch, ECIES decryption,
//!   atomic extraction, change handlers
//! - **Durable rotations**: a resumable on-disk state machine for EST
//!   re-enrollment and root CA renewal that survives power loss at any
//!   step
//! - **Hardware tokens**: PKCS#11-backed keys (feature `pkcs11`),
//!   including ECDH on the token for ECIES
//!
//! ## Quick Start
//!
//! ```no_run
//! use fioconfig::{App, DEF_CONFIG_ORDER};
//!
//! # async fn example() -> fioconfig::Result<()> {
//! let mut app = App::new(DEF_CONFIG_ORDER, "/var/run/secrets", false)?;
//! match app.check_in().await {
//!     Ok(changed) => println!("checked in, changed: {changed}"),
//!     Err(e) if e.is_not_modified() => println!("config unchanged"),
//!     Err(e) => return Err(e),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Certificate Rotation
//!
//! ```no_run
//! use fioconfig::{App, CertRotationHandler, DEF_CONFIG_ORDER};
//!
//! # async fn example() -> fioconfig::Result<()> {
//! let mut app = App::new(DEF_CONFIG_ORDER, "/var/run/secrets", false)?;
//! let state_file = app.storage_dir.join(fioconfig::rotate::STATE_FILE);
//! let mut handler =
//!     CertRotationHandler::new(&mut app, state_file, "https://est.example.com/.well-known/est")?;
//! handler.inner.ctx.state.pkey_slot_ids = vec!["01".into(), "07".into()];
//! handler.inner.ctx.state.cert_slot_ids = vec!["03".into(), "09".into()];
//! handler.rotate().await?;
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod app_config;
pub mod crypto;
pub mod current_target;
pub mod encrypted_config;
pub mod error;
pub mod events;
pub mod exec;
pub mod extract;
pub mod http;
pub mod pkcs7;
pub mod renew_root;
pub mod rotate;
pub mod safe_write;
pub mod services;
pub mod state;
pub mod tls;

pub use app::{App, InitCallback};
pub use app_config::{AppConfig, DEF_CONFIG_ORDER};
pub use crypto::Credential;
pub use current_target::CurrentTarget;
pub use encrypted_config::{ConfigFile, ConfigStruct};
pub use error::{Error, Result};
pub use renew_root::RootRenewalHandler;
pub use rotate::{CertRotationHandler, CertRotationState};
pub use safe_write::safe_write;

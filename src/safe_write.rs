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

//! Atomic file writes.
//!
//! Every persistent mutation in the agent goes through [`safe_write`]: the
//! data is written to `<path>.tmp`, fsync'd, and renamed onto the target.
//! A reader of the target path sees either the old bytes or the new bytes,
//! never a partial file. Writer synchronization is the caller's problem -
//! there is only one writer to these files on a device.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use filetime::FileTime;

use crate::error::{Error, Result};

/// Atomically replace the contents of `path` with `data`.
///
/// The temporary file is created with mode 0o640 and removed on any error
/// path. No prior permissions of `path` are preserved.
pub fn safe_write(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);

    let res = (|| -> std::io::Result<()> {
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o640)
            .open(tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
        drop(f);
        std::fs::rename(tmp, path)
    })();

    if let Err(err) = res {
        let _ = std::fs::remove_file(tmp);
        return Err(Error::Io(std::io::Error::new(
            err.kind(),
            format!("unable to create {}: {}", path.display(), err),
        )));
    }
    Ok(())
}

/// Set the modification time of `path`.
///
/// The check-in mirrors the server's `Date` header onto the persisted
/// ciphertext so it can be replayed as `If-Modified-Since`.
pub fn set_modtime(path: impl AsRef<Path>, t: chrono::DateTime<chrono::Utc>) -> Result<()> {
    let mtime = FileTime::from_unix_time(t.timestamp(), t.timestamp_subsec_nanos());
    filetime::set_file_mtime(path.as_ref(), mtime)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn test_write_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state");

        safe_write(&target, b"v1").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"v1");

        safe_write(&target, b"v2").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"v2");

        // No temp file left behind
        assert!(!dir.path().join("state.tmp").exists());
    }

    #[test]
    fn test_creation_mode() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("secret");
        safe_write(&target, b"s").unwrap();

        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn test_error_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing").join("state");
        assert!(safe_write(&target, b"v").is_err());
        assert!(!dir.path().join("missing").exists());
    }

    #[test]
    fn test_set_modtime() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cfg");
        safe_write(&target, b"x").unwrap();

        let t = chrono::DateTime::parse_from_rfc2822("Tue, 15 Nov 1994 08:12:31 GMT")
            .unwrap()
            .with_timezone(&chrono::Utc);
        set_modtime(&target, t).unwrap();

        let meta = std::fs::metadata(&target).unwrap();
        let mtime = FileTime::from_last_modification_time(&meta);
        assert_eq!(mtime.unix_seconds(), t.timestamp());
    }
}

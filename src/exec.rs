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

//! Subprocess execution with prefixed output forwarding.
//!
//! Handler output is streamed to the agent's stdout/stderr with every line
//! prefixed, so device logs show which output came from a handler. Both
//! pipes are drained by concurrent tasks and fully consumed before the
//! exit status is collected - no interleaved half-lines, and `wait`
//! observes the true status.

use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::error::Result;

/// Run `cmd` to completion, forwarding its output line-by-line with
/// `prefix` prepended.
pub async fn exec_indented(cmd: &mut Command, prefix: &'static str) -> Result<ExitStatus> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn()?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let out_task = tokio::spawn(prefix_copy(stdout, tokio::io::stdout(), prefix));
    let err_task = tokio::spawn(prefix_copy(stderr, tokio::io::stderr(), prefix));
    let _ = out_task.await;
    let _ = err_task.await;

    Ok(child.wait().await?)
}

/// Copy `reader` to `writer` line by line, prefixing each line.
pub(crate) async fn prefix_copy<R, W>(reader: R, mut writer: W, prefix: &str)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let formatted = format!("{prefix}{line}\n");
                if writer.write_all(formatted.as_bytes()).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!("error reading command output: {}", e);
                break;
            }
        }
    }
    let _ = writer.flush().await;
}

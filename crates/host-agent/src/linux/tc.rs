// SPDX-License-Identifier: Apache-2.0

//! Thin wrapper around the `tc` binary.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

const TC_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from invoking `tc`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The subprocess could not be spawned or driven.
    #[error("failed to run {name}: {source}")]
    Spawn {
        /// The binary.
        name: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The command ran but failed.
    #[error("{name}: exit status {status}; stderr:\n{stderr}")]
    Failed {
        /// The binary.
        name: String,
        /// Its exit status.
        status: i32,
        /// Its standard error.
        stderr: String,
    },
    /// The command exceeded its deadline and was killed.
    #[error("{name}: timed out")]
    Timeout {
        /// The binary.
        name: String,
    },
}

/// Invokes `tc` with a kill-on-timeout guard.
#[derive(Clone, Debug)]
pub struct TcCaller {
    tc_name: String,
}

impl Default for TcCaller {
    fn default() -> Self {
        Self::new("tc")
    }
}

impl TcCaller {
    /// Creates a caller for the named binary.
    pub fn new(tc_name: impl Into<String>) -> Self {
        Self {
            tc_name: tc_name.into(),
        }
    }

    /// Runs `tc` with the given arguments and returns its stdout.
    pub async fn call(&self, tc_args: &[&str]) -> Result<String, Error> {
        debug!(args = ?tc_args, "tc");
        let child = Command::new(&self.tc_name)
            .args(tc_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                name: self.tc_name.clone(),
                source,
            })?;
        let output = tokio::time::timeout(TC_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout {
                name: self.tc_name.clone(),
            })?
            .map_err(|source| Error::Spawn {
                name: self.tc_name.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(Error::Failed {
                name: self.tc_name.clone(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Feeds a batch of commands to `tc -batch -`.
    pub async fn batch(&self, input: &str, force: bool) -> Result<(), Error> {
        let mut args = vec!["-batch", "-"];
        if force {
            args.push("-force");
        }
        let mut child = Command::new(&self.tc_name)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                name: self.tc_name.clone(),
                source,
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|source| Error::Spawn {
                    name: self.tc_name.clone(),
                    source,
                })?;
        }
        let output = tokio::time::timeout(TC_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout {
                name: self.tc_name.clone(),
            })?
            .map_err(|source| Error::Spawn {
                name: self.tc_name.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(Error::Failed {
                name: self.tc_name.clone(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

// SPDX-License-Identifier: Apache-2.0

//! Drives the socket inspector.
//!
//! Two modes: a persistent subprocess in `-E` mode streams one line per
//! closed socket (used to finalize flows), and an on-demand invocation lists
//! currently open sockets (used for periodic reports). If the persistent
//! subprocess dies it is restarted with a 500 ms backoff.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use heyp_proto::FlowMarker;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::flow_tracker::{FlowPri, FlowTracker, Update};
use crate::ss_parser;

const RESTART_BACKOFF: Duration = Duration::from_millis(500);
const SS_ARGS: [&str; 5] = ["-i", "-t", "-n", "-H", "-O"];

/// Errors from the reporter.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The inspector could not be spawned.
    #[error("failed to start ss subprocess (path = {path}): {source}")]
    Spawn {
        /// The configured binary.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Configuration for [`SsFlowStateReporter`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Host id stamped on every flow.
    pub host_id: u64,
    /// The `ss`-compatible binary to invoke.
    pub ss_binary_name: String,
    /// Local addresses owned by this host, sorted. Flows from other source
    /// addresses are ignored.
    pub my_addrs: Vec<String>,
    /// Collect auxiliary TCP statistics.
    pub collect_aux: bool,
}

/// See the module docs.
pub struct SsFlowStateReporter {
    config: Config,
    flow_tracker: Arc<FlowTracker>,
}

impl SsFlowStateReporter {
    /// Creates a reporter feeding `flow_tracker`.
    pub fn new(mut config: Config, flow_tracker: Arc<FlowTracker>) -> Self {
        config.my_addrs.sort();
        Self {
            config,
            flow_tracker,
        }
    }

    fn ignore_flow(&self, flow: &FlowMarker) -> bool {
        !self
            .config
            .my_addrs
            .binary_search(&flow.src_addr)
            .is_ok()
    }

    /// Spawns the closed-socket monitor. Runs until cancelled; restarts the
    /// subprocess on failure.
    pub fn spawn_monitor_done(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            info!("entered closed-socket monitor loop");
            loop {
                match this.monitor_done_once(&cancel).await {
                    Ok(()) => {}
                    Err(e) => warn!(error = %e, "closed-socket monitor failed"),
                }
                if cancel.is_cancelled() {
                    break;
                }
                warn!("restarting ss to monitor done flows");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(RESTART_BACKOFF) => {}
                }
            }
            info!("exited closed-socket monitor loop");
        })
    }

    async fn monitor_done_once(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let mut child = Command::new(&self.config.ss_binary_name)
            .arg("-E")
            .args(SS_ARGS)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                path: self.config.ss_binary_name.clone(),
                source,
            })?;
        let stdout = child.stdout.take().expect("stdout piped");
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = tokio::select! {
                () = cancel.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) if !line.is_empty() => self.handle_done_line(&line),
                _ => break,
            }
        }
        let _ = child.kill().await;
        Ok(())
    }

    fn handle_done_line(&self, line: &str) {
        let now = Utc::now();
        let parsed = match ss_parser::parse_line_ss(self.config.host_id, line, self.config.collect_aux)
        {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, line, "failed to parse done line");
                return;
            }
        };
        if self.ignore_flow(&parsed.flow) {
            debug!(flow = ?parsed.flow, "ignoring done flow");
            return;
        }
        debug!(flow = ?parsed.flow, "counting done flow");
        self.flow_tracker.finalize_flows(
            now,
            &[Update {
                flow: parsed.flow,
                instantaneous_usage_bps: parsed.cur_usage_bps,
                cum_usage_bytes: parsed.cum_usage_bytes,
                used_priority: FlowPri::Unset,
                aux: parsed.aux,
            }],
        );
    }

    /// Lists currently open sockets once and updates the tracker.
    /// `is_lopri` resolves the QoS each flow currently uses.
    pub async fn report_state(&self, is_lopri: &(dyn Fn(&FlowMarker) -> bool + Sync)) -> Result<(), Error> {
        let output = Command::new(&self.config.ss_binary_name)
            .args(SS_ARGS)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| Error::Spawn {
                path: self.config.ss_binary_name.clone(),
                source,
            })?;

        let now = Utc::now();
        let mut flow_updates = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if line.is_empty() {
                continue;
            }
            let parsed =
                match ss_parser::parse_line_ss(self.config.host_id, line, self.config.collect_aux) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!(error = %e, line, "failed to parse line");
                        continue;
                    }
                };
            if self.ignore_flow(&parsed.flow) {
                debug!(flow = ?parsed.flow, "ignoring flow");
                continue;
            }
            debug!(flow = ?parsed.flow, "counting flow");
            let pri = if is_lopri(&parsed.flow) {
                FlowPri::Lo
            } else {
                FlowPri::Hi
            };
            flow_updates.push(Update {
                flow: parsed.flow,
                instantaneous_usage_bps: parsed.cur_usage_bps,
                cum_usage_bytes: parsed.cum_usage_bytes,
                used_priority: pri,
                aux: parsed.aux,
            });
        }
        self.flow_tracker.update_flows(now, &flow_updates);
        Ok(())
    }
}

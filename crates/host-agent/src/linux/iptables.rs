// SPDX-License-Identifier: Apache-2.0

//! iptables rule management for the mangle/OUTPUT chain.
//!
//! Each matched flow gets a triplet of rules: CLASSIFY into an HTB class
//! (skipped for DSCPs in the ignore set), DSCP marking, and RETURN.
//! Updates are applied as diffs (delete these / add these) fed to
//! `iptables-restore` on stdin, so one commit replaces arbitrary churn.

use std::fmt::Write as _;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

const RESTORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from committing iptables changes.
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

/// One flow's classification settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Setting {
    /// Source port; 0 to match any.
    pub src_port: u16,
    /// Destination port; 0 to match any.
    pub dst_port: u16,
    /// Destination address (required).
    pub dst_addr: String,
    /// HTB class to CLASSIFY into.
    pub class_id: String,
    /// DSCP class to set.
    pub dscp: String,
}

/// An ordered batch of settings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SettingBatch {
    /// The settings.
    pub settings: Vec<Setting>,
}

/// Sorts both batches and computes their set differences: entries only in
/// `old_batch` go to `to_del`, entries only in `new_batch` go to `to_add`.
pub fn compute_diff(
    old_batch: &mut SettingBatch,
    new_batch: &mut SettingBatch,
    to_del: &mut SettingBatch,
    to_add: &mut SettingBatch,
) {
    old_batch.settings.sort();
    new_batch.settings.sort();

    let old = &old_batch.settings;
    let new = &new_batch.settings;
    let (mut i, mut j) = (0, 0);
    while i < old.len() || j < new.len() {
        match (old.get(i), new.get(j)) {
            (Some(o), Some(n)) => {
                if o < n {
                    to_del.settings.push(o.clone());
                    i += 1;
                } else if n < o {
                    to_add.settings.push(n.clone());
                    j += 1;
                } else {
                    i += 1;
                    j += 1;
                }
            }
            (Some(o), None) => {
                to_del.settings.push(o.clone());
                i += 1;
            }
            (None, Some(n)) => {
                to_add.settings.push(n.clone());
                j += 1;
            }
            (None, None) => break,
        }
    }
}

fn port_matches(s: &Setting) -> (String, String) {
    let src = if s.src_port != 0 {
        format!(" --sport {}", s.src_port)
    } else {
        String::new()
    };
    let dst = if s.dst_port != 0 {
        format!(" --dport {}", s.dst_port)
    } else {
        String::new()
    };
    (src, dst)
}

/// Appends `-D` lines removing the rules for every setting in `batch`.
pub fn add_rule_lines_to_delete(dev: &str, batch: &SettingBatch, lines: &mut String) {
    for s in &batch.settings {
        let (sport, dport) = port_matches(s);
        let _ = writeln!(
            lines,
            "-D OUTPUT -o {dev} -p tcp -m tcp -d {}{sport}{dport} -j CLASSIFY --set-class {}",
            s.dst_addr, s.class_id
        );
        let _ = writeln!(
            lines,
            "-D OUTPUT -o {dev} -p tcp -m tcp -d {}{sport}{dport} -j DSCP --set-dscp-class {}",
            s.dst_addr, s.dscp
        );
        let _ = writeln!(
            lines,
            "-D OUTPUT -o {dev} -p tcp -m tcp -d {}{sport}{dport} -j RETURN",
            s.dst_addr
        );
    }
}

/// Appends lines adding the rules for every setting in `batch`. Fine-grained
/// rules (with a port match) are inserted at the head so they take
/// precedence over address-wide ones, which are appended.
pub fn add_rule_lines_to_add(
    dscps_to_ignore_class_id: &[String],
    dev: &str,
    batch: &SettingBatch,
    lines: &mut String,
) {
    for s in &batch.settings {
        let (sport, dport) = port_matches(s);
        let fine_grained = s.src_port != 0 || s.dst_port != 0;
        let ignore_class = dscps_to_ignore_class_id.iter().any(|d| d == &s.dscp);
        if fine_grained {
            let _ = writeln!(
                lines,
                "-I OUTPUT -o {dev} -p tcp -m tcp -d {}{sport}{dport} -j RETURN",
                s.dst_addr
            );
            let _ = writeln!(
                lines,
                "-I OUTPUT -o {dev} -p tcp -m tcp -d {}{sport}{dport} -j DSCP --set-dscp-class {}",
                s.dst_addr, s.dscp
            );
            if !ignore_class {
                let _ = writeln!(
                    lines,
                    "-I OUTPUT -o {dev} -p tcp -m tcp -d {}{sport}{dport} -j CLASSIFY --set-class {}",
                    s.dst_addr, s.class_id
                );
            }
        } else {
            if !ignore_class {
                let _ = writeln!(
                    lines,
                    "-A OUTPUT -o {dev} -p tcp -m tcp -d {}{sport}{dport} -j CLASSIFY --set-class {}",
                    s.dst_addr, s.class_id
                );
            }
            let _ = writeln!(
                lines,
                "-A OUTPUT -o {dev} -p tcp -m tcp -d {}{sport}{dport} -j DSCP --set-dscp-class {}",
                s.dst_addr, s.dscp
            );
            let _ = writeln!(
                lines,
                "-A OUTPUT -o {dev} -p tcp -m tcp -d {}{sport}{dport} -j RETURN",
                s.dst_addr
            );
        }
    }
}

/// Returns the DSCP the applied settings resolve to for the flow, searching
/// exact matches first, then progressively dropping the ports.
/// `batch.settings` must be sorted.
pub fn settings_find_dscp<'a>(
    batch: &'a SettingBatch,
    src_port: u16,
    dst_port: u16,
    dst_addr: &str,
    default_dscp: &'a str,
) -> &'a str {
    let find = |sp: u16, dp: u16| -> Option<&Setting> {
        let probe = Setting {
            src_port: sp,
            dst_port: dp,
            dst_addr: dst_addr.to_string(),
            ..Default::default()
        };
        let idx = batch.settings.partition_point(|s| s < &probe);
        let got = batch.settings.get(idx)?;
        (got.src_port == sp && got.dst_port == dp && got.dst_addr == dst_addr).then_some(got)
    };
    for (sp, dp) in [
        (src_port, dst_port),
        (0, dst_port),
        (src_port, 0),
        (0, 0),
    ] {
        if let Some(setting) = find(sp, dp) {
            return &setting.dscp;
        }
    }
    default_dscp
}

/// Runs `iptables` and `iptables-restore`.
#[derive(Clone, Debug)]
pub struct Runner {
    iptables_name: String,
    restore_name: String,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new("iptables", "iptables-restore")
    }
}

impl Runner {
    /// Creates a runner for the named binaries.
    pub fn new(iptables_name: impl Into<String>, restore_name: impl Into<String>) -> Self {
        Self {
            iptables_name: iptables_name.into(),
            restore_name: restore_name.into(),
        }
    }

    async fn run_iptables(&self, args: &[&str]) -> Result<(), Error> {
        let output = Command::new(&self.iptables_name)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| Error::Spawn {
                name: self.iptables_name.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(Error::Failed {
                name: self.iptables_name.clone(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    /// Makes sure `chain` exists in `table`. Returns whether it already
    /// existed. Idempotent: repeated calls leave the table unchanged.
    pub async fn ensure_chain(&self, table: &str, chain: &str) -> Result<bool, Error> {
        if self.run_iptables(&["-t", table, "-nL", chain]).await.is_ok() {
            return Ok(true);
        }
        self.run_iptables(&["-t", table, "-N", chain]).await?;
        Ok(false)
    }

    /// Makes sure the rule exists in `table`/`chain`. Returns whether it
    /// already existed. Idempotent: repeated calls leave the chain
    /// unchanged.
    pub async fn ensure_rule(
        &self,
        table: &str,
        chain: &str,
        rule_args: &[&str],
    ) -> Result<bool, Error> {
        let mut check = vec!["-t", table, "-C", chain];
        check.extend_from_slice(rule_args);
        if self.run_iptables(&check).await.is_ok() {
            return Ok(true);
        }
        let mut add = vec!["-t", table, "-A", chain];
        add.extend_from_slice(rule_args);
        self.run_iptables(&add).await?;
        Ok(false)
    }

    /// Feeds `payload` to `iptables-restore`. With `flush_tables` the named
    /// tables are flushed before the rules apply; without it existing rules
    /// are kept (`--noflush`).
    pub async fn restore(&self, payload: &str, flush_tables: bool) -> Result<(), Error> {
        let mut args: Vec<&str> = Vec::new();
        if !flush_tables {
            args.push("--noflush");
        }
        let mut child = Command::new(&self.restore_name)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                name: self.restore_name.clone(),
                source,
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.as_bytes())
                .await
                .map_err(|source| Error::Spawn {
                    name: self.restore_name.clone(),
                    source,
                })?;
        }
        let output = tokio::time::timeout(RESTORE_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout {
                name: self.restore_name.clone(),
            })?
            .map_err(|source| Error::Spawn {
                name: self.restore_name.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(Error::Failed {
                name: self.restore_name.clone(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

/// Stages settings and commits them as diffs against the mangle table.
pub struct Controller {
    dev: String,
    dscps_to_ignore_class_id: Vec<String>,
    runner: Runner,
    staged: SettingBatch,
    applied: SettingBatch,
    to_add: SettingBatch,
    to_del: SettingBatch,
}

impl Controller {
    /// Creates a controller for `dev`.
    pub fn new(dev: impl Into<String>, dscps_to_ignore_class_id: Vec<String>, runner: Runner) -> Self {
        Self {
            dev: dev.into(),
            dscps_to_ignore_class_id,
            runner,
            staged: SettingBatch::default(),
            applied: SettingBatch::default(),
            to_add: SettingBatch::default(),
            to_del: SettingBatch::default(),
        }
    }

    /// Flushes the mangle table and forgets all applied settings.
    pub async fn clear(&mut self) -> Result<(), Error> {
        self.applied.settings.clear();
        info!("flushing iptables 'mangle' table");
        self.runner.restore("*mangle\nCOMMIT\n", true).await
    }

    /// Stages one setting for the next commit.
    pub fn stage(&mut self, setting: Setting) {
        self.staged.settings.push(setting);
    }

    /// Commits the staged settings: computes the diff against what is
    /// applied and replays it via `iptables-restore`.
    ///
    /// On failure the half-applied additions are queued for deletion so the
    /// next commit rolls everything back.
    pub async fn commit_changes(&mut self) -> Result<(), Error> {
        compute_diff(
            &mut self.applied,
            &mut self.staged,
            &mut self.to_del,
            &mut self.to_add,
        );
        self.applied.settings.clear();

        let mut mangle_table = String::from("*mangle\n");
        add_rule_lines_to_delete(&self.dev, &self.to_del, &mut mangle_table);
        add_rule_lines_to_add(
            &self.dscps_to_ignore_class_id,
            &self.dev,
            &self.to_add,
            &mut mangle_table,
        );
        mangle_table.push_str("COMMIT\n");

        debug!(input = %mangle_table, "updating rules for iptables 'mangle' table");

        match self.runner.restore(&mangle_table, false).await {
            Ok(()) => {
                self.to_del.settings.clear();
                self.to_add.settings.clear();
                self.applied.settings = std::mem::take(&mut self.staged.settings);
                Ok(())
            }
            Err(e) => {
                // We are between the old and new states. Make sure the next
                // commit rolls back everything that might have been added.
                let added = std::mem::take(&mut self.to_add.settings);
                self.to_del.settings.extend(added);
                self.applied.settings.clear();
                self.staged.settings.clear();
                Err(e)
            }
        }
    }

    /// The DSCP the applied rules give this flow, or `default_dscp`.
    pub fn dscp_for<'a>(
        &'a self,
        src_port: u16,
        dst_port: u16,
        dst_addr: &str,
        default_dscp: &'a str,
    ) -> &'a str {
        settings_find_dscp(&self.applied, src_port, dst_port, dst_addr, default_dscp)
    }

    /// A snapshot of the currently applied settings.
    pub fn applied_settings(&self) -> &SettingBatch {
        &self.applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn setting(src_port: u16, dst_port: u16, dst_addr: &str, class_id: &str, dscp: &str) -> Setting {
        Setting {
            src_port,
            dst_port,
            dst_addr: dst_addr.into(),
            class_id: class_id.into(),
            dscp: dscp.into(),
        }
    }

    #[test]
    fn diff_is_set_difference() {
        let mut old = SettingBatch {
            settings: vec![
                setting(1, 2, "10.0.0.1", "1:2", "AF41"),
                setting(3, 4, "10.0.0.2", "1:3", "AF31"),
            ],
        };
        let mut new = SettingBatch {
            settings: vec![
                setting(3, 4, "10.0.0.2", "1:3", "AF31"),
                setting(5, 6, "10.0.0.3", "1:4", "AF41"),
            ],
        };
        let mut to_del = SettingBatch::default();
        let mut to_add = SettingBatch::default();
        compute_diff(&mut old, &mut new, &mut to_del, &mut to_add);
        assert_eq!(
            to_del.settings,
            vec![setting(1, 2, "10.0.0.1", "1:2", "AF41")]
        );
        assert_eq!(
            to_add.settings,
            vec![setting(5, 6, "10.0.0.3", "1:4", "AF41")]
        );
    }

    #[test]
    fn rule_lines_for_coarse_settings() {
        let batch = SettingBatch {
            settings: vec![setting(0, 0, "10.0.0.9", "1:7", "AF31")],
        };
        let mut lines = String::new();
        add_rule_lines_to_add(&[], "eth1", &batch, &mut lines);
        assert_eq!(
            lines,
            "-A OUTPUT -o eth1 -p tcp -m tcp -d 10.0.0.9 -j CLASSIFY --set-class 1:7\n\
             -A OUTPUT -o eth1 -p tcp -m tcp -d 10.0.0.9 -j DSCP --set-dscp-class AF31\n\
             -A OUTPUT -o eth1 -p tcp -m tcp -d 10.0.0.9 -j RETURN\n"
        );

        let mut del_lines = String::new();
        add_rule_lines_to_delete("eth1", &batch, &mut del_lines);
        assert_eq!(
            del_lines,
            "-D OUTPUT -o eth1 -p tcp -m tcp -d 10.0.0.9 -j CLASSIFY --set-class 1:7\n\
             -D OUTPUT -o eth1 -p tcp -m tcp -d 10.0.0.9 -j DSCP --set-dscp-class AF31\n\
             -D OUTPUT -o eth1 -p tcp -m tcp -d 10.0.0.9 -j RETURN\n"
        );
    }

    #[test]
    fn rule_lines_for_fine_grained_settings() {
        let batch = SettingBatch {
            settings: vec![setting(1000, 443, "10.0.0.9", "1:7", "AF41")],
        };
        let mut lines = String::new();
        add_rule_lines_to_add(&[], "eth1", &batch, &mut lines);
        assert_eq!(
            lines,
            "-I OUTPUT -o eth1 -p tcp -m tcp -d 10.0.0.9 --sport 1000 --dport 443 -j RETURN\n\
             -I OUTPUT -o eth1 -p tcp -m tcp -d 10.0.0.9 --sport 1000 --dport 443 -j DSCP --set-dscp-class AF41\n\
             -I OUTPUT -o eth1 -p tcp -m tcp -d 10.0.0.9 --sport 1000 --dport 443 -j CLASSIFY --set-class 1:7\n"
        );
    }

    #[test]
    fn ignored_dscp_skips_classify() {
        let batch = SettingBatch {
            settings: vec![setting(0, 0, "10.0.0.9", "1:7", "AF31")],
        };
        let mut lines = String::new();
        add_rule_lines_to_add(&["AF31".to_string()], "eth1", &batch, &mut lines);
        assert!(!lines.contains("CLASSIFY"));
        assert!(lines.contains("DSCP"));
    }

    /// A stateful stand-in for iptables: chains and rules live in a file
    /// next to the script, `-nL`/`-C` probe it, `-N`/`-A` append to it.
    fn fake_iptables(dir: &std::path::Path) -> String {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-iptables.sh");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            "#!/bin/sh\n\
             dir=\"$(dirname \"$0\")\"\n\
             state=\"$dir/ipt-state\"\n\
             touch \"$state\"\n\
             table=\"$2\"\n\
             op=\"$3\"\n\
             case \"$op\" in\n\
               -nL) grep -qxF \"chain $table $4\" \"$state\" ;;\n\
               -N) if grep -qxF \"chain $table $4\" \"$state\"; then exit 1; \
                   else echo \"chain $table $4\" >> \"$state\"; fi ;;\n\
               -C) shift 3; grep -qxF \"rule $table $*\" \"$state\" ;;\n\
               -A) shift 3; echo \"rule $table $*\" >> \"$state\" ;;\n\
               *) exit 2 ;;\n\
             esac\n"
        )
        .unwrap();
        drop(f);
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn ensure_chain_and_rule_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake_iptables(dir.path());
        let runner = Runner::new(fake.clone(), fake);

        assert!(!runner.ensure_chain("mangle", "HEYP").await.unwrap());
        assert!(runner.ensure_chain("mangle", "HEYP").await.unwrap());
        assert!(runner.ensure_chain("mangle", "HEYP").await.unwrap());

        let rule = ["-o", "eth0", "-j", "RETURN"];
        assert!(!runner.ensure_rule("mangle", "OUTPUT", &rule).await.unwrap());
        assert!(runner.ensure_rule("mangle", "OUTPUT", &rule).await.unwrap());
        assert!(runner.ensure_rule("mangle", "OUTPUT", &rule).await.unwrap());

        // A different rule in the same chain is tracked separately.
        let other = ["-o", "eth1", "-j", "RETURN"];
        assert!(!runner.ensure_rule("mangle", "OUTPUT", &other).await.unwrap());
    }

    #[test]
    fn find_dscp_prefers_exact_then_wildcards() {
        let mut batch = SettingBatch {
            settings: vec![
                setting(0, 0, "10.0.0.9", "1:2", "AF41"),
                setting(0, 443, "10.0.0.9", "1:3", "AF31"),
                setting(1000, 443, "10.0.0.9", "1:4", "AF41"),
            ],
        };
        batch.settings.sort();

        assert_eq!(settings_find_dscp(&batch, 1000, 443, "10.0.0.9", "X"), "AF41");
        assert_eq!(settings_find_dscp(&batch, 2000, 443, "10.0.0.9", "X"), "AF31");
        assert_eq!(settings_find_dscp(&batch, 2000, 80, "10.0.0.9", "X"), "AF41");
        assert_eq!(settings_find_dscp(&batch, 2000, 80, "10.9.9.9", "X"), "X");
    }
}

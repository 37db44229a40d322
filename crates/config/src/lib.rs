// SPDX-License-Identifier: Apache-2.0

//! Configuration model for the HEYP agents.
//!
//! Both agents take a YAML configuration file; the cluster-agent additionally
//! takes a YAML file with the initial per-FG admissions (an
//! [`heyp_proto::AllocBundle`]). Durations use humantime strings
//! (e.g. `"2s"`, `"500ms"`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use heyp_alg::downgrade::DowngradeSelectorConfig;
use heyp_alg::feedback::DowngradeFracControllerConfig;
use heyp_flows::dc_mapper::StaticDCMapperConfig;
use heyp_proto::AllocBundle;
use serde::{Deserialize, Serialize};

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to read a configuration file.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The offending path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse a configuration file.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// The offending path.
        path: PathBuf,
        /// Underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },

    /// A value is out of range or malformed.
    #[error("invalid configuration: {reason}")]
    InvalidArgument {
        /// Human-readable description.
        reason: String,
    },
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidArgument {
        reason: reason.into(),
    }
}

/// Reads and parses a YAML file into `T`.
pub fn load_yaml<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, Error> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads the cluster-wide initial admissions.
pub fn load_admissions(path: impl AsRef<Path>) -> Result<AllocBundle, Error> {
    load_yaml(path)
}

/// Converts a std duration into a chrono duration for the flow layer.
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Demand predictor parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DemandPredictorConfig {
    /// Usage window the prediction looks back over.
    #[serde(with = "humantime_serde")]
    pub time_window: Duration,
    /// Multiplier applied to the in-window max usage.
    pub usage_multiplier: f64,
    /// Floor on the predicted demand.
    pub min_demand_bps: i64,
}

impl Default for DemandPredictorConfig {
    fn default() -> Self {
        Self {
            time_window: Duration::from_secs(5),
            usage_multiplier: 1.1,
            min_demand_bps: 0,
        }
    }
}

impl DemandPredictorConfig {
    fn validate(&self) -> Result<(), Error> {
        if !(self.usage_multiplier > 0.0) {
            return Err(invalid("demand predictor usage_multiplier must be > 0"));
        }
        if self.min_demand_bps < 0 {
            return Err(invalid("demand predictor min_demand_bps must be >= 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Host-agent
// ---------------------------------------------------------------------------

/// Host daemon parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HostDaemonConfig {
    /// Address (`host:port`) of the cluster-agent.
    pub cluster_agent_addr: String,
    /// Period between InfoBundle reports.
    #[serde(with = "humantime_serde")]
    pub inform_period: Duration,
    /// Timeout for the initial dial to the cluster-agent.
    #[serde(with = "humantime_serde")]
    pub cluster_agent_connection_timeout: Duration,
    /// Job name stamped on reported flows.
    pub job: String,
}

impl Default for HostDaemonConfig {
    fn default() -> Self {
        Self {
            cluster_agent_addr: "127.0.0.1:4560".to_string(),
            inform_period: Duration::from_secs(2),
            cluster_agent_connection_timeout: Duration::from_secs(30),
            job: String::new(),
        }
    }
}

/// Flow tracker parameters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FlowTrackerConfig {
    /// Demand prediction parameters.
    pub demand_predictor: DemandPredictorConfig,
    /// Ignore the instantaneous rate reported by the socket inspector and
    /// rely on byte counters only.
    pub ignore_instantaneous_usage: bool,
}

/// Socket-inspector reporter parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FlowStateReporterConfig {
    /// Binary to invoke (an `ss`-compatible socket lister).
    pub ss_binary_name: String,
    /// Local addresses owned by this host; flows from other sources are
    /// ignored.
    pub this_host_addrs: Vec<String>,
    /// Collect auxiliary TCP statistics.
    pub collect_aux: bool,
}

impl Default for FlowStateReporterConfig {
    fn default() -> Self {
        Self {
            ss_binary_name: "ss".to_string(),
            this_host_addrs: Vec::new(),
            collect_aux: false,
        }
    }
}

/// Host enforcer parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HostEnforcerConfig {
    /// Apply rate limits and DSCP marks. When false a no-op enforcer is
    /// used; the telemetry path still runs.
    pub enforce: bool,
    /// Outbound device whose traffic is shaped.
    pub device: String,
    /// DSCP classes that should not receive a CLASSIFY rule.
    pub dscps_to_ignore_class_id: Vec<String>,
}

impl Default for HostEnforcerConfig {
    fn default() -> Self {
        Self {
            enforce: true,
            device: "eth0".to_string(),
            dscps_to_ignore_class_id: Vec::new(),
        }
    }
}

/// Top-level host-agent configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HostAgentConfig {
    /// Daemon parameters.
    pub daemon: HostDaemonConfig,
    /// Flow tracker parameters.
    pub flow_tracker: FlowTrackerConfig,
    /// Socket-inspector reporter parameters.
    pub flow_state_reporter: FlowStateReporterConfig,
    /// Address → DC mapping.
    pub dc_mapper: StaticDCMapperConfig,
    /// Enforcer parameters.
    pub enforcer: HostEnforcerConfig,
}

impl HostAgentConfig {
    /// Checks value ranges; errors here are fatal at startup.
    pub fn validate(&self) -> Result<(), Error> {
        self.flow_tracker.demand_predictor.validate()?;
        parse_host_port(&self.daemon.cluster_agent_addr)?;
        if self.daemon.inform_period.is_zero() {
            return Err(invalid("daemon inform_period must be positive"));
        }
        Ok(())
    }
}

fn parse_host_port(addr: &str) -> Result<(), Error> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(invalid(format!("bad host:port (missing port): {addr}")));
    };
    if host.is_empty() {
        return Err(invalid(format!("bad host:port (missing host): {addr}")));
    }
    let _: u16 = port
        .parse()
        .map_err(|_| invalid(format!("bad port in {addr}")))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Cluster-agent
// ---------------------------------------------------------------------------

/// Cluster-agent RPC server parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClusterServerConfig {
    /// Listen address.
    pub address: SocketAddr,
    /// Period of the compute-and-broadcast control loop.
    #[serde(with = "humantime_serde")]
    pub control_period: Duration,
}

impl Default for ClusterServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:4560".parse().expect("static addr"),
            control_period: Duration::from_secs(5),
        }
    }
}

/// Flow aggregator parameters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FlowAggregatorConfig {
    /// Demand prediction parameters for the per-FG aggregate.
    pub demand_predictor: DemandPredictorConfig,
}

/// Which per-FG allocator the full controller runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterAllocatorType {
    /// Disable allocation; the telemetry path still runs.
    Nop,
    /// HIPRI-only waterfill.
    Bwe,
    /// HIPRI + LOPRI with congestion inference.
    #[default]
    HeypSigcomm20,
    /// Hashing-based downgrade with conditional HIPRI throttling.
    SimpleDowngrade,
    /// Scripted allocations, for integration tests.
    FixedHostPattern,
}

/// When the simple-downgrade allocator throttles HIPRI traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HipriThrottleCondition {
    /// Never throttle; HIPRI gets the unlimited sentinel.
    #[default]
    Never,
    /// Throttle once demand exceeds the HIPRI admission.
    WhenAboveHipriLimit,
    /// Throttle once any child is assigned LOPRI.
    WhenAssignedLopri,
    /// Always throttle.
    Always,
}

/// A run-length-encoded scripted allocation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FixedHostAlloc {
    /// How many hosts receive this allocation.
    pub num_hosts: u64,
    /// HIPRI rate limit.
    pub hipri_rate_limit_bps: i64,
    /// LOPRI rate limit.
    pub lopri_rate_limit_bps: i64,
}

/// One scripted snapshot: allocations handed out in child order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FixedHostAllocSnapshot {
    /// Run-length-encoded host allocations.
    pub host_allocs: Vec<FixedHostAlloc>,
}

/// A cyclic scripted allocation pattern for one FG.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FixedClusterHostAllocs {
    /// Source DC of the FG.
    pub src_dc: String,
    /// Destination DC of the FG.
    pub dst_dc: String,
    /// Snapshots applied round-robin, one per tick.
    pub snapshots: Vec<FixedHostAllocSnapshot>,
}

/// Per-FG allocator configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClusterAllocatorConfig {
    /// Allocator strategy.
    #[serde(rename = "type")]
    pub allocator_type: ClusterAllocatorType,
    /// Scale admissions by the aggregate's burstiness factor.
    pub enable_burstiness: bool,
    /// Spread leftover admission evenly across children.
    pub enable_bonus: bool,
    /// Multiplier applied to the final per-child rate limits.
    pub oversub_factor: f64,
    /// Downgrade selector used by the Heyp-Sigcomm20 and simple-downgrade
    /// allocators.
    pub downgrade_selector: DowngradeSelectorConfig,
    /// Threshold below which the measured LOPRI/HIPRI ratio implies LOPRI
    /// congestion.
    pub heyp_acceptable_measured_ratio_over_intended_ratio: f64,
    /// Probe LOPRI when HIPRI is saturated but demand is ambiguous.
    pub heyp_probe_lopri_when_ambiguous: bool,
    /// Demand multiplier used to decide whether demand is ambiguous.
    pub demand_multiplier: f64,
    /// HIPRI throttling policy of the simple-downgrade allocator.
    pub simple_downgrade_throttle_hipri: HipriThrottleCondition,
    /// Scripted allocations for the fixed-host-pattern allocator.
    pub fixed_host_alloc_patterns: Vec<FixedClusterHostAllocs>,
}

impl Default for ClusterAllocatorConfig {
    fn default() -> Self {
        Self {
            allocator_type: ClusterAllocatorType::default(),
            enable_burstiness: false,
            enable_bonus: false,
            oversub_factor: 1.0,
            downgrade_selector: DowngradeSelectorConfig::default(),
            heyp_acceptable_measured_ratio_over_intended_ratio: 0.9,
            heyp_probe_lopri_when_ambiguous: false,
            demand_multiplier: 1.1,
            simple_downgrade_throttle_hipri: HipriThrottleCondition::default(),
            fixed_host_alloc_patterns: Vec::new(),
        }
    }
}

impl ClusterAllocatorConfig {
    fn validate(&self) -> Result<(), Error> {
        if !(self.oversub_factor > 0.0) {
            return Err(invalid("allocator oversub_factor must be > 0"));
        }
        if !(self.demand_multiplier > 0.0) {
            return Err(invalid("allocator demand_multiplier must be > 0"));
        }
        Ok(())
    }
}

/// Fast (sampling) controller configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FastClusterControllerConfig {
    /// Target number of sampled hosts per FG at approval.
    pub target_num_samples: f64,
    /// Worker threads for per-FG computation and broadcast.
    pub num_threads: usize,
    /// Optional feedback controller for the downgrade fraction. Without it,
    /// the fraction comes from the usage-vs-admission ratio.
    pub downgrade_frac_controller: Option<DowngradeFracControllerConfig>,
}

impl Default for FastClusterControllerConfig {
    fn default() -> Self {
        Self {
            target_num_samples: 100.0,
            num_threads: 8,
            downgrade_frac_controller: None,
        }
    }
}

/// Top-level cluster-agent configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClusterAgentConfig {
    /// RPC server parameters.
    pub server: ClusterServerConfig,
    /// Aggregator parameters (full controller only).
    pub flow_aggregator: FlowAggregatorConfig,
    /// Per-FG allocator parameters (full controller only).
    pub allocator: ClusterAllocatorConfig,
    /// When present, run the fast controller instead of the full one.
    pub fast_controller: Option<FastClusterControllerConfig>,
    /// Optional NDJSON debug log of every allocation decision.
    pub alloc_log_path: Option<PathBuf>,
}

impl ClusterAgentConfig {
    /// Checks value ranges; errors here are fatal at startup.
    pub fn validate(&self) -> Result<(), Error> {
        self.flow_aggregator.demand_predictor.validate()?;
        self.allocator.validate()?;
        if self.server.control_period.is_zero() {
            return Err(invalid("server control_period must be positive"));
        }
        if let Some(fast) = &self.fast_controller {
            if fast.num_threads == 0 {
                return Err(invalid("fast_controller num_threads must be positive"));
            }
            if !(fast.target_num_samples > 0.0) {
                return Err(invalid("fast_controller target_num_samples must be > 0"));
            }
        }
        Ok(())
    }
}

//! Filter Supervisor
//!
//! A filter is a separate process listening on a loopback port and forwarding
//! to a mapping's real backend, inspecting or rewriting traffic on the way.
//! The supervisor allocates the port, launches the process and keeps its
//! handle so the phase can stop it on exit.

use crate::error::{GateError, GateResult};
use crate::net::find_free_port;
use crate::process::{forward_output, prepare_command, terminate};
use crate::template::render;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Prefix marking an entrypoint implemented by this binary
pub const BUILTIN_PREFIX: &str = "builtin:";

/// Environment variables every filter process receives
pub const ENV_LISTEN_PORT: &str = "FILTER_LISTEN_PORT";
pub const ENV_UPSTREAM_HOST: &str = "FILTER_UPSTREAM_HOST";
pub const ENV_UPSTREAM_PORT: &str = "FILTER_UPSTREAM_PORT";
pub const ENV_ARGS: &str = "FILTER_ARGS";
pub const ENV_OPTIONS: &str = "FILTER_OPTIONS";

/// Attempts at finding a port no other filter of this supervisor holds
const PORT_ALLOCATION_ATTEMPTS: usize = 16;

fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

/// Filter declared on a mapping
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FilterSpec {
    /// `builtin:<name>` or a path to an executable
    pub entrypoint: String,

    /// Positional arguments. For command filters these are the process arguments,
    /// with `{listen_port}`, `{upstream_host}` and `{upstream_port}` substituted.
    #[serde(default)]
    pub args: Vec<String>,

    /// Opaque filter options, exported as JSON
    #[serde(default)]
    pub kwargs: Map<String, Value>,

    /// Poll the filter's port for this long before its route goes live
    #[serde(default)]
    pub ready_timeout_ms: Option<u64>,
}

impl FilterSpec {
    pub fn new(entrypoint: impl Into<String>) -> Self {
        Self {
            entrypoint: entrypoint.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            ready_timeout_ms: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }

    pub fn parse_entrypoint(&self) -> GateResult<Entrypoint> {
        self.entrypoint.parse()
    }
}

/// Filters implemented inside this binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinFilter {
    /// Forward only JSON-RPC calls whose method matches the list
    JsonRpcWhitelist,
    /// Forward only JSON-RPC calls whose method matches nothing in the list
    JsonRpcBlacklist,
}

impl BuiltinFilter {
    pub const ALL: [BuiltinFilter; 2] = [BuiltinFilter::JsonRpcWhitelist, BuiltinFilter::JsonRpcBlacklist];

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinFilter::JsonRpcWhitelist => "jsonrpc-whitelist",
            BuiltinFilter::JsonRpcBlacklist => "jsonrpc-blacklist",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

impl fmt::Display for BuiltinFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a filter process is started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entrypoint {
    Builtin(BuiltinFilter),
    Command(String),
}

impl std::str::FromStr for Entrypoint {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(GateError::Configuration("filter entrypoint is empty".to_string()));
        }
        match s.strip_prefix(BUILTIN_PREFIX) {
            Some(name) => BuiltinFilter::from_name(name).map(Entrypoint::Builtin).ok_or_else(|| {
                let known: Vec<_> = BuiltinFilter::ALL.iter().map(|f| f.name()).collect();
                GateError::Configuration(format!(
                    "unknown builtin filter '{}' (known: {})",
                    name,
                    known.join(", ")
                ))
            }),
            None => Ok(Entrypoint::Command(s.to_string())),
        }
    }
}

/// Connection parameters handed to a filter process
#[derive(Debug, Clone, PartialEq)]
pub struct FilterEnv {
    pub listen_port: u16,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub args: Vec<String>,
    pub options: Map<String, Value>,
}

impl FilterEnv {
    /// Read the parameters a supervisor exported to this process
    pub fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;

        fn var(name: &str) -> anyhow::Result<String> {
            std::env::var(name).with_context(|| format!("{} is not set", name))
        }

        let listen_port = var(ENV_LISTEN_PORT)?
            .parse()
            .with_context(|| format!("{} is not a port", ENV_LISTEN_PORT))?;
        let upstream_host = var(ENV_UPSTREAM_HOST)?;
        let upstream_port = var(ENV_UPSTREAM_PORT)?
            .parse()
            .with_context(|| format!("{} is not a port", ENV_UPSTREAM_PORT))?;
        let args = match std::env::var(ENV_ARGS) {
            Ok(raw) => serde_json::from_str(&raw).with_context(|| format!("{} is not a JSON list", ENV_ARGS))?,
            Err(_) => Vec::new(),
        };
        let options = match std::env::var(ENV_OPTIONS) {
            Ok(raw) => {
                serde_json::from_str(&raw).with_context(|| format!("{} is not a JSON object", ENV_OPTIONS))?
            }
            Err(_) => Map::new(),
        };

        Ok(Self {
            listen_port,
            upstream_host,
            upstream_port,
            args,
            options,
        })
    }

    fn placeholder(&self, key: &str) -> Option<String> {
        match key {
            "listen_port" => Some(self.listen_port.to_string()),
            "upstream_host" => Some(self.upstream_host.clone()),
            "upstream_port" => Some(self.upstream_port.to_string()),
            _ => None,
        }
    }

    fn apply(&self, cmd: &mut Command) {
        cmd.env(ENV_LISTEN_PORT, self.listen_port.to_string())
            .env(ENV_UPSTREAM_HOST, &self.upstream_host)
            .env(ENV_UPSTREAM_PORT, self.upstream_port.to_string())
            .env(ENV_ARGS, Value::from(self.args.clone()).to_string())
            .env(ENV_OPTIONS, Value::Object(self.options.clone()).to_string());
    }
}

struct FilterInstance {
    entrypoint: String,
    upstream_host: String,
    upstream_port: u16,
    child: Child,
}

/// Snapshot of one supervised filter
#[derive(Debug, Clone, Serialize)]
pub struct FilterStatus {
    pub listen_port: u16,
    pub entrypoint: String,
    pub upstream: String,
    pub pid: Option<u32>,
    pub running: bool,
}

/// Starts and stops filter processes, keyed by listen port
pub struct FilterSupervisor {
    filters: DashMap<u16, FilterInstance>,
    filter_exe: PathBuf,
    grace_period: Duration,
}

impl FilterSupervisor {
    /// Builtin filters are run through the current executable
    pub fn new() -> Arc<Self> {
        let filter_exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("ctfgate"));
        Self::with_filter_exe(filter_exe, default_grace_period())
    }

    /// Use `filter_exe` to run builtin filters
    pub fn with_filter_exe(filter_exe: impl Into<PathBuf>, grace_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            filters: DashMap::new(),
            filter_exe: filter_exe.into(),
            grace_period,
        })
    }

    /// Launch the filter described by `spec` in front of `upstream_host:upstream_port`.
    ///
    /// Returns the port the filter listens on as soon as the process is spawned.
    /// Readiness is not awaited.
    pub fn start_filter(&self, spec: &FilterSpec, upstream_host: &str, upstream_port: u16) -> GateResult<u16> {
        let entrypoint = spec.parse_entrypoint()?;
        let listen_port = self.allocate_port()?;

        let env = FilterEnv {
            listen_port,
            upstream_host: upstream_host.to_string(),
            upstream_port,
            args: spec.args.clone(),
            options: spec.kwargs.clone(),
        };

        let mut cmd = match &entrypoint {
            Entrypoint::Builtin(builtin) => {
                let mut cmd = Command::new(&self.filter_exe);
                cmd.arg("filter").arg(builtin.name());
                cmd
            }
            Entrypoint::Command(program) => {
                let mut cmd = Command::new(program);
                cmd.args(spec.args.iter().map(|arg| render(arg, |key| env.placeholder(key))));
                cmd
            }
        };
        env.apply(&mut cmd);
        prepare_command(&mut cmd);

        let label = format!("filter:{}", listen_port);
        let mut child = cmd.spawn().map_err(|e| GateError::FilterLaunch {
            entrypoint: spec.entrypoint.clone(),
            reason: e.to_string(),
        })?;
        forward_output(&mut child, &label);

        info!(
            entrypoint = %spec.entrypoint,
            listen_port,
            upstream = %format!("{}:{}", upstream_host, upstream_port),
            pid = ?child.id(),
            "Filter started"
        );

        self.filters.insert(
            listen_port,
            FilterInstance {
                entrypoint: spec.entrypoint.clone(),
                upstream_host: upstream_host.to_string(),
                upstream_port,
                child,
            },
        );

        Ok(listen_port)
    }

    fn allocate_port(&self) -> GateResult<u16> {
        let mut seen = HashSet::new();
        for _ in 0..PORT_ALLOCATION_ATTEMPTS {
            let port = find_free_port()?;
            if !self.filters.contains_key(&port) {
                return Ok(port);
            }
            debug!(port, "Port already assigned to a filter, retrying");
            seen.insert(port);
        }
        Err(GateError::ResourceExhausted(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("ports {:?} already assigned to filters", seen),
        )))
    }

    /// True if a filter is registered on `listen_port` and its process has not exited
    pub fn is_running(&self, listen_port: u16) -> bool {
        match self.filters.get_mut(&listen_port) {
            Some(mut instance) => matches!(instance.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Upstream `(host, port)` of the filter on `listen_port`
    pub fn upstream_of(&self, listen_port: u16) -> Option<(String, u16)> {
        self.filters
            .get(&listen_port)
            .map(|f| (f.upstream_host.clone(), f.upstream_port))
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn list(&self) -> Vec<FilterStatus> {
        let mut statuses: Vec<_> = self
            .filters
            .iter_mut()
            .map(|mut entry| {
                let listen_port = *entry.key();
                let instance = entry.value_mut();
                FilterStatus {
                    listen_port,
                    entrypoint: instance.entrypoint.clone(),
                    upstream: format!("{}:{}", instance.upstream_host, instance.upstream_port),
                    pid: instance.child.id(),
                    running: matches!(instance.child.try_wait(), Ok(None)),
                }
            })
            .collect();
        statuses.sort_by_key(|s| s.listen_port);
        statuses
    }

    /// Stop one filter. Returns false if none was registered on `listen_port`.
    pub async fn stop_filter(&self, listen_port: u16) -> bool {
        let Some((_, mut instance)) = self.filters.remove(&listen_port) else {
            warn!(listen_port, "No filter registered on port");
            return false;
        };
        let label = format!("filter:{}", listen_port);
        terminate(&label, &mut instance.child, self.grace_period).await;
        true
    }

    pub async fn stop_all(&self) {
        let ports: Vec<u16> = self.filters.iter().map(|e| *e.key()).collect();
        if ports.is_empty() {
            return;
        }
        info!(count = ports.len(), "Stopping filters");
        for port in ports {
            self.stop_filter(port).await;
        }
    }
}
